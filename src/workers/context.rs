//! Worker execution plumbing: the shared environment handle, the wall-clock
//! budget, and invokers that carry fire-and-forget stage invocations.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, OnceLock},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::{
    analytics::AnalyticsEngine,
    constants::{SAFETY_MARGIN_MSEC, WORKER_TIME_BUDGET},
    storage::ObjectStore,
};

/// Fire-and-forget invocation of another stage worker. Implementations must
/// not wait for the invoked worker to finish.
pub trait Invoker: Send + Sync {
    fn invoke(&self, function: &str, payload: Value) -> Result<()>;
}

/// Shared handles every stage worker needs.
#[derive(Clone)]
pub struct Env {
    pub store: Arc<dyn ObjectStore>,
    pub engine: Arc<dyn AnalyticsEngine>,
    pub invoker: Arc<dyn Invoker>,
}

/// Wall-clock budget for one worker run.
pub struct WorkerContext {
    deadline: Instant,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::with_budget(WORKER_TIME_BUDGET)
    }

    pub fn with_budget(budget: Duration) -> Self {
        Self { deadline: Instant::now() + budget }
    }

    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Deadline with the shutdown safety margin already subtracted; waits
    /// must never run past this point.
    #[inline]
    pub fn safety_deadline(&self) -> Instant {
        self.deadline - Duration::from_millis(SAFETY_MARGIN_MSEC)
    }

    pub fn remaining_millis(&self) -> u64 {
        self.deadline.saturating_duration_since(Instant::now()).as_millis() as u64
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue-backed invoker for tests and the local runner. Invocations are
/// recorded in order and drained by [`run_all`].
#[derive(Default)]
pub struct LocalQueue {
    pending: Mutex<VecDeque<(String, Value)>>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<(String, Value)> {
        self.pending.lock().expect("poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Invoker for LocalQueue {
    fn invoke(&self, function: &str, payload: Value) -> Result<()> {
        tracing::debug!(function, "queueing worker invocation");
        self.pending.lock().expect("poisoned").push_back((function.to_string(), payload));
        Ok(())
    }
}

/// Drain a [`LocalQueue`] until no invocations remain, dispatching each in
/// arrival order. `env.invoker` must be the same queue, so follow-on
/// invocations land back here.
pub fn run_all(env: &Env, queue: &LocalQueue) -> Result<()> {
    while let Some((function, payload)) = queue.pop() {
        let ctx = WorkerContext::new();
        super::dispatch(env, &ctx, &function, payload)?;
    }
    Ok(())
}

/// Invoker that runs each invocation on its own thread, matching the hosted
/// runtime's concurrent fan-out. Bind the environment once after wiring it
/// into an [`Env`], then `join_all` to drain every spawned worker.
#[derive(Default)]
pub struct ThreadedInvoker {
    env: OnceLock<Env>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, env: Env) {
        if self.env.set(env).is_err() {
            tracing::warn!("threaded invoker environment already bound");
        }
    }

    /// Wait for every spawned worker, including ones spawned while joining.
    pub fn join_all(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().expect("poisoned");
                handles.drain(..).collect()
            };
            if drained.is_empty() {
                return;
            }
            for handle in drained {
                let _ = handle.join();
            }
        }
    }
}

impl Invoker for ThreadedInvoker {
    fn invoke(&self, function: &str, payload: Value) -> Result<()> {
        let env = self.env.get().cloned()
            .ok_or_else(|| anyhow!("[workers::ThreadedInvoker] No environment bound"))?;
        let function = function.to_string();

        let handle = std::thread::spawn(move || {
            let ctx = WorkerContext::new();
            if let Err(err) = super::dispatch(&env, &ctx, &function, payload) {
                tracing::error!(function = %function, error = %format!("{err:#}"),
                    "worker invocation failed");
            }
        });
        self.handles.lock().expect("poisoned").push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_queue_preserves_invocation_order() {
        let queue = LocalQueue::new();
        queue.invoke("First", json!({"n": 1})).unwrap();
        queue.invoke("Second", json!({"n": 2})).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().0, "First");
        assert_eq!(queue.pop().unwrap().0, "Second");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn context_budget_counts_down() {
        let ctx = WorkerContext::with_budget(Duration::from_secs(60));
        let remaining = ctx.remaining_millis();
        assert!(remaining > 55_000 && remaining <= 60_000);
        assert!(ctx.safety_deadline() < ctx.deadline());
    }

    #[test]
    fn unbound_threaded_invoker_refuses_invocations() {
        let invoker = ThreadedInvoker::new();
        assert!(invoker.invoke("Anything", json!({})).is_err());
    }
}
