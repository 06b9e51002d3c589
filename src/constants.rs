//! Process-wide limits, key prefixes, and environment configuration.

use std::time::Duration;

/// An upload older than this without a terminal status is overdue (seconds).
pub const UPLOAD_TIME_LIMIT: f64 = 1800.0;

/// Largest WKT piece written to the partition table, in bytes.
pub const WKT_PIECE_LIMIT: usize = 16 * 1024;

/// Sleep between polls while waiting for an expected object or query result.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Stop waiting when less than this remains on the worker clock (msec).
pub const SAFETY_MARGIN_MSEC: u64 = 5_000;

/// Re-invoke the worker itself instead of starting new work below this floor (msec).
pub const SELF_CONTINUE_FLOOR_MSEC: u64 = 30_000;

/// Nominal execution budget for a single worker invocation.
pub const WORKER_TIME_BUDGET: Duration = Duration::from_secs(300);

/// Object-store prefix where the C/E model matrices live.
pub const MODEL_KEY_PREFIX: &str = "data/model";

/// Comma-separated bearer tokens; empty or unset disables the check.
pub const API_TOKENS_VAR: &str = "API_TOKENS";

/// Process-wide secret for the signed-id protocol.
pub const SIGNING_SECRET_VAR: &str = "SIGNING_SECRET";

/// Optional build identifier recorded on new uploads.
pub const COMMIT_SHA_VAR: &str = "COMMIT_SHA";
