//! Distributed scoring pipeline for partisan fairness of U.S. legislative
//! districting plans.
//!
//! An uploaded plan (a geometry file or a block-assignment table) moves
//! through a chain of stage workers that identify its state and chamber,
//! attribute votes and population to each district, synthesize missing
//! geometry from Census block adjacency graphs, and apply a precomputed
//! prediction model. Results are published as a JSON index the front end
//! polls; partisan-fairness metrics summarize the simulation bank.

pub mod analytics;
pub mod auth;
pub mod blockassign;
pub mod compactness;
pub mod constants;
pub mod data;
pub mod detect;
pub mod districts;
pub mod error;
pub mod infer;
pub mod matrix;
pub mod observe;
pub mod plan;
pub mod polygonize;
pub mod score;
pub mod storage;
pub mod workers;

#[doc(inline)]
pub use data::{District, House, Incumbency, Model, Progress, Stage, Upload};

#[doc(inline)]
pub use error::ScoreError;

#[doc(inline)]
pub use storage::{FileStore, MemStore, ObjectStore};

#[doc(inline)]
pub use workers::{Env, LocalQueue, ThreadedInvoker, WorkerContext};
