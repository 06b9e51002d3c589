//! Index data model: uploads, districts, models, and version parameters.

pub mod model;
pub mod upload;
pub mod versions;

pub use model::{models, models_for_state, House, Model};
pub use upload::{generate_id, upload_key, District, Incumbency, Progress, Stage, Upload};
pub use versions::{default_version, public_versions, version_parameters, VersionParameters};
