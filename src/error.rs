use thiserror::Error;

/// Terminal failure taxonomy, surfaced as `upload.message` with `status=false`.
#[derive(Debug, Error)]
pub enum ScoreError {
    /// Unrecognized file type, unreadable archive, unparseable geometry,
    /// or column-count mismatch in block assignments.
    #[error("{0}")]
    InvalidUpload(String),

    /// Detected state has no model, or the plan is outside the U.S.
    #[error("{0}")]
    UnsupportedDomain(String),

    /// Unknown `model_version` supplied by the caller.
    #[error("Bad model_version '{0}'")]
    BadConfig(String),

    /// Attribution query failed, timed out, or produced malformed rows.
    #[error("{0}")]
    AnalyticsFailure(String),

    /// Stage exhausted its execution budget without a self-continuation.
    #[error("Out of time")]
    Timeout,
}

/// Render an error chain as the terminal `upload.message`.
///
/// Known `ScoreError`s give a specific cause; anything else gets the generic
/// giving-up message and should be re-raised to the host for observability.
pub fn failure_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ScoreError>() {
        Some(known) => format!("Can't score this plan: {known}"),
        None => "Can't score this plan: something went wrong, giving up.".to_string(),
    }
}

/// Whether the error is outside the known taxonomy and must be re-raised.
pub fn is_unknown(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ScoreError>().is_none()
}
