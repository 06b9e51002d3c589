//! First stage: admit a newly-uploaded file and hand it to the followup
//! reader. Runs synchronously in the upload request path, so it does no
//! parsing of its own.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::{
    constants::COMMIT_SHA_VAR,
    data::{generate_id, Upload},
    observe::put_upload_index,
};

use super::{functions, upload_event, Env};

/// Create the upload record for a stored file and queue the followup read.
///
/// `key` is where the raw upload already sits in the object store;
/// `auth_token` is recorded (obscured) in the scoring log only.
pub fn run(env: &Env, key: &str, auth_token: Option<&str>) -> Result<Upload> {
    let now = Utc::now();
    let mut upload = Upload::new(generate_id(now), key, now);
    upload.auth_token = auth_token.map(str::to_string);
    upload.commit_sha = std::env::var(COMMIT_SHA_VAR).ok();
    upload.message =
        "Reading this newly-uploaded plan. Reload this page to see the result.".to_string();

    put_upload_index(env.store.as_ref(), &upload)
        .context("[workers::preread] Failed to write initial index")?;

    // the bearer token never serializes, so neither the index nor the
    // followup event can carry it
    let event = upload_event(&upload)?;
    env.invoker.invoke(functions::PREREAD_FOLLOWUP, event)
        .context("[workers::preread] Failed to queue followup")?;

    tracing::info!(id = %upload.id, key, "admitted upload");
    Ok(upload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Stage;
    use crate::storage::ObjectStore;
    use crate::workers::tests::test_env;

    #[test]
    fn admission_writes_the_index_and_queues_the_followup() {
        let (env, store, queue) = test_env();

        let upload = run(&env, "uploads/x/upload/plan.geojson", Some("deadbeefcafe")).unwrap();
        assert_eq!(upload.stage, Stage::Preread);
        assert_eq!(upload.message, "Reading this newly-uploaded plan. Reload this page to see the result.");
        assert!(store.object_exists(&upload.index_key()));

        let (function, payload) = queue.pop().unwrap();
        assert_eq!(function, functions::PREREAD_FOLLOWUP);
        assert_eq!(payload["id"], serde_json::Value::from(upload.id.clone()));
        // the bearer token never rides along in the event
        assert!(payload.get("auth_token").is_none());
    }

    #[test]
    fn bearer_token_never_reaches_the_stored_index() {
        let (env, store, _) = test_env();

        let upload = run(&env, "uploads/x/upload/plan.geojson", Some("secret-bearer-token")).unwrap();
        assert_eq!(upload.auth_token.as_deref(), Some("secret-bearer-token"));

        let body = store.get_object(&upload.index_key()).unwrap().text().unwrap();
        assert!(!body.contains("auth_token"));
        assert!(!body.contains("secret-bearer-token"));
    }
}
