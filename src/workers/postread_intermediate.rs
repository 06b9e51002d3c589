//! Validation stage: pin down the model version before any heavy work, so a
//! bad annotation fails fast and visibly.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::{
    data::{default_version, version_parameters, Stage, Upload},
    observe::put_upload_index,
};

use super::{fail_terminally, functions, upload_event, Env};

pub fn run(env: &Env, event: Value) -> Result<()> {
    let upload: Upload = serde_json::from_value(event)
        .context("[workers::postread_intermediate] Bad event payload")?;

    match validate(env, &upload) {
        Ok(()) => Ok(()),
        Err(err) => fail_terminally(env, &upload, err),
    }
}

fn validate(env: &Env, upload: &Upload) -> Result<()> {
    let tag = upload.model_version.as_deref().unwrap_or(default_version());
    version_parameters(tag)?;

    let started = upload.clone_with()
        .model_version(tag)
        .message("Scoring: Starting analysis.")
        .stage(Stage::PostreadIntermediate)
        .build();
    put_upload_index(env.store.as_ref(), &started)?;

    env.invoker.invoke(functions::POSTREAD_CALCULATE, upload_event(&started)?)
        .context("[workers::postread_intermediate] Failed to queue calculation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::tests::{test_env, test_upload};

    #[test]
    fn versionless_uploads_get_the_default() {
        let (env, store, queue) = test_env();
        let upload = test_upload("uploads/x/upload/plan.geojson");

        run(&env, upload_event(&upload).unwrap()).unwrap();

        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.model_version.as_deref(), Some("2025A"));
        assert_eq!(back.message, "Scoring: Starting analysis.");
        assert_eq!(queue.pop().unwrap().0, functions::POSTREAD_CALCULATE);
    }

    #[test]
    fn bad_version_is_a_terminal_failure() {
        let (env, store, queue) = test_env();
        let mut upload = test_upload("uploads/x/upload/plan.geojson");
        upload.model_version = Some("1999".to_string());

        run(&env, upload_event(&upload).unwrap()).unwrap();

        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.status, Some(false));
        assert_eq!(back.message, "Can't score this plan: Bad model_version '1999'");
        assert!(queue.is_empty());
    }
}
