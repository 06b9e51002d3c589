//! Annotation callback: apply the user's form to an admitted upload and
//! start the scoring chain.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    auth,
    data::{Incumbency, Stage, Upload},
    observe::{get_upload_index, put_upload_index},
};

use super::{functions, upload_event, Env};

/// User-supplied annotations gathered by the front-end form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub incumbents: Option<Vec<Incumbency>>,
    #[serde(default)]
    pub library_metadata: Option<Value>,
    #[serde(default)]
    pub model_version: Option<String>,
}

/// Apply annotations to the upload named by `signed_id` and queue validation.
///
/// With a signing secret configured the id must verify; without one (local
/// runs) it is taken as-is. Unknown model versions are not rejected here:
/// the intermediate stage owns that failure so it lands in the index.
pub fn run(env: &Env, signed_id: &str, annotations: &Annotations) -> Result<Upload> {
    let id = match auth::signing_secret() {
        Some(secret) => auth::verify_id(&secret, signed_id).map_err(anyhow::Error::new)?,
        None => signed_id.to_string(),
    };

    let index_key = format!("uploads/{id}/index.json");
    let upload = get_upload_index(env.store.as_ref(), &index_key)
        .with_context(|| format!("[workers::postread_callback] No upload {id}"))?;

    let mut builder = upload.clone_with()
        .message("Scoring this newly-uploaded plan. Reload this page to see the result.")
        .stage(Stage::PostreadCallback);
    if let Some(description) = &annotations.description {
        builder = builder.description(description.clone());
    }
    if let Some(incumbents) = &annotations.incumbents {
        builder = builder.incumbents(incumbents.clone());
    }
    if let Some(metadata) = &annotations.library_metadata {
        builder = builder.library_metadata(metadata.clone());
    }
    if let Some(version) = &annotations.model_version {
        builder = builder.model_version(version.clone());
    }
    let annotated = builder.build();

    put_upload_index(env.store.as_ref(), &annotated)?;
    env.invoker.invoke(functions::POSTREAD_INTERMEDIATE, upload_event(&annotated)?)
        .context("[workers::postread_callback] Failed to queue validation")?;

    Ok(annotated)
}
