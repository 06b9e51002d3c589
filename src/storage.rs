//! Object-store wrapper: the only shared mutable resource in the pipeline.
//!
//! Keys are writer-exclusive by upload id; readiness of fan-out outputs is
//! observed by polling for key existence (`wait_for_object`).

use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::RwLock,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use thiserror::Error;

use crate::error::ScoreError;

/// Missing-key error, retryable while polling for expected outputs.
#[derive(Debug, Error)]
#[error("no such key: {0}")]
pub struct NoSuchKey(pub String);

/// A stored object with the metadata the pipeline cares about.
#[derive(Debug, Clone, Default)]
pub struct Object {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl Object {
    /// Body bytes, gunzipped when stored with `Content-Encoding: gzip`.
    pub fn decoded_body(&self) -> Result<Vec<u8>> {
        if self.content_encoding.as_deref() == Some("gzip") {
            let mut decoder = GzDecoder::new(self.body.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)
                .context("[storage::decoded_body] Failed to gunzip object body")?;
            Ok(out)
        } else {
            Ok(self.body.clone())
        }
    }

    /// Decoded body as UTF-8 text.
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.decoded_body()?)
            .context("[storage::text] Object body is not valid UTF-8")
    }
}

/// Write-time object metadata.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub acl: Option<String>,
}

impl PutOptions {
    pub fn public_json() -> Self {
        Self {
            content_type: Some("text/json".to_string()),
            cache_control: Some("public, no-cache, no-store".to_string()),
            acl: Some("public-read".to_string()),
            ..Default::default()
        }
    }

    pub fn public_text() -> Self {
        Self {
            content_type: Some("text/plain".to_string()),
            cache_control: Some("public, no-cache, no-store".to_string()),
            acl: Some("public-read".to_string()),
            ..Default::default()
        }
    }

    pub fn private_text() -> Self {
        Self {
            content_type: Some("text/plain".to_string()),
            acl: Some("bucket-owner-full-control".to_string()),
            ..Default::default()
        }
    }

    pub fn gzipped_json() -> Self {
        Self {
            content_type: Some("text/json".to_string()),
            content_encoding: Some("gzip".to_string()),
            acl: Some("public-read".to_string()),
            ..Default::default()
        }
    }

    pub fn with_encoding(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_string());
        self
    }
}

/// Minimal object-store surface used by every stage.
pub trait ObjectStore: Send + Sync {
    fn get_object(&self, key: &str) -> Result<Object>;
    fn put_object(&self, key: &str, body: Vec<u8>, opts: &PutOptions) -> Result<()>;
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    fn object_exists(&self, key: &str) -> bool {
        self.get_object(key).is_ok()
    }
}

/// In-memory store for tests and the all-in-one local runner.
#[derive(Default)]
pub struct MemStore {
    objects: RwLock<BTreeMap<String, (Object, PutOptions)>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write-time options recorded for a key, for assertions.
    pub fn put_options(&self, key: &str) -> Option<PutOptions> {
        self.objects.read().expect("poisoned").get(key).map(|(_, opts)| opts.clone())
    }
}

impl ObjectStore for MemStore {
    fn get_object(&self, key: &str) -> Result<Object> {
        self.objects.read().expect("poisoned")
            .get(key)
            .map(|(object, _)| object.clone())
            .ok_or_else(|| NoSuchKey(key.to_string()).into())
    }

    fn put_object(&self, key: &str, body: Vec<u8>, opts: &PutOptions) -> Result<()> {
        let object = Object {
            body,
            content_type: opts.content_type.clone(),
            content_encoding: opts.content_encoding.clone(),
        };
        self.objects.write().expect("poisoned").insert(key.to_string(), (object, opts.clone()));
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.objects.read().expect("poisoned")
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Directory-backed store. Content encoding is tracked in a sidecar file so
/// gzipped artifacts survive a round trip.
pub struct FileStore {
    root: PathBuf,
}

const META_SUFFIX: &str = ".objectmeta";

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(Path::new(key))
    }
}

impl ObjectStore for FileStore {
    fn get_object(&self, key: &str) -> Result<Object> {
        let path = self.path_for(key);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(NoSuchKey(key.to_string()).into());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("[storage::FileStore] Failed to read {}", path.display())
                });
            }
        };

        let meta_path = self.path_for(&format!("{key}{META_SUFFIX}"));
        let content_encoding = fs::read_to_string(meta_path).ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Object { body, content_type: None, content_encoding })
    }

    fn put_object(&self, key: &str, body: Vec<u8>, opts: &PutOptions) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("[storage::FileStore] Failed to create {}", parent.display())
            })?;
        }
        fs::write(&path, body).with_context(|| {
            format!("[storage::FileStore] Failed to write {}", path.display())
        })?;

        if let Some(encoding) = &opts.content_encoding {
            fs::write(self.path_for(&format!("{key}{META_SUFFIX}")), encoding)?;
        }

        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        fn visit(dir: &Path, root: &Path, keys: &mut Vec<String>) -> Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    visit(&path, root, keys)?;
                } else if let Some(rel) = path.strip_prefix(root).ok().and_then(Path::to_str) {
                    if !rel.ends_with(META_SUFFIX) {
                        keys.push(rel.to_string());
                    }
                }
            }
            Ok(())
        }

        let mut keys = Vec::new();
        if self.root.is_dir() {
            visit(&self.root, &self.root, &mut keys)?;
        }
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// Poll for an expected object until it appears or the deadline passes.
///
/// Missing keys are retryable; any other storage error propagates. Past the
/// deadline the caller gets `ScoreError::Timeout`.
pub fn wait_for_object(
    store: &dyn ObjectStore,
    key: &str,
    poll: Duration,
    deadline: Instant,
) -> Result<Object> {
    loop {
        match store.get_object(key) {
            Ok(object) => return Ok(object),
            Err(err) if err.downcast_ref::<NoSuchKey>().is_some() => {
                if Instant::now() + poll > deadline {
                    return Err(ScoreError::Timeout.into());
                }
                tracing::debug!(key, "waiting for expected object");
                std::thread::sleep(poll);
            }
            Err(err) => return Err(err),
        }
    }
}
