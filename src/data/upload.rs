//! The single entity persisted through all scoring stages.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{constants::UPLOAD_TIME_LIMIT, data::model::Model};

/// One-per-district incumbency scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Incumbency {
    #[default]
    #[serde(rename = "O")]
    Open,
    #[serde(rename = "D")]
    Democrat,
    #[serde(rename = "R")]
    Republican,
}

impl Incumbency {
    /// Model input code: -1 Republican, 0 open seat, +1 Democrat.
    #[inline]
    pub fn code(self) -> f64 {
        match self {
            Incumbency::Open => 0.0,
            Incumbency::Democrat => 1.0,
            Incumbency::Republican => -1.0,
        }
    }

    /// Single-letter scenario used in district totals.
    #[inline]
    pub fn letter(self) -> &'static str {
        match self {
            Incumbency::Open => "O",
            Incumbency::Democrat => "D",
            Incumbency::Republican => "R",
        }
    }
}

/// (completed, expected) pair surfaced to the polling front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress(pub u32, pub u32);

impl Progress {
    #[inline] pub fn completed(&self) -> u32 { self.0 }
    #[inline] pub fn expected(&self) -> u32 { self.1 }
    #[inline] pub fn is_complete(&self) -> bool { self.0 >= self.1 }
}

/// Explicit pipeline lifecycle, validated on every index write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Preread,
    PrereadFollowup,
    PostreadCallback,
    PostreadIntermediate,
    PostreadCalculate,
    Final,
}

/// Per-district record: computed totals plus attribution outputs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct District {
    #[serde(default)]
    pub totals: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compactness: Option<BTreeMap<String, Option<f64>>>,
    #[serde(default)]
    pub number: Option<u32>,
    #[serde(default)]
    pub is_counted: Option<bool>,
}

impl District {
    /// Numeric total for a column, if present and numeric.
    pub fn total(&self, name: &str) -> Option<f64> {
        self.totals.get(name).and_then(Value::as_f64)
    }
}

/// Authoritative state for one uploaded plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub model: Option<Model>,
    #[serde(default)]
    pub districts: Vec<Option<District>>,
    #[serde(default)]
    pub incumbents: Vec<Incumbency>,
    #[serde(default)]
    pub summary: BTreeMap<String, Value>,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub status: Option<bool>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_metadata: Option<Value>,
    // held in memory for the scoring log only; never serialized, so it can
    // appear in neither the public index nor a worker event
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub geometry_key: Option<String>,
    pub start_time: f64,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

/// Time-prefixed opaque identifier, e.g. `20210527T030730.241822291Z`.
pub fn generate_id(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Nanos, true)
        .replace(['-', ':'], "")
}

/// Storage key for a raw upload, preserving the original filename.
pub fn upload_key(id: &str, filename: &str) -> String {
    format!("uploads/{id}/upload/{filename}")
}

impl Upload {
    /// Create a fresh upload; `start_time` is set once and never mutated.
    pub fn new(id: impl Into<String>, key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            model: None,
            districts: Vec::new(),
            incumbents: Vec::new(),
            summary: BTreeMap::new(),
            progress: None,
            status: None,
            message: String::new(),
            description: String::new(),
            library_metadata: None,
            auth_token: None,
            model_version: None,
            geometry_key: None,
            start_time: now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6,
            stage: Stage::Preread,
            commit_sha: None,
        }
    }

    pub fn index_key(&self) -> String { format!("uploads/{}/index.json", self.id) }
    pub fn plaintext_key(&self) -> String { format!("uploads/{}/index.txt", self.id) }
    pub fn geometry_json_key(&self) -> String { format!("uploads/{}/geometry.json", self.id) }
    pub fn geometry_bbox_key(&self) -> String { format!("uploads/{}/geometry-bboxes.geojson", self.id) }
    pub fn partition_key(&self) -> String { format!("uploads/{}/districts/partition.csv.gz", self.id) }

    pub fn geometry_wkt_key(&self, index: usize) -> String {
        format!("uploads/{}/geometries/{}.wkt", self.id, index)
    }

    pub fn assignment_key(&self, index: usize) -> String {
        format!("uploads/{}/assignments/{}.txt", self.id, index)
    }

    pub fn district_key(&self, index: usize) -> String {
        format!("uploads/{}/districts/{}.json", self.id, index)
    }

    /// Scoring-log key; `ds` comes from `start_time`, the name from the caller.
    pub fn logentry_key(&self, uuid: &str) -> String {
        format!("logs/scoring/ds={}/{}.txt", self.start_date(), uuid)
    }

    pub fn timing_key(&self) -> String {
        format!("logs/timing/ds={}/{}.txt", self.start_date(), self.id)
    }

    fn start_date(&self) -> String {
        let secs = self.start_time.floor() as i64;
        match Utc.timestamp_opt(secs, 0).single() {
            Some(dt) => dt.format("%Y-%m-%d").to_string(),
            None => "0000-00-00".to_string(),
        }
    }

    /// Overdue uploads may be retried or reported as stalled.
    pub fn is_overdue(&self, now: f64) -> bool {
        now - self.start_time > UPLOAD_TIME_LIMIT
    }

    /// Begin an immutable update. `id`, `key`, and `start_time` carry over;
    /// a non-null `status` is sticky unless the caller supplies a new one;
    /// `auth_token` is never propagated.
    pub fn clone_with(&self) -> CloneUpload<'_> {
        CloneUpload { source: self, changes: Changes::default() }
    }

    /// District numbers in index order, for the plaintext dump.
    pub fn district_numbers(&self) -> Vec<Option<u32>> {
        self.districts.iter()
            .map(|d| d.as_ref().and_then(|d| d.number))
            .collect()
    }
}

#[derive(Default)]
struct Changes {
    model: Option<Option<Model>>,
    districts: Option<Vec<Option<District>>>,
    incumbents: Option<Vec<Incumbency>>,
    summary: Option<BTreeMap<String, Value>>,
    progress: Option<Option<Progress>>,
    status: Option<Option<bool>>,
    message: Option<String>,
    description: Option<String>,
    library_metadata: Option<Option<Value>>,
    model_version: Option<Option<String>>,
    geometry_key: Option<Option<String>>,
    stage: Option<Stage>,
}

/// Builder for `Upload::clone_with`.
pub struct CloneUpload<'a> {
    source: &'a Upload,
    changes: Changes,
}

impl CloneUpload<'_> {
    pub fn model(mut self, model: Model) -> Self { self.changes.model = Some(Some(model)); self }
    pub fn districts(mut self, d: Vec<Option<District>>) -> Self { self.changes.districts = Some(d); self }
    pub fn incumbents(mut self, i: Vec<Incumbency>) -> Self { self.changes.incumbents = Some(i); self }
    pub fn summary(mut self, s: BTreeMap<String, Value>) -> Self { self.changes.summary = Some(s); self }
    pub fn progress(mut self, p: Progress) -> Self { self.changes.progress = Some(Some(p)); self }
    pub fn status(mut self, s: bool) -> Self { self.changes.status = Some(Some(s)); self }
    pub fn message(mut self, m: impl Into<String>) -> Self { self.changes.message = Some(m.into()); self }
    pub fn description(mut self, d: impl Into<String>) -> Self { self.changes.description = Some(d.into()); self }
    pub fn library_metadata(mut self, v: Value) -> Self { self.changes.library_metadata = Some(Some(v)); self }
    pub fn model_version(mut self, v: impl Into<String>) -> Self { self.changes.model_version = Some(Some(v.into())); self }
    pub fn geometry_key(mut self, k: impl Into<String>) -> Self { self.changes.geometry_key = Some(Some(k.into())); self }

    /// Advance the lifecycle. Transitions are monotone; a regression keeps
    /// the source stage and logs a warning.
    pub fn stage(mut self, stage: Stage) -> Self { self.changes.stage = Some(stage); self }

    pub fn build(self) -> Upload {
        let src = self.source;
        let ch = self.changes;

        let stage = match ch.stage {
            Some(requested) if requested < src.stage => {
                tracing::warn!(?requested, current = ?src.stage, id = %src.id,
                    "ignoring upload stage regression");
                src.stage
            }
            Some(requested) => requested,
            None => src.stage,
        };

        Upload {
            id: src.id.clone(),
            key: src.key.clone(),
            model: ch.model.unwrap_or_else(|| src.model.clone()),
            districts: ch.districts.unwrap_or_else(|| src.districts.clone()),
            incumbents: ch.incumbents.unwrap_or_else(|| src.incumbents.clone()),
            summary: ch.summary.unwrap_or_else(|| src.summary.clone()),
            progress: ch.progress.unwrap_or(src.progress),
            status: ch.status.unwrap_or(src.status),
            message: ch.message.unwrap_or_else(|| src.message.clone()),
            description: ch.description.unwrap_or_else(|| src.description.clone()),
            library_metadata: ch.library_metadata.unwrap_or_else(|| src.library_metadata.clone()),
            auth_token: None,
            model_version: ch.model_version.unwrap_or_else(|| src.model_version.clone()),
            geometry_key: ch.geometry_key.unwrap_or_else(|| src.geometry_key.clone()),
            start_time: src.start_time,
            stage,
            commit_sha: src.commit_sha.clone(),
        }
    }
}
