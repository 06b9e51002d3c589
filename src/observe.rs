//! Index persistence and the append-only scoring log.
//!
//! Every index update writes three objects: the authoritative JSON index,
//! a tab-delimited plaintext dump of district totals, and a single-row log
//! entry partitioned by upload date. Only the JSON write may fail the stage;
//! the other two degrade to an `Error: …` body.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    analytics::BLOCK_TABLE_FIELDS,
    data::Upload,
    storage::{ObjectStore, PutOptions},
};

/// Derived totals reported after the canonical block-table columns.
const DERIVED_FIELDS: &[&str] = &[
    "Democratic Votes",
    "Democratic Votes SD",
    "Republican Votes",
    "Republican Votes SD",
    "Democratic Wins",
    "Household Income 2016",
    "Candidate Scenario",
];

/// Save the JSON index, plaintext dump, and scoring-log row for an upload.
pub fn put_upload_index(store: &dyn ObjectStore, upload: &Upload) -> Result<()> {
    let body = serde_json::to_vec_pretty(upload)
        .context("[observe::put_upload_index] Failed to serialize index")?;
    store.put_object(&upload.index_key(), body, &PutOptions::public_json())
        .context("[observe::put_upload_index] Failed to write index.json")?;

    let text = plaintext(upload).unwrap_or_else(|err| format!("Error: {err}\n"));
    store.put_object(&upload.plaintext_key(), text.into_bytes(), &PutOptions::public_text())
        .context("[observe::put_upload_index] Failed to write index.txt")?;

    let row = logentry_row(upload).unwrap_or_else(|err| format!("Error: {err}\n"));
    let key = upload.logentry_key(&Uuid::new_v4().to_string());
    store.put_object(&key, row.into_bytes(), &PutOptions::private_text())
        .context("[observe::put_upload_index] Failed to write log entry")?;

    tracing::debug!(id = %upload.id, stage = ?upload.stage, message = %upload.message,
        "wrote upload index");
    Ok(())
}

/// Read and parse an index object.
pub fn get_upload_index(store: &dyn ObjectStore, key: &str) -> Result<Upload> {
    let object = store.get_object(key)
        .with_context(|| format!("[observe::get_upload_index] Failed to read {key}"))?;
    serde_json::from_slice(&object.decoded_body()?)
        .with_context(|| format!("[observe::get_upload_index] Failed to parse {key}"))
}

/// Obscured form of a bearer token for log lines: first half plus stars.
/// Counted in characters, so multi-byte tokens never split mid-character.
pub fn obscure_token(token: &str) -> String {
    let half = token.chars().count() / 2;
    let kept: String = token.chars().take(half).collect();
    format!("{kept}********")
}

/// Tab-delimited dump of district totals: header of column names, one row
/// per district. Columns follow the canonical block-table order, then the
/// derived fields, then anything else alphabetically.
fn plaintext(upload: &Upload) -> Result<String> {
    let mut known: Vec<&str> = BLOCK_TABLE_FIELDS.iter().map(|spec| spec.name).collect();
    known.extend_from_slice(DERIVED_FIELDS);

    let mut extra: BTreeSet<&str> = BTreeSet::new();
    for district in upload.districts.iter().flatten() {
        for key in district.totals.keys() {
            if !known.contains(&key.as_str()) {
                extra.insert(key);
            }
        }
    }

    let columns: Vec<&str> = known.iter().copied()
        .filter(|name| {
            upload.districts.iter().flatten().any(|d| d.totals.contains_key(*name))
        })
        .chain(extra)
        .collect();

    let mut out = String::new();
    out.push_str("District");
    for name in &columns {
        out.push('\t');
        out.push_str(name);
    }
    out.push('\n');

    for (index, district) in upload.districts.iter().enumerate() {
        match district.as_ref().and_then(|d| d.number) {
            Some(number) => out.push_str(&number.to_string()),
            None => out.push_str(&(index + 1).to_string()),
        }
        for name in &columns {
            out.push('\t');
            if let Some(value) = district.as_ref().and_then(|d| d.totals.get(*name)) {
                out.push_str(&plain_value(value));
            }
        }
        out.push('\n');
    }

    Ok(out)
}

fn plain_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Single tab-delimited log row with fields in fixed positional order:
/// id, unix time, elapsed seconds, message, model state, model house,
/// model JSON, upload key, status char, obscured token, model version.
/// New fields must only be appended.
fn logentry_row(upload: &Upload) -> Result<String> {
    let now = Utc::now().timestamp() as f64;
    let elapsed = now - upload.start_time;

    let fields: Vec<String> = vec![
        upload.id.clone(),
        format!("{now:.0}"),
        format!("{elapsed:.0}"),
        upload.message.replace(['\t', '\n'], " "),
        upload.model.as_ref().map(|m| m.state.clone()).unwrap_or_default(),
        upload.model.as_ref().map(|m| m.house.as_str().to_string()).unwrap_or_default(),
        upload.model.as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("[observe::logentry_row] Failed to serialize model")?
            .unwrap_or_default(),
        upload.key.clone(),
        match upload.status {
            Some(true) => "t".to_string(),
            Some(false) => "f".to_string(),
            None => String::new(),
        },
        upload.auth_token.as_deref().map(obscure_token).unwrap_or_default(),
        upload.model_version.clone().unwrap_or_default(),
    ];

    Ok(format!("{}\n", fields.join("\t")))
}

/// Optional per-run timing detail under `logs/timing/`.
pub fn put_timing_log(store: &dyn ObjectStore, upload: &Upload, stages: &[(&str, f64)]) -> Result<()> {
    let mut body = String::new();
    for (name, seconds) in stages {
        body.push_str(&format!("{}\t{}\t{seconds:.3}\n", upload.id, name));
    }
    store.put_object(&upload.timing_key(), body.into_bytes(), &PutOptions::private_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{generate_id, District, Upload};
    use crate::storage::MemStore;
    use chrono::TimeZone;

    fn sample_upload() -> Upload {
        let now = Utc.with_ymd_and_hms(2021, 5, 27, 3, 7, 30).unwrap();
        let mut upload = Upload::new(generate_id(now), "uploads/x/upload/plan.geojson", now);
        upload.auth_token = Some("deadbeefcafe".to_string());
        upload.message = "Reading this newly-uploaded plan.".to_string();
        upload
    }

    #[test]
    fn put_index_writes_three_objects() {
        let store = MemStore::new();
        let upload = sample_upload();
        put_upload_index(&store, &upload).unwrap();

        let index = store.get_object(&upload.index_key()).unwrap();
        let parsed: Upload = serde_json::from_slice(&index.body).unwrap();
        assert_eq!(parsed.id, upload.id);

        let opts = store.put_options(&upload.index_key()).unwrap();
        assert_eq!(opts.cache_control.as_deref(), Some("public, no-cache, no-store"));
        assert_eq!(opts.acl.as_deref(), Some("public-read"));

        assert!(store.object_exists(&upload.plaintext_key()));
        let logs = store.list_keys("logs/scoring/ds=2021-05-27/").unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn log_row_has_fixed_positional_fields() {
        let store = MemStore::new();
        let upload = sample_upload();
        put_upload_index(&store, &upload).unwrap();

        let key = &store.list_keys("logs/scoring/").unwrap()[0];
        let row = store.get_object(key).unwrap().text().unwrap();
        // only the newline: the unset model_version leaves a trailing tab
        let fields: Vec<&str> = row.trim_end_matches('\n').split('\t').collect();
        assert_eq!(fields.len(), 11);
        assert_eq!(fields[0], upload.id);
        assert_eq!(fields[3], "Reading this newly-uploaded plan.");
        assert_eq!(fields[7], upload.key);
        assert_eq!(fields[8], "");
        assert_eq!(fields[9], "deadbe********");
    }

    #[test]
    fn plaintext_dumps_district_totals() {
        let mut upload = sample_upload();
        upload.districts = vec![Some(District {
            totals: [
                ("US President 2020 - DEM".to_string(), Value::from(1200.5)),
                ("US President 2020 - REP".to_string(), Value::from(800.25)),
            ].into_iter().collect(),
            compactness: None,
            number: Some(1),
            is_counted: Some(true),
        })];

        let text = plaintext(&upload).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "District\tUS President 2020 - DEM\tUS President 2020 - REP");
        assert_eq!(lines[1], "1\t1200.5\t800.25");
    }

    #[test]
    fn index_round_trip_preserves_fields() {
        let store = MemStore::new();
        let mut upload = sample_upload();
        upload.auth_token = None;
        put_upload_index(&store, &upload).unwrap();
        let back = get_upload_index(&store, &upload.index_key()).unwrap();
        assert_eq!(back, upload);
    }

    #[test]
    fn obscured_token_keeps_first_half() {
        assert_eq!(obscure_token("abcdef"), "abc********");
        assert_eq!(obscure_token(""), "********");
        // character-counted, so a multi-byte token cannot split mid-character
        assert_eq!(obscure_token("käsekuchen"), "käsek********");
    }
}
