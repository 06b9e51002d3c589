//! Stage workers for the scoring pipeline.
//!
//! Each uploaded plan moves through preread, preread followup, the
//! annotation callback, intermediate validation, and calculation. Stages
//! communicate only through the object store and fire-and-forget
//! invocations; the upload index is the single authoritative record.

pub mod context;
pub mod polygonize;
pub mod postread_calculate;
pub mod postread_callback;
pub mod postread_intermediate;
pub mod preread;
pub mod preread_followup;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::{
    data::{Stage, Upload},
    error::{failure_message, is_unknown},
    observe::put_upload_index,
};

pub use context::{run_all, Env, Invoker, LocalQueue, ThreadedInvoker, WorkerContext};
pub use postread_callback::Annotations;

/// Worker function names, as wired into the hosting runtime.
pub mod functions {
    pub const PREREAD_FOLLOWUP: &str = "PrereadFollowup";
    pub const POSTREAD_INTERMEDIATE: &str = "PostreadIntermediate";
    pub const POSTREAD_CALCULATE: &str = "PostreadCalculate";
    pub const POLYGONIZE: &str = "PolygonizeDistrict";
}

/// Route one invocation to its stage worker.
pub fn dispatch(env: &Env, ctx: &WorkerContext, function: &str, payload: Value) -> Result<()> {
    match function {
        functions::PREREAD_FOLLOWUP => preread_followup::run(env, payload),
        functions::POSTREAD_INTERMEDIATE => postread_intermediate::run(env, payload),
        functions::POSTREAD_CALCULATE => postread_calculate::run(env, ctx, payload),
        functions::POLYGONIZE => polygonize::run(env, payload),
        other => bail!("[workers::dispatch] Unknown worker function '{other}'"),
    }
}

/// Serialize an upload as a worker event payload.
pub fn upload_event(upload: &Upload) -> Result<Value> {
    serde_json::to_value(upload).context("[workers::upload_event] Failed to serialize upload")
}

/// Final path component of an upload key, used as the original filename.
pub(crate) fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Write the terminal failure index for an upload. Known failures are
/// absorbed after the index write; anything outside the taxonomy is
/// re-raised so the host can record it.
pub(crate) fn fail_terminally(env: &Env, upload: &Upload, err: anyhow::Error) -> Result<()> {
    let failed = upload.clone_with()
        .status(false)
        .message(failure_message(&err))
        .stage(Stage::Final)
        .build();
    put_upload_index(env.store.as_ref(), &failed)
        .context("[workers::fail_terminally] Failed to write failure index")?;

    if is_unknown(&err) {
        return Err(err);
    }
    tracing::info!(id = %upload.id, error = %err, "upload failed terminally");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, sync::Arc};

    use chrono::{TimeZone, Utc};
    use flate2::{write::GzEncoder, Compression};
    use geo::Point;
    use serde_json::json;

    use crate::analytics::{Block, MemoryEngine};
    use crate::error::ScoreError;
    use crate::storage::{MemStore, ObjectStore, PutOptions};

    pub(crate) fn test_env() -> (Env, Arc<MemStore>, Arc<LocalQueue>) {
        let store = Arc::new(MemStore::new());
        let queue = Arc::new(LocalQueue::new());
        let env = Env {
            store: store.clone(),
            engine: Arc::new(MemoryEngine::new()),
            invoker: queue.clone(),
        };
        (env, store, queue)
    }

    // deterministic id, fresh clock: the scoring stage treats a stale
    // start_time as an overdue upload
    pub(crate) fn test_upload(key: &str) -> Upload {
        let id = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        Upload::new(crate::data::generate_id(id), key, Utc::now())
    }

    #[test]
    fn basename_takes_the_last_component() {
        assert_eq!(basename("uploads/abc/upload/plan.geojson"), "plan.geojson");
        assert_eq!(basename("plan.zip"), "plan.zip");
    }

    fn put_gz(store: &MemStore, key: &str, body: &[u8]) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        store.put_object(key, encoder.finish().unwrap(),
            &PutOptions::private_text().with_encoding("gzip")).unwrap();
    }

    /// Four-simulation model: share = 0.5 + (presidential share + mean
    /// adjustment), no incumbency effect, no state offsets, no residuals.
    fn put_matrices(store: &MemStore) {
        put_gz(store, "data/model/C_matrix_2025A.csv.gz", concat!(
            "key,V1,V2,V3,V4\n",
            "b_Intercept,0.5,0.5,0.5,0.5\n",
            "b_dpres_mn,1.0,1.0,1.0,1.0\n",
            "b_incumb,0.0,0.0,0.0,0.0\n",
        ).as_bytes());
        put_gz(store, "data/model/E_matrix_2025A.csv.gz", concat!(
            "V1,V2,V3,V4\n",
            "0.0,0.0,0.0,0.0\n",
            "0.0,0.0,0.0,0.0\n",
        ).as_bytes());
    }

    fn block(geoid: &str, x: f64, y: f64, dem: f64, rep: f64) -> Block {
        Block {
            geoid: geoid.to_string(),
            point: Point::new(x, y),
            values: [
                ("US President 2020 - DEM".to_string(), dem),
                ("US President 2020 - REP".to_string(), rep),
                ("Population 2019".to_string(), 100.0),
                ("Households 2016".to_string(), 40.0),
                ("Sum Household Income 2016".to_string(), 2_000_000.0),
            ].into_iter().collect(),
        }
    }

    #[test]
    fn geometry_pipeline_scores_a_plan_end_to_end() {
        let store = Arc::new(MemStore::new());
        let queue = Arc::new(LocalQueue::new());
        let engine = Arc::new(MemoryEngine::new());
        let env = Env {
            store: store.clone(),
            engine: engine.clone(),
            invoker: queue.clone(),
        };

        // two unit squares straddling Null Island, one block point in each
        let plan = json!({"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"DISTRICT": 1}, "geometry": {"type": "Polygon",
             "coordinates": [[[-1.0, -0.5], [0.0, -0.5], [0.0, 0.5], [-1.0, 0.5], [-1.0, -0.5]]]}},
            {"type": "Feature", "properties": {"DISTRICT": 2}, "geometry": {"type": "Polygon",
             "coordinates": [[[0.0, -0.5], [1.0, -0.5], [1.0, 0.5], [0.0, 0.5], [0.0, -0.5]]]}},
        ]});
        store.put_object("uploads/t/upload/plan.geojson",
            serde_json::to_vec(&plan).unwrap(), &PutOptions::public_json()).unwrap();

        engine.add_blocks("data/XX/2020", vec![
            block("0000100001", -0.5, 0.0, 60.0, 40.0),
            block("0000100002", 0.5, 0.0, 30.0, 70.0),
        ]);
        put_matrices(&store);

        let upload = preread::run(&env, "uploads/t/upload/plan.geojson", None).unwrap();
        run_all(&env, &queue).unwrap();

        let annotations = Annotations {
            incumbents: Some(vec![crate::data::Incumbency::Democrat, crate::data::Incumbency::Open]),
            ..Annotations::default()
        };
        postread_callback::run(&env, &upload.id, &annotations).unwrap();
        run_all(&env, &queue).unwrap();

        let done = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(done.status, Some(true));
        assert_eq!(done.stage, Stage::Final);
        assert_eq!(done.message, "Finished scoring this plan.");
        assert_eq!(done.districts.len(), 2);

        let first = done.districts[0].as_ref().unwrap();
        assert_eq!(first.total("US President 2020 - DEM"), Some(60.0));
        assert_eq!(first.total("Household Income 2016"), Some(50_000.0));
        assert_eq!(first.totals["Candidate Scenario"], serde_json::Value::from("D"));
        assert_eq!(first.is_counted, Some(true));
        assert!(first.total("Democratic Votes").unwrap() > first.total("Republican Votes").unwrap());
        let compactness = first.compactness.as_ref().unwrap();
        assert!(compactness["Reock"].unwrap() > 0.0);

        assert!(done.summary.contains_key("Efficiency Gap"));
        assert!(done.summary.contains_key("Mean-Median SD"));
        assert!(store.object_exists(&done.geometry_key.unwrap()));
        assert!(store.list_keys("logs/timing/").unwrap().len() == 1);
    }

    #[test]
    fn block_assignment_pipeline_synthesizes_geometry() {
        let store = Arc::new(MemStore::new());
        let invoker = Arc::new(ThreadedInvoker::new());
        let engine = Arc::new(MemoryEngine::new());
        let env = Env {
            store: store.clone(),
            engine: engine.clone(),
            invoker: invoker.clone(),
        };
        invoker.bind(env.clone());

        store.put_object("uploads/t/upload/plan.csv",
            b"0000100001,1\n0000100002,2\n".to_vec(), &PutOptions::public_text()).unwrap();

        // county 00001: two adjacent unit-square blocks sharing the x=1 edge
        let graph = json!({
            "nodes": [
                {"id": "0000100001", "pos": [0.5, 0.5]},
                {"id": "0000100002", "pos": [1.5, 0.5]},
                {"id": "exterior", "pos": null},
            ],
            "edges": [
                {"a": "0000100001", "b": "exterior",
                 "line": [[1.0, 0.0], [0.0, 0.0], [0.0, 1.0], [1.0, 1.0]]},
                {"a": "0000100001", "b": "0000100002", "line": [[1.0, 0.0], [1.0, 1.0]]},
                {"a": "0000100002", "b": "exterior",
                 "line": [[1.0, 0.0], [2.0, 0.0], [2.0, 1.0], [1.0, 1.0]]},
            ],
        });
        put_gz(&store, &crate::polygonize::county_graph_key("XX", "00001"),
            &serde_json::to_vec(&graph).unwrap());

        engine.add_blocks("data/XX/2020", vec![
            block("0000100001", 0.5, 0.5, 55.0, 45.0),
            block("0000100002", 1.5, 0.5, 35.0, 65.0),
        ]);
        put_matrices(&store);

        let upload = preread::run(&env, "uploads/t/upload/plan.csv", None).unwrap();
        invoker.join_all();

        postread_callback::run(&env, &upload.id, &Annotations::default()).unwrap();
        invoker.join_all();

        let done = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(done.status, Some(true));
        assert_eq!(done.message, "Finished scoring this plan.");
        assert_eq!(done.districts.len(), 2);

        let second = done.districts[1].as_ref().unwrap();
        assert_eq!(second.total("US President 2020 - REP"), Some(65.0));
        assert_eq!(second.totals["Candidate Scenario"], serde_json::Value::from("O"));
        assert!(second.compactness.is_some());

        // the fanned-out workers left per-district WKT behind
        assert!(store.object_exists(&done.geometry_wkt_key(0)));
        assert!(store.object_exists(&done.geometry_wkt_key(1)));
        assert_eq!(done.progress, Some(crate::data::Progress(2, 2)));
    }

    #[test]
    fn known_failures_are_absorbed_after_the_index_write() {
        let (env, store, _) = test_env();
        let upload = test_upload("uploads/x/upload/plan.pdf");

        let err = anyhow::Error::new(ScoreError::InvalidUpload("unrecognized file type '.pdf'".to_string()));
        fail_terminally(&env, &upload, err).unwrap();

        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.status, Some(false));
        assert_eq!(back.stage, Stage::Final);
        assert_eq!(back.message, "Can't score this plan: unrecognized file type '.pdf'");
    }

    #[test]
    fn unknown_failures_are_reraised() {
        let (env, store, _) = test_env();
        let upload = test_upload("uploads/x/upload/plan.geojson");

        let err = anyhow::anyhow!("socket hangup");
        assert!(fail_terminally(&env, &upload, err).is_err());

        // the failure index is still written before the re-raise
        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.message, "Can't score this plan: something went wrong, giving up.");
    }
}
