//! The scoring stage: persist attribution inputs, run the block-attribution
//! query, synthesize missing geometry, score compactness, apply the
//! prediction model, and write the final index.
//!
//! Block-assignment plans fan out one polygon-synthesis worker per district
//! and wait for the WKT objects to appear. When the wall clock runs short
//! the stage re-invokes itself with the still-missing district list; the
//! continuation picks totals back up from the index.

use std::{collections::BTreeMap, time::Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

use crate::{
    analytics::{
        multipolygon_from_wkt, poll_query, postprocess_household_income, AttributionQuery,
        JoinKind,
    },
    blockassign, compactness,
    constants::{POLL_INTERVAL, SELF_CONTINUE_FLOOR_MSEC},
    data::{default_version, version_parameters, District, Model, Progress, Stage, Upload},
    detect::{guess_upload_type, UploadType},
    districts::{put_district_assignments, put_district_geometries, put_partition},
    error::ScoreError,
    matrix::{apply_model, build_tensor, district_inputs, load_matrices},
    observe::{get_upload_index, put_timing_log, put_upload_index},
    plan,
    score::{district_predictions, summarize},
    storage::NoSuchKey,
};

use super::{basename, fail_terminally, functions, upload_event, Env, WorkerContext};

pub fn run(env: &Env, ctx: &WorkerContext, event: Value) -> Result<()> {
    let awaiting: Option<Vec<usize>> = match event.get("awaiting") {
        Some(list) => Some(serde_json::from_value(list.clone())
            .context("[workers::postread_calculate] Bad awaiting list")?),
        None => None,
    };
    let upload: Upload = serde_json::from_value(event)
        .context("[workers::postread_calculate] Bad event payload")?;

    match score_plan(env, ctx, &upload, awaiting) {
        Ok(()) => Ok(()),
        Err(err) => fail_terminally(env, &upload, err),
    }
}

fn score_plan(
    env: &Env,
    ctx: &WorkerContext,
    upload: &Upload,
    awaiting: Option<Vec<usize>>,
) -> Result<()> {
    let started = Instant::now();

    let now = chrono::Utc::now().timestamp() as f64;
    if upload.is_overdue(now) {
        return Err(ScoreError::Timeout.into());
    }

    let model = upload.model.clone()
        .ok_or_else(|| anyhow!("[workers::postread_calculate] Upload {} has no model", upload.id))?;
    let tag = upload.model_version.as_deref().unwrap_or(default_version());
    let params = version_parameters(tag)?;

    let (current, pending) = match awaiting {
        None => {
            let working = upload.clone_with()
                .message("Scoring: Building a district map.")
                .stage(Stage::PostreadCalculate)
                .build();
            put_upload_index(env.store.as_ref(), &working)?;

            let (join, count, fanout) = prepare_attribution(env, &working)?;
            let attributed = attribute(env, ctx, &working, &model, join, count)?;
            (attributed, fanout)
        }
        // the continuation's totals live in the index, not the event
        Some(list) => (get_upload_index(env.store.as_ref(), &upload.index_key())?, list),
    };

    if let Some(missing) = await_geometries(env, ctx, &current, &pending)? {
        let total = current.districts.len() as u32;
        let waiting = current.clone_with()
            .progress(Progress(total - missing.len() as u32, total))
            .build();
        put_upload_index(env.store.as_ref(), &waiting)?;

        let mut event = upload_event(&waiting)?;
        event["awaiting"] = json!(missing);
        env.invoker.invoke(functions::POSTREAD_CALCULATE, event)
            .context("[workers::postread_calculate] Failed to queue continuation")?;
        tracing::info!(id = %current.id, "continuing in a fresh worker");
        return Ok(());
    }

    let measured = with_compactness(env, &current)?;
    let predicting = measured.clone_with()
        .message("Predicting future votes for each district")
        .build();
    put_upload_index(env.store.as_ref(), &predicting)?;

    let finished = predict(env, &predicting, &model, params)?;
    put_upload_index(env.store.as_ref(), &finished)?;
    put_timing_log(env.store.as_ref(), &finished, &[
        ("postread_calculate", started.elapsed().as_secs_f64()),
    ])?;

    tracing::info!(id = %finished.id, districts = finished.districts.len(), "finished scoring");
    Ok(())
}

/// Persist the attribution inputs for the uploaded file and return the join
/// kind, district count, and the indexes of any fanned-out polygon workers.
fn prepare_attribution(env: &Env, upload: &Upload) -> Result<(JoinKind, usize, Vec<usize>)> {
    let object = env.store.get_object(&upload.key)
        .with_context(|| format!("[workers::postread_calculate] Failed to read {}", upload.key))?;
    let bytes = object.decoded_body()?;
    let filename = basename(&upload.key);

    match guess_upload_type(filename, &bytes)? {
        UploadType::BlockAssignment | UploadType::ZippedBlockAssignment => {
            let assignments = blockassign::parse(filename, &bytes)?;
            let rows = put_district_assignments(env.store.as_ref(), upload, &assignments)?;
            put_partition(env.store.as_ref(), upload, &rows)?;

            // one polygon-synthesis worker per district
            let count = assignments.seat_count();
            for index in 0..count {
                let mut event = upload_event(upload)?;
                event["district"] = json!(index);
                env.invoker.invoke(functions::POLYGONIZE, event)
                    .with_context(|| format!(
                        "[workers::postread_calculate] Failed to fan out district {index}"))?;
            }
            Ok((JoinKind::BlockId, count, (0..count).collect()))
        }
        upload_type => {
            let features = plan::read_plan(filename, &bytes, upload_type)?;
            let (field, ordered) = plan::ordered_districts(&features);
            let districts = plan::group_districts(&ordered, field.as_deref());

            let geometries: Vec<_> = districts.iter().map(|d| d.geometry.clone()).collect();
            plan::put_geojson_preview(env.store.as_ref(), upload, &geometries)?;
            let rows = put_district_geometries(env.store.as_ref(), upload, &districts)?;
            put_partition(env.store.as_ref(), upload, &rows)?;
            Ok((JoinKind::Spatial, districts.len(), Vec::new()))
        }
    }
}

/// Run the attribution query and fold its totals into numbered districts.
fn attribute(
    env: &Env,
    ctx: &WorkerContext,
    upload: &Upload,
    model: &Model,
    join: JoinKind,
    count: usize,
) -> Result<Upload> {
    let counting = upload.clone_with()
        .message("Counting votes and people in each district")
        .build();
    put_upload_index(env.store.as_ref(), &counting)?;

    let query = AttributionQuery::new(&upload.id, &model.key_prefix, join);
    let execution_id = env.engine.start_query(env.store.as_ref(), &query)?;
    let results = poll_query(env.engine.as_ref(), &execution_id, ctx.safety_deadline())?;

    let mut districts: Vec<Option<District>> = vec![None; count];
    for mut totals in results.decoded_rows()? {
        let index = totals.remove("number")
            .and_then(|v| v.as_i64())
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| ScoreError::AnalyticsFailure(
                "attribution row carries no district number".to_string()))?;
        if index >= count {
            return Err(ScoreError::AnalyticsFailure(
                format!("attribution row names district {index} of {count}")).into());
        }

        postprocess_household_income(&mut totals);
        let scenario = upload.incumbents.get(index).copied().unwrap_or_default();
        totals.insert("Candidate Scenario".to_string(), Value::from(scenario.letter()));

        districts[index] = Some(District {
            totals,
            compactness: None,
            number: Some(index as u32 + 1),
            is_counted: None,
        });
    }

    // districts the query never matched still get a numbered, empty record
    for (index, district) in districts.iter_mut().enumerate() {
        if district.is_none() {
            *district = Some(District {
                number: Some(index as u32 + 1),
                ..District::default()
            });
        }
    }

    Ok(counting.clone_with().districts(districts).build())
}

/// Wait for fanned-out geometry objects. `Ok(None)` means all arrived;
/// `Ok(Some(missing))` means the caller should self-continue.
fn await_geometries(
    env: &Env,
    ctx: &WorkerContext,
    upload: &Upload,
    pending: &[usize],
) -> Result<Option<Vec<usize>>> {
    if pending.is_empty() {
        return Ok(None);
    }

    let mut missing: Vec<usize> = pending.to_vec();
    loop {
        missing.retain(|&index| !env.store.object_exists(&upload.geometry_wkt_key(index)));
        if missing.is_empty() {
            return Ok(None);
        }
        if ctx.remaining_millis() < SELF_CONTINUE_FLOOR_MSEC {
            return Ok(Some(missing));
        }
        if Instant::now() + POLL_INTERVAL > ctx.safety_deadline() {
            return Err(ScoreError::Timeout.into());
        }
        tracing::debug!(id = %upload.id, missing = missing.len(), "waiting for district geometries");
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Score compactness from the per-district WKT objects. Districts with no
/// stored geometry (null features) stay unscored.
fn with_compactness(env: &Env, upload: &Upload) -> Result<Upload> {
    let mut districts = upload.districts.clone();

    for (index, district) in districts.iter_mut().enumerate() {
        let Some(district) = district else { continue };
        let object = match env.store.get_object(&upload.geometry_wkt_key(index)) {
            Ok(object) => object,
            Err(err) if err.downcast_ref::<NoSuchKey>().is_some() => continue,
            Err(err) => return Err(err),
        };
        let geometry = multipolygon_from_wkt(&object.text()?)?;
        district.compactness = Some(compactness::scores(&geometry));
    }

    Ok(upload.clone_with().districts(districts).build())
}

/// Apply the prediction model and assemble the final index.
fn predict(
    env: &Env,
    upload: &Upload,
    model: &Model,
    params: &'static crate::data::VersionParameters,
) -> Result<Upload> {
    let matrices = load_matrices(env.store.as_ref(), &model.state, params)?;
    let inputs = district_inputs(&upload.districts, &upload.incumbents, params);
    let shares = apply_model(&inputs, &matrices, model.house, params)?;
    let tensor = build_tensor(&shares, inputs.district_total);

    let mut districts = upload.districts.clone();
    for (district, prediction) in districts.iter_mut().zip(district_predictions(&tensor)) {
        let Some(district) = district else { continue };
        district.is_counted = Some(prediction.is_counted);
        if !prediction.is_counted {
            district.number = None;
            continue;
        }
        let predicted: BTreeMap<&str, f64> = BTreeMap::from([
            ("Democratic Votes", prediction.dem_mean),
            ("Democratic Votes SD", prediction.dem_sd),
            ("Republican Votes", prediction.rep_mean),
            ("Republican Votes SD", prediction.rep_sd),
            ("Democratic Wins", prediction.dem_wins),
        ]);
        for (name, value) in predicted {
            if value.is_finite() {
                district.totals.insert(name.to_string(), Value::from(value));
            }
        }
    }

    let total = districts.len() as u32;
    Ok(upload.clone_with()
        .districts(districts)
        .summary(summarize(&tensor, model.house))
        .progress(Progress(total, total))
        .status(true)
        .message("Finished scoring this plan.")
        .stage(Stage::Final)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::workers::tests::{test_env, test_upload};

    #[test]
    fn overdue_uploads_fail_with_the_timeout_message() {
        let (env, store, _) = test_env();
        let mut upload = test_upload("uploads/x/upload/plan.geojson");
        upload.start_time = 0.0; // far in the past

        let ctx = WorkerContext::new();
        run(&env, &ctx, upload_event(&upload).unwrap()).unwrap();

        let back = get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.status, Some(false));
        assert_eq!(back.message, "Can't score this plan: Out of time");
    }

    #[test]
    fn exhausted_budget_queues_a_continuation() {
        let (env, store, queue) = test_env();
        let mut upload = test_upload("uploads/x/upload/plan.csv");
        upload.model = crate::data::models_for_state("XX").next().cloned();
        upload.districts = vec![None, None];
        put_upload_index(store.as_ref(), &upload).unwrap();

        // no geometry objects exist and no time remains, so the waiter must
        // hand back the full missing list instead of sleeping
        let ctx = WorkerContext::with_budget(Duration::from_millis(1));
        let missing = await_geometries(&env, &ctx, &upload, &[0, 1]).unwrap();
        assert_eq!(missing, Some(vec![0, 1]));
        assert!(queue.is_empty());
    }

    #[test]
    fn model_free_uploads_fail_terminally_with_the_generic_message() {
        let (env, store, _) = test_env();
        let upload = test_upload("uploads/x/upload/plan.geojson");

        let ctx = WorkerContext::new();
        // no model on the upload is outside the known taxonomy: re-raised
        assert!(run(&env, &ctx, upload_event(&upload).unwrap()).is_err());

        let back = get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.status, Some(false));
        assert_eq!(back.message, "Can't score this plan: something went wrong, giving up.");
    }
}
