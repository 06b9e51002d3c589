//! Followup reader: parse the uploaded file far enough to guess its model
//! and district count, so the annotation form can be shown.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::{
    blockassign,
    data::{Incumbency, Model, Stage, Upload},
    detect::{guess_upload_type, UploadType},
    infer,
    observe::put_upload_index,
    plan,
};

use super::{basename, fail_terminally, Env};

pub fn run(env: &Env, event: Value) -> Result<()> {
    let upload: Upload = serde_json::from_value(event)
        .context("[workers::preread_followup] Bad event payload")?;

    match describe(env, &upload) {
        Ok(described) => put_upload_index(env.store.as_ref(), &described),
        Err(err) => fail_terminally(env, &upload, err),
    }
}

fn describe(env: &Env, upload: &Upload) -> Result<Upload> {
    let object = env.store.get_object(&upload.key)
        .with_context(|| format!("[workers::preread_followup] Failed to read {}", upload.key))?;
    let bytes = object.decoded_body()?;
    let filename = basename(&upload.key);

    let upload_type = guess_upload_type(filename, &bytes)?;
    let (model, count, geometry_key) = match upload_type {
        UploadType::BlockAssignment | UploadType::ZippedBlockAssignment => {
            let assignments = blockassign::parse(filename, &bytes)?;
            let model = infer::guess_blockassign_model(&assignments)?;
            (model, assignments.seat_count(), None)
        }
        UploadType::OgrDatasource | UploadType::ZippedOgrDatasource => {
            let features = plan::read_plan(filename, &bytes, upload_type)?;
            let (field, ordered) = plan::ordered_districts(&features);
            let districts = plan::group_districts(&ordered, field.as_deref());
            let model = infer::guess_geometry_model(&features, districts.len())?;

            let geometries: Vec<_> = districts.iter().map(|d| d.geometry.clone()).collect();
            plan::put_geojson_preview(env.store.as_ref(), upload, &geometries)?;
            (model, districts.len(), Some(upload.geometry_json_key()))
        }
    };

    tracing::info!(id = %upload.id, state = %model.state, house = model.house.as_str(),
        districts = count, "described upload");

    // every district defaults to an open seat until the annotation callback
    // says otherwise
    let mut builder = upload.clone_with()
        .model(model.clone())
        .districts(vec![None; count])
        .incumbents(vec![Incumbency::Open; count])
        .message(found_message(model, count))
        .stage(Stage::PrereadFollowup);
    if let Some(key) = geometry_key {
        builder = builder.geometry_key(key);
    }
    Ok(builder.build())
}

fn found_message(model: &Model, count: usize) -> String {
    let seats = model.seats.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string());
    format!(
        "Found {count} districts in the \"{}\" {} plan with {seats} seats.",
        model.key_prefix,
        model.house.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ObjectStore, PutOptions};
    use crate::workers::tests::{test_env, test_upload};
    use crate::workers::upload_event;

    // two unit squares straddling Null Island, the synthetic test state
    const NULL_ISLAND_PLAN: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"DISTRICT": 1}, "geometry": {"type": "Polygon",
         "coordinates": [[[-0.1, -0.1], [0.1, -0.1], [0.1, 0.1], [-0.1, 0.1], [-0.1, -0.1]]]}},
        {"type": "Feature", "properties": {"DISTRICT": 2}, "geometry": {"type": "Polygon",
         "coordinates": [[[0.1, -0.1], [0.3, -0.1], [0.3, 0.1], [0.1, 0.1], [0.1, -0.1]]]}}
    ]}"#;

    #[test]
    fn geometry_upload_yields_model_and_blank_districts() {
        let (env, store, _) = test_env();
        let upload = test_upload("uploads/x/upload/plan.geojson");
        store.put_object(&upload.key, NULL_ISLAND_PLAN.into(), &PutOptions::public_json()).unwrap();

        run(&env, upload_event(&upload).unwrap()).unwrap();

        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        let model = back.model.as_ref().unwrap();
        assert_eq!(model.state, "XX");
        assert_eq!(back.districts, vec![None, None]);
        assert_eq!(back.incumbents, vec![Incumbency::Open, Incumbency::Open]);
        assert_eq!(back.stage, Stage::PrereadFollowup);
        assert!(back.message.starts_with("Found 2 districts"));
        assert!(store.object_exists(&back.geometry_key.unwrap()));
    }

    #[test]
    fn block_assignment_upload_skips_the_preview() {
        let (env, store, _) = test_env();
        let upload = test_upload("uploads/x/upload/plan.csv");
        let baf = "0001000001US001,1\n0001000001US002,1\n0001000001US003,2\n";
        store.put_object(&upload.key, baf.into(), &PutOptions::public_text()).unwrap();

        run(&env, upload_event(&upload).unwrap()).unwrap();

        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.model.as_ref().unwrap().state, "XX");
        assert_eq!(back.districts.len(), 2);
        assert_eq!(back.geometry_key, None);
    }

    #[test]
    fn incumbents_stay_sized_through_an_annotation_free_callback() {
        let (env, store, _) = test_env();
        let upload = test_upload("uploads/x/upload/plan.geojson");
        store.put_object(&upload.key, NULL_ISLAND_PLAN.into(), &PutOptions::public_json()).unwrap();

        run(&env, upload_event(&upload).unwrap()).unwrap();
        crate::workers::postread_callback::run(
            &env, &upload.id, &crate::workers::Annotations::default()).unwrap();

        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.incumbents.len(), back.districts.len());
        assert_eq!(back.incumbents, vec![Incumbency::Open; 2]);
    }

    #[test]
    fn unreadable_uploads_fail_terminally() {
        let (env, store, _) = test_env();
        let upload = test_upload("uploads/x/upload/plan.pdf");
        store.put_object(&upload.key, b"%PDF-1.4".to_vec(), &PutOptions::public_text()).unwrap();

        run(&env, upload_event(&upload).unwrap()).unwrap();

        let back = crate::observe::get_upload_index(store.as_ref(), &upload.index_key()).unwrap();
        assert_eq!(back.status, Some(false));
        assert_eq!(back.message, "Can't score this plan: unrecognized file type '.pdf'");
    }
}
