//! Plan datasource reading: GeoJSON, zipped shapefiles, and the preview
//! geometry written for map display.

pub mod geojson;
pub mod ordering;
pub mod shapefile;

use std::{collections::BTreeMap, io::Write};

use anyhow::{Context, Result};
use flate2::{write::GzEncoder, Compression};
use geo::MultiPolygon;
use serde_json::Value;

use crate::{
    data::Upload,
    detect::UploadType,
    error::ScoreError,
    storage::{ObjectStore, PutOptions},
};

pub use ordering::{group_districts, ordered_districts, DistrictGeometry};

/// One feature from an uploaded plan datasource.
#[derive(Debug, Clone)]
pub struct PlanFeature {
    pub fields: BTreeMap<String, Value>,
    pub geometry: Option<MultiPolygon<f64>>,
}

/// Read plan features from an uploaded file of a known type.
///
/// Plan sources are taken as EPSG:4326, the GeoJSON contract.
pub fn read_plan(filename: &str, bytes: &[u8], upload_type: UploadType) -> Result<Vec<PlanFeature>> {
    match upload_type {
        UploadType::OgrDatasource => {
            let ext = filename.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
            match ext.as_str() {
                "geojson" | "json" => geojson::read_features(bytes),
                other => Err(ScoreError::InvalidUpload(
                    format!("unsupported datasource format '.{other}'")).into()),
            }
        }
        UploadType::ZippedOgrDatasource => shapefile::read_zipped_features(bytes),
        UploadType::BlockAssignment | UploadType::ZippedBlockAssignment => {
            Err(ScoreError::InvalidUpload(
                "block-assignment files carry no plan geometry".to_string()).into())
        }
    }
}

/// Save the gzipped property-less GeoJSON used by the front-end map.
pub fn put_geojson_preview(
    store: &dyn ObjectStore,
    upload: &Upload,
    geometries: &[Option<MultiPolygon<f64>>],
) -> Result<()> {
    let body = geojson::write_features(geometries)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body)
        .context("[plan::put_geojson_preview] Failed to gzip preview")?;
    let gzipped = encoder.finish()
        .context("[plan::put_geojson_preview] Failed to finish gzip stream")?;

    store.put_object(&upload.geometry_json_key(), gzipped, &PutOptions::gzipped_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use geo::polygon;

    use crate::storage::MemStore;

    #[test]
    fn preview_is_gzipped_and_readable() {
        let store = MemStore::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let upload = Upload::new("20240101T000000.000000000Z", "k", now);
        let square = MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0),
        ]]);

        put_geojson_preview(&store, &upload, &[Some(square), None]).unwrap();

        let object = store.get_object(&upload.geometry_json_key()).unwrap();
        assert_eq!(object.content_encoding.as_deref(), Some("gzip"));
        let features = geojson::read_features(&object.decoded_body().unwrap()).unwrap();
        assert_eq!(features.len(), 2);
        assert!(features[1].geometry.is_none());
    }

    #[test]
    fn gpkg_is_detected_but_not_parsed() {
        let err = read_plan("plan.gpkg", b"GPKG", UploadType::OgrDatasource).unwrap_err();
        assert!(matches!(err.downcast_ref::<ScoreError>(), Some(ScoreError::InvalidUpload(_))));
    }
}
