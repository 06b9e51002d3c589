//! Attribution inputs persisted before the analytics query can run:
//! per-district WKT, bounding boxes for map display, block-id assignment
//! lists, and the flattened partition table the engine joins against.

use std::io::Write;

use anyhow::{Context, Result};
use flate2::{write::GzEncoder, Compression};
use geo::{BooleanOps, BoundingRect, MultiPolygon, Rect};
use serde_json::json;
use wkt::ToWkt;

use crate::{
    blockassign::Assignments,
    constants::WKT_PIECE_LIMIT,
    data::Upload,
    plan::DistrictGeometry,
    storage::{ObjectStore, PutOptions},
};

/// One row of the partition table: exactly one of `wkt` / `block_id` is set.
#[derive(Debug, Clone)]
pub struct PartitionRow {
    pub district: usize,
    pub wkt: Option<String>,
    pub block_id: Option<String>,
}

/// Write per-district WKT and bounding boxes; return the partition rows.
///
/// Each district is stored whole at `geometries/{index}.wkt` for later
/// compactness scoring; the partition rows carry the same geometry split
/// into engine-sized pieces.
pub fn put_district_geometries(
    store: &dyn ObjectStore,
    upload: &Upload,
    districts: &[DistrictGeometry],
) -> Result<Vec<PartitionRow>> {
    let mut rows = Vec::new();
    let mut bbox_features = Vec::new();

    for (index, district) in districts.iter().enumerate() {
        let Some(geometry) = &district.geometry else {
            bbox_features.push(json!({
                "type": "Feature",
                "properties": { "district": index },
                "geometry": serde_json::Value::Null,
            }));
            continue;
        };

        let wkt = geometry.wkt_string();
        store.put_object(&upload.geometry_wkt_key(index), wkt.into_bytes(), &PutOptions::private_text())
            .with_context(|| format!("[districts::put_district_geometries] Failed to write district {index}"))?;

        for piece in partition_pieces(geometry) {
            rows.push(PartitionRow { district: index, wkt: Some(piece), block_id: None });
        }

        bbox_features.push(bbox_feature(index, geometry));
    }

    let collection = json!({ "type": "FeatureCollection", "features": bbox_features });
    let body = serde_json::to_vec(&collection)
        .context("[districts::put_district_geometries] Failed to serialize bboxes")?;
    store.put_object(&upload.geometry_bbox_key(), body, &PutOptions::public_json())
        .context("[districts::put_district_geometries] Failed to write geometry-bboxes.geojson")?;

    tracing::debug!(id = %upload.id, districts = districts.len(), pieces = rows.len(),
        "wrote district geometries");
    Ok(rows)
}

/// Write per-district block-id lists; return the partition rows.
pub fn put_district_assignments(
    store: &dyn ObjectStore,
    upload: &Upload,
    assignments: &Assignments,
) -> Result<Vec<PartitionRow>> {
    let mut rows = Vec::new();

    for (index, (_, blocks)) in assignments.districts.iter().enumerate() {
        let mut body = String::with_capacity(blocks.len() * 16);
        for block in blocks {
            body.push_str(block);
            body.push('\n');
        }
        store.put_object(&upload.assignment_key(index), body.into_bytes(), &PutOptions::private_text())
            .with_context(|| format!("[districts::put_district_assignments] Failed to write district {index}"))?;

        rows.extend(blocks.iter().map(|block| PartitionRow {
            district: index,
            wkt: None,
            block_id: Some(block.clone()),
        }));
    }

    Ok(rows)
}

/// Write the gzipped partition CSV the analytics engine joins against.
pub fn put_partition(store: &dyn ObjectStore, upload: &Upload, rows: &[PartitionRow]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for row in rows {
        let wkt = row.wkt.as_deref().map(|w| format!("\"{w}\"")).unwrap_or_default();
        let block = row.block_id.as_deref().unwrap_or_default();
        writeln!(encoder, "{},{wkt},{block}", row.district)
            .context("[districts::put_partition] Failed to gzip partition table")?;
    }
    let body = encoder.finish()
        .context("[districts::put_partition] Failed to finish gzip stream")?;

    store.put_object(&upload.partition_key(), body, &PutOptions::private_text().with_encoding("gzip"))
        .context("[districts::put_partition] Failed to write partition.csv.gz")
}

/// Split a district into WKT pieces smaller than the engine's row limit.
///
/// Oversized geometries are repaired by self-union, then recursively clipped
/// along the longest bounding-box axis. The union of the returned pieces
/// covers the original geometry.
pub fn partition_pieces(geometry: &MultiPolygon<f64>) -> Vec<String> {
    let wkt = geometry.wkt_string();
    if wkt.len() < WKT_PIECE_LIMIT {
        return vec![wkt];
    }

    let repaired = geometry.union(geometry);
    let mut pieces = Vec::new();
    split_recursive(&repaired, &mut pieces, 0);
    pieces
}

fn split_recursive(geometry: &MultiPolygon<f64>, pieces: &mut Vec<String>, depth: u32) {
    if geometry.0.is_empty() {
        return;
    }
    let wkt = geometry.wkt_string();
    if wkt.len() < WKT_PIECE_LIMIT || depth >= 32 {
        pieces.push(wkt);
        return;
    }

    let Some(bounds) = geometry.bounding_rect() else {
        pieces.push(wkt);
        return;
    };

    let (lower, upper) = halves(&bounds);
    split_recursive(&geometry.intersection(&MultiPolygon(vec![lower.to_polygon()])), pieces, depth + 1);
    split_recursive(&geometry.intersection(&MultiPolygon(vec![upper.to_polygon()])), pieces, depth + 1);
}

/// Two halves of a rect split across its longest axis.
fn halves(bounds: &Rect<f64>) -> (Rect<f64>, Rect<f64>) {
    let (min, max) = (bounds.min(), bounds.max());
    if bounds.width() >= bounds.height() {
        let mid = (min.x + max.x) / 2.0;
        (
            Rect::new(min, geo::coord! { x: mid, y: max.y }),
            Rect::new(geo::coord! { x: mid, y: min.y }, max),
        )
    } else {
        let mid = (min.y + max.y) / 2.0;
        (
            Rect::new(min, geo::coord! { x: max.x, y: mid }),
            Rect::new(geo::coord! { x: min.x, y: mid }, max),
        )
    }
}

fn bbox_feature(index: usize, geometry: &MultiPolygon<f64>) -> serde_json::Value {
    let Some(bounds) = geometry.bounding_rect() else {
        return json!({
            "type": "Feature",
            "properties": { "district": index },
            "geometry": serde_json::Value::Null,
        });
    };
    let (min, max) = (bounds.min(), bounds.max());
    json!({
        "type": "Feature",
        "bbox": [min.x, min.y, max.x, max.y],
        "properties": { "district": index },
        "geometry": {
            "type": "Polygon",
            "coordinates": [[
                [min.x, min.y], [max.x, min.y], [max.x, max.y], [min.x, max.y], [min.x, min.y],
            ]],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use geo::{polygon, Area, Polygon};
    use wkt::TryFromWkt;

    use crate::storage::MemStore;

    fn sample_upload() -> Upload {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Upload::new("20240101T000000.000000000Z", "k", now)
    }

    fn unit_square(x0: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: x0, y: 0.0), (x: x0 + 1.0, y: 0.0),
            (x: x0 + 1.0, y: 1.0), (x: x0, y: 1.0),
        ]])
    }

    /// A jagged polygon whose WKT runs well past the piece limit.
    fn oversized() -> MultiPolygon<f64> {
        let mut coords: Vec<(f64, f64)> = Vec::new();
        for step in 0..2000 {
            let x = step as f64 / 100.0;
            coords.push((x, 1.0 + 0.1234567890123 * ((step % 7) as f64)));
        }
        coords.push((20.0, 0.0));
        coords.push((0.0, 0.0));
        MultiPolygon(vec![Polygon::new(coords.into_iter().collect(), vec![])])
    }

    #[test]
    fn small_geometry_is_one_piece() {
        let pieces = partition_pieces(&unit_square(0.0));
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].starts_with("MULTIPOLYGON"));
    }

    #[test]
    fn oversized_geometry_splits_and_covers_itself() {
        let original = oversized();
        assert!(original.wkt_string().len() >= WKT_PIECE_LIMIT);

        let pieces = partition_pieces(&original);
        assert!(pieces.len() > 1);

        let mut total = 0.0;
        for piece in &pieces {
            assert!(piece.len() < WKT_PIECE_LIMIT);
            let geometry = MultiPolygon::<f64>::try_from_wkt_str(piece).unwrap();
            total += geometry.unsigned_area();
        }
        // clip seams leave boolean-ops noise around 1e-9 relative
        let area = original.unsigned_area();
        assert!((total - area).abs() / area < 1e-6, "total={total} area={area}");
    }

    #[test]
    fn geometries_write_wkt_and_bboxes() {
        let store = MemStore::new();
        let upload = sample_upload();
        let districts = vec![
            DistrictGeometry { number: Some(1), geometry: Some(unit_square(0.0)) },
            DistrictGeometry { number: Some(2), geometry: None },
        ];

        let rows = put_district_geometries(&store, &upload, &districts).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].district, 0);

        let wkt = store.get_object(&upload.geometry_wkt_key(0)).unwrap().text().unwrap();
        assert!(wkt.starts_with("MULTIPOLYGON"));
        assert!(!store.object_exists(&upload.geometry_wkt_key(1)));

        let bboxes = store.get_object(&upload.geometry_bbox_key()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bboxes.body).unwrap();
        assert_eq!(parsed["features"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["features"][0]["bbox"][2], serde_json::json!(1.0));
        assert!(parsed["features"][1]["geometry"].is_null());
    }

    #[test]
    fn assignments_write_one_block_per_line() {
        let store = MemStore::new();
        let upload = sample_upload();
        let assignments = crate::blockassign::parse_table(
            b"0000100002,1\n0000100001,1\n0000100003,2\n").unwrap();

        let rows = put_district_assignments(&store, &upload, &assignments).unwrap();
        assert_eq!(rows.len(), 3);

        let body = store.get_object(&upload.assignment_key(0)).unwrap().text().unwrap();
        assert_eq!(body, "0000100001\n0000100002\n");
    }

    #[test]
    fn partition_table_round_trips_through_gzip() {
        let store = MemStore::new();
        let upload = sample_upload();
        let rows = vec![
            PartitionRow { district: 0, wkt: Some("POLYGON((0 0,1 0,1 1,0 0))".to_string()), block_id: None },
            PartitionRow { district: 1, wkt: None, block_id: Some("0000100003".to_string()) },
        ];

        put_partition(&store, &upload, &rows).unwrap();

        let object = store.get_object(&upload.partition_key()).unwrap();
        assert_eq!(object.content_encoding.as_deref(), Some("gzip"));
        let text = String::from_utf8(object.decoded_body().unwrap()).unwrap();
        assert_eq!(text, "0,\"POLYGON((0 0,1 0,1 1,0 0))\",\n1,,0000100003\n");
    }
}
