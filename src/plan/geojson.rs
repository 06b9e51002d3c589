//! Hand-rolled GeoJSON feature reading and writing over serde_json.

use anyhow::{Context, Result};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde_json::{json, Value};

use crate::{error::ScoreError, plan::PlanFeature};

/// Read plan features from GeoJSON bytes.
pub fn read_features(bytes: &[u8]) -> Result<Vec<PlanFeature>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| ScoreError::InvalidUpload(format!("unparseable GeoJSON: {err}")))?;

    let features = value["features"].as_array().ok_or_else(|| {
        ScoreError::InvalidUpload("GeoJSON has no feature collection".to_string())
    })?;

    features.iter()
        .map(|feature| {
            let fields = feature["properties"].as_object()
                .map(|props| props.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            let geometry = parse_geometry(&feature["geometry"])?;
            Ok(PlanFeature { fields, geometry })
        })
        .collect()
}

fn parse_geometry(geometry: &Value) -> Result<Option<MultiPolygon<f64>>> {
    let coords = &geometry["coordinates"];
    match geometry["type"].as_str() {
        None => Ok(None),
        Some("Polygon") => {
            let polygon = parse_polygon_coords(coords)?;
            Ok(Some(MultiPolygon(vec![polygon])))
        }
        Some("MultiPolygon") => {
            let parts = coords.as_array().ok_or_else(|| invalid("MultiPolygon coordinates"))?;
            let polygons = parts.iter().map(parse_polygon_coords).collect::<Result<Vec<_>>>()?;
            Ok(Some(MultiPolygon(polygons)))
        }
        Some(other) => {
            Err(ScoreError::InvalidUpload(format!("unsupported geometry type '{other}'")).into())
        }
    }
}

fn parse_polygon_coords(coords: &Value) -> Result<Polygon<f64>> {
    let rings = coords.as_array().ok_or_else(|| invalid("Polygon coordinates"))?;
    let mut parsed = rings.iter().map(parse_ring).collect::<Result<Vec<_>>>()?;
    if parsed.is_empty() {
        return Err(invalid("Polygon with no rings").into());
    }
    let exterior = parsed.remove(0);
    Ok(Polygon::new(exterior, parsed))
}

fn parse_ring(ring: &Value) -> Result<LineString<f64>> {
    let positions = ring.as_array().ok_or_else(|| invalid("ring coordinates"))?;
    let coords = positions.iter()
        .map(|position| {
            let pair = position.as_array().filter(|p| p.len() >= 2)
                .ok_or_else(|| invalid("coordinate pair"))?;
            let x = pair[0].as_f64().ok_or_else(|| invalid("longitude"))?;
            let y = pair[1].as_f64().ok_or_else(|| invalid("latitude"))?;
            Ok(Coord { x, y })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LineString::from(coords))
}

fn invalid(what: &str) -> ScoreError {
    ScoreError::InvalidUpload(format!("unparseable geometry: bad {what}"))
}

/// Serialize a property-less FeatureCollection for map display.
pub fn write_features(geometries: &[Option<MultiPolygon<f64>>]) -> Result<Vec<u8>> {
    let features: Vec<Value> = geometries.iter()
        .map(|geometry| {
            let geometry_json = match geometry {
                Some(mp) => multipolygon_json(mp),
                None => Value::Null,
            };
            json!({ "type": "Feature", "properties": {}, "geometry": geometry_json })
        })
        .collect();

    serde_json::to_vec(&json!({ "type": "FeatureCollection", "features": features }))
        .context("[plan::geojson::write_features] Failed to serialize GeoJSON")
}

pub(crate) fn multipolygon_json(mp: &MultiPolygon<f64>) -> Value {
    let polygons: Vec<Value> = mp.0.iter()
        .map(|polygon| {
            let mut rings = vec![ring_json(polygon.exterior())];
            rings.extend(polygon.interiors().iter().map(ring_json));
            Value::Array(rings)
        })
        .collect();

    json!({ "type": "MultiPolygon", "coordinates": polygons })
}

fn ring_json(ring: &LineString<f64>) -> Value {
    Value::Array(
        ring.coords()
            .map(|c| json!([round7(c.x), round7(c.y)]))
            .collect(),
    )
}

// Seven decimal places is centimeter precision at the equator.
fn round7(v: f64) -> f64 {
    (v * 1e7).round() / 1e7
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SQUARES: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "properties": {"DISTRICT": 1},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
            {"type": "Feature", "properties": {"DISTRICT": 2},
             "geometry": {"type": "MultiPolygon", "coordinates": [[[[1,0],[2,0],[2,1],[1,1],[1,0]]]]}}
        ]
    }"#;

    #[test]
    fn reads_polygon_and_multipolygon_features() {
        let features = read_features(TWO_SQUARES.as_bytes()).unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].fields["DISTRICT"], serde_json::json!(1));
        assert_eq!(features[0].geometry.as_ref().unwrap().0.len(), 1);
        assert_eq!(features[1].geometry.as_ref().unwrap().0.len(), 1);
    }

    #[test]
    fn round_trips_through_write_features() {
        use geo::Area;
        let features = read_features(TWO_SQUARES.as_bytes()).unwrap();
        let geometries: Vec<_> = features.into_iter().map(|f| f.geometry).collect();
        let bytes = write_features(&geometries).unwrap();
        let back = read_features(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        let area = back[0].geometry.as_ref().unwrap().unsigned_area();
        assert!((area - 1.0).abs() < 1e-9);
    }

    #[test]
    fn not_geojson_is_invalid_upload() {
        let err = read_features(b"DISTRICT,BLOCKID").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScoreError>(),
            Some(ScoreError::InvalidUpload(_))
        ));
    }
}
