//! Zipped-shapefile reading for plan uploads.

use std::io::{Cursor, Read};

use anyhow::Result;
use geo::MultiPolygon;
use serde_json::Value;
use zip::ZipArchive;

use crate::{detect::ordered_zip_names, error::ScoreError, plan::PlanFeature};

/// Read plan features from a zip archive containing a shapefile.
pub fn read_zipped_features(zip_bytes: &[u8]) -> Result<Vec<PlanFeature>> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|err| ScoreError::InvalidUpload(format!("unreadable zip archive: {err}")))?;

    let shp_name = ordered_zip_names(&mut archive).into_iter()
        .find(|name| name.to_ascii_lowercase().ends_with(".shp"))
        .ok_or_else(|| ScoreError::InvalidUpload("zip archive contains no shapefile".to_string()))?;
    let dbf_name = format!("{}.dbf", shp_name[..shp_name.len() - 4].to_string());

    let shp_bytes = read_entry(&mut archive, &shp_name)?;
    let dbf_bytes = read_entry(&mut archive, &dbf_name)?;

    read_features(&shp_bytes, &dbf_bytes)
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name).map_err(|err| {
        ScoreError::InvalidUpload(format!("zip archive is missing '{name}': {err}"))
    })?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)
        .map_err(|err| ScoreError::InvalidUpload(format!("unreadable zip entry '{name}': {err}")))?;
    Ok(bytes)
}

/// Read features from raw `.shp` and `.dbf` bytes.
pub fn read_features(shp_bytes: &[u8], dbf_bytes: &[u8]) -> Result<Vec<PlanFeature>> {
    let shape_reader = shapefile::ShapeReader::new(Cursor::new(shp_bytes))
        .map_err(|err| ScoreError::InvalidUpload(format!("unparseable shapefile: {err}")))?;
    let dbf_reader = shapefile::dbase::Reader::new(Cursor::new(dbf_bytes))
        .map_err(|err| ScoreError::InvalidUpload(format!("unparseable attribute table: {err}")))?;
    let mut reader = shapefile::Reader::new(shape_reader, dbf_reader);

    let mut features = Vec::new();
    for pair in reader.iter_shapes_and_records() {
        let (shape, record) = pair.map_err(|err| {
            ScoreError::InvalidUpload(format!("unparseable shapefile feature: {err}"))
        })?;

        let geometry = shape_geometry(shape)?;
        let fields = record.into_iter()
            .map(|(name, value)| (name, field_value(value)))
            .collect();

        features.push(PlanFeature { fields, geometry });
    }

    Ok(features)
}

fn shape_geometry(shape: shapefile::Shape) -> Result<Option<MultiPolygon<f64>>> {
    match shape {
        shapefile::Shape::NullShape => Ok(None),
        shapefile::Shape::Polygon(polygon) => Ok(Some(polygon.into())),
        other => Err(ScoreError::InvalidUpload(
            format!("unsupported shape type '{}'", other.shapetype())).into()),
    }
}

fn field_value(value: shapefile::dbase::FieldValue) -> Value {
    use shapefile::dbase::FieldValue;
    match value {
        FieldValue::Character(text) => text.map(Value::from).unwrap_or(Value::Null),
        FieldValue::Numeric(number) => number.map(Value::from).unwrap_or(Value::Null),
        FieldValue::Float(number) => number.map(|f| Value::from(f as f64)).unwrap_or(Value::Null),
        FieldValue::Integer(number) => Value::from(number),
        FieldValue::Double(number) => Value::from(number),
        FieldValue::Logical(flag) => flag.map(Value::from).unwrap_or(Value::Null),
        FieldValue::Date(date) => date
            .map(|d| Value::from(format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day())))
            .unwrap_or(Value::Null),
        FieldValue::Currency(number) => Value::from(number),
        FieldValue::Memo(text) => Value::from(text),
        FieldValue::DateTime(_) => Value::Null,
    }
}
