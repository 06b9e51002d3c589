//! District ordering and grouping for arbitrary-order plan datasources.

use std::collections::{BTreeMap, BTreeSet};

use geo::{unary_union, MultiPolygon};
use serde_json::Value;

use crate::plan::PlanFeature;

/// One district's geometry after ordering and grouping.
#[derive(Debug, Clone)]
pub struct DistrictGeometry {
    /// Guessed district number, when a qualifying field was found.
    pub number: Option<u32>,
    pub geometry: Option<MultiPolygon<f64>>,
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)
        }),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Guess the district-number field and return features in district order.
///
/// A field qualifies iff its values, parsed as integers, are exactly
/// {1..N} — N being the distinct-value count, so multi-ring districts
/// exported as several same-numbered polygons still qualify. Fields named
/// like "district" are preferred; ties break toward the last-occurring
/// field. With no qualifying field, features come back in file order with
/// no field name.
pub fn ordered_districts(features: &[PlanFeature]) -> (Option<String>, Vec<&PlanFeature>) {
    let mut field_names: Vec<&str> = Vec::new();
    for feature in features {
        for name in feature.fields.keys() {
            if !field_names.contains(&name.as_str()) {
                field_names.push(name);
            }
        }
    }

    let mut candidates: Vec<(u8, usize, &str)> = Vec::new();
    for (position, name) in field_names.iter().enumerate() {
        let values: Option<BTreeSet<i64>> = features.iter()
            .map(|feature| feature.fields.get(*name).and_then(int_value))
            .collect();

        let qualifies = values.is_some_and(|values| {
            !values.is_empty() && values == (1..=values.len() as i64).collect::<BTreeSet<i64>>()
        });

        if qualifies {
            let priority = if name.to_lowercase().contains("district") { 2 } else { 1 };
            candidates.push((priority, position, name));
        }
    }

    let Some(&(_, _, name)) = candidates.iter().max() else {
        return (None, features.iter().collect());
    };

    tracing::debug!(field = name, "sorting plan features on district-number field");

    let mut ordered: Vec<&PlanFeature> = features.iter().collect();
    ordered.sort_by_key(|feature| feature.fields.get(name).and_then(int_value));
    (Some(name.to_string()), ordered)
}

/// Group ordered features by district number, unioning multi-ring districts
/// exported as separate polygons. The distinct-number count is the seat
/// count. Without a number field, each feature is its own district.
pub fn group_districts(features: &[&PlanFeature], field: Option<&str>) -> Vec<DistrictGeometry> {
    let Some(field) = field else {
        return features.iter()
            .map(|feature| DistrictGeometry { number: None, geometry: feature.geometry.clone() })
            .collect();
    };

    let mut groups: BTreeMap<i64, Vec<&MultiPolygon<f64>>> = BTreeMap::new();
    for feature in features {
        let Some(number) = feature.fields.get(field).and_then(int_value) else { continue };
        let geometries = groups.entry(number).or_default();
        if let Some(geometry) = &feature.geometry {
            geometries.push(geometry);
        }
    }

    groups.into_iter()
        .map(|(number, geometries)| DistrictGeometry {
            number: u32::try_from(number).ok(),
            geometry: match geometries.len() {
                0 => None,
                1 => Some(geometries[0].clone()),
                _ => Some(unary_union(geometries.into_iter())),
            },
        })
        .collect()
}
