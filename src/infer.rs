//! Model inference: match an uploaded plan to a state and chamber.
//!
//! Geometry uploads are matched by overlap with per-state bounding boxes;
//! block-assignment uploads by the FIPS prefix of their block-ids. Either
//! way the chamber is picked by comparing the plan's district count to each
//! candidate model's seat count.

use std::sync::OnceLock;

use anyhow::Result;
use geo::{unary_union, Area, BooleanOps, BoundingRect, MultiPolygon, Rect};

use crate::{
    blockassign::Assignments,
    data::{models_for_state, Model},
    error::ScoreError,
    plan::PlanFeature,
};

/// Bundled per-state bounding boxes, 2020 vintage.
const STATES_CSV: &str = include_str!("../assets/us_states.csv");

/// Sentinel state used by tests and demo data; blocks carry FIPS "00" and
/// plan footprints sit on Null Island.
const NULL_ISLAND_STATE: &str = "XX";

/// One row of the bundled state table.
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub fips: &'static str,
    pub abbr: &'static str,
    pub name: &'static str,
    pub bounds: Rect<f64>,
}

/// Parsed state table, loaded once.
pub fn states() -> &'static [StateInfo] {
    static STATES: OnceLock<Vec<StateInfo>> = OnceLock::new();
    STATES.get_or_init(|| {
        STATES_CSV.lines().skip(1)
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let mut parts = line.split(',');
                let fips = parts.next().unwrap_or_default();
                let abbr = parts.next().unwrap_or_default();
                let name = parts.next().unwrap_or_default();
                let nums: Vec<f64> = parts.map(|p| p.parse().unwrap_or(f64::NAN)).collect();
                StateInfo {
                    fips,
                    abbr,
                    name,
                    bounds: Rect::new(
                        geo::coord! { x: nums[0], y: nums[1] },
                        geo::coord! { x: nums[2], y: nums[3] },
                    ),
                }
            })
            .collect()
    })
}

#[inline]
pub fn state_by_fips(fips: &str) -> Option<&'static StateInfo> {
    states().iter().find(|state| state.fips == fips)
}

#[inline]
pub fn state_by_abbr(abbr: &str) -> Option<&'static StateInfo> {
    states().iter().find(|state| state.abbr == abbr)
}

/// Pick the model whose seat count best fits `district_count`, by smallest
/// |ln(count / seats)|. Errors when the state has no scoreable models.
pub fn pick_model(state: &str, state_name: &str, district_count: usize) -> Result<&'static Model> {
    let model = models_for_state(state)
        .filter_map(|model| {
            let seats = model.seats?;
            let fit = (district_count.max(1) as f64 / seats as f64).ln().abs();
            Some((fit, model))
        })
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, model)| model)
        .ok_or_else(|| ScoreError::UnsupportedDomain(
            format!("{state_name} is not a currently supported state")))?;

    Ok(model)
}

/// Guess the model for a geometry upload from its footprint.
///
/// The state whose bounding box overlaps the plan footprint with the
/// largest area wins; overlap ties break toward the smaller state box. A
/// footprint around Null Island maps to the test state; anything else with
/// no overlap is rejected.
pub fn guess_geometry_model(features: &[PlanFeature], district_count: usize) -> Result<&'static Model> {
    let footprint = unary_union(features.iter().filter_map(|f| f.geometry.as_ref()));

    let mut guesses: Vec<(f64, f64, &StateInfo)> = states().iter()
        .filter_map(|state| {
            let overlap = overlap_area(&footprint, &state.bounds);
            (overlap > 0.0).then(|| (overlap, -state.bounds.unsigned_area(), state))
        })
        .collect();
    guesses.sort_by(|a, b| (a.0, a.1).partial_cmp(&(b.0, b.1)).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(&(_, _, state)) = guesses.last() {
        tracing::info!(state = state.abbr, "matched plan footprint to state bounds");
        return pick_model(state.abbr, state.name, district_count);
    }

    // No overlap with any state. Demo plans sit on Null Island.
    let on_null_island = footprint.bounding_rect().is_some_and(|rect| {
        rect.min().x < 0.0 && rect.max().x > 0.0 && rect.min().y < 0.0 && rect.max().y > 0.0
    });
    if on_null_island {
        return pick_model(NULL_ISLAND_STATE, "Null Island", district_count);
    }

    Err(ScoreError::UnsupportedDomain(
        "PlanScore only works for U.S. states".to_string()).into())
}

/// Guess the model for a block-assignment upload from its FIPS prefix.
pub fn guess_blockassign_model(assignments: &Assignments) -> Result<&'static Model> {
    let fips = assignments.state_fips().ok_or_else(|| {
        ScoreError::InvalidUpload("block-assignment file contains no block-ids".to_string())
    })?;

    let (abbr, name) = if fips == "00" {
        (NULL_ISLAND_STATE, "Null Island")
    } else {
        let state = state_by_fips(&fips).ok_or_else(|| ScoreError::UnsupportedDomain(
            "PlanScore only works for U.S. states".to_string()))?;
        (state.abbr, state.name)
    };

    pick_model(abbr, name, assignments.seat_count())
}

fn overlap_area(footprint: &MultiPolygon<f64>, bounds: &Rect<f64>) -> f64 {
    if footprint.0.is_empty() {
        return 0.0;
    }
    let clip = MultiPolygon(vec![bounds.to_polygon()]);
    footprint.intersection(&clip).unsigned_area()
}
