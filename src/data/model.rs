//! Immutable model descriptors for each supported state/chamber combination.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Chamber a districting plan is drawn for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum House {
    UsHouse,
    StateSenate,
    StateHouse,
    LocalPlan,
}

impl House {
    pub fn as_str(self) -> &'static str {
        match self {
            House::UsHouse => "ushouse",
            House::StateSenate => "statesenate",
            House::StateHouse => "statehouse",
            House::LocalPlan => "localplan",
        }
    }
}

/// Descriptor for one state/chamber scoring model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Two-letter postal abbreviation; `XX` is the synthetic test state.
    pub state: String,
    pub house: House,
    /// Seat count; None for local plans.
    pub seats: Option<u32>,
    pub incumbency: bool,
    pub versions: Vec<String>,
    /// Object-store prefix where the state's block statistics live.
    pub key_prefix: String,
}

/// 2020-apportionment U.S. House seat counts.
const US_HOUSE_SEATS: &[(&str, u32)] = &[
    ("AL", 7), ("AK", 1), ("AZ", 9), ("AR", 4), ("CA", 52), ("CO", 8), ("CT", 5),
    ("DE", 1), ("FL", 28), ("GA", 14), ("HI", 2), ("ID", 2), ("IL", 17), ("IN", 9),
    ("IA", 4), ("KS", 4), ("KY", 6), ("LA", 6), ("ME", 2), ("MD", 8), ("MA", 9),
    ("MI", 13), ("MN", 8), ("MS", 4), ("MO", 8), ("MT", 2), ("NE", 3), ("NV", 4),
    ("NH", 2), ("NJ", 12), ("NM", 3), ("NY", 26), ("NC", 14), ("ND", 1), ("OH", 15),
    ("OK", 5), ("OR", 6), ("PA", 17), ("RI", 2), ("SC", 7), ("SD", 1), ("TN", 9),
    ("TX", 38), ("UT", 4), ("VT", 1), ("VA", 11), ("WA", 10), ("WV", 2), ("WI", 8),
    ("WY", 1),
    // Synthetic test state centered on Null Island
    ("XX", 2),
];

/// (state, senate seats, house seats). Nebraska's legislature is unicameral.
const STATE_LEGE_SEATS: &[(&str, u32, u32)] = &[
    ("AL", 35, 105), ("AK", 20, 40), ("AZ", 30, 60), ("AR", 35, 100),
    ("CA", 40, 80), ("CO", 35, 65), ("CT", 36, 151), ("DE", 21, 41),
    ("FL", 40, 120), ("GA", 56, 180), ("HI", 25, 51), ("ID", 35, 70),
    ("IL", 59, 118), ("IN", 50, 100), ("IA", 50, 100), ("KS", 40, 125),
    ("KY", 38, 100), ("LA", 39, 105), ("ME", 35, 151), ("MD", 47, 141),
    ("MA", 40, 160), ("MI", 38, 110), ("MN", 67, 134), ("MS", 52, 122),
    ("MO", 34, 163), ("MT", 50, 100), ("NV", 21, 42), ("NH", 24, 400),
    ("NJ", 40, 80), ("NM", 42, 70), ("NY", 63, 150), ("NC", 50, 120),
    ("ND", 47, 94), ("OH", 33, 99), ("OK", 48, 101), ("OR", 30, 60),
    ("PA", 50, 203), ("RI", 38, 75), ("SC", 46, 124), ("SD", 35, 70),
    ("TN", 33, 99), ("TX", 31, 150), ("UT", 29, 75), ("VT", 30, 150),
    ("VA", 40, 100), ("WA", 49, 98), ("WV", 34, 100), ("WI", 33, 99),
    ("WY", 31, 62),
    ("XX", 4, 8),
];

fn build_models() -> Vec<Model> {
    let versions: Vec<String> = crate::data::versions::VERSION_PARAMETERS
        .iter()
        .map(|(tag, _)| tag.to_string())
        .collect();

    let mut models = Vec::new();

    for &(state, seats) in US_HOUSE_SEATS {
        models.push(Model {
            state: state.to_string(),
            house: House::UsHouse,
            seats: Some(seats),
            incumbency: true,
            versions: versions.clone(),
            key_prefix: format!("data/{state}/2020"),
        });
    }

    for &(state, senate, house) in STATE_LEGE_SEATS {
        for (chamber, seats) in [(House::StateSenate, senate), (House::StateHouse, house)] {
            models.push(Model {
                state: state.to_string(),
                house: chamber,
                seats: Some(seats),
                incumbency: true,
                versions: versions.clone(),
                key_prefix: format!("data/{state}/2020"),
            });
        }
    }

    models
}

/// The single canonical model list, keyed by (state, house).
pub fn models() -> &'static [Model] {
    static MODELS: OnceLock<Vec<Model>> = OnceLock::new();
    MODELS.get_or_init(build_models)
}

/// All models for one state.
pub fn models_for_state(abbr: &str) -> impl Iterator<Item = &'static Model> + '_ {
    models().iter().filter(move |m| m.state == abbr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_model_per_state_and_house() {
        let mut seen = std::collections::HashSet::new();
        for model in models() {
            assert!(seen.insert((model.state.clone(), model.house)), "duplicate {model:?}");
        }
    }

    #[test]
    fn test_state_has_two_congressional_seats() {
        let model = models_for_state("XX").find(|m| m.house == House::UsHouse).unwrap();
        assert_eq!(model.seats, Some(2));
        assert_eq!(model.key_prefix, "data/XX/2020");
    }

    #[test]
    fn house_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&House::UsHouse).unwrap(), "\"ushouse\"");
        assert_eq!(serde_json::to_string(&House::StateSenate).unwrap(), "\"statesenate\"");
    }
}
