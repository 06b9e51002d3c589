//! Model-version parameter table.
//!
//! Order is significant: the first entry is the default version offered to
//! uploads that do not name one.

use anyhow::Result;

use crate::error::ScoreError;

/// Per-version knobs consumed by the prediction model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionParameters {
    /// Shown to users in the annotation UI.
    pub description: &'static str,
    /// Selects which C/E matrix pair to load.
    pub path_suffix: &'static str,
    /// Optional election cycle used for adjustment rows.
    pub year: Option<i32>,
    /// Mean-deviation applied to the presidential share input.
    pub vote_adjust_congress: f64,
    pub vote_adjust_statelege: f64,
    /// Presidential vote calibration, by source year.
    pub pvote2016_scale: f64,
    pub pvote2016_offset: f64,
    pub pvote2020_scale: f64,
    pub pvote2020_offset: f64,
    /// Whether users may select this version.
    pub is_public: bool,
}

pub const VERSION_PARAMETERS: &[(&str, VersionParameters)] = &[
    ("2025A", VersionParameters {
        description: "2025 model incorporating the 2020 presidential election",
        path_suffix: "_2025A",
        year: Some(2020),
        vote_adjust_congress: -0.496875,
        vote_adjust_statelege: -0.498,
        pvote2016_scale: 0.91,
        pvote2016_offset: 0.0441,
        pvote2020_scale: 1.0,
        pvote2020_offset: 0.0,
        is_public: true,
    }),
    ("2021B", VersionParameters {
        description: "2021 model based on the 2016 presidential election",
        path_suffix: "_2021B",
        year: None,
        vote_adjust_congress: -0.496875,
        vote_adjust_statelege: -0.498,
        pvote2016_scale: 1.0,
        pvote2016_offset: 0.0,
        pvote2020_scale: 1.0988,
        pvote2020_offset: -0.0485,
        is_public: false,
    }),
];

/// Default version tag: the first table entry.
pub fn default_version() -> &'static str {
    VERSION_PARAMETERS[0].0
}

/// Look up parameters for a caller-supplied tag. Unknown tags are a terminal
/// `BadConfig` failure.
pub fn version_parameters(tag: &str) -> Result<&'static VersionParameters> {
    VERSION_PARAMETERS.iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, params)| params)
        .ok_or_else(|| ScoreError::BadConfig(tag.to_string()).into())
}

/// Read-only discovery listing, filtered to publicly selectable versions.
pub fn public_versions() -> Vec<(&'static str, &'static str)> {
    VERSION_PARAMETERS.iter()
        .filter(|(_, params)| params.is_public)
        .map(|(tag, params)| (*tag, params.description))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_is_the_default() {
        assert_eq!(default_version(), "2025A");
    }

    #[test]
    fn unknown_version_is_a_bad_config() {
        let err = version_parameters("1999").unwrap_err();
        assert_eq!(err.to_string(), "Bad model_version '1999'");
    }

    #[test]
    fn listing_filters_to_public_versions() {
        let listed = public_versions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "2025A");
    }
}
