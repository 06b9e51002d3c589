//! Partisan-fairness metrics over paired (red, blue) vote sequences.
//!
//! Every metric takes red votes first; "red" is the Republican column of
//! the simulation tensor and "blue" the Democratic one. Sign conventions
//! follow the reporting UI: positive favors Blue, negative favors Red.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use ndarray::Array3;
use serde_json::Value;

use crate::data::House;

/// Bundled empirical distribution of past plan scores, by metric and chamber.
const HISTORICAL_SCORES: &str = include_str!("../assets/historical_scores.json");

/// Vote-swing magnitude for the `+1 Dem` / `+1 Rep` summary variants.
const SWING_DELTA: f64 = 0.01;

/// Shift every district's split by `delta` of its total from red to blue.
pub fn swing(red: &[f64], blue: &[f64], delta: f64) -> (Vec<f64>, Vec<f64>) {
    red.iter().zip(blue)
        .map(|(&r, &b)| {
            let shift = delta * (r + b);
            (r - shift, b + shift)
        })
        .unzip()
}

/// Districts with any votes, as (red, blue) pairs.
fn counted(red: &[f64], blue: &[f64]) -> Vec<(f64, f64)> {
    red.iter().zip(blue)
        .map(|(&r, &b)| (r, b))
        .filter(|&(r, b)| r + b > 0.0 && r.is_finite() && b.is_finite())
        .collect()
}

/// Efficiency gap: net wasted votes as a share of all votes.
///
/// The loser wastes everything, the winner wastes votes above half the
/// district total, and ties waste nothing. Clamped to [-1, 1] so extreme
/// swings stay reportable.
pub fn efficiency_gap(red: &[f64], blue: &[f64]) -> Option<f64> {
    let pairs = counted(red, blue);
    let total: f64 = pairs.iter().map(|&(r, b)| r + b).sum();
    if pairs.is_empty() || total <= 0.0 {
        return None;
    }

    let mut wasted_red = 0.0;
    let mut wasted_blue = 0.0;
    for &(r, b) in &pairs {
        let threshold = (r + b) / 2.0;
        if r > b {
            wasted_red += r - threshold;
            wasted_blue += b;
        } else if b > r {
            wasted_red += r;
            wasted_blue += b - threshold;
        }
    }

    Some(((wasted_red - wasted_blue) / total).clamp(-1.0, 1.0))
}

/// Mean-median difference of red vote shares; positive = +Blue.
pub fn mean_median(red: &[f64], blue: &[f64]) -> Option<f64> {
    let shares = red_shares(red, blue)?;
    Some(mean(&shares) - median(&shares))
}

/// Seats above half that red would win at a hypothetically tied statewide
/// election; negative = +Red.
pub fn partisan_bias(red: &[f64], blue: &[f64]) -> Option<f64> {
    let shares = red_shares(red, blue)?;
    let shift = 0.5 - mean(&shares);
    let red_wins = shares.iter().filter(|&&share| share + shift > 0.5).count();
    Some(0.5 - red_wins as f64 / shares.len() as f64)
}

/// Declination: angular asymmetry between each party's winning margins.
///
/// When one party swept every district the two-angle form is undefined; the
/// limiting value is ∓ln(N)/2, negative for a red sweep.
pub fn declination(red: &[f64], blue: &[f64]) -> Option<f64> {
    let shares = red_shares(red, blue)?;
    let n = shares.len() as f64;

    let red_won: Vec<f64> = shares.iter().copied().filter(|&s| s > 0.5).collect();
    let blue_won: Vec<f64> = shares.iter().copied().filter(|&s| s < 0.5).collect();

    match (red_won.is_empty(), blue_won.is_empty()) {
        (true, true) => None,
        (false, true) => Some(-n.ln() / 2.0),
        (true, false) => Some(n.ln() / 2.0),
        (false, false) => {
            let theta_r = ((mean(&red_won) - 0.5) / (red_won.len() as f64 / n)).atan();
            let theta_b = ((0.5 - mean(&blue_won)) / (blue_won.len() as f64 / n)).atan();
            Some((theta_r - theta_b) * 2.0 / std::f64::consts::PI * n.ln())
        }
    }
}

fn red_shares(red: &[f64], blue: &[f64]) -> Option<Vec<f64>> {
    let pairs = counted(red, blue);
    if pairs.is_empty() {
        return None;
    }
    Some(pairs.iter().map(|&(r, b)| r / (r + b)).collect())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Sample standard deviation (n-1); zero for degenerate samples.
fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

type Metric = fn(&[f64], &[f64]) -> Option<f64>;

const METRICS: &[(&str, Metric)] = &[
    ("Efficiency Gap", efficiency_gap),
    ("Mean-Median", mean_median),
    ("Partisan Bias", partisan_bias),
    ("Declination", declination),
];

/// Per-district prediction statistics across the simulation bank.
#[derive(Debug, Clone)]
pub struct DistrictPrediction {
    pub dem_mean: f64,
    pub dem_sd: f64,
    pub rep_mean: f64,
    pub rep_sd: f64,
    /// Fraction of simulations the Democratic candidate wins.
    pub dem_wins: f64,
    pub is_counted: bool,
}

/// Reduce the (D, S, 2) tensor to per-district means, deviations, and win
/// fractions. Districts whose simulations are NaN are uncounted.
pub fn district_predictions(tensor: &Array3<f64>) -> Vec<DistrictPrediction> {
    let (districts, sims, _) = tensor.dim();
    (0..districts)
        .map(|d| {
            let dem: Vec<f64> = (0..sims).map(|s| tensor[[d, s, 0]]).collect();
            let rep: Vec<f64> = (0..sims).map(|s| tensor[[d, s, 1]]).collect();
            let is_counted = dem.iter().chain(&rep).all(|v| v.is_finite());
            if !is_counted {
                return DistrictPrediction {
                    dem_mean: f64::NAN, dem_sd: f64::NAN,
                    rep_mean: f64::NAN, rep_sd: f64::NAN,
                    dem_wins: f64::NAN, is_counted: false,
                };
            }
            let wins = dem.iter().zip(&rep).filter(|(d, r)| d > r).count();
            DistrictPrediction {
                dem_mean: mean(&dem),
                dem_sd: stdev(&dem),
                rep_mean: mean(&rep),
                rep_sd: stdev(&rep),
                dem_wins: wins as f64 / sims.max(1) as f64,
                is_counted: true,
            }
        })
        .collect()
}

/// Summarize the simulation bank into the upload's summary map: per metric
/// the sample mean, standard deviation, positive fraction, ±1% swing
/// variants, and historical percent ranks.
pub fn summarize(tensor: &Array3<f64>, house: House) -> BTreeMap<String, Value> {
    let (districts, sims, _) = tensor.dim();
    let mut summary = BTreeMap::new();

    for &(name, metric) in METRICS {
        let mut base = Vec::with_capacity(sims);
        let mut plus_dem = Vec::with_capacity(sims);
        let mut plus_rep = Vec::with_capacity(sims);

        for s in 0..sims {
            let mut dem = Vec::with_capacity(districts);
            let mut rep = Vec::with_capacity(districts);
            for d in 0..districts {
                let (dv, rv) = (tensor[[d, s, 0]], tensor[[d, s, 1]]);
                if dv.is_finite() && rv.is_finite() {
                    dem.push(dv);
                    rep.push(rv);
                }
            }

            if let Some(value) = metric(&rep, &dem) {
                base.push(value);
            }
            let (swung_red, swung_blue) = swing(&rep, &dem, -SWING_DELTA);
            if let Some(value) = metric(&swung_red, &swung_blue) {
                plus_rep.push(value);
            }
            let (swung_red, swung_blue) = swing(&rep, &dem, SWING_DELTA);
            if let Some(value) = metric(&swung_red, &swung_blue) {
                plus_dem.push(value);
            }
        }

        if base.is_empty() {
            continue;
        }

        let base_mean = mean(&base);
        insert_finite(&mut summary, name.to_string(), base_mean);
        insert_finite(&mut summary, format!("{name} SD"), stdev(&base));
        insert_finite(&mut summary, format!("{name} Positives"),
            base.iter().filter(|&&v| v > 0.0).count() as f64 / base.len() as f64);
        if !plus_dem.is_empty() {
            insert_finite(&mut summary, format!("{name} +1 Dem"), mean(&plus_dem));
        }
        if !plus_rep.is_empty() {
            insert_finite(&mut summary, format!("{name} +1 Rep"), mean(&plus_rep));
        }

        let (absolute, relative) = percent_ranks(name, house, base_mean);
        if let Some(rank) = absolute {
            insert_finite(&mut summary, format!("{name} Absolute Percent Rank"), rank);
        }
        if let Some(rank) = relative {
            insert_finite(&mut summary, format!("{name} Relative Percent Rank"), rank);
        }
    }

    summary
}

fn insert_finite(summary: &mut BTreeMap<String, Value>, key: String, value: f64) {
    if value.is_finite() {
        summary.insert(key, Value::from(value));
    }
}

fn historical() -> &'static BTreeMap<String, BTreeMap<String, Vec<f64>>> {
    static SCORES: OnceLock<BTreeMap<String, BTreeMap<String, Vec<f64>>>> = OnceLock::new();
    SCORES.get_or_init(|| {
        serde_json::from_str(HISTORICAL_SCORES).unwrap_or_default()
    })
}

/// Percent ranks of a score among past plans of the same chamber:
/// absolute (of |value|) and relative (signed). Local plans have no
/// reference distribution.
pub fn percent_ranks(metric: &str, house: House, value: f64) -> (Option<f64>, Option<f64>) {
    if house == House::LocalPlan {
        return (None, None);
    }
    let Some(past) = historical().get(metric).and_then(|m| m.get(house.as_str())) else {
        return (None, None);
    };
    if past.is_empty() {
        return (None, None);
    }

    let absolute = percent_rank(&past.iter().map(|v| v.abs()).collect::<Vec<_>>(), value.abs());
    let relative = percent_rank(past, value);
    (Some(absolute), Some(relative))
}

/// Midrank percentile of `value` within `past`.
fn percent_rank(past: &[f64], value: f64) -> f64 {
    let below = past.iter().filter(|&&v| v < value).count() as f64;
    let equal = past.iter().filter(|&&v| v == value).count() as f64;
    (below + equal / 2.0) / past.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_symmetry_scores_zero() {
        let red = [2.0, 3.0, 5.0, 6.0];
        let blue = [6.0, 5.0, 3.0, 2.0];
        assert!(efficiency_gap(&red, &blue).unwrap().abs() < 1e-9);
        assert!(mean_median(&red, &blue).unwrap().abs() < 1e-9);
        assert!(partisan_bias(&red, &blue).unwrap().abs() < 1e-9);
        assert!(declination(&red, &blue).unwrap().abs() < 1e-9);
    }

    #[test]
    fn maximum_waste_gap_is_minus_quarter() {
        let red = [1.0, 5.0, 5.0, 5.0];
        let blue = [7.0, 3.0, 3.0, 3.0];
        let eg = efficiency_gap(&red, &blue).unwrap();
        assert!((eg + 0.25).abs() < 1e-9, "eg = {eg}");
        assert!(partisan_bias(&red, &blue).unwrap() < 0.0);
    }

    #[test]
    fn sweep_declination_uses_the_limiting_form() {
        let red = [3.0, 4.0, 5.0];
        let blue = [2.0, 1.0, 0.0];
        let d2 = declination(&red, &blue).unwrap();
        assert!((d2 + 0.549).abs() < 1e-3, "declination = {d2}");
        let mirrored = declination(&blue, &red).unwrap();
        assert!((mirrored - 0.549).abs() < 1e-3);
    }

    #[test]
    fn party_label_symmetry_of_the_gap() {
        let red = [10.0, 40.0, 25.0];
        let blue = [30.0, 20.0, 30.0];
        let forward = efficiency_gap(&red, &blue).unwrap();
        let (swung_blue, swung_red) = swing(&blue, &red, -0.02);
        let (plain_red, plain_blue) = swing(&red, &blue, 0.02);
        let backward = efficiency_gap(&swung_blue, &swung_red).unwrap();
        let ahead = efficiency_gap(&plain_red, &plain_blue).unwrap();
        assert!((backward + ahead).abs() < 1e-9);
        assert!(forward.abs() <= 1.0);
    }

    #[test]
    fn zero_vote_district_does_not_change_the_gap() {
        let red = [2.0, 3.0, 5.0, 6.0];
        let blue = [6.0, 5.0, 3.0, 2.0];
        let padded_red = [2.0, 3.0, 5.0, 6.0, 0.0];
        let padded_blue = [6.0, 5.0, 3.0, 2.0, 0.0];
        assert_eq!(efficiency_gap(&red, &blue), efficiency_gap(&padded_red, &padded_blue));
    }

    #[test]
    fn empty_election_is_null() {
        assert_eq!(efficiency_gap(&[], &[]), None);
        assert_eq!(efficiency_gap(&[0.0], &[0.0]), None);
        assert_eq!(declination(&[0.0], &[0.0]), None);
    }

    #[test]
    fn ties_waste_nothing() {
        // first district is tied: no waste, but its votes stay in the total
        let eg = efficiency_gap(&[4.0, 1.0], &[4.0, 5.0]).unwrap();
        assert!((eg - (1.0 - 2.0) / 14.0).abs() < 1e-9);
    }

    #[test]
    fn summary_carries_means_deviations_and_positives() {
        // two simulations of a two-district plan, lightly jittered
        let tensor = Array3::from_shape_vec((2, 2, 2), vec![
            60.0, 40.0, 61.0, 39.0, // district 0: dem, rep per sim
            45.0, 55.0, 44.0, 56.0, // district 1
        ]).unwrap();

        let summary = summarize(&tensor, House::UsHouse);
        assert!(summary.contains_key("Efficiency Gap"));
        assert!(summary.contains_key("Efficiency Gap SD"));
        assert!(summary.contains_key("Efficiency Gap Positives"));
        assert!(summary.contains_key("Efficiency Gap +1 Dem"));
        assert!(summary.contains_key("Efficiency Gap +1 Rep"));
        assert!(summary.contains_key("Mean-Median"));
        assert!(summary.contains_key("Declination"));
        assert!(summary.contains_key("Efficiency Gap Absolute Percent Rank"));

        let positives = summary["Efficiency Gap Positives"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&positives));
    }

    #[test]
    fn local_plans_have_no_percent_rank() {
        assert_eq!(percent_ranks("Efficiency Gap", House::LocalPlan, 0.1), (None, None));
        let (absolute, relative) = percent_ranks("Efficiency Gap", House::UsHouse, 0.0);
        assert!(absolute.is_some() && relative.is_some());
    }

    #[test]
    fn district_predictions_mark_nan_rows_uncounted() {
        let tensor = Array3::from_shape_vec((2, 2, 2), vec![
            f64::NAN, f64::NAN, f64::NAN, f64::NAN,
            45.0, 55.0, 47.0, 53.0,
        ]).unwrap();
        let predictions = district_predictions(&tensor);
        assert!(!predictions[0].is_counted);
        assert!(predictions[1].is_counted);
        assert!((predictions[1].dem_mean - 46.0).abs() < 1e-9);
        assert_eq!(predictions[1].dem_wins, 0.0);
    }
}
