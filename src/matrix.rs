//! Linear prediction model over a bank of posterior simulations.
//!
//! The fitted coefficients live in two CSV matrices per model version: C
//! holds the sampled coefficient rows (intercept, presidential vote,
//! incumbency, plus hierarchical per-state offsets), E holds per-district
//! residual draws. Applying the model is one matrix product plus residuals.

use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, Array3};
use polars::{io::SerReader, prelude::CsvReadOptions};

use crate::{
    constants::MODEL_KEY_PREFIX,
    data::{District, House, Incumbency, VersionParameters},
    storage::ObjectStore,
};

/// Loaded coefficient and residual matrices; `c` is 6×S, `e` is at least
/// D×S for any plan the model can score.
#[derive(Debug, Clone)]
pub struct Matrices {
    pub c: Array2<f64>,
    pub e: Array2<f64>,
}

impl Matrices {
    /// Simulation count S.
    #[inline]
    pub fn simulations(&self) -> usize {
        self.c.ncols()
    }
}

/// Per-district model inputs derived from attribution totals.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// Calibrated Democratic presidential share per district; NaN where the
    /// district had no presidential votes.
    pub shares: Vec<f64>,
    /// Incumbency codes, -1/0/+1.
    pub incumbencies: Vec<f64>,
    /// Plan-wide mean of per-district (dem + rep), spread evenly.
    pub district_total: f64,
}

pub fn c_matrix_key(params: &VersionParameters) -> String {
    format!("{MODEL_KEY_PREFIX}/C_matrix{}.csv.gz", params.path_suffix)
}

pub fn e_matrix_key(params: &VersionParameters) -> String {
    format!("{MODEL_KEY_PREFIX}/E_matrix{}.csv.gz", params.path_suffix)
}

/// Row keys selecting the hierarchical state offset triple. Versions with a
/// `year` use the cycle-qualified rows.
fn state_row_keys(state: &str, year: Option<i32>) -> [String; 3] {
    match year {
        Some(year) => [
            format!("r_stateabrev:cycle[{state}_{year},Intercept]"),
            format!("r_stateabrev:cycle[{state}_{year},dpres_mn]"),
            format!("r_stateabrev:cycle[{state}_{year},incumb]"),
        ],
        None => [
            format!("r_stateabrev[{state},Intercept]"),
            format!("r_stateabrev[{state},dpres_mn]"),
            format!("r_stateabrev[{state},incumb]"),
        ],
    }
}

/// Load the C/E matrix pair for one state and model version.
///
/// States absent from the hierarchical fit contribute a zero offset row.
pub fn load_matrices(
    store: &dyn ObjectStore,
    state: &str,
    params: &'static VersionParameters,
) -> Result<Matrices> {
    let c_key = c_matrix_key(params);
    let rows = read_keyed_rows(store, &c_key)?;

    let base_keys = ["b_Intercept", "b_dpres_mn", "b_incumb"];
    let mut selected: Vec<Vec<f64>> = Vec::with_capacity(6);
    for key in base_keys {
        let row = rows.get(key).ok_or_else(|| {
            anyhow::anyhow!("[matrix::load_matrices] Missing row '{key}' in {c_key}")
        })?;
        selected.push(row.clone());
    }

    let simulations = selected[0].len();
    for key in state_row_keys(state, params.year) {
        match rows.get(key.as_str()) {
            Some(row) => selected.push(row.clone()),
            None => {
                tracing::debug!(key, state, "no state offset row, using zeros");
                selected.push(vec![0.0; simulations]);
            }
        }
    }

    if selected.iter().any(|row| row.len() != simulations) {
        bail!("[matrix::load_matrices] Ragged rows in {c_key}");
    }
    let c = Array2::from_shape_vec((6, simulations), selected.concat())
        .context("[matrix::load_matrices] Bad C matrix shape")?;

    let e = read_unkeyed_matrix(store, &e_matrix_key(params))?;
    if e.ncols() != simulations {
        bail!("[matrix::load_matrices] C and E simulation counts differ");
    }

    Ok(Matrices { c, e })
}

/// Derive per-district model inputs from attribution totals, preferring the
/// 2020 presidential columns when populated and calibrating per version.
pub fn district_inputs(
    districts: &[Option<District>],
    incumbents: &[Incumbency],
    params: &VersionParameters,
) -> ModelInputs {
    let mut shares = Vec::with_capacity(districts.len());
    let mut totals_sum = 0.0;

    for district in districts {
        let (share, total) = district.as_ref()
            .map(|district| presidential_share(district, params))
            .unwrap_or((f64::NAN, 0.0));
        shares.push(share);
        totals_sum += total;
    }

    let incumbencies = (0..districts.len())
        .map(|index| incumbents.get(index).copied().unwrap_or_default().code())
        .collect();

    let district_total = if districts.is_empty() {
        0.0
    } else {
        totals_sum / districts.len() as f64
    };

    ModelInputs { shares, incumbencies, district_total }
}

fn presidential_share(district: &District, params: &VersionParameters) -> (f64, f64) {
    let year_2020 = district.total("US President 2020 - DEM")
        .zip(district.total("US President 2020 - REP"))
        .map(|(dem, rep)| (dem, rep, params.pvote2020_scale, params.pvote2020_offset));
    let year_2016 = district.total("US President 2016 - DEM")
        .zip(district.total("US President 2016 - REP"))
        .map(|(dem, rep)| (dem, rep, params.pvote2016_scale, params.pvote2016_offset));

    let Some((dem, rep, scale, offset)) = year_2020.or(year_2016) else {
        return (f64::NAN, 0.0);
    };

    let total = dem + rep;
    if total <= 0.0 {
        return (f64::NAN, total);
    }
    (scale * (dem / total) + offset, total)
}

/// Simulated Democratic share per (district, simulation): `AD·C + E'`.
///
/// Each AD row is `[1, share + vote_adjust, incumbency]` twice; the doubled
/// block is how the matrix files encode the hierarchical state offset. NaN
/// shares propagate through their whole row.
pub fn apply_model(inputs: &ModelInputs, matrices: &Matrices, house: House, params: &VersionParameters) -> Result<Array2<f64>> {
    let d = inputs.shares.len();
    if matrices.e.nrows() < d {
        bail!("[matrix::apply_model] Residual matrix has {} rows for {d} districts",
            matrices.e.nrows());
    }

    let vote_adjust = match house {
        House::UsHouse => params.vote_adjust_congress,
        _ => params.vote_adjust_statelege,
    };

    let mut ad = Array2::zeros((d, 6));
    for (index, (&share, &incumbency)) in inputs.shares.iter().zip(&inputs.incumbencies).enumerate() {
        let row = [1.0, share + vote_adjust, incumbency];
        for (offset, &value) in row.iter().cycle().take(6).enumerate() {
            ad[[index, offset]] = value;
        }
    }

    let mut shares = ad.dot(&matrices.c);
    shares += &matrices.e.slice(s![..d, ..]);
    Ok(shares)
}

/// Combine simulated shares with the evenly spread district total into the
/// (D, S, 2) votes tensor, rounded to a tenth of a vote.
pub fn build_tensor(shares: &Array2<f64>, district_total: f64) -> Array3<f64> {
    let (d, s) = shares.dim();
    let mut tensor = Array3::zeros((d, s, 2));
    for district in 0..d {
        for sim in 0..s {
            let share = shares[[district, sim]];
            tensor[[district, sim, 0]] = round_tenth(share * district_total);
            tensor[[district, sim, 1]] = round_tenth((1.0 - share) * district_total);
        }
    }
    tensor
}

#[inline]
fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Read a gzipped keyed CSV (`key,V1..VS`) into rows of floats.
fn read_keyed_rows(store: &dyn ObjectStore, key: &str) -> Result<AHashMap<String, Vec<f64>>> {
    let df = read_csv_gz(store, key)?;
    let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    if names.len() < 2 {
        bail!("[matrix::read_keyed_rows] Not enough columns in {key}");
    }

    let row_keys = df.column(&names[0])
        .and_then(|col| col.str().map(Clone::clone))
        .with_context(|| format!("[matrix::read_keyed_rows] Bad key column in {key}"))?;

    let mut columns = Vec::with_capacity(names.len() - 1);
    for name in &names[1..] {
        let column = df.column(name)
            .and_then(|col| col.str().map(Clone::clone))
            .with_context(|| format!("[matrix::read_keyed_rows] Bad column '{name}' in {key}"))?;
        columns.push(column);
    }

    let mut rows = AHashMap::default();
    for index in 0..df.height() {
        let Some(row_key) = row_keys.get(index) else { continue };
        let values: Result<Vec<f64>> = columns.iter()
            .map(|column| {
                column.get(index).unwrap_or_default().parse::<f64>()
                    .with_context(|| format!("[matrix::read_keyed_rows] Bad value in {key}"))
            })
            .collect();
        rows.insert(row_key.to_string(), values?);
    }

    Ok(rows)
}

/// Read a gzipped unkeyed CSV (`V1..VS`) into a dense matrix.
fn read_unkeyed_matrix(store: &dyn ObjectStore, key: &str) -> Result<Array2<f64>> {
    let df = read_csv_gz(store, key)?;
    let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();

    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        let column = df.column(name)
            .and_then(|col| col.str().map(Clone::clone))
            .with_context(|| format!("[matrix::read_unkeyed_matrix] Bad column '{name}' in {key}"))?;
        columns.push(column);
    }

    let height = df.height();
    let mut values = Vec::with_capacity(height * columns.len());
    for index in 0..height {
        for column in &columns {
            values.push(
                column.get(index).unwrap_or_default().parse::<f64>()
                    .with_context(|| format!("[matrix::read_unkeyed_matrix] Bad value in {key}"))?,
            );
        }
    }

    Array2::from_shape_vec((height, columns.len()), values)
        .with_context(|| format!("[matrix::read_unkeyed_matrix] Bad matrix shape in {key}"))
}

fn read_csv_gz(store: &dyn ObjectStore, key: &str) -> Result<polars::prelude::DataFrame> {
    let object = store.get_object(key)
        .with_context(|| format!("[matrix::read_csv_gz] Failed to read {key}"))?;
    let body = object.decoded_body()?;

    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(std::io::Cursor::new(body))
        .finish()
        .with_context(|| format!("[matrix::read_csv_gz] Failed to parse {key}"))
}
