//! District attribution against a tabular analytics engine.
//!
//! Both upload paths reduce to one SQL shape: join precomputed block
//! statistics to districts (spatially or by block-id), aggregate per
//! district, order by district. The production engine is remote and
//! asynchronous; `MemoryEngine` executes the same contract in-process for
//! tests and the all-in-one runner.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::RwLock,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use anyhow::{Context, Result};
use geo::{BoundingRect, Contains, MultiPolygon, Point};
use polars::{io::SerReader, prelude::CsvReadOptions};
use rstar::{primitives::GeomWithData, RTree, AABB};
use serde_json::Value;
use uuid::Uuid;
use wkt::TryFromWkt;

use crate::{
    constants::POLL_INTERVAL,
    error::ScoreError,
    storage::ObjectStore,
};

/// Column types the engine declares on result sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Bigint,
    Double,
    Float,
    Varchar,
    Date,
    Boolean,
}

impl ColumnType {
    /// Decode one cell per the declared type.
    pub fn decode(self, cell: &str) -> Result<Value> {
        Ok(match self {
            ColumnType::Integer | ColumnType::Bigint => {
                Value::from(cell.parse::<i64>().with_context(|| {
                    format!("[analytics::decode] Bad integer cell '{cell}'")
                })?)
            }
            ColumnType::Double | ColumnType::Float => {
                Value::from(cell.parse::<f64>().with_context(|| {
                    format!("[analytics::decode] Bad float cell '{cell}'")
                })?)
            }
            ColumnType::Boolean => Value::from(cell == "true" || cell == "t"),
            ColumnType::Varchar | ColumnType::Date => Value::from(cell),
        })
    }
}

/// Per-column aggregate used in the attribution query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Median,
}

/// One canonical block-table column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    /// Human-readable name, used as the totals key and SQL alias.
    pub name: &'static str,
    /// Identifier in the block-statistics table.
    pub column: &'static str,
    pub column_type: ColumnType,
    pub aggregate: Aggregate,
}

/// Canonical block-table columns, in reporting order. The set is defined by
/// the training pipeline; new columns are appended here when it grows.
pub const BLOCK_TABLE_FIELDS: &[ColumnSpec] = &[
    ColumnSpec { name: "US President 2016 - DEM", column: "us_president_2016_dem", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "US President 2016 - REP", column: "us_president_2016_rep", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "US President 2020 - DEM", column: "us_president_2020_dem", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "US President 2020 - REP", column: "us_president_2020_rep", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "US Senate 2016 - DEM", column: "us_senate_2016_dem", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "US Senate 2016 - REP", column: "us_senate_2016_rep", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "US Senate 2020 - DEM", column: "us_senate_2020_dem", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "US Senate 2020 - REP", column: "us_senate_2020_rep", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "Population 2015", column: "population_2015", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "Population 2019", column: "population_2019", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "Households 2016", column: "households_2016", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "Sum Household Income 2016", column: "sum_household_income_2016", column_type: ColumnType::Double, aggregate: Aggregate::Sum },
    ColumnSpec { name: "Household Income 2016", column: "household_income_2016", column_type: ColumnType::Double, aggregate: Aggregate::Median },
];

/// How blocks join to districts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Block centroid within district polygon.
    Spatial,
    /// Equality on the block-id column.
    BlockId,
}

/// One attribution query over the block-statistics table.
#[derive(Debug, Clone)]
pub struct AttributionQuery {
    pub upload_id: String,
    /// `model.key_prefix`, selecting the state's block partition.
    pub key_prefix: String,
    pub join: JoinKind,
    pub columns: &'static [ColumnSpec],
}

impl AttributionQuery {
    pub fn new(upload_id: &str, key_prefix: &str, join: JoinKind) -> Self {
        AttributionQuery {
            upload_id: upload_id.to_string(),
            key_prefix: key_prefix.to_string(),
            join,
            columns: BLOCK_TABLE_FIELDS,
        }
    }

    /// Render the query for a remote engine.
    pub fn to_sql(&self) -> String {
        let selects: Vec<String> = self.columns.iter()
            .map(|spec| match spec.aggregate {
                Aggregate::Sum => format!("SUM(b.{}) AS \"{}\"", spec.column, spec.name),
                Aggregate::Median => {
                    format!("APPROX_PERCENTILE(b.{}, 0.5) AS \"{}\"", spec.column, spec.name)
                }
            })
            .collect();

        let join_clause = match self.join {
            JoinKind::Spatial => {
                "ST_Within(ST_Point(b.longitude, b.latitude), ST_GeometryFromText(d.polygon_wkt))"
            }
            JoinKind::BlockId => "b.geoid20 = d.geoid20",
        };

        format!(
            "SELECT d.number, {selects}\n\
             FROM blocks b, districts d\n\
             WHERE {join_clause}\n  \
               AND b.prefix = '{prefix}'\n  \
               AND d.upload = '{upload}'\n\
             GROUP BY d.number ORDER BY d.number",
            selects = selects.join(", "),
            prefix = self.key_prefix,
            upload = self.upload_id,
        )
    }
}

/// Declared result column.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
}

/// Rows as returned by the engine: cells are strings, absent cells None.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// Decode rows per declared column type; absent cells omit the key.
    pub fn decoded_rows(&self) -> Result<Vec<BTreeMap<String, Value>>> {
        self.rows.iter()
            .map(|row| {
                self.columns.iter().zip(row)
                    .filter_map(|(info, cell)| {
                        cell.as_deref().map(|cell| {
                            Ok((info.name.clone(), info.column_type.decode(cell)?))
                        })
                    })
                    .collect()
            })
            .collect()
    }
}

/// Asynchronous query execution contract.
///
/// `start_query` persists nothing by itself; the attribution inputs under
/// `uploads/{id}/districts/partition.csv.gz` must exist in the store first.
pub trait AnalyticsEngine: Send + Sync {
    fn start_query(&self, store: &dyn ObjectStore, query: &AttributionQuery) -> Result<String>;
    fn get_result(&self, execution_id: &str) -> Result<Option<ResultSet>>;
}

/// Poll an execution until its result set is available.
pub fn poll_query(
    engine: &dyn AnalyticsEngine,
    execution_id: &str,
    deadline: Instant,
) -> Result<ResultSet> {
    loop {
        if let Some(results) = engine.get_result(execution_id)? {
            return Ok(results);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            return Err(ScoreError::AnalyticsFailure(
                format!("attribution query {execution_id} timed out")).into());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Divide summed household income by household count, once per district.
/// Overwrites any engine-side median with the exact plan-level figure.
pub fn postprocess_household_income(totals: &mut BTreeMap<String, Value>) {
    let sum = totals.get("Sum Household Income 2016").and_then(Value::as_f64);
    let count = totals.get("Households 2016").and_then(Value::as_f64);
    if let (Some(sum), Some(count)) = (sum, count) {
        if count > 0.0 {
            totals.insert("Household Income 2016".to_string(), Value::from((sum / count).round()));
        }
    }
}

/// One block's precomputed statistics, as loaded into the in-process engine.
#[derive(Debug, Clone)]
pub struct Block {
    pub geoid: String,
    /// Representative interior point, EPSG:4326.
    pub point: Point<f64>,
    pub values: BTreeMap<String, f64>,
}

/// In-process engine over in-memory block statistics.
///
/// Results are computed synchronously at `start_query` and handed back on
/// the first `get_result`, preserving the asynchronous calling convention.
#[derive(Default)]
pub struct MemoryEngine {
    partitions: RwLock<AHashMap<String, Vec<Block>>>,
    results: RwLock<AHashMap<String, ResultSet>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one state partition's blocks, keyed by `model.key_prefix`.
    pub fn add_blocks(&self, key_prefix: &str, blocks: Vec<Block>) {
        self.partitions.write().unwrap().insert(key_prefix.to_string(), blocks);
    }

    fn execute(&self, store: &dyn ObjectStore, query: &AttributionQuery) -> Result<ResultSet> {
        let partitions = self.partitions.read().unwrap();
        let blocks = partitions.get(&query.key_prefix).map(Vec::as_slice).unwrap_or(&[]);
        let rows = read_partition_rows(store, &query.upload_id)?;

        // district index -> indices of matched blocks
        let mut matched: BTreeMap<i64, BTreeSet<usize>> = BTreeMap::new();

        match query.join {
            JoinKind::Spatial => {
                let tree: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
                    blocks.iter().enumerate()
                        .map(|(index, block)| {
                            GeomWithData::new([block.point.x(), block.point.y()], index)
                        })
                        .collect(),
                );
                for row in &rows {
                    let Some(wkt_piece) = &row.wkt else { continue };
                    let piece = multipolygon_from_wkt(wkt_piece)?;
                    let Some(bounds) = piece.bounding_rect() else { continue };
                    let envelope = AABB::from_corners(
                        [bounds.min().x, bounds.min().y],
                        [bounds.max().x, bounds.max().y],
                    );
                    let found = matched.entry(row.district).or_default();
                    for candidate in tree.locate_in_envelope(&envelope) {
                        let block = &blocks[candidate.data];
                        if piece.contains(&block.point) {
                            found.insert(candidate.data);
                        }
                    }
                }
            }
            JoinKind::BlockId => {
                let mut by_geoid: AHashMap<&str, usize> = AHashMap::default();
                for (index, block) in blocks.iter().enumerate() {
                    by_geoid.insert(&block.geoid, index);
                }
                for row in &rows {
                    let Some(geoid) = &row.block_id else { continue };
                    let found = matched.entry(row.district).or_default();
                    if let Some(&index) = by_geoid.get(geoid.as_str()) {
                        found.insert(index);
                    }
                }
            }
        }

        let mut columns = vec![ColumnInfo {
            name: "number".to_string(),
            column_type: ColumnType::Integer,
        }];
        columns.extend(query.columns.iter().map(|spec| ColumnInfo {
            name: spec.name.to_string(),
            column_type: spec.column_type,
        }));

        let result_rows = matched.into_iter()
            .map(|(district, indices)| {
                let mut row = vec![Some(district.to_string())];
                for spec in query.columns {
                    let values: Vec<f64> = indices.iter()
                        .filter_map(|&index| blocks[index].values.get(spec.name).copied())
                        .collect();
                    row.push(aggregate_cell(spec.aggregate, &values));
                }
                row
            })
            .collect();

        Ok(ResultSet { columns, rows: result_rows })
    }
}

impl AnalyticsEngine for MemoryEngine {
    fn start_query(&self, store: &dyn ObjectStore, query: &AttributionQuery) -> Result<String> {
        let results = self.execute(store, query)?;
        let execution_id = Uuid::new_v4().to_string();
        tracing::debug!(execution_id, upload = %query.upload_id, rows = results.rows.len(),
            "executed attribution query");
        self.results.write().unwrap().insert(execution_id.clone(), results);
        Ok(execution_id)
    }

    fn get_result(&self, execution_id: &str) -> Result<Option<ResultSet>> {
        Ok(self.results.read().unwrap().get(execution_id).cloned())
    }
}

struct PartitionRow {
    district: i64,
    wkt: Option<String>,
    block_id: Option<String>,
}

/// Read the flattened join table written by the districts module.
fn read_partition_rows(store: &dyn ObjectStore, upload_id: &str) -> Result<Vec<PartitionRow>> {
    let key = format!("uploads/{upload_id}/districts/partition.csv.gz");
    let object = store.get_object(&key)
        .with_context(|| format!("[analytics::read_partition_rows] Failed to read {key}"))?;
    let body = object.decoded_body()?;

    let df = CsvReadOptions::default()
        .with_has_header(false)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(std::io::Cursor::new(body))
        .finish()
        .map_err(|err| ScoreError::AnalyticsFailure(format!("bad partition table: {err}")))?;

    if df.width() != 3 {
        return Err(ScoreError::AnalyticsFailure(
            format!("expected 3 partition columns, found {}", df.width())).into());
    }

    let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    let get = |name: &str| -> Result<_> {
        df.column(name)
            .and_then(|col| col.str().map(Clone::clone))
            .map_err(|err| ScoreError::AnalyticsFailure(format!("bad partition table: {err}")).into())
    };
    let districts = get(&names[0])?;
    let wkts = get(&names[1])?;
    let block_ids = get(&names[2])?;

    (0..df.height())
        .map(|i| {
            let district = districts.get(i).unwrap_or_default().trim().parse::<i64>()
                .map_err(|err| ScoreError::AnalyticsFailure(
                    format!("bad district index in partition table: {err}")))?;
            Ok(PartitionRow {
                district,
                wkt: wkts.get(i).filter(|s| !s.is_empty()).map(str::to_string),
                block_id: block_ids.get(i).filter(|s| !s.is_empty()).map(str::to_string),
            })
        })
        .collect()
}

pub(crate) fn multipolygon_from_wkt(text: &str) -> Result<MultiPolygon<f64>> {
    match geo::Geometry::<f64>::try_from_wkt_str(text) {
        Ok(geo::Geometry::Polygon(polygon)) => Ok(MultiPolygon(vec![polygon])),
        Ok(geo::Geometry::MultiPolygon(multi)) => Ok(multi),
        Ok(other) => Err(ScoreError::AnalyticsFailure(
            format!("non-polygonal partition piece: {other:?}")).into()),
        Err(err) => Err(ScoreError::AnalyticsFailure(
            format!("unparseable partition piece: {err}")).into()),
    }
}

fn aggregate_cell(aggregate: Aggregate, values: &[f64]) -> Option<String> {
    match aggregate {
        Aggregate::Sum => Some(values.iter().sum::<f64>().to_string()),
        Aggregate::Median => {
            if values.is_empty() {
                return None;
            }
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            Some(sorted[sorted.len() / 2].to_string())
        }
    }
}
