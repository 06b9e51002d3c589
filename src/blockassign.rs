//! Block-assignment file parsing.
//!
//! A BAF maps every Census block in a state to a district number. Files come
//! with or without a header, pipe- or comma-delimited, optionally zipped.

use std::{collections::BTreeMap, io::{Cursor, Read}};

use anyhow::Result;
use polars::{io::SerReader, prelude::CsvReadOptions};
use zip::ZipArchive;

use crate::{detect::ordered_zip_names, error::ScoreError};

/// Recognized block-id column names.
const BLOCK_COLUMNS: &[&str] = &["GEOID10", "GEOID20", "BLOCKID"];
/// Recognized district column name.
const DISTRICT_COLUMN: &str = "DISTRICT";
/// Census sentinel for all-water non-districts; rows are excluded.
const WATER_DISTRICT: &str = "ZZ";

/// Parsed block assignments, grouped by district value.
#[derive(Debug, Clone)]
pub struct Assignments {
    /// (district value, lexicographically sorted block-ids), sorted by district.
    pub districts: Vec<(String, Vec<String>)>,
}

impl Assignments {
    /// Distinct district count = seat count.
    #[inline]
    pub fn seat_count(&self) -> usize {
        self.districts.len()
    }

    /// Most common two-character FIPS prefix among block-ids.
    pub fn state_fips(&self) -> Option<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, blocks) in &self.districts {
            for block in blocks {
                if block.len() >= 2 {
                    *counts.entry(&block[..2]).or_default() += 1;
                }
            }
        }
        counts.into_iter()
            .max_by_key(|&(_, count)| count)
            .map(|(fips, _)| fips.to_string())
    }

    /// All block-ids across districts.
    pub fn all_block_ids(&self) -> impl Iterator<Item = &str> {
        self.districts.iter().flat_map(|(_, blocks)| blocks.iter().map(String::as_str))
    }
}

/// Parse a block-assignment upload, unzipping when needed.
pub fn parse(filename: &str, bytes: &[u8]) -> Result<Assignments> {
    let ext = filename.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    if ext == "zip" {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|err| {
            ScoreError::InvalidUpload(format!("unreadable zip archive: {err}"))
        })?;
        let name = ordered_zip_names(&mut archive).into_iter()
            .find(|name| {
                let ext = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
                ext == "txt" || ext == "csv"
            })
            .ok_or_else(|| ScoreError::InvalidUpload("zip archive contains no table".to_string()))?;

        let mut entry = archive.by_name(&name).map_err(|err| {
            ScoreError::InvalidUpload(format!("unreadable zip entry '{name}': {err}"))
        })?;
        let mut inner = Vec::new();
        entry.read_to_end(&mut inner).map_err(|err| {
            ScoreError::InvalidUpload(format!("unreadable zip entry '{name}': {err}"))
        })?;
        parse_table(&inner)
    } else {
        parse_table(bytes)
    }
}

/// Parse BAF table bytes: sniff the delimiter from the first line, detect a
/// header by recognized column names, group rows by district.
pub fn parse_table(bytes: &[u8]) -> Result<Assignments> {
    let first_line = bytes.split(|&b| b == b'\n').next().unwrap_or_default();
    let first_line = String::from_utf8_lossy(first_line);
    let separator = if first_line.contains('|') { b'|' } else { b',' };

    let has_header = {
        let upper = first_line.to_ascii_uppercase();
        upper.split(separator as char).any(|token| {
            let token = token.trim().trim_matches('"');
            BLOCK_COLUMNS.contains(&token) || token == DISTRICT_COLUMN
        })
    };

    let df = CsvReadOptions::default()
        .with_has_header(has_header)
        .with_infer_schema_length(Some(0))
        .map_parse_options(|po| po.with_separator(separator))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()
        .map_err(|err| ScoreError::InvalidUpload(format!("unparseable table: {err}")))?;

    if df.width() != 2 {
        return Err(ScoreError::InvalidUpload(
            format!("expected 2 columns in block-assignment table, found {}", df.width())).into());
    }

    let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();

    let block_name = names.iter()
        .find(|name| BLOCK_COLUMNS.contains(&name.to_ascii_uppercase().as_str()))
        .unwrap_or(&names[0]);
    let district_name = names.iter()
        .find(|name| name.eq_ignore_ascii_case(DISTRICT_COLUMN))
        .unwrap_or(&names[1]);

    if block_name == district_name {
        return Err(ScoreError::InvalidUpload(
            "block-assignment table has no distinct block and district columns".to_string()).into());
    }

    let blocks = df.column(block_name)
        .and_then(|col| col.str().map(Clone::clone))
        .map_err(|err| ScoreError::InvalidUpload(format!("unparseable table: {err}")))?;
    let districts = df.column(district_name)
        .and_then(|col| col.str().map(Clone::clone))
        .map_err(|err| ScoreError::InvalidUpload(format!("unparseable table: {err}")))?;

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (block, district) in blocks.into_iter().zip(districts.into_iter()) {
        let (Some(block), Some(district)) = (block, district) else { continue };
        let district = district.trim();
        if district.is_empty() || district == WATER_DISTRICT {
            continue;
        }
        grouped.entry(district.to_string()).or_default().push(block.trim().to_string());
    }

    let districts = grouped.into_iter()
        .map(|(district, mut blocks)| {
            blocks.sort();
            (district, blocks)
        })
        .collect();

    Ok(Assignments { districts })
}
