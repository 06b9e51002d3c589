//! Upload-type detection: sniff by extension and, for archives, by contents.

use std::io::Cursor;

use anyhow::Result;
use zip::ZipArchive;

use crate::error::ScoreError;

/// Shape of an uploaded plan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadType {
    OgrDatasource,
    ZippedOgrDatasource,
    BlockAssignment,
    ZippedBlockAssignment,
}

fn extension(filename: &str) -> String {
    filename.rsplit('.').next().unwrap_or_default().to_ascii_lowercase()
}

/// Zip entry names, ordered so that dotfiles and `__MACOSX/` resource forks
/// come last and are never selected over real payload entries.
pub fn ordered_zip_names<R: std::io::Read + std::io::Seek>(archive: &mut ZipArchive<R>) -> Vec<String> {
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort_by_key(|name| {
        let basename = name.rsplit('/').next().unwrap_or(name);
        (name.starts_with("__MACOSX/") || basename.starts_with('.'), name.clone())
    });
    names
}

/// Decide the shape of an uploaded file, or fail with `InvalidUpload`.
pub fn guess_upload_type(filename: &str, bytes: &[u8]) -> Result<UploadType> {
    match extension(filename).as_str() {
        "geojson" | "json" | "gpkg" => return Ok(UploadType::OgrDatasource),
        "txt" | "csv" => return Ok(UploadType::BlockAssignment),
        "zip" => {}
        other => {
            return Err(ScoreError::InvalidUpload(
                format!("unrecognized file type '.{other}'")).into());
        }
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|err| {
        ScoreError::InvalidUpload(format!("unreadable zip archive: {err}"))
    })?;

    for name in ordered_zip_names(&mut archive) {
        match extension(&name).as_str() {
            "shp" => return Ok(UploadType::ZippedOgrDatasource),
            "txt" | "csv" => return Ok(UploadType::ZippedBlockAssignment),
            _ => continue,
        }
    }

    Err(ScoreError::InvalidUpload("zip archive contains no plan file".to_string()).into())
}
