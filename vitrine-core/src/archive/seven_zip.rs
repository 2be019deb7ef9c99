use std::path::Path;

use sevenz_rust2::{ArchiveReader, Password};

use super::RawEntry;
use crate::error::{CatalogError, Result};

fn open(path: &Path) -> Result<ArchiveReader<std::fs::File>> {
    ArchiveReader::open(path, Password::empty()).map_err(|err| {
        CatalogError::CorruptSource(format!("{}: {err}", path.display()))
    })
}

pub(super) fn list(path: &Path) -> Result<Vec<RawEntry>> {
    let reader = open(path)?;
    Ok(reader
        .archive()
        .files
        .iter()
        .map(|entry| RawEntry {
            raw_name: entry.name().to_string(),
            uncompressed_size: entry.size(),
            is_dir: entry.is_directory(),
        })
        .collect())
}

pub(super) fn read(path: &Path, raw_name: &str) -> Result<Vec<u8>> {
    let mut reader = open(path)?;
    reader.read_file(raw_name).map_err(|err| {
        CatalogError::CorruptSource(format!(
            "{}!{raw_name}: {err}",
            path.display()
        ))
    })
}
