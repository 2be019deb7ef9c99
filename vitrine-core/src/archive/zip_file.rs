use std::fs::File;
use std::io::Read;
use std::path::Path;

use zip::ZipArchive;
use zip::result::ZipError;

use super::RawEntry;
use crate::error::{CatalogError, Result};

fn map_err(path: &Path, err: ZipError) -> CatalogError {
    match err {
        ZipError::FileNotFound => CatalogError::EntryNotFound {
            archive: path.display().to_string(),
            entry: String::new(),
        },
        ZipError::Io(io) => CatalogError::Io(io),
        other => CatalogError::CorruptSource(format!(
            "{}: {other}",
            path.display()
        )),
    }
}

fn open(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path)?;
    ZipArchive::new(file).map_err(|err| map_err(path, err))
}

pub(super) fn list(path: &Path) -> Result<Vec<RawEntry>> {
    let mut archive = open(path)?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|err| map_err(path, err))?;
        entries.push(RawEntry {
            raw_name: entry.name().to_string(),
            uncompressed_size: entry.size(),
            is_dir: entry.is_dir(),
        });
    }
    Ok(entries)
}

pub(super) fn read(path: &Path, raw_name: &str) -> Result<Vec<u8>> {
    let mut archive = open(path)?;
    let mut entry = archive.by_name(raw_name).map_err(|err| match err {
        ZipError::FileNotFound => CatalogError::EntryNotFound {
            archive: path.display().to_string(),
            entry: raw_name.to_string(),
        },
        other => map_err(path, other),
    })?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes).map_err(|err| {
        CatalogError::CorruptSource(format!(
            "{}!{raw_name}: {err}",
            path.display()
        ))
    })?;
    Ok(bytes)
}
