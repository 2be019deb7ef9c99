use std::fs::File;
use std::io::Read;
use std::path::Path;

use tar::Archive;

use super::RawEntry;
use crate::error::{CatalogError, Result};

// Tar has no central directory; both operations are a sequential pass.

pub(super) fn list(path: &Path) -> Result<Vec<RawEntry>> {
    let mut archive = Archive::new(File::open(path)?);
    let mut entries = Vec::new();
    for entry in archive.entries().map_err(CatalogError::Io)? {
        let entry = entry.map_err(|err| {
            CatalogError::CorruptSource(format!("{}: {err}", path.display()))
        })?;
        let raw_name = entry
            .path()
            .map_err(|err| {
                CatalogError::CorruptSource(format!(
                    "{}: {err}",
                    path.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();
        let is_dir = entry.header().entry_type().is_dir();
        entries.push(RawEntry {
            raw_name,
            uncompressed_size: entry.header().size().unwrap_or(0),
            is_dir,
        });
    }
    Ok(entries)
}

pub(super) fn read(path: &Path, raw_name: &str) -> Result<Vec<u8>> {
    let mut archive = Archive::new(File::open(path)?);
    for entry in archive.entries().map_err(CatalogError::Io)? {
        let mut entry = entry.map_err(|err| {
            CatalogError::CorruptSource(format!("{}: {err}", path.display()))
        })?;
        let matches = entry
            .path()
            .map(|p| p.to_string_lossy() == raw_name)
            .unwrap_or(false);
        if matches {
            let mut bytes =
                Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
            entry.read_to_end(&mut bytes).map_err(|err| {
                CatalogError::CorruptSource(format!(
                    "{}!{raw_name}: {err}",
                    path.display()
                ))
            })?;
            return Ok(bytes);
        }
    }
    Err(CatalogError::EntryNotFound {
        archive: path.display().to_string(),
        entry: raw_name.to_string(),
    })
}
