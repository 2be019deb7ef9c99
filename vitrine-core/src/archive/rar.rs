use std::path::Path;

use unrar::Archive;

use super::RawEntry;
use crate::error::{CatalogError, Result};

pub(super) fn list(path: &Path) -> Result<Vec<RawEntry>> {
    let archive = Archive::new(&path).open_for_listing().map_err(|err| {
        CatalogError::CorruptSource(format!("{}: {err}", path.display()))
    })?;

    let mut entries = Vec::new();
    for header in archive {
        let header = header.map_err(|err| {
            CatalogError::CorruptSource(format!("{}: {err}", path.display()))
        })?;
        entries.push(RawEntry {
            raw_name: header.filename.to_string_lossy().into_owned(),
            uncompressed_size: header.unpacked_size as u64,
            is_dir: !header.is_file(),
        });
    }
    Ok(entries)
}

pub(super) fn read(path: &Path, raw_name: &str) -> Result<Vec<u8>> {
    let mut archive =
        Archive::new(&path).open_for_processing().map_err(|err| {
            CatalogError::CorruptSource(format!("{}: {err}", path.display()))
        })?;

    loop {
        let Some(header) = archive.read_header().map_err(|err| {
            CatalogError::CorruptSource(format!("{}: {err}", path.display()))
        })?
        else {
            break;
        };

        if header.entry().filename.to_string_lossy() == raw_name {
            let (bytes, _rest) = header.read().map_err(|err| {
                CatalogError::CorruptSource(format!(
                    "{}!{raw_name}: {err}",
                    path.display()
                ))
            })?;
            return Ok(bytes);
        }
        archive = header.skip().map_err(|err| {
            CatalogError::CorruptSource(format!("{}: {err}", path.display()))
        })?;
    }

    Err(CatalogError::EntryNotFound {
        archive: path.display().to_string(),
        entry: raw_name.to_string(),
    })
}
