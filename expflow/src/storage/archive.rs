//! Zip parameter packages.

use crate::errors::ExpflowResult;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// One file or directory to place in a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    /// Name (or directory prefix) inside the archive.
    pub name: String,
    /// Local source.
    pub source: PathBuf,
}

impl PackageEntry {
    /// Creates a new entry.
    #[must_use]
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Writes `entries` into a new zip archive at `dest`.
///
/// Directory sources are added recursively below their entry name.
pub fn write_package(dest: &Path, entries: &[PackageEntry]) -> ExpflowResult<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default();

    for entry in entries {
        if entry.source.is_dir() {
            for item in WalkDir::new(&entry.source).sort_by_file_name() {
                let item = item?;
                if !item.file_type().is_file() {
                    continue;
                }
                let relative = item.path().strip_prefix(&entry.source).unwrap_or(item.path());
                let name = format!("{}/{}", entry.name, relative.to_string_lossy().replace('\\', "/"));
                writer.start_file(name, options)?;
                writer.write_all(&std::fs::read(item.path())?)?;
            }
        } else {
            writer.start_file(entry.name.as_str(), options)?;
            writer.write_all(&std::fs::read(&entry.source)?)?;
        }
    }
    writer.finish()?;
    Ok(())
}

/// Reads one entry; `None` if the archive has no such entry.
pub fn read_entry(archive_path: &Path, name: &str) -> ExpflowResult<Option<Vec<u8>>> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Names of all entries, sorted.
pub fn list_entries(archive_path: &Path) -> ExpflowResult<Vec<String>> {
    let file = File::open(archive_path)?;
    let archive = ZipArchive::new(file)?;
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    Ok(names)
}
