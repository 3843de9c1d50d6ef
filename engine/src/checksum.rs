//! Per-library checksum manifests.
//!
//! Every installed library folder carries a `floe-checksums` file recording
//! the expected contents: one file per line as
//! `<relative-path>\t<hex-crc32>\t<size>`, preceded by a
//! `# Generated by <tag>` header. The installer writes one after extraction;
//! the existing-install probe compares the stored manifest against a freshly
//! computed table to classify user modifications.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult, FilesystemError};
use crate::logger;

/// File name of the manifest written to the root of each installed library.
pub const CHECKSUMS_FILE_NAME: &str = "floe-checksums";

/// Files the engine itself (or the host OS) drops into installed folders.
/// Entries matching one of these names never count as user modifications.
pub const AUTO_GENERATED_FILES: &[&str] =
    &[CHECKSUMS_FILE_NAME, ".DS_Store", "Thumbs.db", "desktop.ini"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumValue {
    pub crc32: u32,
    pub size: u64,
}

/// Ordered map from forward-slash relative path to checksum + size.
/// Ordering is load-bearing: emission must be deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumTable {
    entries: BTreeMap<String, ChecksumValue>,
}

impl ChecksumTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: ChecksumValue) {
        self.entries.insert(path.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&ChecksumValue> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChecksumValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Outcome of comparing an expected table against what is actually on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumDiff {
    Same,
    /// Every expected file matches, but the actual set is a strict superset.
    SameButHasExtraFiles,
    Differ,
}

/// Tolerances applied to [`compare`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions<'a> {
    /// Drop [`AUTO_GENERATED_FILES`] from the actual side before comparing.
    pub ignore_auto_generated_files: bool,
    /// Extra files under this relative prefix are permitted entirely
    /// (dropped, not demoted to `SameButHasExtraFiles`). An empty prefix
    /// permits extras anywhere.
    pub extras_allowed_in_subtree: Option<&'a str>,
}

fn is_auto_generated(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    AUTO_GENERATED_FILES.contains(&name)
}

fn is_under_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path.strip_prefix(prefix)
        .map(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(false)
}

/// Compare `expected` against `actual`.
///
/// `Differ` when any shared entry differs in hash or size, or any expected
/// file is missing from `actual`. `SameButHasExtraFiles` when everything
/// expected matches but `actual` has files beyond it (after tolerances).
/// `Same` only on exact equality.
pub fn compare(
    expected: &ChecksumTable,
    actual: &ChecksumTable,
    options: CompareOptions<'_>,
) -> ChecksumDiff {
    let mut has_extras = false;

    for (path, value) in actual.iter() {
        if options.ignore_auto_generated_files && is_auto_generated(path) {
            continue;
        }
        match expected.get(path) {
            Some(expected_value) if expected_value == value => {}
            Some(_) => return ChecksumDiff::Differ,
            None => {
                let allowed = options
                    .extras_allowed_in_subtree
                    .map(|prefix| is_under_prefix(path, prefix))
                    .unwrap_or(false);
                if !allowed {
                    has_extras = true;
                }
            }
        }
    }

    for path in expected.paths() {
        if actual.get(path).is_none() {
            return ChecksumDiff::Differ;
        }
    }

    if has_extras {
        ChecksumDiff::SameButHasExtraFiles
    } else {
        ChecksumDiff::Same
    }
}

/// Parse the manifest text format. Lines starting `#` are comments; each
/// data line is `<relative-path>\t<hex-crc32>\t<size>`.
pub fn parse_checksum_file(text: &str) -> EngineResult<ChecksumTable> {
    let mut table = ChecksumTable::new();

    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split('\t');
        let (path, hash, size) = match (fields.next(), fields.next(), fields.next()) {
            (Some(p), Some(h), Some(s)) if fields.next().is_none() => (p, h, s),
            _ => {
                return Err(EngineError::corrupted(format!(
                    "checksum manifest line {} is malformed",
                    line_number + 1
                )))
            }
        };

        let crc32 = u32::from_str_radix(hash, 16).map_err(|_| {
            EngineError::corrupted(format!(
                "checksum manifest line {}: bad hash '{}'",
                line_number + 1,
                hash
            ))
        })?;
        let size = size.parse::<u64>().map_err(|_| {
            EngineError::corrupted(format!(
                "checksum manifest line {}: bad size '{}'",
                line_number + 1,
                size
            ))
        })?;

        table.insert(path, ChecksumValue { crc32, size });
    }

    Ok(table)
}

/// Emit the manifest text: a generator header then entries in stable order.
pub fn write_checksum_file(table: &ChecksumTable, generator_tag: &str) -> String {
    let mut out = format!("# Generated by {}\n", generator_tag);
    for (path, value) in table.iter() {
        out.push_str(&format!("{}\t{:08x}\t{}\n", path, value.crc32, value.size));
    }
    out
}

/// Read and parse `<dir>/floe-checksums`.
pub fn read_checksum_file_in_dir(dir: &Path) -> EngineResult<ChecksumTable> {
    let path = dir.join(CHECKSUMS_FILE_NAME);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::Filesystem(FilesystemError::PathDoesNotExist(path.clone()))
        } else {
            EngineError::Filesystem(FilesystemError::Io(e))
        }
    })?;
    parse_checksum_file(&text)
}

/// Compute the crc32 and size of a single file without loading it whole.
pub fn crc32_of_file(path: &Path) -> EngineResult<ChecksumValue> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut size = 0u64;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    Ok(ChecksumValue {
        crc32: hasher.finalize(),
        size,
    })
}

/// Walk `root` and build the actual checksum table of everything under it.
pub fn checksum_table_for_dir(root: &Path) -> EngineResult<ChecksumTable> {
    if !root.exists() {
        return Err(EngineError::Filesystem(FilesystemError::PathDoesNotExist(
            root.to_path_buf(),
        )));
    }

    let mut table = ChecksumTable::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            EngineError::Filesystem(FilesystemError::Io(std::io::Error::other(e)))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let value = crc32_of_file(entry.path())?;
        table.insert(relative, value);
    }

    logger::log_debug(
        &format!("computed checksum table for {:?}: {} files", root, table.len()),
        Some("checksum"),
        None,
    );
    Ok(table)
}
