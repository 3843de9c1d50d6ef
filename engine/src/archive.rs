//! Install-archive access.
//!
//! Wraps a seekable ZIP reader behind the small surface the component
//! identifier and the install transaction need: entry count, per-entry
//! metadata, and extraction into an arbitrary writer. Entry names are
//! normalized to forward slashes and rejected outright when they contain
//! traversal components.

use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::core::paths::validate_archive_entry_path;
use crate::error::{EngineError, EngineResult};

/// Metadata of one archive entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    /// Normalized relative path inside the archive.
    pub path: PathBuf,
    pub is_dir: bool,
    /// Uncompressed size in bytes (0 for directories).
    pub size: u64,
}

pub struct ArchiveReader<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl ArchiveReader<BufReader<File>> {
    /// Open an archive on disk.
    pub fn open_file(path: &Path) -> EngineResult<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Filesystem(crate::error::FilesystemError::PathDoesNotExist(
                    path.to_path_buf(),
                ))
            } else {
                EngineError::Filesystem(crate::error::FilesystemError::Io(e))
            }
        })?;
        Self::open(BufReader::new(file))
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Open an archive from any seekable reader.
    pub fn open(reader: R) -> EngineResult<Self> {
        let archive = ZipArchive::new(reader)
            .map_err(|e| EngineError::bad_archive(format!("cannot open archive: {}", e)))?;
        Ok(Self { archive })
    }

    pub fn num_entries(&self) -> usize {
        self.archive.len()
    }

    /// Entry metadata without decompressing its contents.
    pub fn stat(&mut self, index: usize) -> EngineResult<EntryInfo> {
        if index >= self.archive.len() {
            return Err(EngineError::EntryNotFound(format!("index {}", index)));
        }
        let entry = self.archive.by_index_raw(index)?;
        let is_dir = entry.is_dir();
        let size = entry.size();
        let path = validate_archive_entry_path(entry.name())?;
        Ok(EntryInfo { path, is_dir, size })
    }

    /// The CRC-32 the archive records for entry `index`, available without
    /// decompression. Component checksum tables are built from these.
    pub fn entry_crc32(&mut self, index: usize) -> EngineResult<u32> {
        if index >= self.archive.len() {
            return Err(EngineError::EntryNotFound(format!("index {}", index)));
        }
        let entry = self.archive.by_index_raw(index)?;
        Ok(entry.crc32())
    }

    /// Decompress entry `index` into `out`. Returns the number of bytes
    /// written, which must equal the entry's stated size.
    pub fn extract(&mut self, index: usize, out: &mut impl Write) -> EngineResult<u64> {
        if index >= self.archive.len() {
            return Err(EngineError::EntryNotFound(format!("index {}", index)));
        }
        let mut entry = self.archive.by_index(index)?;
        let expected = entry.size();
        let written = std::io::copy(&mut entry, out)
            .map_err(|e| EngineError::Filesystem(crate::error::FilesystemError::Io(e)))?;
        if written != expected {
            return Err(EngineError::corrupted(format!(
                "entry {} truncated: {} of {} bytes",
                entry.name(),
                written,
                expected
            )));
        }
        Ok(written)
    }

    /// Extract entry `index` to a file, creating parent directories.
    pub fn extract_to_file(&mut self, index: usize, destination: &Path) -> EngineResult<u64> {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Filesystem(crate::error::FilesystemError::Io(e)))?;
        }
        let mut file = File::create(destination)
            .map_err(|e| EngineError::Filesystem(crate::error::FilesystemError::Io(e)))?;
        self.extract(index, &mut file)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Cursor;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Build an in-memory ZIP from (path, contents) pairs. Paths ending in
    /// '/' become directory entries.
    pub fn build_zip(entries: &[(&str, &[u8])]) -> Cursor<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (path, contents) in entries {
            if path.ends_with('/') {
                writer.add_directory(path.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(*path, options).unwrap();
                std::io::Write::write_all(&mut writer, contents).unwrap();
            }
        }
        let mut cursor = writer.finish().unwrap();
        cursor.set_position(0);
        cursor
    }
}
