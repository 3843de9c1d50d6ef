//! Sample-library server and preset server.
//!
//! The library server keeps an in-memory index of installed libraries built
//! by scanning the configured scan folders. Install workers ask it whether a
//! library identity is already present (the existing-install probe) and tell
//! it to rescan a folder right after installing into it, without waiting for
//! filesystem notifications. The preset server keeps a lighter snapshot:
//! per scanned subdirectory, the set of file checksums under it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::checksum::{self, ChecksumTable};
use crate::error::{EngineError, EngineResult};
use crate::logger;
use crate::prefs::parse_ini_text;

/// Well-known manifest name at the root of a modern library folder.
pub const LIBRARY_MANIFEST_NAME: &str = "floe-library.ini";

/// Extension identifying a legacy single-file library.
pub const LEGACY_LIBRARY_EXTENSION: &str = "mdata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Single-file library from the legacy sibling application. Always
    /// compares as older than any modern library.
    Legacy,
    Modern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryIdentity {
    pub author: String,
    pub name: String,
    pub minor_version: u16,
    pub file_format: FileFormat,
}

impl LibraryIdentity {
    /// Identity match ignores version and format: same author + name means
    /// "the same library" for install purposes.
    pub fn same_library(&self, other: &LibraryIdentity) -> bool {
        self.author == other.author && self.name == other.name
    }
}

#[derive(Debug, Clone)]
pub struct InstalledLibrary {
    pub identity: LibraryIdentity,
    /// Folder for modern libraries, the `.mdata` file for legacy ones.
    pub path: PathBuf,
}

/// Parse a modern library manifest (`floe-library.ini`) text.
pub fn parse_library_manifest(text: &str) -> EngineResult<LibraryIdentity> {
    let mut author = None;
    let mut name = None;
    let mut minor_version = None;

    for (key, value) in parse_ini_text(text) {
        match key.as_str() {
            "author" => author = Some(value),
            "name" => name = Some(value),
            "minor_version" => {
                minor_version = Some(value.parse::<u16>().map_err(|_| {
                    EngineError::corrupted(format!("bad minor_version '{}'", value))
                })?)
            }
            _ => {} // unknown keys ignored
        }
    }

    match (author, name) {
        (Some(author), Some(name)) if !name.is_empty() => Ok(LibraryIdentity {
            author,
            name,
            minor_version: minor_version.unwrap_or(0),
            file_format: FileFormat::Modern,
        }),
        _ => Err(EngineError::corrupted(
            "library manifest missing author or name",
        )),
    }
}

/// Derive a legacy identity from a `.mdata` filename. The convention is
/// `<Author> - <Name>.mdata`; a bare name gets an empty author.
pub fn legacy_identity_from_filename(file_stem: &str) -> LibraryIdentity {
    let (author, name) = match file_stem.split_once(" - ") {
        Some((author, name)) => (author.to_string(), name.to_string()),
        None => (String::new(), file_stem.to_string()),
    };
    LibraryIdentity {
        author,
        name,
        minor_version: 0,
        file_format: FileFormat::Legacy,
    }
}

#[derive(Default)]
struct LibraryIndex {
    libraries: Vec<InstalledLibrary>,
    scan_folders: Vec<PathBuf>,
    /// Number of scans currently running on worker threads.
    active_scans: usize,
}

pub struct SampleLibraryServer {
    index: Mutex<LibraryIndex>,
    scan_settled: Condvar,
}

impl SampleLibraryServer {
    pub fn new(scan_folders: Vec<PathBuf>) -> Self {
        Self {
            index: Mutex::new(LibraryIndex {
                scan_folders,
                ..Default::default()
            }),
            scan_settled: Condvar::new(),
        }
    }

    pub fn set_scan_folders(&self, folders: Vec<PathBuf>) {
        let mut index = self.index.lock().unwrap();
        index.scan_folders = folders;
    }

    pub fn scan_folders(&self) -> Vec<PathBuf> {
        self.index.lock().unwrap().scan_folders.clone()
    }

    /// Snapshot of the current index.
    pub fn libraries(&self) -> Vec<InstalledLibrary> {
        self.index.lock().unwrap().libraries.clone()
    }

    pub fn find_library(&self, identity: &LibraryIdentity) -> Option<InstalledLibrary> {
        self.index
            .lock()
            .unwrap()
            .libraries
            .iter()
            .find(|lib| lib.identity.same_library(identity))
            .cloned()
    }

    /// Block until no scan is running, up to `timeout`. Install probes call
    /// this so they never race a half-built index.
    pub fn wait_until_scans_settled(&self, timeout: Duration) -> EngineResult<()> {
        let deadline = Instant::now() + timeout;
        let mut index = self.index.lock().unwrap();
        while index.active_scans > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::timed_out(
                    "waiting for sample-library scan to finish",
                ));
            }
            let (guard, result) = self
                .scan_settled
                .wait_timeout(index, remaining)
                .unwrap();
            index = guard;
            if result.timed_out() && index.active_scans > 0 {
                return Err(EngineError::timed_out(
                    "waiting for sample-library scan to finish",
                ));
            }
        }
        Ok(())
    }

    /// Rescan every configured scan folder, replacing the index.
    pub fn rescan_all(&self) {
        let folders = self.scan_folders();
        self.begin_scan();
        let mut found = Vec::new();
        for folder in &folders {
            found.extend(scan_folder_for_libraries(folder));
        }
        let mut index = self.index.lock().unwrap();
        index.libraries = found;
        Self::finish_scan_locked(&mut index);
        drop(index);
        self.scan_settled.notify_all();
    }

    /// Rescan a single folder, replacing only entries that live under it.
    /// Called by the install worker right after a library lands on disk.
    pub fn rescan_folder(&self, folder: &Path) {
        self.begin_scan();
        let found = scan_folder_for_libraries(folder);
        let mut index = self.index.lock().unwrap();
        index.libraries.retain(|lib| !lib.path.starts_with(folder));
        index.libraries.extend(found);
        Self::finish_scan_locked(&mut index);
        drop(index);
        self.scan_settled.notify_all();

        logger::log_info(
            &format!("rescanned library folder {:?}", folder),
            Some("library_server"),
        );
    }

    fn begin_scan(&self) {
        self.index.lock().unwrap().active_scans += 1;
    }

    fn finish_scan_locked(index: &mut LibraryIndex) {
        index.active_scans = index.active_scans.saturating_sub(1);
    }
}

/// One pass over a folder's immediate children: a subdirectory with a
/// `floe-library.ini` is a modern library, a `.mdata` file is a legacy one.
fn scan_folder_for_libraries(folder: &Path) -> Vec<InstalledLibrary> {
    let mut found = Vec::new();
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(_) => return found,
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            let manifest_path = path.join(LIBRARY_MANIFEST_NAME);
            let Ok(text) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            match parse_library_manifest(&text) {
                Ok(identity) => found.push(InstalledLibrary { identity, path }),
                Err(e) => {
                    logger::log_warn(
                        &format!("skipping library with bad manifest {:?}: {}", path, e),
                        Some("library_server"),
                    );
                }
            }
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(LEGACY_LIBRARY_EXTENSION))
        {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            found.push(InstalledLibrary {
                identity: legacy_identity_from_filename(stem),
                path,
            });
        }
    }

    found
}

/// A scanned presets subdirectory and the checksums of the files in it.
#[derive(Debug, Clone)]
struct ScannedPresetDir {
    #[allow(dead_code)]
    path: PathBuf,
    file_checksums: HashSet<(u32, u64)>,
}

/// Snapshot of everything under the preset scan folders.
pub struct PresetServer {
    snapshot: Mutex<Vec<ScannedPresetDir>>,
}

impl PresetServer {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the snapshot from the given scan folders. Preset files are
    /// small; hashing them all is cheap relative to the install itself.
    pub fn rescan(&self, scan_folders: &[PathBuf]) {
        let mut dirs: Vec<ScannedPresetDir> = Vec::new();

        for folder in scan_folders {
            for entry in WalkDir::new(folder)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_dir() {
                    continue;
                }
                let mut file_checksums = HashSet::new();
                let children = match std::fs::read_dir(entry.path()) {
                    Ok(children) => children,
                    Err(_) => continue,
                };
                for child in children.filter_map(|e| e.ok()) {
                    if child.path().is_file() {
                        if let Ok(value) = checksum::crc32_of_file(&child.path()) {
                            file_checksums.insert((value.crc32, value.size));
                        }
                    }
                }
                if !file_checksums.is_empty() {
                    dirs.push(ScannedPresetDir {
                        path: entry.path().to_path_buf(),
                        file_checksums,
                    });
                }
            }
        }

        *self.snapshot.lock().unwrap() = dirs;
    }

    /// Does any scanned subdirectory contain (by checksum) every file of the
    /// incoming table? Deliberately under-reports so duplicate preset packs
    /// can coexist.
    pub fn contains_all_files(&self, incoming: &ChecksumTable) -> bool {
        if incoming.is_empty() {
            return false;
        }
        let snapshot = self.snapshot.lock().unwrap();
        snapshot.iter().any(|dir| {
            incoming
                .iter()
                .all(|(_, value)| dir.file_checksums.contains(&(value.crc32, value.size)))
        })
    }
}

impl Default for PresetServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumValue;

    #[test]
    fn test_parse_library_manifest() {
        let identity = parse_library_manifest(
            "; Floe library\nauthor = FrozenPlain\nname = Core\nminor_version = 3\nfuture = x\n",
        )
        .unwrap();
        assert_eq!(identity.author, "FrozenPlain");
        assert_eq!(identity.name, "Core");
        assert_eq!(identity.minor_version, 3);
        assert_eq!(identity.file_format, FileFormat::Modern);

        assert!(parse_library_manifest("author = A\n").is_err());
        assert!(parse_library_manifest("author=A\nname=B\nminor_version=notanumber\n").is_err());
    }

    #[test]
    fn test_legacy_identity_from_filename() {
        let id = legacy_identity_from_filename("FrozenPlain - Arctic Strings");
        assert_eq!(id.author, "FrozenPlain");
        assert_eq!(id.name, "Arctic Strings");
        assert_eq!(id.file_format, FileFormat::Legacy);

        let bare = legacy_identity_from_filename("Arctic Strings");
        assert_eq!(bare.author, "");
        assert_eq!(bare.name, "Arctic Strings");
    }

    #[test]
    fn test_scan_finds_modern_and_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let lib_dir = dir.path().join("Core");
        std::fs::create_dir(&lib_dir).unwrap();
        std::fs::write(
            lib_dir.join(LIBRARY_MANIFEST_NAME),
            "author=FrozenPlain\nname=Core\nminor_version=2\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("FrozenPlain - Old.mdata"), b"legacy").unwrap();
        // Folder without a manifest is not a library.
        std::fs::create_dir(dir.path().join("Random")).unwrap();

        let server = SampleLibraryServer::new(vec![dir.path().to_path_buf()]);
        server.rescan_all();

        let libraries = server.libraries();
        assert_eq!(libraries.len(), 2);
        assert!(server
            .find_library(&LibraryIdentity {
                author: "FrozenPlain".into(),
                name: "Core".into(),
                minor_version: 0,
                file_format: FileFormat::Modern,
            })
            .is_some());
    }

    #[test]
    fn test_rescan_folder_replaces_subset() {
        let dir = tempfile::tempdir().unwrap();
        let server = SampleLibraryServer::new(vec![dir.path().to_path_buf()]);
        server.rescan_all();
        assert!(server.libraries().is_empty());

        let lib_dir = dir.path().join("New");
        std::fs::create_dir(&lib_dir).unwrap();
        std::fs::write(
            lib_dir.join(LIBRARY_MANIFEST_NAME),
            "author=A\nname=New\nminor_version=1\n",
        )
        .unwrap();

        server.rescan_folder(dir.path());
        assert_eq!(server.libraries().len(), 1);

        // Rescanning again does not duplicate.
        server.rescan_folder(dir.path());
        assert_eq!(server.libraries().len(), 1);
    }

    #[test]
    fn test_wait_until_scans_settled_times_out() {
        let server = SampleLibraryServer::new(Vec::new());
        server.begin_scan();
        let result = server.wait_until_scans_settled(Duration::from_millis(50));
        assert!(matches!(result, Err(EngineError::TimedOut(_))));

        let mut index = server.index.lock().unwrap();
        SampleLibraryServer::finish_scan_locked(&mut index);
        drop(index);
        assert!(server
            .wait_until_scans_settled(Duration::from_millis(50))
            .is_ok());
    }

    #[test]
    fn test_preset_server_containment() {
        let dir = tempfile::tempdir().unwrap();
        let pack_dir = dir.path().join("Synthwave Pack");
        std::fs::create_dir(&pack_dir).unwrap();
        std::fs::write(pack_dir.join("a.floe-preset"), b"patch-a").unwrap();
        std::fs::write(pack_dir.join("b.floe-preset"), b"patch-b").unwrap();

        let server = PresetServer::new();
        server.rescan(&[dir.path().to_path_buf()]);

        let mut incoming = ChecksumTable::new();
        incoming.insert(
            "a.floe-preset",
            ChecksumValue {
                crc32: crc32fast::hash(b"patch-a"),
                size: 7,
            },
        );
        assert!(server.contains_all_files(&incoming));

        incoming.insert(
            "c.floe-preset",
            ChecksumValue {
                crc32: crc32fast::hash(b"patch-c"),
                size: 7,
            },
        );
        assert!(!server.contains_all_files(&incoming));

        assert!(!server.contains_all_files(&ChecksumTable::new()));
    }
}
