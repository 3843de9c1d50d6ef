//! Component identification.
//!
//! An install archive groups its entries by top-level folder; each group is
//! a candidate component. A folder with a `floe-library.ini` at its root is
//! a library, a folder with a `floe-preset-pack.ini` (or the older
//! `preset-pack.ini` spelling) is a preset pack, and a loose top-level
//! `.mdata` file is a legacy single-file library. Anything else is skipped
//! with a warning so stray folders (`__MACOSX`, documentation) don't fail
//! the whole archive.

use std::collections::BTreeMap;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use crate::archive::ArchiveReader;
use crate::checksum::{ChecksumTable, ChecksumValue};
use crate::error::{EngineError, EngineResult};
use crate::libraries::{
    legacy_identity_from_filename, parse_library_manifest, FileFormat, LibraryIdentity,
    LEGACY_LIBRARY_EXTENSION, LIBRARY_MANIFEST_NAME,
};
use crate::logger;
use crate::persistent_store::key_hash;
use crate::prefs::parse_ini_text;

/// Hard cap on candidate components; a higher count is treated as a
/// malformed archive rather than a gigantic install.
pub const MAX_COMPONENTS_PER_ARCHIVE: usize = 4000;

/// Accepted metadata file names at the root of a preset-pack folder.
pub const PRESET_PACK_METADATA_NAMES: &[&str] = &["floe-preset-pack.ini", "preset-pack.ini"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetPackMetadata {
    pub subtitle: String,
    pub minor_version: u16,
    /// Hash of the pack's stable string id.
    pub id: u64,
}

/// Parse `floe-preset-pack.ini` text. Unknown keys are ignored.
pub fn parse_preset_pack_metadata(text: &str) -> EngineResult<PresetPackMetadata> {
    let mut subtitle = String::new();
    let mut minor_version = 0u16;
    let mut id = None;

    for (key, value) in parse_ini_text(text) {
        match key.as_str() {
            "subtitle" => subtitle = value,
            "minor_version" => {
                minor_version = value.parse::<u16>().map_err(|_| {
                    EngineError::corrupted(format!("bad preset-pack minor_version '{}'", value))
                })?
            }
            "id" => id = Some(key_hash(&value)),
            _ => {}
        }
    }

    Ok(PresetPackMetadata {
        subtitle,
        minor_version,
        id: id.ok_or_else(|| EngineError::corrupted("preset-pack metadata missing id"))?,
    })
}

#[derive(Debug, Clone)]
pub enum ComponentKind {
    Library(LibraryIdentity),
    PresetPack(PresetPackMetadata),
}

/// One installable unit inside an archive. Immutable once identified.
#[derive(Debug, Clone)]
pub struct Component {
    pub kind: ComponentKind,
    /// Top-level folder inside the archive, or the single file for a legacy
    /// library.
    pub path_in_archive: PathBuf,
    /// Relative path → checksum for every file in the component, taken from
    /// the archive's own per-entry CRCs.
    pub checksums: ChecksumTable,
    /// Whole-file checksum for legacy single-file libraries.
    pub legacy_checksum: Option<u32>,
    /// Archive entry index and component-relative path for each file.
    pub file_entries: Vec<(usize, PathBuf)>,
}

impl Component {
    pub fn file_format(&self) -> FileFormat {
        match &self.kind {
            ComponentKind::Library(identity) => identity.file_format,
            ComponentKind::PresetPack(_) => FileFormat::Modern,
        }
    }

    /// Name the component installs under by default.
    pub fn install_name(&self) -> String {
        self.path_in_archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "component".to_string())
    }

    pub fn is_library(&self) -> bool {
        matches!(self.kind, ComponentKind::Library(_))
    }
}

struct CandidateGroup {
    /// (entry index, path relative to the group root, crc32, size)
    files: Vec<(usize, PathBuf, u32, u64)>,
}

/// Enumerate the components of an archive.
pub fn identify_components<R: Read + Seek>(
    reader: &mut ArchiveReader<R>,
) -> EngineResult<Vec<Component>> {
    let mut groups: BTreeMap<String, CandidateGroup> = BTreeMap::new();
    let mut loose_files: Vec<(usize, PathBuf, u32, u64)> = Vec::new();

    for index in 0..reader.num_entries() {
        let info = reader.stat(index)?;
        if info.is_dir {
            continue;
        }
        let crc32 = reader.entry_crc32(index)?;

        let mut components = info.path.components();
        let Some(top) = components.next() else {
            continue;
        };
        let top = top.as_os_str().to_string_lossy().into_owned();
        let rest: PathBuf = components.collect();

        if rest.as_os_str().is_empty() {
            loose_files.push((index, info.path.clone(), crc32, info.size));
        } else {
            groups
                .entry(top)
                .or_insert_with(|| CandidateGroup { files: Vec::new() })
                .files
                .push((index, rest, crc32, info.size));
        }

        if groups.len() + loose_files.len() > MAX_COMPONENTS_PER_ARCHIVE {
            return Err(EngineError::bad_archive(format!(
                "archive has more than {} components",
                MAX_COMPONENTS_PER_ARCHIVE
            )));
        }
    }

    let mut result = Vec::new();

    for (top, group) in groups {
        match identify_group(reader, &top, group)? {
            Some(component) => result.push(component),
            None => {
                logger::log_warn(
                    &format!("skipping unrecognized archive folder '{}'", top),
                    Some("components"),
                );
            }
        }
    }

    for (index, path, crc32, size) in loose_files {
        let is_legacy = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(LEGACY_LIBRARY_EXTENSION));
        if !is_legacy {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let mut checksums = ChecksumTable::new();
        checksums.insert(
            path.to_string_lossy().replace('\\', "/"),
            ChecksumValue { crc32, size },
        );
        result.push(Component {
            kind: ComponentKind::Library(legacy_identity_from_filename(stem)),
            path_in_archive: path.clone(),
            checksums,
            legacy_checksum: Some(crc32),
            file_entries: vec![(index, PathBuf::from(path.file_name().unwrap_or_default()))],
        });
    }

    if result.len() > MAX_COMPONENTS_PER_ARCHIVE {
        return Err(EngineError::bad_archive(format!(
            "archive has more than {} components",
            MAX_COMPONENTS_PER_ARCHIVE
        )));
    }

    Ok(result)
}

fn identify_group<R: Read + Seek>(
    reader: &mut ArchiveReader<R>,
    top: &str,
    group: CandidateGroup,
) -> EngineResult<Option<Component>> {
    let find_entry = |name_matches: &dyn Fn(&Path) -> bool| {
        group
            .files
            .iter()
            .find(|(_, rest, _, _)| name_matches(rest))
            .map(|(index, _, _, _)| *index)
    };

    let library_manifest =
        find_entry(&|rest: &Path| rest == Path::new(LIBRARY_MANIFEST_NAME));
    let preset_metadata = find_entry(&|rest: &Path| {
        PRESET_PACK_METADATA_NAMES
            .iter()
            .any(|name| rest == Path::new(name))
    });

    let kind = if let Some(index) = library_manifest {
        let text = extract_small_text(reader, index)?;
        ComponentKind::Library(parse_library_manifest(&text)?)
    } else if let Some(index) = preset_metadata {
        let text = extract_small_text(reader, index)?;
        ComponentKind::PresetPack(parse_preset_pack_metadata(&text)?)
    } else {
        return Ok(None);
    };

    let mut checksums = ChecksumTable::new();
    let mut file_entries = Vec::new();
    for (index, rest, crc32, size) in group.files {
        checksums.insert(
            rest.to_string_lossy().replace('\\', "/"),
            ChecksumValue { crc32, size },
        );
        file_entries.push((index, rest));
    }

    Ok(Some(Component {
        kind,
        path_in_archive: PathBuf::from(top),
        checksums,
        legacy_checksum: None,
        file_entries,
    }))
}

fn extract_small_text<R: Read + Seek>(
    reader: &mut ArchiveReader<R>,
    index: usize,
) -> EngineResult<String> {
    let mut bytes = Vec::new();
    reader.extract(index, &mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| EngineError::bad_archive("metadata file is not valid UTF-8"))
}
