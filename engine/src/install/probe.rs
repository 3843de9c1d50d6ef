//! Existing-install probe.
//!
//! Decides, for each component of an archive, how it relates to what is
//! already on disk. The verdict drives the job runner: unchanged installs
//! are skipped, modified installs suspend the job for a user decision.

use std::time::Duration;

use crate::checksum::{self, ChecksumDiff, CompareOptions};
use crate::error::{EngineError, EngineResult};
use crate::install::components::{Component, ComponentKind};
use crate::libraries::{FileFormat, InstalledLibrary, PresetServer, SampleLibraryServer};
use crate::logger;

/// How long a probe waits for the library server's scan to settle before
/// giving up with `TimedOut`.
pub const SCAN_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDiff {
    Equal,
    InstalledOlder,
    InstalledNewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    Unmodified,
    /// Everything we shipped is intact, but the user added files.
    UnmodifiedPlusExtras,
    /// The stored manifest is missing or corrupt, so we cannot tell.
    MaybeModified,
    Modified,
}

/// Probe outcome. Version and modification only exist for installed
/// components; the type makes reading them for a missing install impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallVerdict {
    NotInstalled,
    Installed {
        version: VersionDiff,
        modification: Modification,
    },
}

/// What the job runner must do about a component, derived from its verdict.
/// Exactly one action holds for every verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAction {
    NoActionRequired,
    UserInputRequired,
    RequiresInstall,
}

impl InstallVerdict {
    pub fn installed(&self) -> bool {
        matches!(self, InstallVerdict::Installed { .. })
    }

    pub fn required_action(&self) -> RequiredAction {
        match self {
            InstallVerdict::NotInstalled => RequiredAction::RequiresInstall,
            InstallVerdict::Installed {
                version,
                modification,
            } => {
                let intact = matches!(
                    modification,
                    Modification::Unmodified | Modification::UnmodifiedPlusExtras
                );
                let current = matches!(
                    version,
                    VersionDiff::Equal | VersionDiff::InstalledNewer
                );
                if intact && current {
                    RequiredAction::NoActionRequired
                } else if !matches!(modification, Modification::Unmodified) {
                    RequiredAction::UserInputRequired
                } else {
                    // Unmodified but older than the archive: safe to replace.
                    RequiredAction::RequiresInstall
                }
            }
        }
    }
}

/// Probe one component against the servers. Blocks until the library scan
/// settles (bounded by [`SCAN_WAIT_TIMEOUT`]).
pub fn probe_component(
    component: &Component,
    library_server: &SampleLibraryServer,
    preset_server: &PresetServer,
) -> EngineResult<InstallVerdict> {
    match &component.kind {
        ComponentKind::Library(incoming) => {
            library_server.wait_until_scans_settled(SCAN_WAIT_TIMEOUT)?;
            let Some(existing) = library_server.find_library(incoming) else {
                return Ok(InstallVerdict::NotInstalled);
            };
            probe_library(component, incoming.minor_version, &existing)
        }
        ComponentKind::PresetPack(_) => {
            // Preset files are idempotent by content hash; the probe only
            // recognizes an exact duplicate and otherwise under-reports so
            // multiple copies can coexist.
            if preset_server.contains_all_files(&component.checksums) {
                Ok(InstallVerdict::Installed {
                    version: VersionDiff::Equal,
                    modification: Modification::Unmodified,
                })
            } else {
                Ok(InstallVerdict::NotInstalled)
            }
        }
    }
}

fn probe_library(
    component: &Component,
    incoming_minor: u16,
    existing: &InstalledLibrary,
) -> EngineResult<InstallVerdict> {
    let incoming_format = component.file_format();

    match (existing.identity.file_format, incoming_format) {
        // A legacy install always loses to a modern archive.
        (FileFormat::Legacy, FileFormat::Modern) => Ok(InstallVerdict::Installed {
            version: VersionDiff::InstalledOlder,
            modification: Modification::Unmodified,
        }),

        // Legacy vs legacy: versioning was never tracked, so whole-file
        // checksums are all there is to compare.
        (FileFormat::Legacy, FileFormat::Legacy) => {
            let on_disk = checksum::crc32_of_file(&existing.path)?;
            let version = match component.legacy_checksum {
                Some(crc) if crc == on_disk.crc32 => VersionDiff::Equal,
                _ => VersionDiff::InstalledOlder,
            };
            Ok(InstallVerdict::Installed {
                version,
                modification: Modification::Unmodified,
            })
        }

        // A modern install never downgrades to legacy; the incoming side is
        // the older one, and the folder is left alone unless the user asks.
        (FileFormat::Modern, FileFormat::Legacy) => Ok(InstallVerdict::Installed {
            version: VersionDiff::InstalledNewer,
            modification: Modification::Unmodified,
        }),

        (FileFormat::Modern, FileFormat::Modern) => {
            let actual = checksum::checksum_table_for_dir(&existing.path)?;

            // Fast path: the folder holds exactly what the archive would
            // install (user extras permitted anywhere).
            let same_as_incoming = checksum::compare(
                &component.checksums,
                &actual,
                CompareOptions {
                    ignore_auto_generated_files: true,
                    extras_allowed_in_subtree: Some(""),
                },
            );
            if same_as_incoming == ChecksumDiff::Same {
                return Ok(InstallVerdict::Installed {
                    version: VersionDiff::Equal,
                    modification: Modification::Unmodified,
                });
            }

            let version = match existing.identity.minor_version.cmp(&incoming_minor) {
                std::cmp::Ordering::Equal => VersionDiff::Equal,
                std::cmp::Ordering::Less => VersionDiff::InstalledOlder,
                std::cmp::Ordering::Greater => VersionDiff::InstalledNewer,
            };

            // Modification is judged against the manifest the installer
            // wrote, not against the archive: user edits show up as a
            // mismatch between manifest and folder. Extras are reported, not
            // forgiven, so they can surface as UnmodifiedPlusExtras.
            let modification = match checksum::read_checksum_file_in_dir(&existing.path) {
                Ok(manifest) => match checksum::compare(
                    &manifest,
                    &actual,
                    CompareOptions {
                        ignore_auto_generated_files: true,
                        extras_allowed_in_subtree: None,
                    },
                ) {
                    ChecksumDiff::Same => Modification::Unmodified,
                    ChecksumDiff::SameButHasExtraFiles => Modification::UnmodifiedPlusExtras,
                    ChecksumDiff::Differ => Modification::Modified,
                },
                Err(e) => {
                    logger::log_warn(
                        &format!(
                            "cannot read stored manifest for {:?}: {}",
                            existing.path, e
                        ),
                        Some("probe"),
                    );
                    Modification::MaybeModified
                }
            };

            Ok(InstallVerdict::Installed {
                version,
                modification,
            })
        }
    }
}
