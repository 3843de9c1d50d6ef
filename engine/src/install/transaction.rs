//! Install transaction: staged extraction and atomic placement.
//!
//! Each component is extracted into a staging directory on the same
//! filesystem as the target (a standard temp directory is the fallback,
//! accepting non-atomic rename semantics), verified against the archive's
//! checksums, then renamed into place. The contract: either the destination
//! holds the complete new component and any old install has been removed or
//! trashed, or the destination is unchanged. Partial subtrees must never be
//! visible under the final path.

use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::archive::ArchiveReader;
use crate::checksum::{self, ChecksumDiff, CompareOptions, CHECKSUMS_FILE_NAME};
use crate::core::paths::{
    clear_hidden_attribute, find_next_nonexistent_filename, remove_readonly_attribute,
    sanitize_folder_name, validate_child_path,
};
use crate::core::seams::RngHandle;
use crate::error::{EngineError, EngineResult, FilesystemError};
use crate::install::components::Component;
use crate::libraries::FileFormat;
use crate::logger;

/// Minimum required free space (1 GB) as a safety buffer.
const MIN_FREE_SPACE_BYTES: u64 = 1024 * 1024 * 1024;

/// The final rename is retried to absorb names appearing between probing
/// and renaming.
const RENAME_RETRY_LIMIT: usize = 50;

/// Length of the random suffix in a `(old-<suffix>)` side-rename.
const SIDE_RENAME_SUFFIX_LEN: usize = 8;

pub struct TransactionContext<'a> {
    pub rng: &'a RngHandle,
    /// Written into the generated checksums manifest header.
    pub generator_tag: &'a str,
}

/// Staging directory that cleans itself up on every exit path.
struct StagingDir {
    path: PathBuf,
    /// Keeps a fallback temp dir alive for the transaction's duration.
    _fallback: Option<tempfile::TempDir>,
}

impl StagingDir {
    /// Prefer a dot-prefixed sibling on the destination filesystem so the
    /// final rename is atomic; fall back to the standard temp location.
    fn create(dest_folder: &Path) -> EngineResult<Self> {
        let sibling = dest_folder.join(format!(".floe-staging-{}", Uuid::new_v4()));
        match fs::create_dir_all(&sibling) {
            Ok(()) => Ok(Self {
                path: sibling,
                _fallback: None,
            }),
            Err(e) => {
                logger::log_warn(
                    &format!(
                        "cannot stage next to destination ({}), using temp dir",
                        e
                    ),
                    Some("transaction"),
                );
                let fallback = tempfile::tempdir()
                    .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
                Ok(Self {
                    path: fallback.path().to_path_buf(),
                    _fallback: Some(fallback),
                })
            }
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                logger::log_error(
                    &format!("failed to clean staging directory {:?}: {}", self.path, e),
                    Some("transaction"),
                );
            }
        }
    }
}

/// Restores a side-renamed folder unless the install completed.
struct SideRenameGuard {
    original: PathBuf,
    renamed: PathBuf,
    armed: bool,
}

impl SideRenameGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SideRenameGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::rename(&self.renamed, &self.original) {
                logger::log_error(
                    &format!(
                        "CRITICAL: failed to restore {:?} from {:?}: {}",
                        self.original, self.renamed, e
                    ),
                    Some("transaction"),
                );
            }
        }
    }
}

/// Install one component into `dest_folder`. Returns the final path.
///
/// With `overwrite_allowed`, an existing destination is side-renamed out of
/// the way and trashed after the new content lands; without it, a
/// non-colliding ` (N)` name is chosen instead.
pub fn install_component<R: Read + Seek>(
    reader: &mut ArchiveReader<R>,
    component: &Component,
    dest_folder: &Path,
    overwrite_allowed: bool,
    ctx: &TransactionContext<'_>,
) -> EngineResult<PathBuf> {
    fs::create_dir_all(dest_folder).map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
    check_disk_space(dest_folder)?;

    let staging = StagingDir::create(dest_folder)?;
    let install_name = sanitize_folder_name(&component.install_name());
    let single_file = component.file_format() == FileFormat::Legacy;

    // Extract into staging. Failures here leave the destination untouched.
    let staged_content = if single_file {
        let staged = staging.path.join(&install_name);
        let (index, _) = component
            .file_entries
            .first()
            .ok_or_else(|| EngineError::bad_archive("legacy component has no file entry"))?;
        reader.extract_to_file(*index, &staged)?;
        staged
    } else {
        let staged = staging.path.join(&install_name);
        fs::create_dir_all(&staged)
            .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
        for (index, relative) in &component.file_entries {
            reader.extract_to_file(*index, &staged.join(relative))?;
        }

        // Verify what actually landed against the archive's CRCs before the
        // component can become visible.
        let actual = checksum::checksum_table_for_dir(&staged)?;
        if checksum::compare(&component.checksums, &actual, CompareOptions::default())
            != ChecksumDiff::Same
        {
            return Err(EngineError::corrupted(format!(
                "extraction of '{}' does not match archive checksums",
                install_name
            )));
        }

        let manifest = checksum::write_checksum_file(&actual, ctx.generator_tag);
        fs::write(staged.join(CHECKSUMS_FILE_NAME), manifest)
            .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
        staged
    };

    // The staged tree must still be inside the staging directory; anything
    // else means entry validation was bypassed somewhere.
    validate_child_path(&staging.path, &staged_content)
        .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;

    let final_path = place_staged_content(
        &staged_content,
        dest_folder,
        &install_name,
        overwrite_allowed,
        ctx,
    )?;

    let _ = clear_hidden_attribute(&final_path);
    let _ = remove_readonly_attribute(&final_path);

    logger::log_info(
        &format!("installed component to {:?}", final_path),
        Some("transaction"),
    );
    Ok(final_path)
}

/// Resolve the destination name and move staging into place, retrying name
/// generation when the filesystem changes underneath us.
fn place_staged_content(
    staged: &Path,
    dest_folder: &Path,
    install_name: &str,
    overwrite_allowed: bool,
    ctx: &TransactionContext<'_>,
) -> EngineResult<PathBuf> {
    let mut name = install_name.to_string();

    for attempt in 0..RENAME_RETRY_LIMIT {
        let dest = dest_folder.join(&name);

        if !overwrite_allowed {
            if dest.exists() {
                name = find_next_nonexistent_filename(dest_folder, &name)?;
                continue;
            }
            match move_path(staged, &dest) {
                Ok(()) => return Ok(dest),
                Err(e) if is_collision(&e) => continue,
                Err(e) => return Err(EngineError::Filesystem(FilesystemError::Io(e))),
            }
        }

        // Overwrite path.
        if dest.is_dir() {
            if dir_is_empty(&dest)? {
                // Nothing to preserve; replace directly.
                let _ = fs::remove_dir(&dest);
            } else {
                let aside = dest_folder.join(format!(
                    "{} (old-{})",
                    name,
                    ctx.rng.base32_string(SIDE_RENAME_SUFFIX_LEN)
                ));
                match fs::rename(&dest, &aside) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Deleted between probe and rename; treat as fresh.
                        continue;
                    }
                    Err(e) => return Err(EngineError::Filesystem(FilesystemError::Io(e))),
                }

                let mut guard = SideRenameGuard {
                    original: dest.clone(),
                    renamed: aside.clone(),
                    armed: true,
                };
                match move_path(staged, &dest) {
                    Ok(()) => {
                        guard.disarm();
                        trash_or_delete(&aside)?;
                        return Ok(dest);
                    }
                    Err(e) => {
                        // Guard restores the side-renamed folder.
                        return Err(EngineError::Filesystem(FilesystemError::Io(e)));
                    }
                }
            }
        } else if dest.is_file() {
            // Folder-over-file collision: the file goes to the trash and the
            // component keeps the archive's own name.
            trash_or_delete(&dest)?;
        }

        match move_path(staged, &dest) {
            Ok(()) => return Ok(dest),
            Err(e) if is_collision(&e) => {
                crate::log_debug!(
                    &format!("rename collision on attempt {}: {:?}", attempt + 1, dest),
                    "transaction"
                );
                continue;
            }
            Err(e) => return Err(EngineError::Filesystem(FilesystemError::Io(e))),
        }
    }

    Err(EngineError::Filesystem(
        FilesystemError::FolderContainsTooManyFiles(dest_folder.to_path_buf()),
    ))
}

fn is_collision(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::DirectoryNotEmpty
    )
}

fn dir_is_empty(dir: &Path) -> EngineResult<bool> {
    let mut entries =
        fs::read_dir(dir).map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
    Ok(entries.next().is_none())
}

/// Move `src` to `dst`: atomic rename on the same filesystem, copy+delete
/// fallback across filesystems (staging fell back to the temp dir).
fn move_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_collision(&e) => Err(e),
        Err(rename_err) => {
            logger::log_info(
                &format!(
                    "rename failed ({}), falling back to copy+delete",
                    rename_err
                ),
                Some("transaction"),
            );
            if src.is_dir() {
                copy_dir_recursive(src, dst)?;
                fs::remove_dir_all(src)?;
            } else {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(src, dst)?;
                fs::remove_file(src)?;
            }
            Ok(())
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Move a replaced install to the platform trash; fall back to permanent
/// deletion where no trash exists (headless Linux, some network mounts).
pub fn trash_or_delete(path: &Path) -> EngineResult<()> {
    match trash::delete(path) {
        Ok(()) => Ok(()),
        Err(trash_err) => {
            logger::log_warn(
                &format!(
                    "trash unavailable for {:?} ({}), deleting permanently",
                    path, trash_err
                ),
                Some("transaction"),
            );
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            result.map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))
        }
    }
}

fn check_disk_space(path: &Path) -> EngineResult<()> {
    match fs2::available_space(path) {
        Ok(available) => {
            if available < MIN_FREE_SPACE_BYTES {
                return Err(EngineError::Filesystem(FilesystemError::InsufficientSpace {
                    available,
                    required: MIN_FREE_SPACE_BYTES,
                }));
            }
            Ok(())
        }
        Err(e) => {
            // A failed statvfs should not block installs; log and proceed.
            logger::log_warn(
                &format!("cannot determine free space for {:?}: {}", path, e),
                Some("transaction"),
            );
            Ok(())
        }
    }
}
