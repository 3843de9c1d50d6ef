//! Path helpers shared by the install transaction and the servers.
//!
//! Covers collision-free name generation, archive entry validation against
//! path traversal, and platform file-attribute cleanup after installs.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, EngineResult, FilesystemError};

/// Highest ` (N)` suffix tried before giving up.
const MAX_NAME_SUFFIX: u32 = 999;

/// Find a name under `folder` that does not exist yet.
///
/// Returns `name` itself when free. Otherwise appends ` (N)` before the
/// extension, starting just above any suffix already present in `name`
/// (so `"Core (2).zip"` continues at 3, not 1). Fails with
/// `FolderContainsTooManyFiles` once N would exceed 999.
pub fn find_next_nonexistent_filename(folder: &Path, name: &str) -> EngineResult<String> {
    if !folder.join(name).exists() {
        return Ok(name.to_string());
    }

    let (stem, extension) = split_name(name);
    let (base, existing_suffix) = split_counter_suffix(stem);

    let start = existing_suffix.map(|n| n + 1).unwrap_or(1);
    for n in start..=MAX_NAME_SUFFIX {
        let candidate = match extension {
            Some(ext) => format!("{} ({}).{}", base, n, ext),
            None => format!("{} ({})", base, n),
        };
        if !folder.join(&candidate).exists() {
            return Ok(candidate);
        }
    }

    Err(EngineError::Filesystem(
        FilesystemError::FolderContainsTooManyFiles(folder.to_path_buf()),
    ))
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// Split a trailing ` (N)` counter off a file stem, if present.
fn split_counter_suffix(stem: &str) -> (&str, Option<u32>) {
    let trimmed = stem.trim_end();
    if let Some(open) = trimmed.rfind(" (") {
        if let Some(inner) = trimmed[open + 2..].strip_suffix(')') {
            if let Ok(n) = inner.parse::<u32>() {
                return (&trimmed[..open], Some(n));
            }
        }
    }
    (stem, None)
}

/// Replace characters that are invalid in folder names on any supported OS.
pub fn sanitize_folder_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = sanitized.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lexically validate a relative archive entry path: no absolute paths, no
/// drive prefixes, no `..` components. Returns the normalized relative path.
pub fn validate_archive_entry_path(entry_name: &str) -> EngineResult<PathBuf> {
    let normalized = entry_name.replace('\\', "/");
    let path = Path::new(&normalized);

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(EngineError::bad_archive(format!(
                    "unsafe entry path: {}",
                    entry_name
                )))
            }
        }
    }

    Ok(path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect())
}

/// Canonicalize `candidate` and verify it is contained within `base`.
///
/// Returns the canonical form of `candidate` on success. Fails with
/// `PermissionDenied` when the resolved path escapes `base`.
pub fn validate_child_path(base: &Path, candidate: &Path) -> io::Result<PathBuf> {
    let canonical_base = base.canonicalize()?;
    let canonical_candidate = candidate.canonicalize()?;
    if !canonical_candidate.starts_with(&canonical_base) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "path traversal attempt detected",
        ));
    }
    Ok(canonical_candidate)
}

/// Clear the hidden attribute on a freshly installed destination.
/// Staging directories are dot-prefixed and some filesystems propagate the
/// hidden flag through the rename.
#[cfg(windows)]
pub fn clear_hidden_attribute(path: &Path) -> io::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::fileapi::{GetFileAttributesW, SetFileAttributesW, INVALID_FILE_ATTRIBUTES};
    use winapi::um::winnt::FILE_ATTRIBUTE_HIDDEN;

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let attributes = GetFileAttributesW(wide.as_ptr());
        if attributes == INVALID_FILE_ATTRIBUTES {
            return Err(io::Error::last_os_error());
        }
        if attributes & FILE_ATTRIBUTE_HIDDEN != 0
            && SetFileAttributesW(wide.as_ptr(), attributes & !FILE_ATTRIBUTE_HIDDEN) == 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(windows))]
pub fn clear_hidden_attribute(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove the read-only attribute so a later replacement install can delete
/// the file.
pub fn remove_readonly_attribute(path: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(path)?;
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_returned_unchanged_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let name = find_next_nonexistent_filename(dir.path(), "Core.zip").unwrap();
        assert_eq!(name, "Core.zip");
    }

    #[test]
    fn test_counter_appended_before_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Core.zip"), b"x").unwrap();
        let name = find_next_nonexistent_filename(dir.path(), "Core.zip").unwrap();
        assert_eq!(name, "Core (1).zip");
    }

    #[test]
    fn test_counter_continues_past_existing_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Core (2).zip"), b"x").unwrap();
        std::fs::write(dir.path().join("Core (3).zip"), b"x").unwrap();
        let name = find_next_nonexistent_filename(dir.path(), "Core (2).zip").unwrap();
        assert_eq!(name, "Core (4).zip");
    }

    #[test]
    fn test_folder_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Core")).unwrap();
        let name = find_next_nonexistent_filename(dir.path(), "Core").unwrap();
        assert_eq!(name, "Core (1)");
    }

    #[test]
    fn test_too_many_suffixes_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        // Claim the whole counter space just below the cap.
        std::fs::write(dir.path().join("a (999)"), b"x").unwrap();
        let result = find_next_nonexistent_filename(dir.path(), "a (999)");
        assert!(matches!(
            result,
            Err(EngineError::Filesystem(
                FilesystemError::FolderContainsTooManyFiles(_)
            ))
        ));
    }

    #[test]
    fn test_sanitize_folder_name() {
        assert_eq!(sanitize_folder_name("Core: Strings?"), "Core_ Strings_");
        assert_eq!(sanitize_folder_name("   "), "unnamed");
        assert_eq!(sanitize_folder_name("trailing."), "trailing");
    }

    #[test]
    fn test_entry_path_traversal_rejected() {
        assert!(validate_archive_entry_path("../evil").is_err());
        assert!(validate_archive_entry_path("/abs/path").is_err());
        assert!(validate_archive_entry_path("lib/../../evil").is_err());
        let ok = validate_archive_entry_path("Core\\samples\\a.flac").unwrap();
        assert_eq!(ok, PathBuf::from("Core/samples/a.flac"));
    }

    #[test]
    fn test_validate_child_path() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("inner");
        std::fs::create_dir(&inside).unwrap();
        assert!(validate_child_path(dir.path(), &inside).is_ok());

        let other = tempfile::tempdir().unwrap();
        assert!(validate_child_path(dir.path(), other.path()).is_err());
    }
}
