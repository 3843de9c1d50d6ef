//! Centralized app data directory management
//!
//! All persistent data (logs, preferences, autosaves, pending report events)
//! uses paths from this module so every plugin instance, the standalone host,
//! and the uninstaller agree on storage locations.

use std::path::PathBuf;

/// Folder name used under the per-OS application data roots.
const APP_FOLDER: &str = "Floe";

/// Legacy sibling application whose folders are imported on first run.
const LEGACY_APP_FOLDER: &str = "FrozenPlain/Mirage";

/// Get the app data directory for persistent storage.
///
/// Platform-specific:
/// - Windows: %LOCALAPPDATA%\Floe
/// - macOS: ~/Library/Application Support/Floe
/// - Linux: $XDG_DATA_HOME/Floe (or ~/.local/share/Floe)
pub fn app_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            return home
                .join("Library")
                .join("Application Support")
                .join(APP_FOLDER);
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        if let Some(data) = dirs::data_local_dir() {
            return data.join(APP_FOLDER);
        }
    }

    // Fallback to current directory
    PathBuf::from(".").join(APP_FOLDER)
}

/// Candidate preferences file locations, most preferred first.
/// The first path that exists on disk is loaded; writes always go to the
/// first entry.
pub fn possible_preferences_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(config) = dirs::config_dir() {
        paths.push(config.join(APP_FOLDER).join("floe.ini"));
    }
    paths.push(app_data_dir().join("floe.ini"));
    paths
}

pub fn logs_dir() -> PathBuf {
    app_data_dir().join("logs")
}

pub fn log_file_path() -> PathBuf {
    logs_dir().join("floe-engine.log")
}

pub fn autosave_dir() -> PathBuf {
    app_data_dir().join("autosaves")
}

/// Per-process append-only file holding report events that could not be
/// handed to the reporting worker (queue full, worker absent, crash path).
pub fn fallback_store_path() -> PathBuf {
    app_data_dir()
        .join("reports")
        .join(format!("pending-events-{}.bin", std::process::id()))
}

pub fn persistent_store_path() -> PathBuf {
    app_data_dir().join("floe.state")
}

pub fn update_cache_path() -> PathBuf {
    app_data_dir().join("update_check_cache.txt")
}

/// Default sample-library install folder, used when the scan-folder list in
/// preferences is empty.
pub fn default_libraries_dir() -> PathBuf {
    app_data_dir().join("Libraries")
}

/// Default presets install folder.
pub fn default_presets_dir() -> PathBuf {
    app_data_dir().join("Presets")
}

/// Library folders of the legacy sibling application, checked on first run.
/// Only folders that exist on disk get imported into the scan-folder list.
pub fn legacy_library_dirs() -> Vec<PathBuf> {
    legacy_roots()
        .into_iter()
        .map(|root| root.join("Libraries"))
        .collect()
}

/// Preset folders of the legacy sibling application.
pub fn legacy_preset_dirs() -> Vec<PathBuf> {
    legacy_roots()
        .into_iter()
        .map(|root| root.join("Presets"))
        .collect()
}

fn legacy_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            roots.push(
                home.join("Library")
                    .join("Application Support")
                    .join(LEGACY_APP_FOLDER),
            );
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        if let Some(data) = dirs::data_local_dir() {
            roots.push(data.join(LEGACY_APP_FOLDER));
        }
        if let Some(docs) = dirs::document_dir() {
            roots.push(docs.join(LEGACY_APP_FOLDER));
        }
    }

    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_data_dir_not_empty() {
        let dir = app_data_dir();
        assert!(!dir.as_os_str().is_empty());
    }

    #[test]
    fn test_paths_contain_app_folder() {
        assert!(app_data_dir().to_string_lossy().contains(APP_FOLDER));
        assert!(autosave_dir().starts_with(app_data_dir()));
        assert!(log_file_path().starts_with(logs_dir()));
    }

    #[test]
    fn test_preferences_paths_ordered_and_nonempty() {
        let paths = possible_preferences_paths();
        assert!(!paths.is_empty());
        assert!(paths
            .iter()
            .all(|p| p.file_name().unwrap() == "floe.ini"));
    }

    #[test]
    fn test_fallback_store_is_per_process() {
        let path = fallback_store_path();
        assert!(path
            .to_string_lossy()
            .contains(&std::process::id().to_string()));
    }
}
