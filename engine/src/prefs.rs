//! User preferences store.
//!
//! The on-disk format is a flat UTF-8 `key=value` file: `;` starts a comment
//! line, whitespace around key and value is trimmed, blank or invalid lines
//! are skipped, and a repeated key forms a string list. Unknown keys survive
//! a load/save round-trip untouched.
//!
//! Only the main thread mutates the store. A single registered change
//! callback is invoked synchronously from the writer's thread; subsystems
//! that need the value on other threads stash it in an atomic.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::logger;

/// Typed preference value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    String(String),
    StringList(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefType {
    Bool,
    Int,
    String,
    StringList,
}

impl PrefValue {
    fn matches_type(&self, t: PrefType) -> bool {
        matches!(
            (self, t),
            (PrefValue::Bool(_), PrefType::Bool)
                | (PrefValue::Int(_), PrefType::Int)
                | (PrefValue::String(_), PrefType::String)
                | (PrefValue::StringList(_), PrefType::StringList)
        )
    }
}

/// Static description of one preference key.
pub struct Descriptor {
    pub key: &'static str,
    pub value_type: PrefType,
    /// Used when the key is absent from the file.
    pub default: fn() -> PrefValue,
    /// Used instead of `default` when the preferences file existed but could
    /// not be read; keys where the two differ fail safe (e.g. reporting
    /// stays off).
    pub policy_safe_default: Option<fn() -> PrefValue>,
    pub validator: Option<fn(&PrefValue) -> bool>,
    pub gui_label: &'static str,
    pub long_description: &'static str,
}

fn non_negative(value: &PrefValue) -> bool {
    matches!(value, PrefValue::Int(n) if *n >= 0)
}

/// Disable uploading of error reports. Events still land in the on-disk
/// fallback store so a manual bug report can attach them.
pub const ONLINE_REPORTING_DISABLED: Descriptor = Descriptor {
    key: "online_reporting_disabled",
    value_type: PrefType::Bool,
    default: || PrefValue::Bool(false),
    policy_safe_default: Some(|| PrefValue::Bool(true)),
    validator: None,
    gui_label: "Disable online error reporting",
    long_description: "When enabled, Floe never uploads error reports. \
                       Reports are kept locally for manual bug reports.",
};

pub const CHECK_FOR_UPDATES: Descriptor = Descriptor {
    key: "check_for_updates",
    value_type: PrefType::Bool,
    default: || PrefValue::Bool(true),
    policy_safe_default: None,
    validator: None,
    gui_label: "Check for updates",
    long_description: "Periodically ask the release server whether a newer \
                       Floe version is available.",
};

pub const LIBRARY_SCAN_FOLDERS: Descriptor = Descriptor {
    key: "library_scan_folder",
    value_type: PrefType::StringList,
    default: || PrefValue::StringList(Vec::new()),
    policy_safe_default: None,
    validator: None,
    gui_label: "Sample library folders",
    long_description: "Folders scanned for installed sample libraries.",
};

pub const PRESET_SCAN_FOLDERS: Descriptor = Descriptor {
    key: "preset_scan_folder",
    value_type: PrefType::StringList,
    default: || PrefValue::StringList(Vec::new()),
    policy_safe_default: None,
    validator: None,
    gui_label: "Preset folders",
    long_description: "Folders scanned for presets and preset packs.",
};

pub const AUTOSAVE_INTERVAL_SECONDS: Descriptor = Descriptor {
    key: "autosave_interval_seconds",
    value_type: PrefType::Int,
    default: || PrefValue::Int(10),
    policy_safe_default: None,
    validator: Some(non_negative),
    gui_label: "Autosave interval (seconds)",
    long_description: "Minimum time between autosave snapshots per instance.",
};

pub const MAX_AUTOSAVES_PER_INSTANCE: Descriptor = Descriptor {
    key: "max_autosaves_per_instance",
    value_type: PrefType::Int,
    default: || PrefValue::Int(16),
    policy_safe_default: None,
    validator: Some(non_negative),
    gui_label: "Autosaves kept per instance",
    long_description: "Oldest autosaves beyond this count are deleted.",
};

pub const AUTOSAVE_DELETE_AFTER_DAYS: Descriptor = Descriptor {
    key: "autosave_delete_after_days",
    value_type: PrefType::Int,
    default: || PrefValue::Int(7),
    policy_safe_default: None,
    validator: Some(non_negative),
    gui_label: "Delete autosaves after (days)",
    long_description: "Autosaves older than this many days are deleted.",
};

/// Parse ini-like text into ordered (key, value) pairs. Shared with the
/// component identifier for the in-archive metadata files.
pub(crate) fn parse_ini_text(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        pairs.push((key.to_string(), value.trim().to_string()));
    }
    pairs
}

/// Options applied to a single write.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Skip the change callback for this write; used by bulk first-run
    /// imports where one fan-out at the end is enough.
    pub suppress_callback: bool,
}

type ChangeCallback = Box<dyn Fn(&str, &PrefValue) + Send>;

pub struct Preferences {
    /// Raw text values for every key, known or not; repeated keys stack.
    entries: BTreeMap<String, Vec<String>>,
    /// Where `write_if_needed` persists to.
    path: PathBuf,
    dirty: bool,
    /// Set when the file existed but could not be read; reads then degrade
    /// to each descriptor's policy-safe default.
    read_failed: bool,
    on_change: Option<ChangeCallback>,
}

impl Preferences {
    /// Load from the first of `possible_paths` that exists. Returns the
    /// store and the index of the path used (`None` on first run). Writes
    /// always target the first path.
    pub fn init(possible_paths: &[PathBuf]) -> (Self, Option<usize>) {
        assert!(!possible_paths.is_empty(), "need at least one prefs path");
        let write_path = possible_paths[0].clone();

        for (index, path) in possible_paths.iter().enumerate() {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    let mut prefs = Self::empty(write_path.clone());
                    for (key, value) in parse_ini_text(&text) {
                        prefs.entries.entry(key).or_default().push(value);
                    }
                    logger::log_info(
                        &format!("loaded preferences from {:?}", path),
                        Some("prefs"),
                    );
                    return (prefs, Some(index));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    logger::log_error(
                        &format!("failed to read preferences {:?}: {}", path, e),
                        Some("prefs"),
                    );
                    let mut prefs = Self::empty(write_path.clone());
                    prefs.read_failed = true;
                    return (prefs, Some(index));
                }
            }
        }

        (Self::empty(write_path), None)
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            entries: BTreeMap::new(),
            path,
            dirty: false,
            read_failed: false,
            on_change: None,
        }
    }

    /// Register the single change callback. Invoked synchronously from the
    /// writing thread; it must fan out without blocking.
    pub fn set_on_change(&mut self, callback: impl Fn(&str, &PrefValue) + Send + 'static) {
        self.on_change = Some(Box::new(callback));
    }

    /// Typed read. Missing key yields the descriptor default; an unreadable
    /// preferences file yields the policy-safe default where one is defined.
    pub fn get(&self, descriptor: &Descriptor) -> PrefValue {
        if self.read_failed {
            if let Some(safe) = descriptor.policy_safe_default {
                return safe();
            }
        }

        let Some(raw) = self.entries.get(descriptor.key) else {
            return (descriptor.default)();
        };

        let parsed = match descriptor.value_type {
            PrefType::Bool => raw.last().and_then(|v| match v.as_str() {
                "true" => Some(PrefValue::Bool(true)),
                "false" => Some(PrefValue::Bool(false)),
                _ => None,
            }),
            PrefType::Int => raw.last().and_then(|v| v.parse().ok().map(PrefValue::Int)),
            PrefType::String => raw.last().map(|v| PrefValue::String(v.clone())),
            PrefType::StringList => Some(PrefValue::StringList(raw.clone())),
        };

        parsed.unwrap_or_else(|| (descriptor.default)())
    }

    pub fn get_bool(&self, descriptor: &Descriptor) -> bool {
        match self.get(descriptor) {
            PrefValue::Bool(b) => b,
            _ => false,
        }
    }

    pub fn get_int(&self, descriptor: &Descriptor) -> i64 {
        match self.get(descriptor) {
            PrefValue::Int(n) => n,
            _ => 0,
        }
    }

    pub fn get_list(&self, descriptor: &Descriptor) -> Vec<String> {
        match self.get(descriptor) {
            PrefValue::StringList(list) => list,
            _ => Vec::new(),
        }
    }

    /// Typed write. Validates against the descriptor; marks the store dirty
    /// and notifies the change callback unless suppressed.
    pub fn set(
        &mut self,
        descriptor: &Descriptor,
        value: PrefValue,
        options: SetOptions,
    ) -> EngineResult<()> {
        self.validate(descriptor, &value)?;

        let raw = match &value {
            PrefValue::Bool(b) => vec![b.to_string()],
            PrefValue::Int(n) => vec![n.to_string()],
            PrefValue::String(s) => vec![s.clone()],
            PrefValue::StringList(list) => list.clone(),
        };
        self.entries.insert(descriptor.key.to_string(), raw);
        self.dirty = true;

        if !options.suppress_callback {
            if let Some(callback) = &self.on_change {
                callback(descriptor.key, &value);
            }
        }
        Ok(())
    }

    /// Append one value to a list descriptor (no-op if already present).
    pub fn add_value(
        &mut self,
        descriptor: &Descriptor,
        value: impl Into<String>,
        options: SetOptions,
    ) -> EngineResult<()> {
        if descriptor.value_type != PrefType::StringList {
            return Err(EngineError::Api(format!(
                "{} is not a list preference",
                descriptor.key
            )));
        }
        let mut list = self.get_list(descriptor);
        let value = value.into();
        if !list.contains(&value) {
            list.push(value);
            self.set(descriptor, PrefValue::StringList(list), options)?;
        }
        Ok(())
    }

    /// Remove one value from a list descriptor.
    pub fn remove_value(
        &mut self,
        descriptor: &Descriptor,
        value: &str,
        options: SetOptions,
    ) -> EngineResult<()> {
        if descriptor.value_type != PrefType::StringList {
            return Err(EngineError::Api(format!(
                "{} is not a list preference",
                descriptor.key
            )));
        }
        let mut list = self.get_list(descriptor);
        let before = list.len();
        list.retain(|v| v != value);
        if list.len() != before {
            self.set(descriptor, PrefValue::StringList(list), options)?;
        }
        Ok(())
    }

    fn validate(&self, descriptor: &Descriptor, value: &PrefValue) -> EngineResult<()> {
        if !value.matches_type(descriptor.value_type) {
            return Err(EngineError::Api(format!(
                "wrong value type for preference {}",
                descriptor.key
            )));
        }
        if let Some(validator) = descriptor.validator {
            if !validator(value) {
                return Err(EngineError::Api(format!(
                    "invalid value for preference {}",
                    descriptor.key
                )));
            }
        }
        Ok(())
    }

    /// Persist to the canonical path if any write happened since the last
    /// flush. Returns whether a write occurred.
    pub fn write_if_needed(&mut self) -> EngineResult<bool> {
        if !self.dirty {
            return Ok(false);
        }

        let mut out = String::new();
        for (key, values) in &self.entries {
            for value in values {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Filesystem(e.into()))?;
        }
        std::fs::write(&self.path, out).map_err(|e| EngineError::Filesystem(e.into()))?;
        self.dirty = false;
        logger::log_debug(
            &format!("preferences written to {:?}", self.path),
            Some("prefs"),
            None,
        );
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_at(dir: &Path) -> (Preferences, Option<usize>) {
        Preferences::init(&[dir.join("floe.ini")])
    }

    #[test]
    fn test_first_run_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (prefs, used) = init_at(dir.path());
        assert_eq!(used, None);
        assert!(!prefs.get_bool(&ONLINE_REPORTING_DISABLED));
        assert_eq!(prefs.get_int(&AUTOSAVE_INTERVAL_SECONDS), 10);
    }

    #[test]
    fn test_round_trip_preserves_values_and_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floe.ini");
        std::fs::write(
            &path,
            "; user file\nfuture_key = something\nonline_reporting_disabled = true\n\
             library_scan_folder = /a\nlibrary_scan_folder = /b\n",
        )
        .unwrap();

        let (mut prefs, used) = Preferences::init(&[path.clone()]);
        assert_eq!(used, Some(0));
        assert!(prefs.get_bool(&ONLINE_REPORTING_DISABLED));
        assert_eq!(
            prefs.get_list(&LIBRARY_SCAN_FOLDERS),
            vec!["/a".to_string(), "/b".to_string()]
        );

        prefs
            .set(
                &AUTOSAVE_INTERVAL_SECONDS,
                PrefValue::Int(30),
                SetOptions::default(),
            )
            .unwrap();
        assert!(prefs.write_if_needed().unwrap());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("future_key=something"));
        assert!(written.contains("autosave_interval_seconds=30"));
        assert!(written.contains("library_scan_folder=/a"));
        assert!(written.contains("library_scan_folder=/b"));

        // Second flush with no writes is a no-op.
        assert!(!prefs.write_if_needed().unwrap());
    }

    #[test]
    fn test_list_add_remove_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut prefs, _) = init_at(dir.path());

        for folder in ["/one", "/two", "/three"] {
            prefs
                .add_value(&PRESET_SCAN_FOLDERS, folder, SetOptions::default())
                .unwrap();
        }
        // Duplicate add is a no-op.
        prefs
            .add_value(&PRESET_SCAN_FOLDERS, "/two", SetOptions::default())
            .unwrap();
        assert_eq!(
            prefs.get_list(&PRESET_SCAN_FOLDERS),
            vec!["/one", "/two", "/three"]
        );

        prefs
            .remove_value(&PRESET_SCAN_FOLDERS, "/two", SetOptions::default())
            .unwrap();
        assert_eq!(prefs.get_list(&PRESET_SCAN_FOLDERS), vec!["/one", "/three"]);
    }

    #[test]
    fn test_validation_rejects_bad_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut prefs, _) = init_at(dir.path());

        assert!(prefs
            .set(
                &AUTOSAVE_INTERVAL_SECONDS,
                PrefValue::Int(-5),
                SetOptions::default()
            )
            .is_err());
        assert!(prefs
            .set(
                &ONLINE_REPORTING_DISABLED,
                PrefValue::Int(1),
                SetOptions::default()
            )
            .is_err());
    }

    #[test]
    fn test_change_callback_and_suppression() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let (mut prefs, _) = init_at(dir.path());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_seen = calls.clone();
        prefs.set_on_change(move |key, _| {
            assert_eq!(key, "check_for_updates");
            calls_seen.fetch_add(1, Ordering::SeqCst);
        });

        prefs
            .set(
                &CHECK_FOR_UPDATES,
                PrefValue::Bool(false),
                SetOptions::default(),
            )
            .unwrap();
        prefs
            .set(
                &CHECK_FOR_UPDATES,
                PrefValue::Bool(true),
                SetOptions {
                    suppress_callback: true,
                },
            )
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let pairs = parse_ini_text("; comment\n\nnot a pair\n = novalue\nkey = v ; ok\n");
        assert_eq!(pairs, vec![("key".to_string(), "v ; ok".to_string())]);
    }
}
