//! Autosave scheduler.
//!
//! Each plugin instance owns a one-slot snapshot mailbox: the main thread
//! posts state blobs, and posting again before a save overwrites the
//! pending one. A background cadence (the orchestrator's polling thread)
//! writes due snapshots under the autosave directory and then applies
//! retention: drop files past the age limit, and keep at most N per
//! instance prefix.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::core::seams::{Clock, RngHandle};
use crate::error::{EngineError, EngineResult, FilesystemError};
use crate::logger;

pub const AUTOSAVE_EXTENSION: &str = "floe-autosave";

/// Length of the random instance-id prefix in autosave filenames.
const INSTANCE_ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    PendingSave,
    Saved,
}

/// Per-instance autosave state. Created through
/// [`AutosaveScheduler::register_instance`].
pub struct InstanceAutosave {
    instance_id: String,
    slot: Mutex<(SlotState, Option<Vec<u8>>)>,
    last_save: Mutex<Option<DateTime<Utc>>>,
}

impl InstanceAutosave {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Main thread: post the latest state blob. Overwrites a pending
    /// unsaved snapshot.
    pub fn post_snapshot(&self, state_blob: Vec<u8>) {
        let mut slot = self.slot.lock().unwrap();
        *slot = (SlotState::PendingSave, Some(state_blob));
    }

    fn take_due_snapshot(
        &self,
        now: DateTime<Utc>,
        interval_seconds: i64,
    ) -> Option<Vec<u8>> {
        let mut slot = self.slot.lock().unwrap();
        if slot.0 != SlotState::PendingSave {
            return None;
        }
        let interval_elapsed = match *self.last_save.lock().unwrap() {
            Some(last) => (now - last).num_seconds() >= interval_seconds,
            None => true,
        };
        if !interval_elapsed {
            return None;
        }
        let blob = slot.1.take();
        slot.0 = SlotState::Saved;
        blob
    }

    fn mark_saved(&self, now: DateTime<Utc>) {
        *self.last_save.lock().unwrap() = Some(now);
    }
}

/// Thresholds mirrored from preferences; refreshed by the change callback
/// and read with relaxed ordering from the background cadence.
pub struct AutosaveThresholds {
    pub interval_seconds: AtomicI64,
    pub max_per_instance: AtomicUsize,
    pub delete_after_days: AtomicI64,
}

impl AutosaveThresholds {
    fn new() -> Self {
        Self {
            interval_seconds: AtomicI64::new(10),
            max_per_instance: AtomicUsize::new(16),
            delete_after_days: AtomicI64::new(7),
        }
    }
}

pub struct AutosaveScheduler {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    pub thresholds: AutosaveThresholds,
    instances: Mutex<Vec<Arc<InstanceAutosave>>>,
}

impl AutosaveScheduler {
    pub fn new(dir: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir,
            clock,
            thresholds: AutosaveThresholds::new(),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn register_instance(&self, rng: &RngHandle) -> Arc<InstanceAutosave> {
        let instance = Arc::new(InstanceAutosave {
            instance_id: rng.base32_string(INSTANCE_ID_LEN),
            slot: Mutex::new((SlotState::Idle, None)),
            last_save: Mutex::new(None),
        });
        self.instances.lock().unwrap().push(instance.clone());
        instance
    }

    pub fn unregister_instance(&self, instance: &Arc<InstanceAutosave>) {
        self.instances
            .lock()
            .unwrap()
            .retain(|other| !Arc::ptr_eq(other, instance));
    }

    /// Background cadence: write every due snapshot, then run retention.
    pub fn run_pending(&self) {
        let now = self.clock.now_utc();
        let interval = self.thresholds.interval_seconds.load(Ordering::Relaxed);
        let instances = self.instances.lock().unwrap().clone();

        let mut wrote_any = false;
        for instance in &instances {
            let Some(blob) = instance.take_due_snapshot(now, interval) else {
                continue;
            };
            match self.write_snapshot(instance, now, &blob) {
                Ok(path) => {
                    instance.mark_saved(now);
                    wrote_any = true;
                    logger::log_debug(
                        &format!("autosaved instance {} to {:?}", instance.instance_id, path),
                        Some("autosave"),
                        None,
                    );
                }
                Err(e) => {
                    logger::log_error(
                        &format!("autosave failed for {}: {}", instance.instance_id, e),
                        Some("autosave"),
                    );
                }
            }
        }

        if wrote_any {
            self.apply_retention(now, &instances);
        }
    }

    fn write_snapshot(
        &self,
        instance: &InstanceAutosave,
        now: DateTime<Utc>,
        blob: &[u8],
    ) -> EngineResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
        let filename = format!(
            "{}_{}.{}",
            instance.instance_id,
            now.format("%Y%m%d-%H%M%S%3f"),
            AUTOSAVE_EXTENSION
        );
        let path = self.dir.join(filename);
        std::fs::write(&path, blob)
            .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
        Ok(path)
    }

    /// Delete snapshots past the age limit, and the oldest beyond the
    /// per-instance cap. Filenames sort chronologically per prefix.
    fn apply_retention(&self, now: DateTime<Utc>, instances: &[Arc<InstanceAutosave>]) {
        let delete_after_days = self.thresholds.delete_after_days.load(Ordering::Relaxed);
        let max_per_instance = self.thresholds.max_per_instance.load(Ordering::Relaxed);

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let mut autosaves: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == AUTOSAVE_EXTENSION)
            })
            .collect();
        autosaves.sort();

        // Age-based deletion applies to every autosave, not just live
        // instances; dead instances' files age out here too.
        for path in &autosaves {
            if let Some(age_days) = file_age_days(path, now) {
                if age_days > delete_after_days {
                    remove_logged(path);
                }
            }
        }

        // Per-instance cap.
        for instance in instances {
            let prefix = format!("{}_", instance.instance_id);
            let of_instance: Vec<&PathBuf> = autosaves
                .iter()
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
                })
                .collect();
            if of_instance.len() > max_per_instance {
                let excess = of_instance.len() - max_per_instance;
                for path in of_instance.into_iter().take(excess) {
                    remove_logged(path);
                }
            }
        }
    }
}

fn file_age_days(path: &Path, now: DateTime<Utc>) -> Option<i64> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some((now - modified).num_days())
}

fn remove_logged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        logger::log_warn(
            &format!("could not delete old autosave {:?}: {}", path, e),
            Some("autosave"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::seams::FixedClock;
    use chrono::{Duration, TimeZone};

    fn scheduler_at(dir: &Path) -> (AutosaveScheduler, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
        ));
        let scheduler = AutosaveScheduler::new(dir.to_path_buf(), clock.clone());
        (scheduler, clock)
    }

    fn autosave_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn test_post_then_save_once() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _clock) = scheduler_at(dir.path());
        let rng = RngHandle::seeded(3);
        let instance = scheduler.register_instance(&rng);

        instance.post_snapshot(b"state-v1".to_vec());
        scheduler.run_pending();
        assert_eq!(autosave_files(dir.path()).len(), 1);

        // Saved state without a new post does not save again.
        scheduler.run_pending();
        assert_eq!(autosave_files(dir.path()).len(), 1);
    }

    #[test]
    fn test_posting_overwrites_pending_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _clock) = scheduler_at(dir.path());
        let rng = RngHandle::seeded(3);
        let instance = scheduler.register_instance(&rng);

        instance.post_snapshot(b"first".to_vec());
        instance.post_snapshot(b"second".to_vec());
        scheduler.run_pending();

        let files = autosave_files(dir.path());
        assert_eq!(files.len(), 1);
        let content = std::fs::read(dir.path().join(&files[0])).unwrap();
        assert_eq!(content, b"second");
    }

    #[test]
    fn test_interval_gates_saves() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, clock) = scheduler_at(dir.path());
        let rng = RngHandle::seeded(3);
        let instance = scheduler.register_instance(&rng);

        instance.post_snapshot(b"v1".to_vec());
        scheduler.run_pending();
        assert_eq!(autosave_files(dir.path()).len(), 1);

        // Second post inside the interval stays pending.
        instance.post_snapshot(b"v2".to_vec());
        scheduler.run_pending();
        assert_eq!(autosave_files(dir.path()).len(), 1);

        // After the interval it is written.
        clock.advance(Duration::seconds(11));
        scheduler.run_pending();
        assert_eq!(autosave_files(dir.path()).len(), 2);
    }

    #[test]
    fn test_retention_caps_files_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, clock) = scheduler_at(dir.path());
        scheduler.thresholds.max_per_instance.store(3, Ordering::Relaxed);
        scheduler
            .thresholds
            .interval_seconds
            .store(0, Ordering::Relaxed);
        let rng = RngHandle::seeded(3);
        let instance = scheduler.register_instance(&rng);

        for i in 0..6u8 {
            instance.post_snapshot(vec![i]);
            scheduler.run_pending();
            clock.advance(Duration::seconds(1));
        }

        let files = autosave_files(dir.path());
        assert_eq!(files.len(), 3);
        // The newest three survive (names sort chronologically).
        let newest = std::fs::read(dir.path().join(files.last().unwrap())).unwrap();
        assert_eq!(newest, vec![5]);
    }

    #[test]
    fn test_two_instances_keep_separate_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, clock) = scheduler_at(dir.path());
        scheduler
            .thresholds
            .interval_seconds
            .store(0, Ordering::Relaxed);
        let rng = RngHandle::seeded(4);
        let a = scheduler.register_instance(&rng);
        let b = scheduler.register_instance(&rng);
        assert_ne!(a.instance_id(), b.instance_id());

        a.post_snapshot(b"a1".to_vec());
        b.post_snapshot(b"b1".to_vec());
        scheduler.run_pending();
        clock.advance(Duration::seconds(1));
        a.post_snapshot(b"a2".to_vec());
        scheduler.run_pending();

        let files = autosave_files(dir.path());
        assert_eq!(files.len(), 3);
        assert_eq!(
            files
                .iter()
                .filter(|f| f.starts_with(&format!("{}_", a.instance_id())))
                .count(),
            2
        );
    }
}
