//! Shared engine systems orchestrator.
//!
//! One of these exists per process and is shared by every plugin instance.
//! It owns the preferences store, the persistent KV store, the shared
//! worker pool, the sample-library and preset servers, the install job
//! pool, the autosave scheduler, the update checker, and the registry of
//! live instances. A ~1 Hz wakable polling thread drives the periodic work:
//! per-instance poll callbacks, autosave cadence, the update-checker tick,
//! and persistent-store reconciliation.

pub mod autosave;
pub mod update_checker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;

use crate::core::app_dirs;
use crate::core::seams::{Clock, RngHandle, SystemClock};
use crate::error::EngineResult;
use crate::install::{InstallContext, InstallJob, InstallJobPool};
use crate::libraries::{PresetServer, SampleLibraryServer};
use crate::logger;
use crate::persistent_store::PersistentStore;
use crate::prefs::{self, PrefValue, Preferences, SetOptions};
use crate::reporting::{self, ReportingConfig};

use autosave::{AutosaveScheduler, InstanceAutosave};
use update_checker::UpdateChecker;

/// Polling cadence of the orchestrator thread.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_RELEASE_API_URL: &str = "https://releases.floe.audio/api/latest";

/// Everything the orchestrator needs to know about its environment.
/// Defaults point at the real app directories; tests inject temp roots,
/// a fixed clock, and a seeded RNG.
pub struct EngineConfig {
    pub preferences_paths: Vec<PathBuf>,
    pub autosave_dir: PathBuf,
    pub persistent_store_path: PathBuf,
    pub update_cache_path: PathBuf,
    pub log_file_path: PathBuf,
    pub default_libraries_dir: PathBuf,
    pub default_presets_dir: PathBuf,
    pub release_api_url: String,
    pub reporting: ReportingConfig,
    pub clock: Arc<dyn Clock>,
    pub rng: Arc<RngHandle>,
    /// Off in tests: the trap is process-global and irreversible.
    pub install_crash_trap: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            preferences_paths: app_dirs::possible_preferences_paths(),
            autosave_dir: app_dirs::autosave_dir(),
            persistent_store_path: app_dirs::persistent_store_path(),
            update_cache_path: app_dirs::update_cache_path(),
            log_file_path: app_dirs::log_file_path(),
            default_libraries_dir: app_dirs::default_libraries_dir(),
            default_presets_dir: app_dirs::default_presets_dir(),
            release_api_url: std::env::var("FLOE_RELEASE_API_URL")
                .unwrap_or_else(|_| DEFAULT_RELEASE_API_URL.to_string()),
            reporting: ReportingConfig::default(),
            clock: Arc::new(SystemClock),
            rng: Arc::new(RngHandle::from_entropy()),
            install_crash_trap: true,
        }
    }
}

/// A live plugin instance's registration with the orchestrator.
pub struct PluginInstance {
    pub id: u64,
    pub autosave: Arc<InstanceAutosave>,
    poll_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl PluginInstance {
    /// Register the callback the polling thread invokes every tick. Must
    /// be internally thread-safe: it runs on the polling thread.
    pub fn set_poll_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.poll_callback.lock().unwrap() = Some(Box::new(callback));
    }
}

pub struct Orchestrator {
    prefs: Mutex<Preferences>,
    persistent: Mutex<PersistentStore>,
    library_server: Arc<SampleLibraryServer>,
    preset_server: Arc<PresetServer>,
    install_pool: InstallJobPool,
    autosave: Arc<AutosaveScheduler>,
    update_checker: UpdateChecker,
    instances: DashMap<u64, Arc<PluginInstance>>,
    next_instance_id: AtomicU64,
    rng: Arc<RngHandle>,
    /// (shutdown flag, wakeup) for the polling thread.
    poll_signal: Arc<(Mutex<bool>, Condvar)>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build the shared systems and start the polling thread. Loads
    /// preferences from the first existing candidate path; a first run
    /// imports the legacy sibling application's folders into the scan
    /// lists.
    pub fn start(config: EngineConfig) -> Arc<Orchestrator> {
        logger::init(&config.log_file_path);
        reporting::init(config.reporting.clone());
        if config.install_crash_trap {
            reporting::crash::init(&config.reporting.fallback_path);
        }

        let (mut preferences, used_path) = Preferences::init(&config.preferences_paths);
        if used_path.is_none() {
            first_run_import(&mut preferences);
        }

        reporting::set_online_reporting_disabled(
            preferences.get_bool(&prefs::ONLINE_REPORTING_DISABLED),
        );

        let library_folders = scan_folders_or_default(
            &preferences,
            &prefs::LIBRARY_SCAN_FOLDERS,
            &config.default_libraries_dir,
        );
        let preset_folders = scan_folders_or_default(
            &preferences,
            &prefs::PRESET_SCAN_FOLDERS,
            &config.default_presets_dir,
        );

        let library_server = Arc::new(SampleLibraryServer::new(library_folders.clone()));
        let preset_server = Arc::new(PresetServer::new());

        let thread_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .thread_name(|i| format!("floe-worker-{}", i))
                .build()
                .expect("shared worker pool"),
        );

        let autosave = Arc::new(AutosaveScheduler::new(
            config.autosave_dir.clone(),
            config.clock.clone(),
        ));
        refresh_autosave_thresholds(&preferences, &autosave);

        // Single synchronous change callback fanning out to subsystems.
        {
            let library_server = library_server.clone();
            let autosave = autosave.clone();
            let default_libraries_dir = config.default_libraries_dir.clone();
            preferences.set_on_change(move |key, value| {
                route_preference_change(
                    key,
                    value,
                    &library_server,
                    &autosave,
                    &default_libraries_dir,
                );
            });
        }

        let install_context = Arc::new(InstallContext {
            library_server: library_server.clone(),
            preset_server: preset_server.clone(),
            rng: config.rng.clone(),
            generator_tag: format!("Floe {}", env!("CARGO_PKG_VERSION")),
            libraries_dir: library_folders[0].clone(),
            presets_dir: preset_folders[0].clone(),
        });

        let orchestrator = Arc::new(Orchestrator {
            prefs: Mutex::new(preferences),
            persistent: Mutex::new(PersistentStore::open(
                config.persistent_store_path.clone(),
                config.clock.clone(),
            )),
            library_server: library_server.clone(),
            preset_server: preset_server.clone(),
            install_pool: InstallJobPool::new(thread_pool.clone(), install_context),
            autosave,
            update_checker: UpdateChecker::new(
                config.update_cache_path.clone(),
                config.release_api_url.clone(),
            ),
            instances: DashMap::new(),
            next_instance_id: AtomicU64::new(1),
            rng: config.rng.clone(),
            poll_signal: Arc::new((Mutex::new(false), Condvar::new())),
            poll_thread: Mutex::new(None),
        });

        // Initial scans happen on the pool so startup never blocks on IO.
        {
            let library_server = library_server.clone();
            thread_pool.spawn(move || library_server.rescan_all());
            let preset_server = preset_server.clone();
            thread_pool.spawn(move || preset_server.rescan(&preset_folders));
        }

        // Polling thread.
        {
            let weak = Arc::downgrade(&orchestrator);
            let signal = orchestrator.poll_signal.clone();
            let handle = std::thread::Builder::new()
                .name("floe-poll".to_string())
                .spawn(move || {
                    loop {
                        let (lock, condvar) = &*signal;
                        let shutdown = {
                            let guard = lock.lock().unwrap();
                            let (guard, _) = condvar.wait_timeout(guard, POLL_INTERVAL).unwrap();
                            *guard
                        };
                        if shutdown {
                            break;
                        }
                        let Some(orchestrator) = weak.upgrade() else {
                            break;
                        };
                        orchestrator.poll_tick();
                    }
                })
                .expect("polling thread");
            *orchestrator.poll_thread.lock().unwrap() = Some(handle);
        }

        logger::log_info("orchestrator started", Some("orchestrator"));
        orchestrator
    }

    /// One pass of the periodic work. Public so hosts without a background
    /// thread budget (and tests) can drive it manually.
    pub fn poll_tick(&self) {
        for entry in self.instances.iter() {
            let callback = entry.value().poll_callback.lock().unwrap();
            if let Some(callback) = callback.as_ref() {
                callback();
            }
        }

        self.autosave.run_pending();

        if self
            .prefs
            .lock()
            .unwrap()
            .get_bool(&prefs::CHECK_FOR_UPDATES)
        {
            if let Err(e) = self.update_checker.check_for_updates(false) {
                logger::log_debug(
                    &format!("update check failed: {}", e),
                    Some("orchestrator"),
                    None,
                );
            }
        }

        {
            let mut persistent = self.persistent.lock().unwrap();
            persistent.reconcile_file_mtime();
            if let Err(e) = persistent.flush_if_needed() {
                logger::log_error(
                    &format!("persistent store flush failed: {}", e),
                    Some("orchestrator"),
                );
            }
        }

        if let Err(e) = self.prefs.lock().unwrap().write_if_needed() {
            logger::log_error(
                &format!("preferences flush failed: {}", e),
                Some("orchestrator"),
            );
        }
    }

    /// Wake the polling thread ahead of its next tick.
    pub fn wake(&self) {
        let (_, condvar) = &*self.poll_signal;
        condvar.notify_one();
    }

    pub fn register_instance(&self) -> Arc<PluginInstance> {
        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let instance = Arc::new(PluginInstance {
            id,
            autosave: self.autosave.register_instance(&self.rng),
            poll_callback: Mutex::new(None),
        });
        self.instances.insert(id, instance.clone());
        logger::log_info(
            &format!("instance {} registered", id),
            Some("orchestrator"),
        );
        instance
    }

    pub fn unregister_instance(&self, instance: &Arc<PluginInstance>) {
        self.instances.remove(&instance.id);
        self.autosave.unregister_instance(&instance.autosave);
        logger::log_info(
            &format!("instance {} unregistered", instance.id),
            Some("orchestrator"),
        );
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Submit an install archive; see [`crate::install`] for the job
    /// lifecycle.
    pub fn submit_install(&self, archive_path: PathBuf) -> EngineResult<Arc<InstallJob>> {
        self.install_pool.submit(archive_path)
    }

    pub fn install_pool(&self) -> &InstallJobPool {
        &self.install_pool
    }

    pub fn library_server(&self) -> &Arc<SampleLibraryServer> {
        &self.library_server
    }

    pub fn preset_server(&self) -> &Arc<PresetServer> {
        &self.preset_server
    }

    /// Main-thread access to preferences. Writes fan out through the
    /// change callback synchronously on the calling thread.
    pub fn preferences(&self) -> MutexGuard<'_, Preferences> {
        self.prefs.lock().unwrap()
    }

    pub fn persistent_store(&self) -> MutexGuard<'_, PersistentStore> {
        self.persistent.lock().unwrap()
    }

    pub fn check_for_updates_now(&self) -> EngineResult<Option<update_checker::UpdateInfo>> {
        self.update_checker.check_for_updates(true)
    }

    /// Stop the polling thread and release the reporting system. Called
    /// once when the last plugin instance goes away.
    pub fn shutdown(&self) {
        {
            let (lock, condvar) = &*self.poll_signal;
            *lock.lock().unwrap() = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.poll_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        let _ = self.prefs.lock().unwrap().write_if_needed();
        let _ = self.persistent.lock().unwrap().flush_if_needed();

        reporting::deinit();
        logger::log_info("orchestrator stopped", Some("orchestrator"));
    }
}

fn scan_folders_or_default(
    preferences: &Preferences,
    descriptor: &prefs::Descriptor,
    default_dir: &std::path::Path,
) -> Vec<PathBuf> {
    let folders: Vec<PathBuf> = preferences
        .get_list(descriptor)
        .into_iter()
        .map(PathBuf::from)
        .collect();
    if folders.is_empty() {
        vec![default_dir.to_path_buf()]
    } else {
        folders
    }
}

/// First run: adopt the legacy sibling application's folders where they
/// exist on disk. The change callback is suppressed; subsystems read the
/// final lists during construction right after this.
fn first_run_import(preferences: &mut Preferences) {
    let suppress = SetOptions {
        suppress_callback: true,
    };
    for folder in app_dirs::legacy_library_dirs() {
        if folder.is_dir() {
            let _ = preferences.add_value(
                &prefs::LIBRARY_SCAN_FOLDERS,
                folder.to_string_lossy().into_owned(),
                suppress,
            );
        }
    }
    for folder in app_dirs::legacy_preset_dirs() {
        if folder.is_dir() {
            let _ = preferences.add_value(
                &prefs::PRESET_SCAN_FOLDERS,
                folder.to_string_lossy().into_owned(),
                suppress,
            );
        }
    }
    logger::log_info("first run: imported legacy folders", Some("orchestrator"));
}

/// The single change-callback body: route a preference write to the
/// subsystems that consume it. Runs synchronously on the writing thread,
/// so everything here must be quick and non-blocking.
fn route_preference_change(
    key: &str,
    value: &PrefValue,
    library_server: &Arc<SampleLibraryServer>,
    autosave: &Arc<AutosaveScheduler>,
    default_libraries_dir: &std::path::Path,
) {
    match key {
        k if k == prefs::ONLINE_REPORTING_DISABLED.key => {
            if let PrefValue::Bool(disabled) = value {
                reporting::set_online_reporting_disabled(*disabled);
            }
        }
        k if k == prefs::LIBRARY_SCAN_FOLDERS.key => {
            if let PrefValue::StringList(folders) = value {
                let folders: Vec<PathBuf> = if folders.is_empty() {
                    vec![default_libraries_dir.to_path_buf()]
                } else {
                    folders.iter().map(PathBuf::from).collect()
                };
                library_server.set_scan_folders(folders);
            }
        }
        k if k == prefs::AUTOSAVE_INTERVAL_SECONDS.key
            || k == prefs::MAX_AUTOSAVES_PER_INSTANCE.key
            || k == prefs::AUTOSAVE_DELETE_AFTER_DAYS.key =>
        {
            if let PrefValue::Int(n) = value {
                let n = *n;
                if k == prefs::AUTOSAVE_INTERVAL_SECONDS.key {
                    autosave.thresholds.interval_seconds.store(n, Ordering::Relaxed);
                } else if k == prefs::MAX_AUTOSAVES_PER_INSTANCE.key {
                    autosave
                        .thresholds
                        .max_per_instance
                        .store(n.max(0) as usize, Ordering::Relaxed);
                } else {
                    autosave
                        .thresholds
                        .delete_after_days
                        .store(n, Ordering::Relaxed);
                }
            }
        }
        _ => {}
    }
}

fn refresh_autosave_thresholds(preferences: &Preferences, autosave: &AutosaveScheduler) {
    autosave.thresholds.interval_seconds.store(
        preferences.get_int(&prefs::AUTOSAVE_INTERVAL_SECONDS),
        Ordering::Relaxed,
    );
    autosave.thresholds.max_per_instance.store(
        preferences.get_int(&prefs::MAX_AUTOSAVES_PER_INSTANCE).max(0) as usize,
        Ordering::Relaxed,
    );
    autosave.thresholds.delete_after_days.store(
        preferences.get_int(&prefs::AUTOSAVE_DELETE_AFTER_DAYS),
        Ordering::Relaxed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::seams::FixedClock;
    use chrono::TimeZone;
    use chrono::Utc;

    fn test_config(root: &std::path::Path) -> EngineConfig {
        // A prefs file that keeps the polling thread off the network.
        let prefs_path = root.join("floe.ini");
        std::fs::write(&prefs_path, "check_for_updates=false\n").unwrap();

        EngineConfig {
            preferences_paths: vec![prefs_path],
            autosave_dir: root.join("autosaves"),
            persistent_store_path: root.join("floe.state"),
            update_cache_path: root.join("update_check_cache.txt"),
            log_file_path: root.join("logs/floe-engine.log"),
            default_libraries_dir: root.join("Libraries"),
            default_presets_dir: root.join("Presets"),
            release_api_url: "http://127.0.0.1:1/unreachable".to_string(),
            reporting: ReportingConfig {
                endpoint: "http://127.0.0.1:1/unreachable".to_string(),
                fallback_path: root.join("reports/pending.bin"),
            },
            clock: Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap(),
            )),
            rng: Arc::new(RngHandle::seeded(17)),
            install_crash_trap: false,
        }
    }

    #[test]
    fn test_lifecycle_register_autosave_shutdown() {
        let _guard = reporting::TEST_SYSTEM_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let root = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::start(test_config(root.path()));

        let instance = orchestrator.register_instance();
        assert_eq!(orchestrator.instance_count(), 1);

        use std::sync::atomic::AtomicUsize;
        let polled = Arc::new(AtomicUsize::new(0));
        let polled_seen = polled.clone();
        instance.set_poll_callback(move || {
            polled_seen.fetch_add(1, Ordering::SeqCst);
        });

        instance.autosave.post_snapshot(b"plugin-state".to_vec());
        orchestrator.poll_tick();

        // The background polling thread may have ticked too; at least one
        // callback invocation is guaranteed by the manual tick.
        assert!(polled.load(Ordering::SeqCst) >= 1);
        let autosaves: Vec<_> = std::fs::read_dir(root.path().join("autosaves"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(autosaves.len(), 1);
        assert!(autosaves[0]
            .file_name()
            .to_string_lossy()
            .starts_with(instance.autosave.instance_id()));

        orchestrator.unregister_instance(&instance);
        assert_eq!(orchestrator.instance_count(), 0);

        orchestrator.shutdown();
    }

    #[test]
    fn test_preference_change_fans_out_to_autosave() {
        let _guard = reporting::TEST_SYSTEM_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let root = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::start(test_config(root.path()));

        orchestrator
            .preferences()
            .set(
                &prefs::AUTOSAVE_INTERVAL_SECONDS,
                PrefValue::Int(120),
                SetOptions::default(),
            )
            .unwrap();
        assert_eq!(
            orchestrator
                .autosave
                .thresholds
                .interval_seconds
                .load(Ordering::Relaxed),
            120
        );

        // The dirty flag flushes on the next tick.
        orchestrator.poll_tick();
        let written = std::fs::read_to_string(root.path().join("floe.ini")).unwrap();
        assert!(written.contains("autosave_interval_seconds=120"));

        orchestrator.shutdown();
    }

    #[test]
    fn test_persistent_store_survives_ticks() {
        let _guard = reporting::TEST_SYSTEM_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let root = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::start(test_config(root.path()));

        orchestrator.persistent_store().set(
            "install_count",
            crate::persistent_store::StoreValue::Int(7),
        );
        orchestrator.poll_tick();
        assert!(root.path().join("floe.state").exists());

        orchestrator.shutdown();
    }
}
