//! Error and feedback reporting pipeline.
//!
//! A single background worker consumes a bounded queue of events and POSTs
//! them in batches to the reporting endpoint. The contract at the callers'
//! side: at-most-once delivery per idempotency id within this process,
//! best-effort otherwise, never blocks beyond an unlocked append, never
//! panics outward. When the queue is full or the worker absent, events are
//! appended to the on-disk fallback store in the same format the worker
//! uploads; a later successful upload drains that file.
//!
//! Failures of the reporter itself are logged locally and never re-reported
//! through the reporter.

pub mod crash;
pub mod fallback;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::app_dirs;
use crate::error::Severity;
use crate::logger;

pub const DEFAULT_REPORT_ENDPOINT: &str = "https://reports.floe.audio/api/events";

/// Bounded queue depth between callers and the worker.
const QUEUE_CAPACITY: usize = 256;

/// Most-recent idempotency ids remembered for de-duplication. Once full,
/// new ids are admitted without being recorded; occasional duplicates from
/// a long session are acceptable.
const DEDUP_RING_CAPACITY: usize = 48;

/// Events uploaded per POST.
const BATCH_MAX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Error,
    Crash,
    Feedback,
}

/// One reportable event; also the fallback store's record payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEvent {
    pub kind: EventKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Suppresses duplicates across the process lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_id: Option<u64>,
    /// Unix seconds at enqueue time.
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ReportingConfig {
    pub endpoint: String,
    pub fallback_path: PathBuf,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_REPORT_ENDPOINT.to_string(),
            fallback_path: app_dirs::fallback_store_path(),
        }
    }
}

struct System {
    sender: SyncSender<ReportEvent>,
    worker: Option<JoinHandle<()>>,
    config: ReportingConfig,
    refcount: usize,
}

/// Worker-present flag. Enqueue checks it with an acquire load before
/// touching the system mutex; when clear (pre-init, post-deinit) the
/// file-fallback path is taken without any locking beyond the file append.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Honoured with relaxed ordering; readers tolerate staleness.
static DISABLED: AtomicBool = AtomicBool::new(false);

static SYSTEM: OnceLock<Mutex<Option<System>>> = OnceLock::new();
static DEDUP_RING: OnceLock<Mutex<Vec<u64>>> = OnceLock::new();

/// Serializes tests that init/deinit the process-global system, so their
/// refcount observations don't interleave.
#[cfg(test)]
pub(crate) static TEST_SYSTEM_LOCK: Mutex<()> = Mutex::new(());

fn system_cell() -> &'static Mutex<Option<System>> {
    SYSTEM.get_or_init(|| Mutex::new(None))
}

/// Counted init: any module may start the system; only the first call
/// spawns the worker. Pair every call with [`deinit`].
pub fn init(config: ReportingConfig) {
    let mut guard = system_cell().lock().unwrap();
    if let Some(system) = guard.as_mut() {
        system.refcount += 1;
        return;
    }

    let (sender, receiver) = sync_channel::<ReportEvent>(QUEUE_CAPACITY);
    let worker_config = config.clone();
    let worker = std::thread::Builder::new()
        .name("floe-reporting".to_string())
        .spawn(move || worker_loop(receiver, worker_config))
        .ok();

    if worker.is_none() {
        logger::log_error("failed to spawn reporting worker", Some("reporting"));
    }

    *guard = Some(System {
        sender,
        worker,
        config,
        refcount: 1,
    });
    ACTIVE.store(true, Ordering::Release);
}

/// Counted deinit; the last call closes the queue and joins the worker.
pub fn deinit() {
    let mut guard = system_cell().lock().unwrap();
    let Some(system) = guard.as_mut() else {
        return;
    };
    system.refcount -= 1;
    if system.refcount > 0 {
        return;
    }

    ACTIVE.store(false, Ordering::Release);
    let system = guard.take().unwrap();
    drop(guard);

    // Dropping the sender disconnects the channel; the worker drains what
    // is left and exits.
    drop(system.sender);
    if let Some(worker) = system.worker {
        let _ = worker.join();
    }
}

/// Route the `online_reporting_disabled` preference to the worker. Relaxed:
/// an upload racing the change may still go out, which is acceptable.
pub fn set_online_reporting_disabled(disabled: bool) {
    DISABLED.store(disabled, Ordering::Relaxed);
}

/// True when the event is a duplicate and must be dropped.
fn is_duplicate(id: u64) -> bool {
    let ring = DEDUP_RING.get_or_init(|| Mutex::new(Vec::with_capacity(DEDUP_RING_CAPACITY)));
    let mut ring = ring.lock().unwrap();
    if ring.contains(&id) {
        return true;
    }
    if ring.len() < DEDUP_RING_CAPACITY {
        ring.push(id);
    }
    false
}

/// Enqueue an event. Fast, lock-light, infallible from the caller's view:
/// on any queue problem the event goes to the fallback store instead.
pub fn report_event(event: ReportEvent) {
    if let Some(id) = event.idempotency_id {
        if is_duplicate(id) {
            return;
        }
    }

    if ACTIVE.load(Ordering::Acquire) {
        let sender = {
            let guard = system_cell().lock().unwrap();
            guard.as_ref().map(|s| (s.sender.clone(), s.config.fallback_path.clone()))
        };
        if let Some((sender, fallback_path)) = sender {
            match sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                    write_to_fallback(&fallback_path, &event);
                    return;
                }
            }
        }
    }

    write_to_fallback(&app_dirs::fallback_store_path(), &event);
}

/// Convenience wrapper for plain error messages.
pub fn report_message(severity: Severity, message: String, idempotency_id: Option<u64>) {
    report_event(ReportEvent {
        kind: EventKind::Error,
        severity,
        message,
        stacktrace: None,
        tags: BTreeMap::new(),
        idempotency_id,
        timestamp: chrono::Utc::now().timestamp(),
    });
}

/// User-submitted feedback; always carries whatever pending crash events
/// exist, attached server-side by shared install id.
pub fn report_feedback(message: String, tags: BTreeMap<String, String>) {
    report_event(ReportEvent {
        kind: EventKind::Feedback,
        severity: Severity::Info,
        message,
        stacktrace: None,
        tags,
        idempotency_id: None,
        timestamp: chrono::Utc::now().timestamp(),
    });
}

fn write_to_fallback(path: &std::path::Path, event: &ReportEvent) {
    if let Err(e) = fallback::append_event(path, event) {
        // Last resort: the reporter must stay silent about its own failures.
        logger::log_error(
            &format!("failed to write event to fallback store: {}", e),
            Some("reporting"),
        );
    }
}

fn worker_loop(receiver: Receiver<ReportEvent>, config: ReportingConfig) {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("Floe/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(10))
        .build();
    let client = match client {
        Ok(client) => client,
        Err(e) => {
            logger::log_error(
                &format!("reporting worker has no HTTP client: {}", e),
                Some("reporting"),
            );
            // Still consume the queue so callers never block; everything
            // goes to the fallback store.
            while let Ok(event) = receiver.recv() {
                write_to_fallback(&config.fallback_path, &event);
            }
            return;
        }
    };

    // A previous run may have left events behind.
    upload_pending_fallback(&client, &config);

    loop {
        let first = match receiver.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => event,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let mut batch = vec![first];
        while batch.len() < BATCH_MAX {
            match receiver.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        dispatch_batch(&client, &config, batch);
    }

    logger::log_info("reporting worker stopped", Some("reporting"));
}

fn dispatch_batch(
    client: &reqwest::blocking::Client,
    config: &ReportingConfig,
    batch: Vec<ReportEvent>,
) {
    if DISABLED.load(Ordering::Relaxed) {
        // Keep the events for a manual bug report instead of uploading.
        for event in &batch {
            write_to_fallback(&config.fallback_path, event);
        }
        return;
    }

    if let Err(e) = post_events(client, &config.endpoint, &batch) {
        logger::log_warn(
            &format!("report upload failed, keeping {} events: {}", batch.len(), e),
            Some("reporting"),
        );
        for event in &batch {
            write_to_fallback(&config.fallback_path, event);
        }
        return;
    }

    // The network is evidently up; retry anything stranded on disk.
    upload_pending_fallback(client, config);
}

fn post_events(
    client: &reqwest::blocking::Client,
    endpoint: &str,
    events: &[ReportEvent],
) -> Result<(), String> {
    let response = client
        .post(endpoint)
        .json(events)
        .send()
        .map_err(|e| e.to_string())?;

    let status = response.status();
    // The body is only interesting for diagnostics.
    let body = response.text().unwrap_or_default();
    if !status.is_success() {
        return Err(format!("status {}: {}", status, body));
    }
    logger::log_debug(
        &format!("uploaded {} events", events.len()),
        Some("reporting"),
        Some(&body),
    );
    Ok(())
}

/// Upload events stranded in the fallback store, truncating it on success.
fn upload_pending_fallback(client: &reqwest::blocking::Client, config: &ReportingConfig) {
    if DISABLED.load(Ordering::Relaxed) {
        return;
    }
    let pending = match fallback::read_events(&config.fallback_path) {
        Ok(pending) => pending,
        Err(e) => {
            logger::log_warn(
                &format!("cannot read fallback store: {}", e),
                Some("reporting"),
            );
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    for chunk in pending.chunks(BATCH_MAX) {
        if let Err(e) = post_events(client, &config.endpoint, chunk) {
            logger::log_warn(
                &format!("fallback upload failed: {}", e),
                Some("reporting"),
            );
            return;
        }
    }
    if let Err(e) = fallback::truncate(&config.fallback_path) {
        logger::log_warn(
            &format!("cannot truncate fallback store: {}", e),
            Some("reporting"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_event(message: &str, id: Option<u64>) -> ReportEvent {
        ReportEvent {
            kind: EventKind::Error,
            severity: Severity::Error,
            message: message.to_string(),
            stacktrace: None,
            tags: BTreeMap::new(),
            idempotency_id: id,
            timestamp: 0,
        }
    }

    // The dedup ring is process-global, so both its properties live in one
    // test: parallel tests would otherwise fill it out from under each
    // other.
    #[test]
    fn test_dedup_ring() {
        // Concurrent reports with one id: exactly one gets through.
        let id = 0xfeed_beef_u64;
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let hits = hits.clone();
            handles.push(std::thread::spawn(move || {
                if !is_duplicate(id) {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Fill the ring past capacity with unique ids; once full, a fresh
        // id is admitted (not suppressed) even though it cannot be
        // recorded.
        for id in 1000..1000 + (DEDUP_RING_CAPACITY as u64) {
            is_duplicate(id);
        }
        assert!(!is_duplicate(99_999_001));
        assert!(!is_duplicate(99_999_001));
    }

    #[test]
    fn test_events_reach_fallback_when_worker_absent() {
        // The global system is not initialized in this test binary run
        // order-independently; emulate the absent-worker path directly.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.bin");
        write_to_fallback(&path, &test_event("engine exploded", None));

        let events = fallback::read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "engine exploded");
    }

    #[test]
    fn test_disabled_batches_go_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReportingConfig {
            endpoint: "http://127.0.0.1:1/unreachable".to_string(),
            fallback_path: dir.path().join("pending.bin"),
        };
        let client = reqwest::blocking::Client::new();

        set_online_reporting_disabled(true);
        dispatch_batch(&client, &config, vec![test_event("kept local", None)]);
        set_online_reporting_disabled(false);

        let events = fallback::read_events(&config.fallback_path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "kept local");
    }

    #[test]
    fn test_failed_upload_flushes_batch_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReportingConfig {
            // Nothing listens here; the send must fail fast.
            endpoint: "http://127.0.0.1:1/unreachable".to_string(),
            fallback_path: dir.path().join("pending.bin"),
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();

        dispatch_batch(
            &client,
            &config,
            vec![test_event("a", None), test_event("b", None)],
        );

        let events = fallback::read_events(&config.fallback_path).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_init_deinit_refcounting() {
        let _guard = TEST_SYSTEM_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let config = ReportingConfig {
            endpoint: "http://127.0.0.1:1/unreachable".to_string(),
            fallback_path: dir.path().join("pending.bin"),
        };

        init(config.clone());
        init(config);
        assert!(ACTIVE.load(Ordering::Acquire));

        report_message(Severity::Warning, "queued while active".to_string(), None);

        deinit();
        assert!(ACTIVE.load(Ordering::Acquire), "still one ref outstanding");
        deinit();
        assert!(!ACTIVE.load(Ordering::Acquire));

        // Post-deinit events take the fallback path and must not panic.
        report_message(Severity::Warning, "after deinit".to_string(), None);
    }
}
