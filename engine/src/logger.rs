//! Engine log sink shared by every subsystem.
//!
//! Lines are appended to the engine log file under the app data directory
//! (see `core::app_dirs`). Logging never fails outward: if the sink cannot
//! be opened or written, the line is dropped (stderr still sees it in debug
//! builds). The reporting pipeline logs through here but never reports its
//! own failures, so this module must not call back into `reporting`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

static SINK: OnceLock<Mutex<Option<File>>> = OnceLock::new();

#[cfg(debug_assertions)]
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);
#[cfg(not(debug_assertions))]
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Open (or create) the log file and route subsequent lines to it.
/// Called once by the orchestrator during startup; safe to call again
/// (the new file replaces the old sink).
pub fn init(log_path: &Path) {
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = OpenOptions::new().create(true).append(true).open(log_path);

    let sink = SINK.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = sink.lock() {
        *guard = file.ok();
    }
}

pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn write_line(level: LogLevel, message: &str, module: Option<&str>) {
    if (level as u8) < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let line = match module {
        Some(module) => format!("[{}] [{}] [{}] {}", timestamp, level.tag(), module, message),
        None => format!("[{}] [{}] {}", timestamp, level.tag(), message),
    };

    #[cfg(debug_assertions)]
    eprintln!("{}", line);

    if let Some(sink) = SINK.get() {
        if let Ok(mut guard) = sink.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "{}", line);
            }
        }
    }
}

pub fn log_info(message: &str, module: Option<&str>) {
    write_line(LogLevel::Info, message, module);
}

pub fn log_warn(message: &str, module: Option<&str>) {
    write_line(LogLevel::Warn, message, module);
}

pub fn log_error(message: &str, module: Option<&str>) {
    write_line(LogLevel::Error, message, module);
}

pub fn log_debug(message: &str, module: Option<&str>, detail: Option<&str>) {
    match detail {
        Some(detail) => write_line(
            LogLevel::Debug,
            &format!("{} ({})", message, detail),
            module,
        ),
        None => write_line(LogLevel::Debug, message, module),
    }
}

/// Shorthand for timing/trace lines that carry a module tag.
#[macro_export]
macro_rules! log_debug {
    ($msg:expr, $module:expr) => {
        $crate::logger::log_debug($msg, Some($module), None)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test only: the sink and level are process-global, and parallel
    // tests would observe each other's re-init. The reporting test lock
    // also serializes us against orchestrator startups, which re-init the
    // sink.
    #[test]
    fn test_log_to_file_and_level_filtering() {
        let _guard = crate::reporting::TEST_SYSTEM_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        init(&path);

        log_info("install started", Some("installer"));
        log_error("install failed", Some("installer"));

        set_min_level(LogLevel::Error);
        log_info("quiet line", None);
        log_error("loud line", None);
        set_min_level(LogLevel::Debug);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[INFO] [installer] install started"));
        assert!(content.contains("[ERROR] [installer] install failed"));
        assert!(!content.contains("quiet line"));
        assert!(content.contains("loud line"));
    }
}
