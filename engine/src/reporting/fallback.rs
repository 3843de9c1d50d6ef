//! On-disk fallback store for report events.
//!
//! An append-only, length-prefixed record file: 4 bytes little-endian
//! length, then that many bytes of JSON. Events land here whenever the
//! reporting worker is absent, its queue is full, or an upload fails; the
//! crash trap writes the same format through a pre-opened file descriptor.
//! After the worker successfully uploads pending records it truncates the
//! file.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{EngineError, EngineResult, FilesystemError};
use crate::logger;

use super::ReportEvent;

/// Append one event record. Never called from signal context (the crash
/// trap has its own pre-opened-fd writer for the same format).
pub fn append_event(path: &Path, event: &ReportEvent) -> EngineResult<()> {
    let json = serde_json::to_vec(event).map_err(|e| EngineError::Api(e.to_string()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;

    // One write call per record keeps interleaving from concurrent
    // appenders at record granularity.
    let mut record = Vec::with_capacity(4 + json.len());
    record.extend_from_slice(&(json.len() as u32).to_le_bytes());
    record.extend_from_slice(&json);
    file.write_all(&record)
        .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
    Ok(())
}

/// Read every intact record. A truncated or corrupt tail (a crash mid-write)
/// is logged and ignored rather than failing the whole file.
pub fn read_events(path: &Path) -> EngineResult<Vec<ReportEvent>> {
    let mut bytes = Vec::new();
    match std::fs::File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)
                .map_err(|e| EngineError::Filesystem(FilesystemError::Io(e)))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::Filesystem(FilesystemError::Io(e))),
    }

    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len > bytes.len() {
            logger::log_warn(
                &format!("fallback store {:?} has a truncated tail record", path),
                Some("reporting"),
            );
            break;
        }
        match serde_json::from_slice::<ReportEvent>(&bytes[offset..offset + len]) {
            Ok(event) => events.push(event),
            Err(e) => {
                logger::log_warn(
                    &format!("skipping corrupt fallback record in {:?}: {}", path, e),
                    Some("reporting"),
                );
            }
        }
        offset += len;
    }
    Ok(events)
}

/// Drop all records after a successful upload.
pub fn truncate(path: &Path) -> EngineResult<()> {
    match OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::Filesystem(FilesystemError::Io(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{EventKind, ReportEvent};
    use super::*;
    use crate::error::Severity;

    fn event(message: &str) -> ReportEvent {
        ReportEvent {
            kind: EventKind::Error,
            severity: Severity::Error,
            message: message.to_string(),
            stacktrace: None,
            tags: Default::default(),
            idempotency_id: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_append_read_truncate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending-events.bin");

        append_event(&path, &event("first")).unwrap();
        append_event(&path, &event("second")).unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].message, "second");

        truncate(&path).unwrap();
        assert!(read_events(&path).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        assert!(read_events(&path).unwrap().is_empty());
        truncate(&path).unwrap();
    }

    #[test]
    fn test_truncated_tail_record_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending-events.bin");
        append_event(&path, &event("intact")).unwrap();

        // Simulate a crash mid-write: a length prefix with half a payload.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "intact");
    }
}
