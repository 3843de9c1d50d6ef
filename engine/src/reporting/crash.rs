//! Crash trap.
//!
//! Captures Rust panics and (on unix) hardware faults and writes a crash
//! event into the fallback store. The hardware path runs in signal context
//! and is restricted accordingly: a fixed inline scratch buffer, a file
//! descriptor opened ahead of time, lock-free reads of module state, and
//! direct `write(2)` calls. It must never enqueue through the reporting
//! queue, whose mutex may be held by the crashing thread.
//!
//! The panic path is ordinary Rust code: it records the event through the
//! normal fallback writer and, when online reporting is enabled, attempts
//! one synchronous upload with a short timeout before the process dies.

use std::panic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::logger;

use super::{fallback, EventKind, ReportEvent};
use crate::error::Severity;

/// Inline scratch for the signal handler's record. Large enough for the
/// fixed JSON skeleton plus a full frame list.
const SCRATCH_SIZE: usize = 4096;

/// Upper bound on captured frame addresses.
const MAX_FRAMES: usize = 32;

/// Timeout for the crash path's synchronous upload.
const CRASH_SUBMIT_TIMEOUT: Duration = Duration::from_secs(3);

static INSTALLED: AtomicBool = AtomicBool::new(false);
static IN_HANDLER: AtomicBool = AtomicBool::new(false);

/// Pre-opened append fd for the fallback store; -1 when unavailable.
static FALLBACK_FD: AtomicI32 = AtomicI32::new(-1);

/// Base address of this module, captured at init for the "is it our
/// crash?" check.
static MODULE_BASE: AtomicUsize = AtomicUsize::new(0);

static DEBUGGER_ATTACHED: AtomicBool = AtomicBool::new(false);

static FALLBACK_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Scratch written only between the IN_HANDLER acquire and the handler's
/// return, so a plain static mut is sound here.
static mut SCRATCH: [u8; SCRATCH_SIZE] = [0; SCRATCH_SIZE];

/// Install the process-global crash trap. Idempotent; the first call wins.
pub fn init(fallback_path: &Path) {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = FALLBACK_PATH.set(fallback_path.to_path_buf());

    if let Some(parent) = fallback_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    #[cfg(unix)]
    {
        open_fallback_fd(fallback_path);
        capture_module_base();
        install_signal_handlers();
    }

    DEBUGGER_ATTACHED.store(detect_debugger(), Ordering::Relaxed);
    install_panic_hook();

    logger::log_info("crash trap installed", Some("crash"));
}

fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        handle_panic(info);
        previous(info);
    }));
}

fn handle_panic(info: &panic::PanicHookInfo<'_>) {
    let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    let location = info
        .location()
        .map(|l| format!("{}:{}", l.file(), l.line()))
        .unwrap_or_else(|| "unknown".to_string());

    let backtrace = std::backtrace::Backtrace::force_capture();
    let event = ReportEvent {
        kind: EventKind::Crash,
        severity: Severity::Fatal,
        message: format!("panic at {}: {}", location, message),
        stacktrace: Some(backtrace.to_string()),
        tags: Default::default(),
        idempotency_id: None,
        timestamp: chrono::Utc::now().timestamp(),
    };

    if let Some(path) = FALLBACK_PATH.get() {
        let _ = fallback::append_event(path, &event);
    }

    submit_crash_event_now(&event);

    #[cfg(all(unix, debug_assertions))]
    if DEBUGGER_ATTACHED.load(Ordering::Relaxed) {
        unsafe {
            libc::raise(libc::SIGTRAP);
        }
    }
}

/// One best-effort synchronous POST; the process is going down, so a short
/// timeout bounds how long we delay it.
fn submit_crash_event_now(event: &ReportEvent) {
    if super::DISABLED.load(Ordering::Relaxed) {
        return;
    }
    let Ok(client) = reqwest::blocking::Client::builder()
        .timeout(CRASH_SUBMIT_TIMEOUT)
        .build()
    else {
        return;
    };
    let endpoint = {
        match super::system_cell().try_lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|s| s.config.endpoint.clone())
                .unwrap_or_else(|| super::DEFAULT_REPORT_ENDPOINT.to_string()),
            // The lock may be held by the panicking thread itself: skip
            // the upload, the event is on disk already.
            Err(_) => return,
        }
    };
    let _ = client.post(endpoint).json(&[event]).send();
}

#[cfg(target_os = "linux")]
fn detect_debugger() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("TracerPid:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|pid| pid.parse::<u32>().ok())
        })
        .is_some_and(|pid| pid != 0)
}

#[cfg(not(target_os = "linux"))]
fn detect_debugger() -> bool {
    false
}

#[cfg(unix)]
fn open_fallback_fd(path: &Path) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            0o600,
        )
    };
    if fd >= 0 {
        FALLBACK_FD.store(fd, Ordering::SeqCst);
    } else {
        logger::log_warn("cannot pre-open fallback store for crash trap", Some("crash"));
    }
}

#[cfg(unix)]
fn capture_module_base() {
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(init as *const libc::c_void, &mut info) != 0 {
            MODULE_BASE.store(info.dli_fbase as usize, Ordering::SeqCst);
        }
    }
}

#[cfg(unix)]
const TRAPPED_SIGNALS: &[libc::c_int] = &[
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
];

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = signal_handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        for &signal in TRAPPED_SIGNALS {
            libc::sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGABRT => "SIGABRT",
        _ => "signal",
    }
}

/// Program counter and frame pointer from the interrupted context.
/// Implemented per-arch; elsewhere the record simply omits the trace.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn context_registers(context: *mut libc::c_void) -> (usize, usize) {
    let ucontext = context as *mut libc::ucontext_t;
    if ucontext.is_null() {
        return (0, 0);
    }
    let gregs = &(*ucontext).uc_mcontext.gregs;
    (
        gregs[libc::REG_RIP as usize] as usize,
        gregs[libc::REG_RBP as usize] as usize,
    )
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn context_registers(context: *mut libc::c_void) -> (usize, usize) {
    let ucontext = context as *mut libc::ucontext_t;
    if ucontext.is_null() {
        return (0, 0);
    }
    let mcontext = &(*ucontext).uc_mcontext;
    (mcontext.pc as usize, mcontext.regs[29] as usize)
}

#[cfg(all(unix, not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))))]
unsafe fn context_registers(_context: *mut libc::c_void) -> (usize, usize) {
    (0, 0)
}

/// Bounded frame-pointer walk. Each frame is `[saved fp, return address]`;
/// the walk stops on null, misalignment, or a non-increasing chain, which
/// also bounds it against corrupted stacks.
#[cfg(unix)]
unsafe fn walk_frames(mut fp: usize, frames: &mut [usize; MAX_FRAMES]) -> usize {
    let mut count = 0;
    while count < MAX_FRAMES {
        if fp == 0 || fp % std::mem::align_of::<usize>() != 0 {
            break;
        }
        let next_fp = *(fp as *const usize);
        let return_address = *((fp + std::mem::size_of::<usize>()) as *const usize);
        if return_address == 0 {
            break;
        }
        frames[count] = return_address;
        count += 1;
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }
    count
}

/// No-alloc formatter over the scratch buffer.
struct ScratchWriter {
    len: usize,
}

impl ScratchWriter {
    fn new() -> Self {
        Self { len: 0 }
    }

    fn push(&mut self, bytes: &[u8]) {
        unsafe {
            let remaining = SCRATCH_SIZE - self.len;
            let n = bytes.len().min(remaining);
            let scratch = &raw mut SCRATCH;
            (&mut (*scratch))[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
        }
    }

    fn push_str(&mut self, s: &str) {
        self.push(s.as_bytes());
    }

    fn push_decimal(&mut self, mut value: u64) {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        self.push(&digits[i..]);
    }

    fn push_hex(&mut self, value: usize) {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        self.push_str("0x");
        if value == 0 {
            self.push(b"0");
            return;
        }
        let mut digits = [0u8; 16];
        let mut i = digits.len();
        let mut v = value;
        while v != 0 {
            i -= 1;
            digits[i] = HEX[v & 0xf];
            v >>= 4;
        }
        self.push(&digits[i..]);
    }
}

/// The actual signal handler. Only async-signal-safe operations: atomics,
/// stack/static memory, `dladdr`, `time`, `write`, `sigaction`, `raise`.
#[cfg(unix)]
extern "C" fn signal_handler(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // A second fault inside the handler must not loop.
    if IN_HANDLER.swap(true, Ordering::SeqCst) {
        unsafe { restore_and_reraise(signal) };
        return;
    }

    unsafe {
        let (pc, fp) = context_registers(context);

        // If the faulting code is another module loaded into the host
        // process, this is not our crash: put the default handler back and
        // let the host deal with it.
        let our_base = MODULE_BASE.load(Ordering::SeqCst);
        if pc != 0 && our_base != 0 {
            let mut dl_info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(pc as *const libc::c_void, &mut dl_info) != 0
                && !dl_info.dli_fbase.is_null()
                && dl_info.dli_fbase as usize != our_base
            {
                restore_and_reraise(signal);
                return;
            }
        }

        let fd = FALLBACK_FD.load(Ordering::SeqCst);
        if fd >= 0 {
            let mut frames = [0usize; MAX_FRAMES];
            let frame_count = if fp != 0 { walk_frames(fp, &mut frames) } else { 0 };

            let fault_address = fault_addr(info);

            let mut writer = ScratchWriter::new();
            // Reserve the 4-byte length prefix.
            writer.push(&[0, 0, 0, 0]);
            writer.push_str("{\"kind\":\"crash\",\"severity\":\"fatal\",\"message\":\"");
            writer.push_str(signal_name(signal));
            writer.push_str(" (signal ");
            writer.push_decimal(signal as u64);
            writer.push_str(")\",\"stacktrace\":\"");
            for i in 0..frame_count {
                if i > 0 {
                    writer.push_str(" ");
                }
                writer.push_hex(frames[i]);
            }
            writer.push_str("\",\"tags\":{\"thread_id\":\"");
            writer.push_decimal(libc::pthread_self() as u64);
            writer.push_str("\",\"fault_address\":\"");
            writer.push_hex(fault_address);
            writer.push_str("\",\"pc\":\"");
            writer.push_hex(pc);
            writer.push_str("\"},\"timestamp\":");
            writer.push_decimal(libc::time(std::ptr::null_mut()) as u64);
            writer.push_str("}");

            let payload_len = (writer.len - 4) as u32;
            let scratch = &raw mut SCRATCH;
            (&mut (*scratch))[..4].copy_from_slice(&payload_len.to_le_bytes());
            libc::write(
                fd,
                (*scratch).as_ptr() as *const libc::c_void,
                writer.len,
            );
        }

        restore_and_reraise(signal);
    }
}

#[cfg(target_os = "linux")]
unsafe fn fault_addr(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        0
    } else {
        (*info).si_addr() as usize
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn fault_addr(info: *mut libc::siginfo_t) -> usize {
    if info.is_null() {
        0
    } else {
        (*info).si_addr as usize
    }
}

#[cfg(unix)]
unsafe fn restore_and_reraise(signal: libc::c_int) {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(signal, &action, std::ptr::null_mut());
    libc::raise(signal);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the scratch buffer is global, and parallel tests would
    // interleave writes into it.
    #[test]
    fn test_scratch_writer_formats_json_fragments() {
        // Serialize through the writer and parse back as a ReportEvent to
        // prove the handler's hand-built JSON matches the record schema.
        let mut writer = ScratchWriter::new();
        writer.push_str("{\"kind\":\"crash\",\"severity\":\"fatal\",\"message\":\"");
        writer.push_str("SIGSEGV (signal ");
        writer.push_decimal(11);
        writer.push_str(")\",\"stacktrace\":\"");
        writer.push_hex(0xdeadbeef);
        writer.push_str(" ");
        writer.push_hex(0x1000);
        writer.push_str("\",\"tags\":{\"thread_id\":\"");
        writer.push_decimal(42);
        writer.push_str("\",\"fault_address\":\"");
        writer.push_hex(0);
        writer.push_str("\"},\"timestamp\":");
        writer.push_decimal(1_700_000_000);
        writer.push_str("}");

        let json = unsafe {
            let scratch = &raw const SCRATCH;
            String::from_utf8((&(*scratch))[..writer.len].to_vec()).unwrap()
        };
        let event: ReportEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.kind, EventKind::Crash);
        assert_eq!(event.message, "SIGSEGV (signal 11)");
        assert_eq!(event.stacktrace.as_deref(), Some("0xdeadbeef 0x1000"));
        assert_eq!(event.tags.get("thread_id").unwrap(), "42");
        assert_eq!(event.timestamp, 1_700_000_000);

        // Numeric formatting edges, reusing the same (global) scratch.
        let mut writer = ScratchWriter::new();
        writer.push_decimal(0);
        writer.push_str("|");
        writer.push_decimal(u64::MAX);
        writer.push_str("|");
        writer.push_hex(usize::MAX);

        let text = unsafe {
            let scratch = &raw const SCRATCH;
            String::from_utf8((&(*scratch))[..writer.len].to_vec()).unwrap()
        };
        let parts: Vec<&str> = text.split('|').collect();
        assert_eq!(parts[0], "0");
        assert_eq!(parts[1], "18446744073709551615");
        assert_eq!(parts[2], format!("{:#x}", usize::MAX));
    }
}

