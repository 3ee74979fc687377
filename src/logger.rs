use crate::ffi::TunnelLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type LogCallback = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Installs (or with `None`, removes) the process-wide log sink.
pub fn install_sink(sink: Option<Arc<dyn LogSink>>, level: LogLevel, breadcrumbs: BreadcrumbFlags) {
    LOGGER.install(sink.map(|sink| SinkSlot {
        sink,
        breadcrumbs,
        min_level: level,
    }));
}

/// Adapts a C log callback into the process-wide sink.
pub fn install_c_sink(sink: Option<&TunnelLogSink>, level: Option<&str>) -> Result<(), &'static str> {
    let Some(sink) = sink else {
        LOGGER.install(None);
        return Ok(());
    };
    let callback = match sink.log {
        Some(cb) => cb,
        None => return Err("log callback missing"),
    };
    let min_level = level.map(LogLevel::from_str).unwrap_or(LogLevel::Info);
    install_sink(
        Some(Arc::new(CallbackSink {
            callback,
            context: sink.context,
        })),
        min_level,
        BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
    );
    Ok(())
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

/// Destination for formatted log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, line: &str);
}

/// Writes every line to stderr. Used by the standalone runner.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write(&self, level: LogLevel, _breadcrumbs: BreadcrumbFlags, line: &str) {
        eprintln!("{:>5} {}", level.as_str(), line);
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const DEVICE = 0b0000_0001;
        const FLOW   = 0b0000_0010;
        const PROXY  = 0b0000_0100;
        const RELAY  = 0b0000_1000;
        const FFI    = 0b0001_0000;
        const PACKET = 0b0100_0000;
        const ALL    = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct CallbackSink {
    callback: LogCallback,
    context: *mut c_void,
}

// The host guarantees the callback and its context may be used from any thread.
unsafe impl Send for CallbackSink {}
unsafe impl Sync for CallbackSink {}

impl LogSink for CallbackSink {
    fn write(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, line: &str) {
        let level_c = match CString::new(level.as_str()) {
            Ok(val) => val,
            Err(_) => return,
        };
        let msg_c = match CString::new(line) {
            Ok(val) => val,
            Err(_) => return,
        };
        unsafe {
            (self.callback)(
                level_c.as_ptr(),
                msg_c.as_ptr(),
                breadcrumbs.bits(),
                self.context,
            );
        }
    }
}

#[derive(Clone)]
struct SinkSlot {
    sink: Arc<dyn LogSink>,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<SinkSlot>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[ct-p{pid}]"),
        }
    }

    fn install(&self, slot: Option<SinkSlot>) {
        *self.sink.lock() = slot;
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(slot) = self.sink.lock().as_mut() {
            slot.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        // Clone out so the sink runs without the lock held.
        let Some(slot) = self.sink.lock().clone() else {
            return;
        };
        if level > slot.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !slot.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if !breadcrumbs.is_empty() {
            let label = label_for(breadcrumbs);
            format!("{} [{}] {}", self.prefix, label, message)
        } else {
            format!("{} {}", self.prefix, message)
        };
        slot.sink.write(level, breadcrumbs, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::FLOW) {
        "FLOW"
    } else if flags.contains(BreadcrumbFlags::PROXY) {
        "PROXY"
    } else if flags.contains(BreadcrumbFlags::RELAY) {
        "RELAY"
    } else if flags.contains(BreadcrumbFlags::DEVICE) {
        "DEVICE"
    } else if flags.contains(BreadcrumbFlags::PACKET) {
        "PACKET"
    } else if flags.contains(BreadcrumbFlags::FFI) {
        "FFI"
    } else {
        "LOG"
    }
}

// ============================================================================
// Rate-Limited Error Logging
// ============================================================================
// Each category has its own limiter so a flood of one kind of error cannot
// hide an unrelated one.

/// Minimum interval between logs of the same error category (in milliseconds).
const RATE_LIMIT_INTERVAL_MS: u64 = 1000;

const CATEGORY_COUNT: usize = 5;

/// Error categories for rate-limited logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Datagram rejected by the IPv4 decoder
    PacketInvalidIp,
    /// Datagram rejected by the TCP decoder
    PacketInvalidTcp,
    /// CONNECT dial or handshake failed
    ProxyFailure,
    /// Interface writer queue or a flow's segment queue was full
    DeviceBackpressure,
    /// Segment for a flow that does not exist
    UnknownFlow,
}

impl ErrorCategory {
    fn index(self) -> usize {
        match self {
            Self::PacketInvalidIp => 0,
            Self::PacketInvalidTcp => 1,
            Self::ProxyFailure => 2,
            Self::DeviceBackpressure => 3,
            Self::UnknownFlow => 4,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::PacketInvalidIp => "INVALID_IP",
            Self::PacketInvalidTcp => "INVALID_TCP",
            Self::ProxyFailure => "PROXY_FAILURE",
            Self::DeviceBackpressure => "BACKPRESSURE",
            Self::UnknownFlow => "UNKNOWN_FLOW",
        }
    }
}

/// Uses atomic timestamps for lock-free rate limiting.
struct RateLimitedLogger {
    /// Last log time (unix millis) for each error category.
    last_log_times: [AtomicU64; CATEGORY_COUNT],
}

impl RateLimitedLogger {
    const fn new() -> Self {
        Self {
            last_log_times: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Returns true if the log was emitted, false if rate-limited.
    fn try_log(&self, category: ErrorCategory, message: &str) -> bool {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let idx = category.index();
        let last = self.last_log_times[idx].load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }

        // Losing the race means another thread just logged this category.
        if self.last_log_times[idx]
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            warn(format!("[{}] {}", category.label(), message));
            true
        } else {
            false
        }
    }
}

static RATE_LIMITER: RateLimitedLogger = RateLimitedLogger::new();

/// Log an error with rate limiting to prevent log flooding.
/// Only one log per category per second will be emitted.
/// Returns true if the log was emitted, false if suppressed.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    RATE_LIMITER.try_log(category, &message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_suppresses_repeats_per_category() {
        let limiter = RateLimitedLogger::new();
        assert!(limiter.try_log(ErrorCategory::PacketInvalidIp, "first"));
        assert!(!limiter.try_log(ErrorCategory::PacketInvalidIp, "second"));
        assert!(limiter.try_log(ErrorCategory::ProxyFailure, "other category"));
    }

    #[test]
    fn level_parsing_is_lenient() {
        assert_eq!(LogLevel::from_str("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("nonsense"), LogLevel::Info);
    }

    #[test]
    fn labels_prefer_flow() {
        assert_eq!(
            label_for(BreadcrumbFlags::FLOW | BreadcrumbFlags::PROXY),
            "FLOW"
        );
        assert_eq!(label_for(BreadcrumbFlags::RELAY), "RELAY");
    }
}
