use crate::config::{ConfigError, EngineConfig, FlowTimeouts, ProxyConfig, DEFAULT_MTU};
use crate::proxy::SocketProtector;
use crate::status::{EngineStatus, StatusSink};
use std::ffi::{c_char, c_void, CStr, CString};
use std::io;
use std::ptr;
use std::time::Duration;
use tokio::net::TcpSocket;

pub type EmitPacketFn =
    unsafe extern "C" fn(packet: *const u8, length: usize, context: *mut c_void) -> bool;
pub type ReportStatusFn =
    unsafe extern "C" fn(connected: bool, error: *const c_char, context: *mut c_void);
pub type ProtectSocketFn = unsafe extern "C" fn(fd: i32, context: *mut c_void) -> bool;

/// Mirror of the `TunnelConfig` struct defined in `include/tunnel.h`.
/// Zero timeouts and a zero MTU select the defaults.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct TunnelConfig {
    pub proxy_host: *const c_char,
    pub proxy_port: u16,
    /// Optional; credentials are sent only when both are non-empty.
    pub username: *const c_char,
    pub password: *const c_char,
    pub mtu: u32,
    pub connect_timeout_ms: u32,
    pub response_timeout_ms: u32,
    pub idle_timeout_ms: u32,
    pub max_flow_age_ms: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let timeouts = FlowTimeouts::default();
        Self {
            proxy_host: ptr::null(),
            proxy_port: 0,
            username: ptr::null(),
            password: ptr::null(),
            mtu: DEFAULT_MTU as u32,
            connect_timeout_ms: millis(timeouts.connect),
            response_timeout_ms: millis(timeouts.response),
            idle_timeout_ms: millis(timeouts.idle),
            max_flow_age_ms: millis(timeouts.max_age),
        }
    }
}

impl TunnelConfig {
    /// # Safety
    /// Every non-null string pointer must reference a NUL-terminated string
    /// that stays valid for the duration of the call.
    pub unsafe fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let host = unsafe { read_string(self.proxy_host, "proxy_host") }?.unwrap_or_default();
        let mut proxy = ProxyConfig::new(host, self.proxy_port);
        proxy.username = unsafe { read_string(self.username, "username") }?;
        proxy.password = unsafe { read_string(self.password, "password") }?;
        proxy.validate()?;
        Ok(proxy)
    }

    /// # Safety
    /// Same requirements as [`TunnelConfig::proxy_config`].
    pub unsafe fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let proxy = unsafe { self.proxy_config() }?;
        let defaults = FlowTimeouts::default();
        let mtu = if self.mtu == 0 {
            DEFAULT_MTU
        } else {
            self.mtu as usize
        };
        let mut config = EngineConfig::new(proxy).with_mtu(mtu);
        config.timeouts = FlowTimeouts {
            connect: duration_or(self.connect_timeout_ms, defaults.connect),
            response: duration_or(self.response_timeout_ms, defaults.response),
            idle: duration_or(self.idle_timeout_ms, defaults.idle),
            max_age: duration_or(self.max_flow_age_ms, defaults.max_age),
        };
        Ok(config)
    }
}

unsafe fn read_string(
    value: *const c_char,
    field: &'static str,
) -> Result<Option<String>, ConfigError> {
    if value.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(value) }
        .to_str()
        .map(|text| Some(text.to_owned()))
        .map_err(|_| ConfigError::InvalidString(field))
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn duration_or(ms: u32, default: Duration) -> Duration {
    if ms == 0 {
        default
    } else {
        Duration::from_millis(u64::from(ms))
    }
}

/// Callbacks installed by the host. `emit_packet` is required in
/// packet-push mode; the others are optional.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TunnelCallbacks {
    pub emit_packet: Option<EmitPacketFn>,
    pub report_status: Option<ReportStatusFn>,
    pub protect_socket: Option<ProtectSocketFn>,
    pub context: *mut c_void,
}

// The host guarantees the callbacks and context may be used from any thread.
unsafe impl Send for TunnelCallbacks {}
unsafe impl Sync for TunnelCallbacks {}

impl TunnelCallbacks {
    /// Hands one outbound datagram to the host.
    pub fn emit(&self, packet: &[u8]) -> io::Result<()> {
        let Some(emit) = self.emit_packet else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "emit_packet callback missing",
            ));
        };
        if unsafe { emit(packet.as_ptr(), packet.len(), self.context) } {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "host refused outbound packet",
            ))
        }
    }
}

impl StatusSink for TunnelCallbacks {
    fn report(&self, status: &EngineStatus) {
        let Some(report) = self.report_status else {
            return;
        };
        let error = status
            .error
            .as_deref()
            .and_then(|text| CString::new(text.replace('\0', " ")).ok());
        let error_ptr = error.as_ref().map_or(ptr::null(), |text| text.as_ptr());
        unsafe { report(status.connected, error_ptr, self.context) };
    }
}

impl SocketProtector for TunnelCallbacks {
    #[cfg(unix)]
    fn protect(&self, socket: &TcpSocket) -> bool {
        use std::os::fd::AsRawFd;
        match self.protect_socket {
            Some(protect) => unsafe { protect(socket.as_raw_fd(), self.context) },
            None => true,
        }
    }

    #[cfg(not(unix))]
    fn protect(&self, _socket: &TcpSocket) -> bool {
        true
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    pub packets_read: u64,
    pub decode_drops: u64,
    pub non_tcp_ignored: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub duplicate_syns: u64,
    pub unsolicited_segments: u64,
    pub event_drops: u64,
    pub proxy_failures: u64,
    pub bytes_device_to_proxy: u64,
    pub bytes_proxy_to_device: u64,
    pub segments_synthesized: u64,
}

#[repr(C)]
pub struct TunnelLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[cfg(test)]
mod tests;
