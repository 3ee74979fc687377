use super::*;
use std::sync::Mutex;

#[test]
fn config_conversion_applies_defaults() {
    let host = CString::new("proxy.example").expect("host");
    let config = TunnelConfig {
        proxy_host: host.as_ptr(),
        proxy_port: 3128,
        mtu: 0,
        idle_timeout_ms: 1500,
        connect_timeout_ms: 0,
        ..TunnelConfig::default()
    };

    let engine = unsafe { config.engine_config() }.expect("valid config");
    assert_eq!(engine.proxy.host, "proxy.example");
    assert_eq!(engine.proxy.port, 3128);
    assert!(engine.proxy.credentials().is_none());
    assert_eq!(engine.mtu, DEFAULT_MTU);
    assert_eq!(engine.mss(), 1460);
    assert_eq!(engine.timeouts.idle, Duration::from_millis(1500));
    assert_eq!(engine.timeouts.connect, FlowTimeouts::default().connect);
}

#[test]
fn config_conversion_clamps_mtu_and_reads_credentials() {
    let host = CString::new("10.0.0.1").expect("host");
    let user = CString::new("user").expect("user");
    let pass = CString::new("pass").expect("pass");
    let config = TunnelConfig {
        proxy_host: host.as_ptr(),
        proxy_port: 8080,
        username: user.as_ptr(),
        password: pass.as_ptr(),
        mtu: 100,
        ..TunnelConfig::default()
    };

    let engine = unsafe { config.engine_config() }.expect("valid config");
    assert_eq!(engine.mtu, 576);
    assert_eq!(engine.proxy.credentials(), Some(("user", "pass")));
}

#[test]
fn config_conversion_rejects_missing_host_and_port() {
    let config = TunnelConfig {
        proxy_port: 8080,
        ..TunnelConfig::default()
    };
    assert!(matches!(
        unsafe { config.proxy_config() },
        Err(ConfigError::EmptyHost)
    ));

    let host = CString::new("proxy").expect("host");
    let config = TunnelConfig {
        proxy_host: host.as_ptr(),
        proxy_port: 0,
        ..TunnelConfig::default()
    };
    assert!(matches!(
        unsafe { config.proxy_config() },
        Err(ConfigError::InvalidPort)
    ));
}

#[test]
fn config_conversion_rejects_invalid_utf8() {
    let host = CString::new(vec![0xffu8, 0xfe]).expect("bytes");
    let config = TunnelConfig {
        proxy_host: host.as_ptr(),
        proxy_port: 8080,
        ..TunnelConfig::default()
    };
    assert!(matches!(
        unsafe { config.proxy_config() },
        Err(ConfigError::InvalidString("proxy_host"))
    ));
}

#[derive(Default)]
struct Recorded {
    packets: Mutex<Vec<Vec<u8>>>,
    statuses: Mutex<Vec<(bool, Option<String>)>>,
}

unsafe extern "C" fn record_packet(packet: *const u8, length: usize, context: *mut c_void) -> bool {
    let recorded = unsafe { &*(context as *const Recorded) };
    let bytes = unsafe { std::slice::from_raw_parts(packet, length) };
    recorded.packets.lock().expect("packets").push(bytes.to_vec());
    true
}

unsafe extern "C" fn refuse_packet(_packet: *const u8, _length: usize, _context: *mut c_void) -> bool {
    false
}

unsafe extern "C" fn record_status(connected: bool, error: *const c_char, context: *mut c_void) {
    let recorded = unsafe { &*(context as *const Recorded) };
    let error = if error.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned())
    };
    recorded
        .statuses
        .lock()
        .expect("statuses")
        .push((connected, error));
}

fn callbacks_for(recorded: &Recorded) -> TunnelCallbacks {
    TunnelCallbacks {
        emit_packet: Some(record_packet),
        report_status: Some(record_status),
        protect_socket: None,
        context: recorded as *const Recorded as *mut c_void,
    }
}

#[test]
fn callbacks_emit_and_report() {
    let recorded = Recorded::default();
    let callbacks = callbacks_for(&recorded);

    callbacks.emit(&[0x45, 0, 0, 20]).expect("emit");
    callbacks.report(&EngineStatus::connected());
    callbacks.report(&EngineStatus::failed("interface closed"));

    assert_eq!(
        *recorded.packets.lock().expect("packets"),
        vec![vec![0x45, 0, 0, 20]]
    );
    assert_eq!(
        *recorded.statuses.lock().expect("statuses"),
        vec![(true, None), (false, Some("interface closed".to_string()))]
    );
}

#[test]
fn refused_or_missing_emit_is_an_error() {
    let recorded = Recorded::default();
    let mut callbacks = callbacks_for(&recorded);
    callbacks.emit_packet = Some(refuse_packet);
    assert_eq!(
        callbacks.emit(&[1, 2, 3]).expect_err("refused").kind(),
        io::ErrorKind::BrokenPipe
    );

    callbacks.emit_packet = None;
    assert_eq!(
        callbacks.emit(&[1, 2, 3]).expect_err("missing").kind(),
        io::ErrorKind::Unsupported
    );
}

#[cfg(unix)]
#[tokio::test]
async fn protect_callback_sees_socket_fd() {
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicI32, Ordering};

    static SEEN_FD: AtomicI32 = AtomicI32::new(-1);
    unsafe extern "C" fn remember_fd(fd: i32, _context: *mut c_void) -> bool {
        SEEN_FD.store(fd, Ordering::SeqCst);
        false
    }

    let callbacks = TunnelCallbacks {
        emit_packet: None,
        report_status: None,
        protect_socket: Some(remember_fd),
        context: ptr::null_mut(),
    };
    let socket = TcpSocket::new_v4().expect("socket");
    assert!(!callbacks.protect(&socket));
    assert_eq!(SEEN_FD.load(Ordering::SeqCst), socket.as_raw_fd());

    let permissive = TunnelCallbacks {
        protect_socket: None,
        ..callbacks
    };
    assert!(permissive.protect(&socket));
}
