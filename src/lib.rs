#![deny(unsafe_op_in_unsafe_fn)]

pub mod codec;
pub mod config;
pub mod counters;
pub mod device;
pub mod ffi;
mod flow_manager;
pub mod logger;
pub mod proxy;
pub mod status;

pub use crate::flow_manager::state::{CloseReason, FlowKey, FlowState};
pub use crate::flow_manager::table::FlowTable;
pub use crate::flow_manager::{classify, Disposition, FlowManager, SegmentAction};

use crate::config::{ConfigError, ConfigStore, EngineConfig, ProxyConfig};
use crate::counters::Counters;
use crate::device::{DeviceWriter, EmitWriter, QueueHandle};
use crate::ffi::{FlowCounters, TunnelCallbacks, TunnelConfig, TunnelLogSink};
use crate::logger::BreadcrumbFlags;
use crate::proxy::SocketProtector;
use crate::status::{EngineStatus, LogStatusSink, StatusSink};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::io;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("interface read failed: {0}")]
    InterfaceRead(#[source] io::Error),
    #[error("interface write failed: {0}")]
    InterfaceWrite(#[source] io::Error),
    #[error("interface closed")]
    InterfaceClosed,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to build runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("engine already running")]
    AlreadyRunning,
}

/// Opaque engine handle shared with the host.
pub struct TunnelEngine {
    runtime: Runtime,
    config: EngineConfig,
    store: Arc<ConfigStore>,
    counters: Arc<Counters>,
    session: Mutex<Option<Session>>,
}

struct Session {
    shutdown: watch::Sender<bool>,
    ingest: JoinHandle<()>,
    /// Present in packet-push mode.
    queue: Option<QueueHandle>,
}

impl TunnelEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tunnel-engine")
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;

        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            format!(
                "TunnelEngine initialized (mtu={}, proxy={}:{})",
                config.mtu, config.proxy.host, config.proxy.port
            ),
        );

        Ok(Self {
            runtime,
            store: Arc::new(ConfigStore::new(config.proxy.clone())),
            config,
            counters: Arc::new(Counters::default()),
            session: Mutex::new(None),
        })
    }

    /// Starts relaying over any datagram reader/writer pair.
    pub fn start_with_device<R, W>(
        &self,
        reader: R,
        writer: W,
        status: Arc<dyn StatusSink>,
        protector: Option<Arc<dyn SocketProtector>>,
    ) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.start_session(reader, writer, status, protector, None)
    }

    /// Starts relaying over a TUN file descriptor the engine takes over.
    #[cfg(unix)]
    pub fn start_fd(
        &self,
        fd: std::os::fd::OwnedFd,
        status: Arc<dyn StatusSink>,
        protector: Option<Arc<dyn SocketProtector>>,
    ) -> Result<(), EngineError> {
        let tun = {
            let _context = self.runtime.enter();
            device::TunFd::new(fd).map_err(EngineError::InterfaceRead)?
        };
        self.start_session(tun.clone(), tun, status, protector, None)
    }

    /// Starts in packet-push mode: the host feeds inbound datagrams through
    /// [`TunnelEngine::handle_packet`] and receives outbound ones on `writer`.
    pub fn start_queue<W>(
        &self,
        writer: W,
        status: Arc<dyn StatusSink>,
        protector: Option<Arc<dyn SocketProtector>>,
    ) -> Result<QueueHandle, EngineError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, queue) =
            device::packet_queue(self.config.mtu, self.config.device_queue_capacity);
        self.start_session(queue, writer, status, protector, Some(handle.clone()))?;
        Ok(handle)
    }

    fn start_session<R, W>(
        &self,
        reader: R,
        writer: W,
        status: Arc<dyn StatusSink>,
        protector: Option<Arc<dyn SocketProtector>>,
        queue: Option<QueueHandle>,
    ) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let (device, outbound) = DeviceWriter::channel(self.config.device_queue_capacity);
        let manager = FlowManager::new(
            &self.config,
            Arc::clone(&self.store),
            device,
            Arc::clone(&self.counters),
            protector,
            self.runtime.handle().clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingest = self.runtime.spawn(run_session(
            manager,
            reader,
            writer,
            outbound,
            shutdown_rx,
            status,
            self.config.shutdown_grace,
        ));
        *session = Some(Session {
            shutdown: shutdown_tx,
            ingest,
            queue,
        });

        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            "TunnelEngine session started".to_string(),
        );
        Ok(())
    }

    /// Stops the session and blocks until ingestion, flow teardown and the
    /// interface writer have finished. Must not be called from inside the
    /// engine's runtime.
    pub fn stop(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            "TunnelEngine stop requested".to_string(),
        );
        session.shutdown.send_replace(true);
        if let Err(error) = self.runtime.block_on(session.ingest) {
            logger::error(format!("TunnelEngine: session task failed: {error}"));
        }
    }

    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| !session.ingest.is_finished())
    }

    /// Feeds one inbound datagram in packet-push mode. Returns `false` when
    /// no queue-mode session is running or the queue is full.
    pub fn handle_packet(&self, packet: &[u8]) -> bool {
        let session = self.session.lock();
        match session.as_ref().and_then(|session| session.queue.as_ref()) {
            Some(queue) => queue.push_inbound(packet),
            None => false,
        }
    }

    /// Replaces the proxy used by flows opened from now on.
    pub fn update_proxy(&self, proxy: ProxyConfig) -> Result<(), EngineError> {
        let target = format!("{}:{}", proxy.host, proxy.port);
        self.store.update_proxy(proxy)?;
        logger::breadcrumb(
            BreadcrumbFlags::PROXY,
            format!("proxy updated to {target}"),
        );
        Ok(())
    }

    pub fn counters(&self) -> FlowCounters {
        self.counters.snapshot()
    }
}

impl Drop for TunnelEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_session<R, W>(
    manager: FlowManager,
    reader: R,
    writer: W,
    outbound: mpsc::Receiver<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
    status: Arc<dyn StatusSink>,
    grace: Duration,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (stop_writer, stop_rx) = oneshot::channel();
    let mut write_task = tokio::spawn(device::write_loop(outbound, writer, stop_rx));
    status.report(&EngineStatus::connected());

    let (mut outcome, writer_finished) = tokio::select! {
        result = manager.run(reader, shutdown) => (result, false),
        joined = &mut write_task => {
            let error = match joined {
                Ok(Ok(_)) => io::Error::new(io::ErrorKind::BrokenPipe, "interface writer stopped"),
                Ok(Err(error)) => error,
                Err(join) => io::Error::other(join.to_string()),
            };
            (Err(EngineError::InterfaceWrite(error)), true)
        }
    };

    manager.shutdown(grace).await;
    if !writer_finished {
        let _ = stop_writer.send(());
        let flushed = match write_task.await {
            Ok(result) => result,
            Err(join) => Err(io::Error::other(join.to_string())),
        };
        if let (Err(error), true) = (flushed, outcome.is_ok()) {
            outcome = Err(EngineError::InterfaceWrite(error));
        }
    }
    drop(manager);

    let report = match &outcome {
        Ok(()) => EngineStatus::disconnected(),
        Err(error) => {
            logger::error(format!("TunnelEngine: session ended: {error}"));
            EngineStatus::failed(error.to_string())
        }
    };
    logger::breadcrumb(
        BreadcrumbFlags::DEVICE,
        "TunnelEngine session stopped".to_string(),
    );
    status.report(&report);
}

#[no_mangle]
pub unsafe extern "C" fn TunnelNewEngine(config: *const TunnelConfig) -> *mut TunnelEngine {
    let Some(config) = (unsafe { config.as_ref() }) else {
        logger::error("TunnelNewEngine: config is null");
        return std::ptr::null_mut();
    };
    let config = match unsafe { config.engine_config() } {
        Ok(config) => config,
        Err(error) => {
            logger::error(format!("TunnelNewEngine: {error}"));
            return std::ptr::null_mut();
        }
    };

    match TunnelEngine::new(config) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(error) => {
            logger::error(format!("TunnelNewEngine failed: {error:?}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn TunnelFreeEngine(engine: *mut TunnelEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe {
            drop(Box::from_raw(engine.as_ptr()));
        }
    }
}

/// Starts the engine. With `tun_fd >= 0` the engine duplicates and reads the
/// descriptor itself; otherwise the host pushes packets through
/// `TunnelEngineHandlePacket` and receives them via `emit_packet`.
#[no_mangle]
pub unsafe extern "C" fn TunnelEngineStart(
    engine: *mut TunnelEngine,
    callbacks: *const TunnelCallbacks,
    tun_fd: i32,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(callbacks) = (unsafe { callbacks.as_ref() }).copied() else {
        return -2;
    };
    let engine = unsafe { engine.as_ref() };
    logger::breadcrumb(
        BreadcrumbFlags::FFI,
        format!(
            "TunnelEngineStart ({})",
            if tun_fd >= 0 { "fd mode" } else { "packet-push mode" }
        ),
    );
    let host: Arc<TunnelCallbacks> = Arc::new(callbacks);
    let status: Arc<dyn StatusSink> = if callbacks.report_status.is_some() {
        host.clone()
    } else {
        Arc::new(LogStatusSink)
    };
    let protector: Option<Arc<dyn SocketProtector>> = callbacks
        .protect_socket
        .map(|_| host.clone() as Arc<dyn SocketProtector>);

    let result = if tun_fd >= 0 {
        start_with_fd(engine, tun_fd, status, protector)
    } else if callbacks.emit_packet.is_none() {
        logger::error("TunnelEngineStart: emit_packet callback missing");
        return -2;
    } else {
        let writer = EmitWriter::new(move |packet: &[u8]| host.emit(packet));
        engine.start_queue(writer, status, protector).map(|_| ())
    };

    match result {
        Ok(()) => 0,
        Err(error) => {
            logger::error(format!("TunnelEngineStart error: {error:?}"));
            -3
        }
    }
}

#[cfg(unix)]
fn start_with_fd(
    engine: &TunnelEngine,
    tun_fd: i32,
    status: Arc<dyn StatusSink>,
    protector: Option<Arc<dyn SocketProtector>>,
) -> Result<(), EngineError> {
    use std::os::fd::BorrowedFd;
    // The host keeps ownership of its descriptor; the engine works on a copy.
    let owned = unsafe { BorrowedFd::borrow_raw(tun_fd) }
        .try_clone_to_owned()
        .map_err(EngineError::InterfaceRead)?;
    engine.start_fd(owned, status, protector)
}

#[cfg(not(unix))]
fn start_with_fd(
    _engine: &TunnelEngine,
    _tun_fd: i32,
    _status: Arc<dyn StatusSink>,
    _protector: Option<Arc<dyn SocketProtector>>,
) -> Result<(), EngineError> {
    Err(EngineError::InterfaceRead(io::Error::new(
        io::ErrorKind::Unsupported,
        "file descriptor mode requires a unix host",
    )))
}

#[no_mangle]
pub unsafe extern "C" fn TunnelEngineStop(engine: *mut TunnelEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.stop();
    }
}

#[no_mangle]
pub unsafe extern "C" fn TunnelEngineHandlePacket(
    engine: *mut TunnelEngine,
    packet: *const u8,
    length: usize,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if packet.is_null() || length == 0 {
        return false;
    }
    let slice = unsafe { slice::from_raw_parts(packet, length) };
    unsafe { engine.as_ref() }.handle_packet(slice)
}

/// Replaces the proxy for flows opened afterwards. Only the proxy fields of
/// `config` are read.
#[no_mangle]
pub unsafe extern "C" fn TunnelEngineUpdateProxy(
    engine: *mut TunnelEngine,
    config: *const TunnelConfig,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(config) = (unsafe { config.as_ref() }) else {
        return false;
    };
    let proxy = match unsafe { config.proxy_config() } {
        Ok(proxy) => proxy,
        Err(error) => {
            logger::error(format!("TunnelEngineUpdateProxy: {error}"));
            return false;
        }
    };
    unsafe { engine.as_ref() }.update_proxy(proxy).is_ok()
}

#[no_mangle]
pub unsafe extern "C" fn TunnelEngineGetCounters(
    engine: *mut TunnelEngine,
    out: *mut FlowCounters,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = (unsafe { out.as_mut() }) else {
        return false;
    };
    *out = unsafe { engine.as_ref() }.counters();
    true
}

#[no_mangle]
pub unsafe extern "C" fn TunnelSetLogSink(
    sink: *const TunnelLogSink,
    level: *const c_char,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(level) }.to_str().ok()
    };
    logger::install_c_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn TunnelSetBreadcrumbMask(mask: u32) {
    logger::set_breadcrumb_mask(mask);
}
