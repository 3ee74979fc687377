//! Routes device segments to per-flow handler tasks.

mod handler;
mod packet_builder;
pub mod state;
pub mod table;

use crate::codec::{self, ParsedPacket, TcpHeader, TcpSegment};
use crate::config::{ConfigStore, EngineConfig};
use crate::counters::Counters;
use crate::device::DeviceWriter;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::proxy::SocketProtector;
use crate::EngineError;
use handler::{FlowSettings, FlowShared, SynInfo};
use state::{CloseReason, Flow, FlowKey, SegmentEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use table::FlowTable;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};

/// Outcome of one datagram, mostly for tests and counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Failed to decode; dropped.
    Malformed,
    /// Not TCP; dropped without a reply.
    Ignored,
    /// SYN for a new key; a flow and its handler were created.
    Opened,
    /// Queued on an existing flow's event channel.
    Queued,
    /// RST tore down an existing flow, or a FIN was handed to its handler
    /// for teardown.
    TornDown,
    /// No flow for this key.
    Unsolicited,
    /// The flow's event channel was full.
    Dropped,
}

/// What a segment means for the flow table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentAction {
    Open,
    Teardown(CloseReason),
    Relay,
    Unsolicited,
}

/// Transition function for device segments. RST wins over FIN, and FIN over
/// everything else; only a bare SYN may create a flow.
pub fn classify(tcp: &TcpHeader, flow_exists: bool) -> SegmentAction {
    if flow_exists {
        if tcp.is_rst() {
            SegmentAction::Teardown(CloseReason::DeviceRst)
        } else if tcp.is_fin() {
            SegmentAction::Teardown(CloseReason::DeviceFin)
        } else {
            SegmentAction::Relay
        }
    } else if tcp.is_syn() && !tcp.is_ack() && !tcp.is_rst() && !tcp.is_fin() {
        SegmentAction::Open
    } else {
        SegmentAction::Unsolicited
    }
}

pub struct FlowManager {
    shared: Arc<FlowShared>,
    config: Arc<ConfigStore>,
    handlers: Arc<HandlerTracker>,
    runtime: Handle,
    mtu: usize,
}

impl FlowManager {
    pub fn new(
        config: &EngineConfig,
        store: Arc<ConfigStore>,
        device: DeviceWriter,
        counters: Arc<Counters>,
        protector: Option<Arc<dyn SocketProtector>>,
        runtime: Handle,
    ) -> Self {
        let settings = FlowSettings {
            mss: config.mss(),
            timeouts: config.timeouts,
            pending_bytes_cap: config.pending_bytes_cap,
            event_capacity: config.flow_event_capacity,
        };
        Self {
            shared: Arc::new(FlowShared {
                table: Arc::new(FlowTable::new()),
                device,
                counters,
                protector,
                settings,
            }),
            config: store,
            handlers: Arc::new(HandlerTracker::default()),
            runtime,
            mtu: config.mtu,
        }
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.shared.table
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.shared.counters
    }

    /// Handler tasks that have not finished yet.
    pub fn active_handlers(&self) -> usize {
        self.handlers.active()
    }

    /// Reads datagrams from the interface until `shutdown` flips to true.
    /// A read error or end of stream is fatal to the engine.
    pub async fn run<R>(
        &self,
        mut reader: R,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; self.mtu];
        logger::breadcrumb(
            BreadcrumbFlags::DEVICE,
            format!("ingest loop started (mtu={})", self.mtu),
        );
        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                read = reader.read(&mut buffer) => read.map_err(EngineError::InterfaceRead)?,
            };
            if read == 0 {
                return Err(EngineError::InterfaceClosed);
            }
            self.process_packet(&buffer[..read]);
        }
    }

    /// Handles one datagram read from the interface. Never waits on proxy
    /// I/O or on the interface writer.
    pub fn process_packet(&self, bytes: &[u8]) -> Disposition {
        let counters = &self.shared.counters;
        Counters::bump(&counters.packets_read);
        let segment = match codec::parse_packet(bytes) {
            Ok(ParsedPacket::Tcp(segment)) => segment,
            Ok(ParsedPacket::Other { protocol }) => {
                Counters::bump(&counters.non_tcp_ignored);
                logger::breadcrumb(
                    BreadcrumbFlags::PACKET,
                    format!("ignoring protocol {protocol} ({} bytes)", bytes.len()),
                );
                return Disposition::Ignored;
            }
            Err(error) => {
                Counters::bump(&counters.decode_drops);
                let category = if error.is_tcp_error() {
                    ErrorCategory::PacketInvalidTcp
                } else {
                    ErrorCategory::PacketInvalidIp
                };
                logger::rate_limited_error(category, format!("dropping datagram: {error}"));
                return Disposition::Malformed;
            }
        };

        let key = FlowKey::from_segment(&segment);
        let existing = self.shared.table.get(&key);
        match (classify(&segment.tcp, existing.is_some()), existing) {
            (SegmentAction::Open, _) => self.open_flow(key, &segment),
            (SegmentAction::Teardown(CloseReason::DeviceFin), Some(flow)) => {
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("flow {key}: device sent FIN"),
                );
                // The handler consumes the FIN in sequence, after any payload
                // it carries, and then tears the flow down.
                match self.relay(&flow, &segment) {
                    Disposition::Queued => Disposition::TornDown,
                    other => other,
                }
            }
            (SegmentAction::Teardown(reason), Some(flow)) => {
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("flow {key}: device sent {}", reason.as_str()),
                );
                flow.close(&self.shared.table, reason);
                Disposition::TornDown
            }
            (SegmentAction::Relay, Some(flow)) => self.relay(&flow, &segment),
            _ => self.unsolicited(key, &segment),
        }
    }

    /// Closes every flow and waits up to `grace` for their handlers. Returns
    /// false if some handler was still running when the grace ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let flows = self.shared.table.snapshot();
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("closing {} flows for shutdown", flows.len()),
        );
        for flow in flows {
            flow.close(&self.shared.table, CloseReason::Shutdown);
        }
        let drained = tokio::time::timeout(grace, self.handlers.wait_idle())
            .await
            .is_ok();
        if !drained {
            logger::warn(format!(
                "FlowManager: {} flow handlers still running after {:?}",
                self.handlers.active(),
                grace
            ));
        }
        drained
    }

    fn open_flow(&self, key: FlowKey, segment: &TcpSegment<'_>) -> Disposition {
        let (flow, channels) = Flow::new(key, self.shared.settings.event_capacity);
        if let Err(existing) = self.shared.table.insert_new(Arc::clone(&flow)) {
            return self.relay(&existing, segment);
        }
        Counters::bump(&self.shared.counters.flows_opened);
        logger::breadcrumb(BreadcrumbFlags::FLOW, format!("flow {key} opened"));

        let syn = SynInfo {
            seq: segment.tcp.seq,
            window: segment.tcp.window,
            mss: segment.tcp.mss,
        };
        let proxy = self.config.proxy();
        let shared = Arc::clone(&self.shared);
        let guard = self.handlers.enter();
        self.runtime.spawn(async move {
            let _guard = guard;
            handler::run(flow, channels, syn, shared, proxy).await;
        });
        Disposition::Opened
    }

    fn relay(&self, flow: &Flow, segment: &TcpSegment<'_>) -> Disposition {
        let counters = &self.shared.counters;
        if segment.tcp.is_syn() {
            Counters::bump(&counters.duplicate_syns);
            logger::breadcrumb(
                BreadcrumbFlags::PACKET,
                format!("flow {}: duplicate SYN", flow.key()),
            );
        }
        if flow.offer(SegmentEvent::from_segment(segment)) {
            Disposition::Queued
        } else {
            Counters::bump(&counters.event_drops);
            logger::rate_limited_error(
                ErrorCategory::DeviceBackpressure,
                format!("flow {}: event queue full; dropping segment", flow.key()),
            );
            Disposition::Dropped
        }
    }

    fn unsolicited(&self, key: FlowKey, segment: &TcpSegment<'_>) -> Disposition {
        Counters::bump(&self.shared.counters.unsolicited_segments);
        logger::rate_limited_error(
            ErrorCategory::UnknownFlow,
            format!("no flow for {key} (flags {:?})", segment.tcp.flags),
        );
        if segment.tcp.is_fin() && !segment.tcp.is_rst() {
            self.shared
                .device
                .try_send(packet_builder::ack_unsolicited(segment));
        }
        Disposition::Unsolicited
    }
}

/// Counts running handler tasks so shutdown can wait for them.
#[derive(Debug, Default)]
struct HandlerTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl HandlerTracker {
    fn enter(self: &Arc<Self>) -> HandlerGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        HandlerGuard {
            tracker: Arc::clone(self),
        }
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct HandlerGuard {
    tracker: Arc<HandlerTracker>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
