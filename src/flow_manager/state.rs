use super::table::FlowTable;
use crate::codec::{TcpFlags, TcpSegment};
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// MSS assumed when the device's SYN carries no MSS option.
pub(crate) const DEFAULT_MSS: u16 = 536;

/// Identity of a device-originated connection.
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn from_segment(segment: &TcpSegment<'_>) -> Self {
        Self {
            src_ip: segment.ip.src,
            src_port: segment.tcp.src_port,
            dst_ip: segment.ip.dst,
            dst_port: segment.tcp.dst_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    Handshaking,
    Proxying,
    Established,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    DeviceFin,
    DeviceRst,
    DialFailed,
    ProxyEof,
    ProxyReadFailed,
    ProxyWriteFailed,
    IdleTimeout,
    AgeLimit,
    DeviceGone,
    Shutdown,
}

impl CloseReason {
    /// Whether teardown ends with a FIN+ACK toward the device. Not after the
    /// device reset, after a dial failure (already answered with RST), or
    /// once the interface writer is gone.
    pub fn sends_fin(self) -> bool {
        !matches!(self, Self::DeviceRst | Self::DialFailed | Self::DeviceGone)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceFin => "device_fin",
            Self::DeviceRst => "device_rst",
            Self::DialFailed => "dial_failed",
            Self::ProxyEof => "proxy_eof",
            Self::ProxyReadFailed => "proxy_read_failed",
            Self::ProxyWriteFailed => "proxy_write_failed",
            Self::IdleTimeout => "idle_timeout",
            Self::AgeLimit => "age_limit",
            Self::DeviceGone => "device_gone",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A device segment routed to an existing flow.
#[derive(Debug, Clone)]
pub struct SegmentEvent {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl SegmentEvent {
    pub fn from_segment(segment: &TcpSegment<'_>) -> Self {
        Self {
            seq: segment.tcp.seq,
            ack: segment.tcp.ack,
            flags: segment.tcp.flags,
            window: segment.tcp.window,
            payload: segment.payload.to_vec(),
        }
    }
}

/// Receiving ends handed to the flow's handler task.
pub(crate) struct FlowChannels {
    pub(crate) events: mpsc::Receiver<SegmentEvent>,
    pub(crate) closed: watch::Receiver<Option<CloseReason>>,
}

/// Shared record of one flow. The dispatcher and the table hold it; the
/// sequence counters and proxy socket live in the handler tasks.
#[derive(Debug)]
pub struct Flow {
    key: FlowKey,
    state: Mutex<FlowState>,
    closing: AtomicBool,
    events: mpsc::Sender<SegmentEvent>,
    close_tx: watch::Sender<Option<CloseReason>>,
    created_at: Instant,
}

impl Flow {
    pub(crate) fn new(key: FlowKey, event_capacity: usize) -> (Arc<Self>, FlowChannels) {
        let (events_tx, events_rx) = mpsc::channel(event_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let flow = Arc::new(Self {
            key,
            state: Mutex::new(FlowState::Handshaking),
            closing: AtomicBool::new(false),
            events: events_tx,
            close_tx,
            created_at: Instant::now(),
        });
        let channels = FlowChannels {
            events: events_rx,
            closed: close_rx,
        };
        (flow, channels)
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: FlowState) {
        *self.state.lock() = state;
    }

    /// Moves to `next` unless teardown has started. The closing flag is read
    /// under the state lock so a concurrent `close` cannot be overwritten.
    pub(crate) fn advance(&self, next: FlowState) -> bool {
        let mut state = self.state.lock();
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        *state = next;
        true
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    /// Queues a device segment for the handler without waiting. Returns
    /// `false` when the queue is full or the handler is gone.
    pub(crate) fn offer(&self, event: SegmentEvent) -> bool {
        self.events.try_send(event).is_ok()
    }

    /// Starts teardown. Only the first caller wins: it removes the flow from
    /// `table` and publishes `reason`. Returns whether this call did so.
    pub fn close(&self, table: &FlowTable, reason: CloseReason) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(FlowState::Closing);
        table.remove(self);
        self.close_tx.send_replace(Some(reason));
        true
    }
}

/// `a < b` in 32-bit sequence space.
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// How an incoming payload relates to what has already been received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Acceptance {
    /// No payload.
    Empty,
    /// Entirely before `rcv_nxt`; re-ACK only.
    Duplicate,
    /// Starts past `rcv_nxt`; dropped and re-ACKed so the device retransmits.
    OutOfOrder,
    /// `payload[offset..offset + len]` is new in-order data. `len` may be
    /// shorter than the remainder when the caller's budget ran out.
    Accepted { offset: usize, len: usize },
}

/// Device-side TCP bookkeeping for one flow.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SeqState {
    pub(crate) iss: u32,
    /// Oldest sequence number the device has not acknowledged.
    pub(crate) snd_una: u32,
    pub(crate) snd_nxt: u32,
    pub(crate) rcv_nxt: u32,
    /// `ack` value of our SYN-ACK, kept so a lost SYN-ACK can be resent.
    pub(crate) syn_ack: u32,
    pub(crate) peer_window: u16,
}

impl SeqState {
    pub(crate) fn new(iss: u32, device_isn: u32, peer_window: u16) -> Self {
        let syn_ack = device_isn.wrapping_add(1);
        Self {
            iss,
            snd_una: iss,
            // The SYN occupies one sequence number.
            snd_nxt: iss.wrapping_add(1),
            rcv_nxt: syn_ack,
            syn_ack,
            peer_window,
        }
    }

    /// Whether the device has acknowledged our SYN-ACK.
    pub(crate) fn syn_acked(&self) -> bool {
        self.snd_una != self.iss
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.snd_nxt.wrapping_sub(self.snd_una) as usize
    }

    /// Bytes that can be sent without overrunning the device's window.
    pub(crate) fn send_room(&self) -> usize {
        (self.peer_window as usize).saturating_sub(self.in_flight())
    }

    /// Applies an acknowledgment from the device. Returns true if the usable
    /// window may have grown.
    pub(crate) fn on_ack(&mut self, ack: u32, window: u16) -> bool {
        if seq_lt(ack, self.snd_una) || seq_lt(self.snd_nxt, ack) {
            return false;
        }
        self.snd_una = ack;
        self.peer_window = window;
        true
    }

    /// Classifies a payload at `seq` and advances `rcv_nxt` by at most
    /// `budget` bytes of new data.
    pub(crate) fn accept(&mut self, seq: u32, len: usize, budget: usize) -> Acceptance {
        if len == 0 {
            return Acceptance::Empty;
        }
        let end = seq.wrapping_add(len as u32);
        if seq_le(end, self.rcv_nxt) {
            return Acceptance::Duplicate;
        }
        if seq_lt(self.rcv_nxt, seq) {
            return Acceptance::OutOfOrder;
        }
        let offset = self.rcv_nxt.wrapping_sub(seq) as usize;
        let take = (len - offset).min(budget);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(take as u32);
        Acceptance::Accepted { offset, len: take }
    }

    /// Consumes the device's FIN if every byte before it has been received.
    /// A FIN behind a gap, or one already consumed, is left alone.
    pub(crate) fn accept_fin(&mut self, seq: u32, len: usize) -> bool {
        if seq.wrapping_add(len as u32) != self.rcv_nxt {
            return false;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        true
    }
}

/// Initial send sequence for a new flow.
pub(crate) fn initial_sequence(key: &FlowKey) -> u32 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos() ^ (elapsed.as_secs() as u32).rotate_left(16))
        .unwrap_or(0);
    (hasher.finish() as u32) ^ clock
}
