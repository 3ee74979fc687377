//! Per-flow task: handshake with the device, CONNECT dial, relay, teardown.

use super::packet_builder;
use super::state::{
    initial_sequence, Acceptance, CloseReason, Flow, FlowChannels, FlowKey, FlowState,
    SegmentEvent, SeqState, DEFAULT_MSS,
};
use super::table::FlowTable;
use crate::codec::TcpFlags;
use crate::config::{FlowTimeouts, ProxyConfig};
use crate::counters::Counters;
use crate::device::DeviceWriter;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::proxy::{ProxyTunnel, SocketProtector};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};

#[derive(Clone, Copy, Debug)]
pub(crate) struct FlowSettings {
    /// MSS advertised in our SYN-ACK.
    pub(crate) mss: u16,
    pub(crate) timeouts: FlowTimeouts,
    pub(crate) pending_bytes_cap: usize,
    pub(crate) event_capacity: usize,
}

/// Engine-wide state every handler needs.
pub(crate) struct FlowShared {
    pub(crate) table: Arc<FlowTable>,
    pub(crate) device: DeviceWriter,
    pub(crate) counters: Arc<Counters>,
    pub(crate) protector: Option<Arc<dyn SocketProtector>>,
    pub(crate) settings: FlowSettings,
}

/// Fields of the opening SYN the handler needs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SynInfo {
    pub(crate) seq: u32,
    pub(crate) window: u16,
    pub(crate) mss: Option<u16>,
}

/// Device data ACKed while the dial is still in flight.
struct PendingData {
    chunks: SmallVec<[Vec<u8>; 8]>,
    bytes: usize,
    cap: usize,
}

impl PendingData {
    fn new(cap: usize) -> Self {
        Self {
            chunks: SmallVec::new(),
            bytes: 0,
            cap,
        }
    }

    fn remaining(&self) -> usize {
        self.cap.saturating_sub(self.bytes)
    }

    fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.bytes += data.len();
        self.chunks.push(data.to_vec());
    }
}

struct FlowHandler {
    flow: Arc<Flow>,
    key: FlowKey,
    shared: Arc<FlowShared>,
    seq: Mutex<SeqState>,
    /// Signalled when a device ACK may have opened the send window.
    window: Notify,
    /// Largest payload per segment toward the device.
    send_mss: usize,
}

pub(crate) async fn run(
    flow: Arc<Flow>,
    channels: FlowChannels,
    syn: SynInfo,
    shared: Arc<FlowShared>,
    proxy: Arc<ProxyConfig>,
) {
    let key = flow.key();
    let iss = initial_sequence(&key);
    let send_mss = syn
        .mss
        .unwrap_or(DEFAULT_MSS)
        .min(shared.settings.mss)
        .max(1) as usize;
    let handler = Arc::new(FlowHandler {
        flow,
        key,
        shared,
        seq: Mutex::new(SeqState::new(iss, syn.seq, syn.window)),
        window: Notify::new(),
        send_mss,
    });
    let reason = Arc::clone(&handler).drive(channels, proxy).await;
    handler.finish(reason).await;
}

async fn closed_reason(closed: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    match closed.wait_for(Option::is_some).await {
        Ok(reason) => reason.unwrap_or(CloseReason::Shutdown),
        Err(_) => CloseReason::Shutdown,
    }
}

impl FlowHandler {
    async fn drive(self: Arc<Self>, channels: FlowChannels, proxy: Arc<ProxyConfig>) -> CloseReason {
        let FlowChannels {
            mut events,
            mut closed,
        } = channels;
        let timeouts = self.shared.settings.timeouts;
        let deadline = Instant::from_std(self.flow.created_at()) + timeouts.max_age;

        if let Err(reason) = self.send_syn_ack().await {
            return self.close(reason);
        }
        if !self.flow.advance(FlowState::Proxying) {
            return closed_reason(&mut closed).await;
        }

        let target_host = self.key.dst_ip.to_string();
        let dial = ProxyTunnel::open(
            &target_host,
            self.key.dst_port,
            &proxy,
            &timeouts,
            self.shared.protector.as_deref(),
        );
        tokio::pin!(dial);
        let mut pending = PendingData::new(self.shared.settings.pending_bytes_cap);
        // A FIN taken while dialing still lets the buffered data reach the proxy.
        let mut fin_received = false;

        let dialed = loop {
            tokio::select! {
                reason = closed_reason(&mut closed) => return reason,
                _ = sleep_until(deadline) => return self.close(CloseReason::AgeLimit),
                result = &mut dial => break result,
                Some(event) = events.recv() => {
                    match self.on_early_segment(event, &mut pending).await {
                        Ok(fin) => fin_received |= fin,
                        Err(reason) => return self.close(reason),
                    }
                }
            }
        };

        let tunnel = match dialed {
            Ok(tunnel) => tunnel,
            Err(error) => {
                Counters::bump(&self.shared.counters.proxy_failures);
                logger::rate_limited_error(
                    ErrorCategory::ProxyFailure,
                    format!("flow {}: {error}", self.key),
                );
                let (seq, ack) = self.reply_numbers();
                let _ = self.emit(packet_builder::rst_ack(&self.key, seq, ack)).await;
                return self.close(CloseReason::DialFailed);
            }
        };

        if !self.flow.advance(FlowState::Established) {
            return closed_reason(&mut closed).await;
        }
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "flow {} established via {} (buffered={})",
                self.key,
                tunnel.target(),
                pending.bytes
            ),
        );

        let (reader, mut writer, leftover) = tunnel.into_split();
        let flushed = tokio::select! {
            reason = closed_reason(&mut closed) => Err(reason),
            result = self.flush_pending(&mut writer, pending) => result,
        };
        if let Err(reason) = flushed {
            return self.close(reason);
        }
        if fin_received {
            return self.close(CloseReason::DeviceFin);
        }

        let uplink = tokio::spawn(Arc::clone(&self).relay_device_to_proxy(events, writer));
        let downlink = tokio::spawn(Arc::clone(&self).relay_proxy_to_device(reader, leftover));

        let reason = tokio::select! {
            reason = closed_reason(&mut closed) => reason,
            _ = sleep_until(deadline) => self.close(CloseReason::AgeLimit),
        };

        uplink.abort();
        downlink.abort();
        let _ = uplink.await;
        let _ = downlink.await;
        reason
    }

    /// Starts teardown and returns the reason that won, which differs from
    /// `reason` when another task closed the flow first.
    fn close(&self, reason: CloseReason) -> CloseReason {
        self.flow.close(&self.shared.table, reason);
        self.flow.close_reason().unwrap_or(reason)
    }

    async fn finish(&self, reason: CloseReason) {
        if reason.sends_fin() {
            let (seq, ack) = {
                // A consumed device FIN is already counted in rcv_nxt.
                let state = self.seq.lock();
                (state.snd_nxt, state.rcv_nxt)
            };
            let _ = self.emit(packet_builder::fin_ack(&self.key, seq, ack)).await;
        }
        self.flow.set_state(FlowState::Closed);
        Counters::bump(&self.shared.counters.flows_closed);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("flow {} closed ({})", self.key, reason.as_str()),
        );
    }

    async fn emit(&self, datagram: Vec<u8>) -> Result<(), CloseReason> {
        self.shared
            .device
            .send(datagram)
            .await
            .map_err(|_| CloseReason::DeviceGone)?;
        Counters::bump(&self.shared.counters.segments_synthesized);
        Ok(())
    }

    fn reply_numbers(&self) -> (u32, u32) {
        let state = self.seq.lock();
        (state.snd_nxt, state.rcv_nxt)
    }

    async fn send_ack(&self) -> Result<(), CloseReason> {
        let (seq, ack) = self.reply_numbers();
        self.emit(packet_builder::ack(&self.key, seq, ack)).await
    }

    async fn send_syn_ack(&self) -> Result<(), CloseReason> {
        let (iss, ack) = {
            let state = self.seq.lock();
            (state.iss, state.syn_ack)
        };
        self.emit(packet_builder::syn_ack(
            &self.key,
            iss,
            ack,
            self.shared.settings.mss,
        ))
        .await
    }

    /// A repeated SYN means our SYN-ACK was lost; resend it unless the
    /// device has already acknowledged it.
    async fn on_duplicate_syn(&self) -> Result<(), CloseReason> {
        if self.seq.lock().syn_acked() {
            return Ok(());
        }
        self.send_syn_ack().await
    }

    /// Applies the segment's ACK and classifies its payload, accepting at
    /// most `budget` new bytes.
    fn absorb(&self, event: &SegmentEvent, budget: usize) -> Acceptance {
        let (acceptance, window_grew) = {
            let mut state = self.seq.lock();
            let grew = event.flags.contains(TcpFlags::ACK) && state.on_ack(event.ack, event.window);
            (state.accept(event.seq, event.payload.len(), budget), grew)
        };
        if window_grew {
            self.window.notify_one();
        }
        acceptance
    }

    /// Handles a segment that arrives before the tunnel is up. Returns
    /// whether it carried the device's FIN in sequence.
    async fn on_early_segment(
        &self,
        event: SegmentEvent,
        pending: &mut PendingData,
    ) -> Result<bool, CloseReason> {
        if event.flags.contains(TcpFlags::SYN) {
            return self.on_duplicate_syn().await.map(|()| false);
        }
        let acceptance = self.absorb(&event, pending.remaining());
        if let Acceptance::Accepted { offset, len } = acceptance {
            pending.push(&event.payload[offset..offset + len]);
        }
        let is_fin = event.flags.contains(TcpFlags::FIN);
        if acceptance == Acceptance::Empty && !is_fin {
            return Ok(false);
        }
        let fin = is_fin && self.seq.lock().accept_fin(event.seq, event.payload.len());
        self.send_ack().await?;
        Ok(fin)
    }

    async fn flush_pending(
        &self,
        writer: &mut OwnedWriteHalf,
        pending: PendingData,
    ) -> Result<(), CloseReason> {
        for chunk in pending.chunks {
            writer
                .write_all(&chunk)
                .await
                .map_err(|_| CloseReason::ProxyWriteFailed)?;
            Counters::add(&self.shared.counters.bytes_device_to_proxy, chunk.len());
        }
        Ok(())
    }

    async fn relay_device_to_proxy(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SegmentEvent>,
        mut writer: OwnedWriteHalf,
    ) {
        let reason = loop {
            let Some(event) = events.recv().await else {
                break CloseReason::Shutdown;
            };
            if event.flags.contains(TcpFlags::SYN) {
                if let Err(reason) = self.on_duplicate_syn().await {
                    break reason;
                }
                continue;
            }
            let acceptance = self.absorb(&event, usize::MAX);
            if let Acceptance::Accepted { offset, len } = acceptance {
                if let Err(error) = writer.write_all(&event.payload[offset..offset + len]).await {
                    logger::breadcrumb(
                        BreadcrumbFlags::RELAY,
                        format!("flow {}: proxy write failed: {error}", self.key),
                    );
                    break CloseReason::ProxyWriteFailed;
                }
                Counters::add(&self.shared.counters.bytes_device_to_proxy, len);
            }
            if event.flags.contains(TcpFlags::FIN) {
                // Teardown acknowledges the FIN together with its payload.
                if self.seq.lock().accept_fin(event.seq, event.payload.len()) {
                    break CloseReason::DeviceFin;
                }
            } else if acceptance == Acceptance::Empty {
                continue;
            }
            if let Err(reason) = self.send_ack().await {
                break reason;
            }
        };
        self.close(reason);
    }

    async fn relay_proxy_to_device(self: Arc<Self>, mut reader: OwnedReadHalf, leftover: Vec<u8>) {
        let reason = match self.deliver(&leftover).await {
            Ok(()) => self.pump(&mut reader).await,
            Err(reason) => reason,
        };
        self.close(reason);
    }

    async fn pump(&self, reader: &mut OwnedReadHalf) -> CloseReason {
        let idle = self.shared.settings.timeouts.idle;
        let mut buf = vec![0u8; self.send_mss];
        loop {
            let room = match self.wait_for_room().await {
                Ok(room) => room,
                Err(reason) => return reason,
            };
            let limit = room.min(buf.len());
            match timeout(idle, reader.read(&mut buf[..limit])).await {
                Err(_) => return CloseReason::IdleTimeout,
                Ok(Err(error)) => {
                    logger::breadcrumb(
                        BreadcrumbFlags::RELAY,
                        format!("flow {}: proxy read failed: {error}", self.key),
                    );
                    return CloseReason::ProxyReadFailed;
                }
                Ok(Ok(0)) => return CloseReason::ProxyEof,
                Ok(Ok(read)) => {
                    if let Err(reason) = self.send_data(&buf[..read]).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Sends `data` as MSS-sized segments, respecting the device's window.
    async fn deliver(&self, mut data: &[u8]) -> Result<(), CloseReason> {
        while !data.is_empty() {
            let room = self.wait_for_room().await?;
            let take = room.min(self.send_mss).min(data.len());
            self.send_data(&data[..take]).await?;
            data = &data[take..];
        }
        Ok(())
    }

    async fn send_data(&self, chunk: &[u8]) -> Result<(), CloseReason> {
        let datagram = {
            let mut state = self.seq.lock();
            let datagram = packet_builder::data(&self.key, state.snd_nxt, state.rcv_nxt, chunk);
            state.snd_nxt = state.snd_nxt.wrapping_add(chunk.len() as u32);
            datagram
        };
        self.emit(datagram).await?;
        Counters::add(&self.shared.counters.bytes_proxy_to_device, chunk.len());
        Ok(())
    }

    /// Waits until the device's window has room. A window that stays shut
    /// for the idle timeout ends the flow.
    async fn wait_for_room(&self) -> Result<usize, CloseReason> {
        let deadline = Instant::now() + self.shared.settings.timeouts.idle;
        loop {
            let room = self.seq.lock().send_room();
            if room > 0 {
                return Ok(room);
            }
            if timeout_at(deadline, self.window.notified()).await.is_err() {
                return Err(CloseReason::IdleTimeout);
            }
        }
    }
}
