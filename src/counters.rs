use crate::ffi::FlowCounters;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters shared by the dispatcher and every flow task.
#[derive(Debug, Default)]
pub struct Counters {
    pub packets_read: AtomicU64,
    pub decode_drops: AtomicU64,
    pub non_tcp_ignored: AtomicU64,
    pub flows_opened: AtomicU64,
    pub flows_closed: AtomicU64,
    pub duplicate_syns: AtomicU64,
    pub unsolicited_segments: AtomicU64,
    pub event_drops: AtomicU64,
    pub proxy_failures: AtomicU64,
    pub bytes_device_to_proxy: AtomicU64,
    pub bytes_proxy_to_device: AtomicU64,
    pub segments_synthesized: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlowCounters {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        FlowCounters {
            packets_read: load(&self.packets_read),
            decode_drops: load(&self.decode_drops),
            non_tcp_ignored: load(&self.non_tcp_ignored),
            flows_opened: load(&self.flows_opened),
            flows_closed: load(&self.flows_closed),
            duplicate_syns: load(&self.duplicate_syns),
            unsolicited_segments: load(&self.unsolicited_segments),
            event_drops: load(&self.event_drops),
            proxy_failures: load(&self.proxy_failures),
            bytes_device_to_proxy: load(&self.bytes_device_to_proxy),
            bytes_proxy_to_device: load(&self.bytes_proxy_to_device),
            segments_synthesized: load(&self.segments_synthesized),
        }
    }
}
