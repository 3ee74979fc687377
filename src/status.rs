//! Engine connection status reported to the host.

use crate::logger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub connected: bool,
    pub error: Option<String>,
}

impl EngineStatus {
    pub fn connected() -> Self {
        Self {
            connected: true,
            error: None,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
        }
    }
}

/// Receives one status when the engine starts and one when it stops or
/// fails. Called from runtime threads, so implementations must not block.
pub trait StatusSink: Send + Sync {
    fn report(&self, status: &EngineStatus);
}

impl StatusSink for crossbeam_channel::Sender<EngineStatus> {
    fn report(&self, status: &EngineStatus) {
        // A host that dropped its receiver has stopped listening.
        let _ = self.try_send(status.clone());
    }
}

/// Fallback used when the host installs no sink.
#[derive(Debug, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn report(&self, status: &EngineStatus) {
        match &status.error {
            Some(error) => logger::error(format!("engine status: failed ({error})")),
            None if status.connected => logger::info("engine status: connected"),
            None => logger::info("engine status: disconnected"),
        }
    }
}
