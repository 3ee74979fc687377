//! Engine and upstream proxy configuration.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MTU: usize = 1500;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 9000;

/// Bytes of device data accepted while the proxy dial is still in flight.
pub const DEFAULT_PENDING_BYTES_CAP: usize = 64 * 1024;
/// Depth of each flow's segment queue between the dispatcher and the handler.
pub const DEFAULT_FLOW_EVENT_CAPACITY: usize = 64;
/// Datagrams queued toward the interface writer.
pub const DEFAULT_DEVICE_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("proxy host is empty")]
    EmptyHost,
    #[error("proxy port must be in 1..=65535")]
    InvalidPort,
    #[error("{0} is not valid UTF-8")]
    InvalidString(&'static str),
}

/// Upstream HTTP CONNECT proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(())
    }

    /// Credentials to send, only when both halves are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user, pass))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTimeouts {
    pub connect: Duration,
    pub response: Duration,
    pub idle: Duration,
    pub max_age: Duration,
}

impl Default for FlowTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            response: Duration::from_secs(10),
            idle: Duration::from_secs(30),
            max_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub proxy: ProxyConfig,
    pub mtu: usize,
    pub timeouts: FlowTimeouts,
    pub pending_bytes_cap: usize,
    pub flow_event_capacity: usize,
    pub device_queue_capacity: usize,
    /// How long shutdown waits for flow handlers before giving up on them.
    pub shutdown_grace: Duration,
}

impl EngineConfig {
    pub fn new(proxy: ProxyConfig) -> Self {
        Self {
            proxy,
            mtu: DEFAULT_MTU,
            timeouts: FlowTimeouts::default(),
            pending_bytes_cap: DEFAULT_PENDING_BYTES_CAP,
            flow_event_capacity: DEFAULT_FLOW_EVENT_CAPACITY,
            device_queue_capacity: DEFAULT_DEVICE_QUEUE_CAPACITY,
            shutdown_grace: Duration::from_secs(2),
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = normalize_mtu(mtu);
        self
    }

    /// MSS advertised to the device: MTU minus the IPv4 and TCP headers.
    pub fn mss(&self) -> u16 {
        mss_for_mtu(self.mtu)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()
    }
}

pub fn normalize_mtu(value: usize) -> usize {
    value.clamp(MIN_MTU, MAX_MTU)
}

pub fn mss_for_mtu(mtu: usize) -> u16 {
    (normalize_mtu(mtu) - 40) as u16
}

/// Current proxy settings. Flows read a snapshot when they are created, so
/// an update only affects flows opened after it.
#[derive(Debug)]
pub struct ConfigStore {
    proxy: RwLock<Arc<ProxyConfig>>,
}

impl ConfigStore {
    pub fn new(proxy: ProxyConfig) -> Self {
        Self {
            proxy: RwLock::new(Arc::new(proxy)),
        }
    }

    pub fn proxy(&self) -> Arc<ProxyConfig> {
        Arc::clone(&*self.proxy.read())
    }

    pub fn update_proxy(&self, proxy: ProxyConfig) -> Result<(), ConfigError> {
        proxy.validate()?;
        *self.proxy.write() = Arc::new(proxy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_require_both_halves() {
        let bare = ProxyConfig::new("proxy.local", 8080);
        assert_eq!(bare.credentials(), None);

        let half = ProxyConfig {
            username: Some("user".into()),
            password: Some(String::new()),
            ..bare.clone()
        };
        assert_eq!(half.credentials(), None);

        let full = bare.with_credentials("user", "secret");
        assert_eq!(full.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn validate_rejects_empty_host_and_port_zero() {
        assert_eq!(
            ProxyConfig::new("  ", 8080).validate(),
            Err(ConfigError::EmptyHost)
        );
        assert_eq!(
            ProxyConfig::new("proxy.local", 0).validate(),
            Err(ConfigError::InvalidPort)
        );
        assert!(ProxyConfig::new("proxy.local", 1).validate().is_ok());
    }

    #[test]
    fn mtu_is_clamped() {
        let config = EngineConfig::new(ProxyConfig::new("p", 1));
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.mss(), 1460);
        assert_eq!(config.clone().with_mtu(100).mtu, MIN_MTU);
        assert_eq!(config.with_mtu(65_535).mtu, MAX_MTU);
    }

    #[test]
    fn store_update_keeps_existing_snapshots() {
        let store = ConfigStore::new(ProxyConfig::new("old.local", 3128));
        let before = store.proxy();

        store
            .update_proxy(ProxyConfig::new("new.local", 8080))
            .expect("valid update");
        assert_eq!(before.host, "old.local");
        assert_eq!(store.proxy().host, "new.local");

        assert!(store.update_proxy(ProxyConfig::new("", 8080)).is_err());
        assert_eq!(store.proxy().host, "new.local");
    }
}
