//! HTTP CONNECT client for the upstream proxy.
//!
//! Each flow opens its own tunnel; connections are never pooled or reused.

use crate::config::{FlowTimeouts, ProxyConfig};
use crate::logger::{self, BreadcrumbFlags};
use base64::{engine::general_purpose, Engine as _};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;

/// Upper bound on the CONNECT response head.
pub const RESPONSE_BUFFER_LEN: usize = 4096;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const ESTABLISHED_PHRASE: &[u8] = b"200 Connection established";
const MAX_STATUS_LINE: usize = 128;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to resolve proxy {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("proxy {0} resolved to no addresses")]
    NoAddress(String),
    #[error("socket protection refused the proxy connection")]
    ProtectFailed,
    #[error("connect to proxy {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("connect to proxy timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("proxy I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("no CONNECT response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("proxy closed the connection without responding")]
    EmptyResponse,
    #[error("proxy rejected CONNECT: {status_line}")]
    Rejected { status_line: String },
}

/// Hook run on the proxy socket before it connects, so the host can exempt
/// it from its own tunnel (Android's `VpnService.protect`).
pub trait SocketProtector: Send + Sync {
    /// Returning `false` aborts the dial.
    fn protect(&self, socket: &TcpSocket) -> bool;
}

/// An established CONNECT tunnel.
#[derive(Debug)]
pub struct ProxyTunnel {
    stream: TcpStream,
    target: String,
    authenticated: bool,
    leftover: Vec<u8>,
}

impl ProxyTunnel {
    /// Dials the proxy and negotiates a tunnel to `target_host:target_port`.
    /// On any failure the proxy socket is closed before returning.
    pub async fn open(
        target_host: &str,
        target_port: u16,
        config: &ProxyConfig,
        timeouts: &FlowTimeouts,
        protector: Option<&dyn SocketProtector>,
    ) -> Result<Self, ProxyError> {
        let target = format!("{target_host}:{target_port}");
        let mut stream = match timeout(timeouts.connect, connect(config, protector)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::ConnectTimeout(timeouts.connect)),
        };
        logger::breadcrumb(
            BreadcrumbFlags::PROXY,
            format!("connected to proxy {}:{} for {target}", config.host, config.port),
        );

        let request = build_connect_request(&target, config);
        stream.write_all(request.as_bytes()).await?;

        let response = match timeout(timeouts.response, read_response_head(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::ResponseTimeout(timeouts.response)),
        };
        if response.is_empty() {
            return Err(ProxyError::EmptyResponse);
        }

        let head_len = header_end(&response).unwrap_or(response.len());
        if !is_established(&response[..head_len]) {
            return Err(ProxyError::Rejected {
                status_line: status_line(&response),
            });
        }

        let leftover = response[head_len..].to_vec();
        logger::breadcrumb(
            BreadcrumbFlags::PROXY,
            format!("tunnel to {target} established (leftover={})", leftover.len()),
        );
        Ok(Self {
            stream,
            target,
            authenticated: config.credentials().is_some(),
            leftover,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether a `Proxy-Authorization` header was sent.
    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// Bytes the proxy sent after its response head.
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf, Vec<u8>) {
        let (reader, writer) = self.stream.into_split();
        (reader, writer, self.leftover)
    }
}

async fn connect(
    config: &ProxyConfig,
    protector: Option<&dyn SocketProtector>,
) -> Result<TcpStream, ProxyError> {
    let addrs = lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|source| ProxyError::Resolve {
            host: config.host.clone(),
            source,
        })?;

    let mut last_error = None;
    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(protector) = protector {
            if !protector.protect(&socket) {
                return Err(ProxyError::ProtectFailed);
            }
        }
        match socket.connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(source) => last_error = Some(ProxyError::Connect { addr, source }),
        }
    }
    Err(last_error.unwrap_or_else(|| ProxyError::NoAddress(config.host.clone())))
}

/// Reads until the header terminator, a full buffer, or EOF.
async fn read_response_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; RESPONSE_BUFFER_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let read = stream.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
        if header_end(&buf[..filled]).is_some() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

pub fn build_connect_request(target: &str, config: &ProxyConfig) -> String {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((user, pass)) = config.credentials() {
        let encoded = general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("Connection: keep-alive\r\n\r\n");
    request
}

pub fn is_established(head: &[u8]) -> bool {
    head.starts_with(b"HTTP/1.1 200")
        || head.starts_with(b"HTTP/1.0 200")
        || head
            .windows(ESTABLISHED_PHRASE.len())
            .any(|window| window == ESTABLISHED_PHRASE)
}

/// Offset just past the `\r\n\r\n` that ends the response head.
pub fn header_end(response: &[u8]) -> Option<usize> {
    response
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|start| start + HEADER_TERMINATOR.len())
}

fn status_line(response: &[u8]) -> String {
    let end = response
        .iter()
        .position(|byte| *byte == b'\r' || *byte == b'\n')
        .unwrap_or(response.len())
        .min(MAX_STATUS_LINE);
    String::from_utf8_lossy(&response[..end]).into_owned()
}

#[cfg(test)]
mod tests;
