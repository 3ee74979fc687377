use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// What the fake proxy saw: the request head and whether the client closed
/// its socket afterwards.
struct Observed {
    request: String,
    client_closed: bool,
}

/// One-shot fake proxy. Reads the CONNECT head, writes `reply` (if any), then
/// waits for the client to close.
async fn fake_proxy(reply: Option<&'static str>) -> (ProxyConfig, oneshot::Receiver<Observed>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut head = Vec::new();
        let mut chunk = [0u8; 512];
        while header_end(&head).is_none() {
            let read = socket.read(&mut chunk).await.expect("read request");
            if read == 0 {
                break;
            }
            head.extend_from_slice(&chunk[..read]);
        }
        if let Some(reply) = reply {
            socket.write_all(reply.as_bytes()).await.expect("write reply");
        }
        let client_closed = matches!(
            tokio::time::timeout(Duration::from_secs(5), socket.read(&mut chunk)).await,
            Ok(Ok(0)) | Ok(Err(_))
        );
        let _ = tx.send(Observed {
            request: String::from_utf8_lossy(&head).into_owned(),
            client_closed,
        });
    });
    (ProxyConfig::new("127.0.0.1", port), rx)
}

fn quick_timeouts() -> FlowTimeouts {
    FlowTimeouts {
        connect: Duration::from_secs(2),
        response: Duration::from_millis(300),
        ..FlowTimeouts::default()
    }
}

#[test]
fn connect_request_without_credentials() {
    let request = build_connect_request("93.184.216.34:443", &ProxyConfig::new("proxy", 8080));
    assert_eq!(
        request,
        "CONNECT 93.184.216.34:443 HTTP/1.1\r\n\
         Host: 93.184.216.34:443\r\n\
         Connection: keep-alive\r\n\r\n"
    );
}

#[test]
fn connect_request_with_credentials() {
    let config = ProxyConfig::new("proxy", 8080).with_credentials("user", "pass");
    let request = build_connect_request("10.0.0.1:80", &config);
    assert_eq!(
        request,
        "CONNECT 10.0.0.1:80 HTTP/1.1\r\n\
         Host: 10.0.0.1:80\r\n\
         Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
         Connection: keep-alive\r\n\r\n"
    );
}

#[test]
fn success_detection() {
    assert!(is_established(b"HTTP/1.1 200 OK\r\n\r\n"));
    assert!(is_established(b"HTTP/1.0 200 Connection established\r\n\r\n"));
    assert!(is_established(b"HTTP/2 200 Connection established\r\n\r\n"));
    assert!(!is_established(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n"));
    assert!(!is_established(b"HTTP/1.1 502 Bad Gateway\r\n\r\n"));
}

#[test]
fn header_end_points_past_terminator() {
    assert_eq!(header_end(b"HTTP/1.1 200 OK\r\n\r\nabc"), Some(19));
    assert_eq!(header_end(b"HTTP/1.1 200 OK\r\n"), None);
}

#[tokio::test]
async fn tunnel_established_on_200() {
    let (config, observed) =
        fake_proxy(Some("HTTP/1.1 200 Connection established\r\n\r\n")).await;
    let tunnel = ProxyTunnel::open("93.184.216.34", 443, &config, &quick_timeouts(), None)
        .await
        .expect("tunnel");

    assert_eq!(tunnel.target(), "93.184.216.34:443");
    assert!(!tunnel.authenticated());
    assert!(tunnel.leftover().is_empty());
    drop(tunnel);

    let observed = observed.await.expect("observed");
    assert!(observed.request.starts_with("CONNECT 93.184.216.34:443 HTTP/1.1\r\n"));
    assert!(!observed.request.contains("Proxy-Authorization"));
    assert!(observed.client_closed);
}

#[tokio::test]
async fn credentials_are_sent_when_configured() {
    let (config, observed) = fake_proxy(Some("HTTP/1.1 200 OK\r\n\r\n")).await;
    let config = config.with_credentials("user", "pass");
    let tunnel = ProxyTunnel::open("10.0.0.1", 80, &config, &quick_timeouts(), None)
        .await
        .expect("tunnel");
    assert!(tunnel.authenticated());
    drop(tunnel);

    let observed = observed.await.expect("observed");
    assert!(observed
        .request
        .contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

#[tokio::test]
async fn bytes_after_response_head_are_kept() {
    let (config, _observed) =
        fake_proxy(Some("HTTP/1.1 200 Connection established\r\n\r\nSSH-2.0-banner\r\n")).await;
    let tunnel = ProxyTunnel::open("10.0.0.1", 22, &config, &quick_timeouts(), None)
        .await
        .expect("tunnel");
    assert_eq!(tunnel.leftover(), b"SSH-2.0-banner\r\n");

    let (_reader, _writer, leftover) = tunnel.into_split();
    assert_eq!(leftover, b"SSH-2.0-banner\r\n");
}

#[tokio::test]
async fn rejection_closes_socket() {
    let (config, observed) =
        fake_proxy(Some("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")).await;
    let error = ProxyTunnel::open("10.0.0.1", 443, &config, &quick_timeouts(), None)
        .await
        .expect_err("407 must fail");
    match error {
        ProxyError::Rejected { status_line } => {
            assert_eq!(status_line, "HTTP/1.1 407 Proxy Authentication Required");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(observed.await.expect("observed").client_closed);
}

#[tokio::test]
async fn silent_proxy_times_out_and_is_closed() {
    let (config, observed) = fake_proxy(None).await;
    let error = ProxyTunnel::open("10.0.0.1", 443, &config, &quick_timeouts(), None)
        .await
        .expect_err("silence must fail");
    assert!(matches!(error, ProxyError::ResponseTimeout(_)), "{error:?}");
    assert!(observed.await.expect("observed").client_closed);
}

#[tokio::test]
async fn closed_without_response_is_empty() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut chunk = [0u8; 512];
        let _ = socket.read(&mut chunk).await;
    });

    let config = ProxyConfig::new("127.0.0.1", port);
    let error = ProxyTunnel::open("10.0.0.1", 443, &config, &quick_timeouts(), None)
        .await
        .expect_err("eof must fail");
    assert!(matches!(error, ProxyError::EmptyResponse), "{error:?}");
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let config = ProxyConfig::new("127.0.0.1", port);
    let error = ProxyTunnel::open("10.0.0.1", 443, &config, &quick_timeouts(), None)
        .await
        .expect_err("refused must fail");
    assert!(matches!(error, ProxyError::Connect { .. }), "{error:?}");
}

struct CountingProtector {
    calls: AtomicUsize,
    allow: bool,
}

impl SocketProtector for CountingProtector {
    fn protect(&self, _socket: &TcpSocket) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.allow
    }
}

#[tokio::test]
async fn protector_runs_before_connect() {
    let (config, _observed) = fake_proxy(Some("HTTP/1.1 200 OK\r\n\r\n")).await;
    let protector = Arc::new(CountingProtector {
        calls: AtomicUsize::new(0),
        allow: true,
    });
    ProxyTunnel::open("10.0.0.1", 443, &config, &quick_timeouts(), Some(&*protector as &dyn SocketProtector))
        .await
        .expect("tunnel");
    assert_eq!(protector.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn protector_refusal_aborts_dial() {
    let (config, _observed) = fake_proxy(Some("HTTP/1.1 200 OK\r\n\r\n")).await;
    let protector = CountingProtector {
        calls: AtomicUsize::new(0),
        allow: false,
    };
    let error = ProxyTunnel::open("10.0.0.1", 443, &config, &quick_timeouts(), Some(&protector as &dyn SocketProtector))
        .await
        .expect_err("refused protection must fail");
    assert!(matches!(error, ProxyError::ProtectFailed));
}
