//! Shared harness for proxy e2e tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use thyroros::{AuditLogger, Config, ProxyServer};

// ---------------------------------------------------------------------------
// TestProxy — wraps ProxyServer with bind + spawn
// ---------------------------------------------------------------------------

pub struct TestProxy {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestProxy {
    /// Start a proxy with the given allow-list and no audit log.
    pub async fn start(allowed_hosts: &[&str]) -> Self {
        Self::start_with_audit(allowed_hosts, None).await
    }

    /// Start a proxy with the given allow-list, optionally writing an audit log.
    pub async fn start_with_audit(allowed_hosts: &[&str], audit_path: Option<&Path>) -> Self {
        let mut config = Config::minimal("127.0.0.1:0".to_string());
        config.allowed_hosts = allowed_hosts.iter().map(|s| s.to_string()).collect();
        config.logging.log_allowed_requests = false;
        config.logging.log_blocked_requests = false;

        let mut server = ProxyServer::new(config).unwrap();
        if let Some(path) = audit_path {
            server = server.with_audit_logger(Arc::new(AuditLogger::create(path).unwrap()));
        }

        let addr = server.bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self { addr, shutdown_tx }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// test_client — reqwest client that routes through the proxy
// ---------------------------------------------------------------------------

pub fn test_client(proxy_addr: SocketAddr) -> reqwest::Client {
    let proxy_url = format!("http://{}", proxy_addr);
    let proxy = reqwest::Proxy::all(&proxy_url).unwrap();

    reqwest::Client::builder().proxy(proxy).build().unwrap()
}

// ---------------------------------------------------------------------------
// EchoOrigin — a raw TCP origin that echoes bytes and counts connections
// ---------------------------------------------------------------------------

pub struct EchoOrigin {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl EchoOrigin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let (mut stream, _) = match result {
                            Ok(conn) => conn,
                            Err(_) => continue,
                        };
                        counter.fetch_add(1, Ordering::SeqCst);

                        tokio::spawn(async move {
                            let mut buf = [0u8; 4096];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });

        Self {
            addr,
            accepted,
            shutdown_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of TCP connections the origin has accepted.
    pub fn connection_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// Raw CONNECT helpers
// ---------------------------------------------------------------------------

/// Issue a CONNECT request through the proxy and read the response head.
/// Returns the stream (positioned after the head) and the head text.
pub async fn connect_through_proxy(proxy_addr: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_response_head(&mut stream).await;
    (stream, head)
}

/// Read an HTTP response head (up to the blank line) one byte at a time so
/// no tunneled payload bytes are consumed.
pub async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => buf.push(byte[0]),
        }
        if buf.len() > 16384 {
            break;
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

// ---------------------------------------------------------------------------
// Audit log helpers
// ---------------------------------------------------------------------------

/// Parse every line of the audit log as JSON.
pub fn read_audit_lines(path: &Path) -> Vec<serde_json::Value> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("audit line is valid JSON"))
        .collect()
}

/// Give spawned relay tasks a moment to finish and flush.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
}
