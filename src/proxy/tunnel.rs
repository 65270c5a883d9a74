//! CONNECT tunnel handling: origin dialing and bidirectional byte relay.
//!
//! Tunneled traffic is opaque to the proxy. After the policy check and a
//! successful origin dial, the two directions are spliced by independent
//! copy tasks; the first direction to reach end-of-stream or error tears the
//! whole session down and produces the close-time audit decision.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::audit::{AuditLogger, Decision, Outcome};
use crate::error::{Error, Result};

/// Which side of a tunnel session ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    Client,
    Origin,
}

impl CloseInitiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseInitiator::Client => "client",
            CloseInitiator::Origin => "origin",
        }
    }
}

/// Handles outbound dialing and CONNECT splicing.
pub struct TunnelHandler {
    connect_timeout: Duration,
    idle_timeout: Duration,
    audit_logger: Option<Arc<AuditLogger>>,
}

impl TunnelHandler {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
            audit_logger: None,
        }
    }

    /// Set the audit logger for close-time tunnel decisions.
    pub fn with_audit_logger(mut self, logger: Option<Arc<AuditLogger>>) -> Self {
        self.audit_logger = logger;
        self
    }

    fn emit_audit(&self, decision: Decision) {
        if let Some(ref logger) = self.audit_logger {
            logger.log(&decision);
        }
    }

    /// Open a TCP connection to `host:port`, bounded by the connect timeout.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::proxy(format!("Failed to connect to {}: {}", addr, e))),
            Err(_) => Err(Error::proxy(format!(
                "Connection to {} timed out after {}s",
                addr,
                self.connect_timeout.as_secs()
            ))),
        }
    }

    /// Splice bytes between an established client stream and the origin until
    /// either side closes or errors, then tear both down and record the
    /// close-time decision for `target`.
    pub async fn run<C>(&self, client: C, origin: TcpStream, target: &str)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (origin_read, origin_write) = origin.into_split();

        let idle = self.idle_timeout;
        let mut client_to_origin =
            tokio::spawn(copy_with_idle_timeout(client_read, origin_write, idle));
        let mut origin_to_client =
            tokio::spawn(copy_with_idle_timeout(origin_read, client_write, idle));

        // Whichever direction finishes first decides the session's fate.
        let (initiator, result) = tokio::select! {
            res = &mut client_to_origin => (CloseInitiator::Client, res),
            res = &mut origin_to_client => (CloseInitiator::Origin, res),
        };

        // Tear down the other direction; dropping its halves closes both
        // sockets, so neither copy task can outlive the session.
        client_to_origin.abort();
        origin_to_client.abort();

        match result {
            Ok(Ok(bytes)) => {
                tracing::debug!(
                    addr = %target,
                    initiator = initiator.as_str(),
                    bytes,
                    "Tunnel closed"
                );
                self.emit_audit(
                    Decision::new(Outcome::Closed, "CONNECT", target)
                        .with_detail(format!("{}_closed ({} bytes)", initiator.as_str(), bytes)),
                );
            }
            Ok(Err(e)) => {
                tracing::debug!(
                    addr = %target,
                    initiator = initiator.as_str(),
                    error = %e,
                    "Tunnel errored"
                );
                self.emit_audit(
                    Decision::new(Outcome::Error, "CONNECT", target)
                        .with_detail(format!("{} side: {}", initiator.as_str(), e)),
                );
            }
            Err(e) => {
                // A copy task can only fail to join if it panicked.
                tracing::error!(addr = %target, error = %e, "Tunnel task failed");
                self.emit_audit(
                    Decision::new(Outcome::Error, "CONNECT", target)
                        .with_detail(format!("relay task failed: {}", e)),
                );
            }
        }
    }
}

/// Copy bytes from `reader` to `writer` until end-of-stream, bounding each
/// read by `idle`. Shuts the writer down on EOF; the peer may already be
/// gone, so the shutdown result is ignored.
async fn copy_with_idle_timeout<R, W>(mut reader: R, mut writer: W, idle: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "tunnel idle timeout",
                ))
            }
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_report;

    #[test]
    fn test_close_initiator_names() {
        let t = test_report!("CloseInitiator sides have stable names");
        t.assert_eq("client", &CloseInitiator::Client.as_str(), &"client");
        t.assert_eq("origin", &CloseInitiator::Origin.as_str(), &"origin");
    }

    #[tokio::test]
    async fn test_copy_relays_until_eof() {
        let t = test_report!("copy_with_idle_timeout relays bytes and stops at EOF");
        let (mut src_near, src_far) = tokio::io::duplex(64);
        let (dst_near, mut dst_far) = tokio::io::duplex(64);

        let handle = tokio::spawn(copy_with_idle_timeout(
            src_far,
            dst_near,
            Duration::from_secs(5),
        ));

        src_near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        dst_far.read_exact(&mut buf).await.unwrap();
        t.assert_eq("relayed bytes", &&buf[..], &b"ping".as_slice());

        drop(src_near);
        let copied = handle.await.unwrap().unwrap();
        t.assert_eq("total copied", &copied, &4u64);

        // EOF propagated: the destination sees its stream shut down.
        let n = dst_far.read(&mut buf).await.unwrap();
        t.assert_eq("destination EOF", &n, &0usize);
    }

    #[tokio::test]
    async fn test_copy_idle_timeout_errors() {
        let t = test_report!("copy_with_idle_timeout errors after idle bound");
        let (_src_near, src_far) = tokio::io::duplex(64);
        let (dst_near, _dst_far) = tokio::io::duplex(64);

        let result =
            copy_with_idle_timeout(src_far, dst_near, Duration::from_millis(50)).await;
        let err = result.unwrap_err();
        t.assert_eq("timed out", &err.kind(), &io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_dial_refused_port() {
        let t = test_report!("dial reports connection failures");
        // Bind then drop a listener so the port is closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handler = TunnelHandler::new(Duration::from_secs(2), Duration::from_secs(2));
        let result = handler.dial("127.0.0.1", port).await;
        t.assert_true("dial failed", result.is_err());
        let msg = result.unwrap_err().to_string();
        t.assert_contains("error names the address", &msg, &format!("127.0.0.1:{}", port));
    }
}
