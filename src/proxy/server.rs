//! Main proxy server

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use super::handler::ProxyHandler;
use super::tunnel::TunnelHandler;
use crate::allowlist::Allowlist;
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::error::{Error, Result};

/// The main proxy server
pub struct ProxyServer {
    config: Config,
    allowlist: Arc<Allowlist>,
    audit_logger: Option<Arc<AuditLogger>>,
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a new proxy server from configuration
    pub fn new(config: Config) -> Result<Self> {
        let allowlist = Arc::new(Allowlist::new(config.allowed_hosts.clone()));

        if allowlist.is_empty() {
            tracing::warn!("Allow-list is empty: every host will be denied");
        }
        tracing::info!(entries = allowlist.len(), "Allow-list initialized");

        Ok(Self {
            config,
            allowlist,
            audit_logger: None,
            listener: None,
        })
    }

    /// Set the audit logger for structured request logging.
    pub fn with_audit_logger(mut self, logger: Arc<AuditLogger>) -> Self {
        self.audit_logger = Some(logger);
        self
    }

    /// Run the proxy server with graceful shutdown
    pub async fn run_until_shutdown(
        mut self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let local_addr = self.bind().await?;
        tracing::info!(address = %local_addr, "Proxy server listening");
        self.serve(shutdown).await
    }

    /// Bind the server to its configured address and return the listen address.
    ///
    /// Useful when binding to port 0 to discover the assigned port.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_address = &self.config.proxy.bind_address;

        let addr: SocketAddr = bind_address.parse().map_err(|e| {
            Error::config(format!("Invalid bind address '{}': {}", bind_address, e))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::proxy(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::proxy(format!("Failed to get local address: {}", e)))?;

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections using a previously bound listener, with graceful shutdown.
    ///
    /// Must call `bind()` first. Panics if no listener is stored.
    pub async fn serve(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let listener = self
            .listener
            .take()
            .expect("must call bind() before serve()");

        let tunnel_handler = Arc::new(self.make_tunnel_handler());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    // Flush pending decisions before the accept loop exits;
                    // in-flight tunnels are abandoned.
                    if let Some(ref logger) = self.audit_logger {
                        logger.flush();
                    }
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    tracing::debug!(client = %client_addr, "New connection");
                    self.spawn_connection(stream, client_addr, &tunnel_handler);
                }
            }
        }
    }

    /// Spawn a task to handle a single connection. A connection's failure
    /// never propagates past its own task.
    fn spawn_connection(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        tunnel_handler: &Arc<TunnelHandler>,
    ) {
        let tunnel_handler = tunnel_handler.clone();
        let allowlist = self.allowlist.clone();
        let log_allowed = self.config.logging.log_allowed_requests;
        let log_blocked = self.config.logging.log_blocked_requests;
        let audit_logger = self.audit_logger.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            let service = service_fn(move |req| {
                let handler = ProxyHandler::new(allowlist.clone(), tunnel_handler.clone())
                    .with_request_logging(log_allowed, log_blocked)
                    .with_audit_logger(audit_logger.clone());
                async move { handler.handle(req).await }
            });

            if let Err(e) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                if !e.to_string().contains("connection closed") {
                    tracing::debug!(client = %client_addr, error = %e, "Connection error");
                }
            }
        });
    }

    fn make_tunnel_handler(&self) -> TunnelHandler {
        TunnelHandler::new(
            Duration::from_secs(self.config.proxy.connect_timeout_secs),
            Duration::from_secs(self.config.proxy.tunnel_idle_timeout_secs),
        )
        .with_audit_logger(self.audit_logger.clone())
    }

    /// Get the bind address
    pub fn bind_address(&self) -> &str {
        &self.config.proxy.bind_address
    }

    /// Get the allow-list
    pub fn allowlist(&self) -> &Arc<Allowlist> {
        &self.allowlist
    }
}
