//! Per-request dispatch: liveness, CONNECT tunnels, and plain HTTP relay.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;

use super::response::{
    blocked_response, connect_established_response, error_response, health_response,
};
use super::tunnel::TunnelHandler;
use crate::allowlist::{split_host_port, Allowlist, HEALTH_PATH};
use crate::audit::{AuditLogger, Decision, Outcome};
use crate::error::{Error, Result};

/// Main proxy request handler. One value per request, cheap to build from
/// the shared `Arc`s the server owns.
pub struct ProxyHandler {
    allowlist: Arc<Allowlist>,
    tunnel_handler: Arc<TunnelHandler>,
    audit_logger: Option<Arc<AuditLogger>>,
    log_allowed_requests: bool,
    log_blocked_requests: bool,
}

impl ProxyHandler {
    pub fn new(allowlist: Arc<Allowlist>, tunnel_handler: Arc<TunnelHandler>) -> Self {
        Self {
            allowlist,
            tunnel_handler,
            audit_logger: None,
            log_allowed_requests: true,
            log_blocked_requests: true,
        }
    }

    pub fn with_request_logging(mut self, log_allowed: bool, log_blocked: bool) -> Self {
        self.log_allowed_requests = log_allowed;
        self.log_blocked_requests = log_blocked;
        self
    }

    pub fn with_audit_logger(mut self, logger: Option<Arc<AuditLogger>>) -> Self {
        self.audit_logger = logger;
        self
    }

    fn emit_audit(&self, decision: Decision) {
        if let Some(ref logger) = self.audit_logger {
            logger.log(&decision);
        }
    }

    /// Handle an incoming proxy request
    pub async fn handle(
        self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        // CONNECT requests become opaque HTTPS tunnels
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req).await);
        }

        // Everything else is relayed as plain HTTP
        Ok(self.handle_http(req).await)
    }

    async fn handle_connect(self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        // CONNECT targets arrive in authority form: host[:port]
        let host = match req.uri().host() {
            Some(h) => h.to_ascii_lowercase(),
            None => {
                // Unparseable target: fail closed, same as a policy denial.
                let target = req.uri().to_string();
                tracing::warn!(addr = %target, "Malformed CONNECT target");
                self.emit_audit(
                    Decision::new(Outcome::Blocked, "CONNECT", &target)
                        .with_detail("malformed CONNECT target"),
                );
                return blocked_response("CONNECT", &target);
            }
        };
        let port = req.uri().port_u16().unwrap_or(443);
        let target = format!("{}:{}", host, port);

        tracing::debug!(addr = %target, "CONNECT request");

        if !self.allowlist.is_allowed(&host) {
            if self.log_blocked_requests {
                tracing::warn!(addr = %target, "BLOCKED (CONNECT)");
            }
            // No upstream connection is ever attempted for a denied target.
            self.emit_audit(Decision::new(Outcome::Blocked, "CONNECT", &target));
            return blocked_response("CONNECT", &target);
        }

        // Dial the origin before confirming the tunnel, so a failed dial
        // never produces a success response on the client socket.
        let origin = match self.tunnel_handler.dial(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(addr = %target, error = %e, "CONNECT dial failed");
                self.emit_audit(
                    Decision::new(Outcome::Error, "CONNECT", &target).with_detail(e.to_string()),
                );
                return error_response(&e.to_string());
            }
        };

        if self.log_allowed_requests {
            tracing::info!(addr = %target, "ALLOWED (CONNECT)");
        }
        self.emit_audit(Decision::new(Outcome::Allowed, "CONNECT", &target));

        // Get the upgrade future before the request is consumed. Bytes the
        // client sent ahead of the handshake sit in hyper's upgrade buffer
        // and are replayed to the origin first.
        let upgrade = hyper::upgrade::on(req);
        let tunnel_handler = self.tunnel_handler.clone();
        let audit_logger = self.audit_logger.clone();

        tokio::spawn(async move {
            let upgraded = match upgrade.await {
                Ok(u) => u,
                Err(e) => {
                    tracing::debug!(addr = %target, error = %e, "CONNECT upgrade failed");
                    if let Some(ref logger) = audit_logger {
                        logger.log(
                            &Decision::new(Outcome::Error, "CONNECT", &target)
                                .with_detail(format!("upgrade failed: {}", e)),
                        );
                    }
                    return;
                }
            };

            tunnel_handler
                .run(TokioIo::new(upgraded), origin, &target)
                .await;
        });

        connect_established_response()
    }

    async fn handle_http(self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        // The liveness endpoint bypasses the allow-list so monitoring can
        // reach the proxy without an entry.
        if path == HEALTH_PATH {
            tracing::debug!("Health check");
            self.emit_audit(
                Decision::new(Outcome::Allowed, &method, HEALTH_PATH).with_detail("health"),
            );
            return health_response();
        }

        // The Host header names the target; absolute-form proxy requests
        // carry the same information in the URI when the header is absent.
        let raw_host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        let Some(raw_host) = raw_host else {
            if self.log_blocked_requests {
                tracing::warn!(method = %method, path = %path, "BLOCKED (no host)");
            }
            self.emit_audit(
                Decision::new(Outcome::Blocked, &method, &path).with_detail("missing host"),
            );
            return blocked_response(&method, &path);
        };

        let (host_part, header_port) = split_host_port(&raw_host);
        let host = host_part.to_ascii_lowercase();
        let port = header_port.or(req.uri().port_u16()).unwrap_or(80);
        let target = format!("{}{}", host, path);

        if !self.allowlist.is_allowed(&host) {
            if self.log_blocked_requests {
                tracing::warn!(method = %method, url = %target, "BLOCKED (HTTP)");
            }
            self.emit_audit(Decision::new(Outcome::Blocked, &method, &target));
            return blocked_response(&method, &target);
        }

        if self.log_allowed_requests {
            tracing::info!(method = %method, url = %target, "ALLOWED (HTTP)");
        }
        self.emit_audit(Decision::new(Outcome::Allowed, &method, &target));

        match forward_http_request(&self.tunnel_handler, &host, port, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(host = %host, port = %port, error = %e, "HTTP forwarding error");
                self.emit_audit(
                    Decision::new(Outcome::Error, &method, &target).with_detail(e.to_string()),
                );
                error_response(&e.to_string())
            }
        }
    }
}

/// Forward a plain HTTP request to the origin and stream the response back
/// verbatim. Method, path, and headers pass through unchanged; only the URI
/// is rewritten to origin form.
async fn forward_http_request(
    tunnel_handler: &TunnelHandler,
    host: &str,
    port: u16,
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let stream = tunnel_handler.dial(host, port).await?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the upstream connection to completion in the background
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let err_str = e.to_string();
            if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                tracing::debug!(error = %e, "Upstream connection error");
            }
        }
    });

    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let new_uri: hyper::Uri = path_and_query
        .parse()
        .map_err(|e| Error::proxy(format!("Invalid request path '{}': {}", path_and_query, e)))?;

    let mut builder = Request::builder().method(parts.method).uri(new_uri);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }

    // A client speaking strict proxy form may omit Host; the origin still
    // needs one.
    if !parts.headers.contains_key(hyper::header::HOST) {
        if port == 80 {
            builder = builder.header(hyper::header::HOST, host);
        } else {
            builder = builder.header(hyper::header::HOST, format!("{}:{}", host, port));
        }
    }

    let upstream_req = builder
        .body(body)
        .map_err(|e| Error::proxy(format!("Failed to build upstream request: {}", e)))?;

    let resp = sender.send_request(upstream_req).await?;
    Ok(resp.map(|b| b.boxed()))
}
