//! Thyroros - a sandboxing forward proxy for test-run network egress control
//!
//! This crate provides a forward proxy that mediates outbound HTTP(S) traffic
//! from automated test runs, permitting only requests to an allow-list of
//! hosts and recording every decision in an audit log.
//!
//! # Features
//!
//! - **Allow-list filtering**: default-deny with exact and subdomain matching
//! - **HTTPS tunneling**: CONNECT requests become opaque bidirectional relays
//! - **Plain HTTP relay**: non-CONNECT requests are forwarded verbatim
//! - **Audit log**: one JSONL decision record per request, reset per run
//!
//! # Example
//!
//! ```no_run
//! use thyroros::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.toml")?;
//!     let server = ProxyServer::new(config)?;
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
//!     server.run_until_shutdown(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod allowlist;
pub mod audit;
pub mod config;
pub mod error;
pub mod proxy;
#[doc(hidden)]
pub mod test_support;

pub use allowlist::Allowlist;
pub use audit::{AuditLogger, Decision, Outcome};
pub use config::Config;
pub use error::{Error, Result};
pub use proxy::ProxyServer;
