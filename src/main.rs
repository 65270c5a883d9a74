//! Thyroros CLI - a sandboxing forward proxy for test-run egress control

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use thyroros::{AuditLogger, Config, ProxyServer};

#[derive(Parser)]
#[command(name = "thyroros")]
#[command(about = "A sandboxing forward proxy that restricts test-run egress to an allow-list")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Additional allowed host (repeatable, appended to config entries)
        #[arg(short, long = "allow")]
        allow: Vec<String>,

        /// Audit log path (overrides config)
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bind,
            allow,
            audit_log,
            log_level,
        } => {
            // Initialize logging
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            // Load config
            let mut cfg = if let Some(config_path) = config {
                tracing::info!(path = %config_path.display(), "Loading configuration");
                Config::from_file(&config_path)?
            } else {
                tracing::info!("Using default configuration");
                Config::parse("")?
            };

            // Apply CLI overrides
            if let Some(addr) = bind {
                cfg.proxy.bind_address = addr;
            }
            cfg.allowed_hosts.extend(allow);
            if let Some(path) = audit_log {
                cfg.logging.audit_log = Some(path.to_string_lossy().to_string());
            }

            let audit_log_path = cfg.logging.audit_log.clone();

            // Create server
            let mut server = ProxyServer::new(cfg)?;

            // Open the audit log, starting a fresh record for this run
            if let Some(ref audit_path) = audit_log_path {
                match AuditLogger::create(audit_path) {
                    Ok(logger) => {
                        tracing::info!(path = %audit_path, "Audit log enabled");
                        server = server.with_audit_logger(Arc::new(logger));
                    }
                    Err(e) => {
                        eprintln!("Error: Failed to open audit log '{}': {}", audit_path, e);
                        std::process::exit(1);
                    }
                }
            } else {
                tracing::warn!("Audit log disabled");
            }

            tracing::info!("Starting proxy server...");
            tracing::info!("Configure clients with:");
            tracing::info!("  export HTTP_PROXY=http://{}", server.bind_address());
            tracing::info!("  export HTTPS_PROXY=http://{}", server.bind_address());

            // Handle Ctrl+C
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Bind address: {}", cfg.proxy.bind_address);
            println!("  Connect timeout: {}s", cfg.proxy.connect_timeout_secs);
            println!(
                "  Tunnel idle timeout: {}s",
                cfg.proxy.tunnel_idle_timeout_secs
            );
            println!("  Log level: {}", cfg.logging.level);
            println!(
                "  Log allowed requests: {}",
                cfg.logging.log_allowed_requests
            );
            println!(
                "  Log blocked requests: {}",
                cfg.logging.log_blocked_requests
            );
            println!(
                "  Audit log: {}",
                cfg.logging.audit_log.as_deref().unwrap_or("disabled")
            );
            println!("  Allowed hosts: {}", cfg.allowed_hosts.len());

            if cfg.allowed_hosts.is_empty() {
                println!();
                println!("Warning: the allow-list is empty; every host will be denied.");
            } else {
                println!();
                for (i, host) in cfg.allowed_hosts.iter().enumerate() {
                    println!("  {}. {} (and subdomains)", i + 1, host);
                }
            }
        }
    }

    Ok(())
}
