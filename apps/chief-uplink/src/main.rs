//! # Chief Agent
//!
//! Keeps this device connected to the Chief server until interrupted.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Chief Agent                                    │
//! │                                                                         │
//! │  config ──► Uplink ──► connect ──► state snapshot                      │
//! │                │                                                        │
//! │                ├── on reconnect ──► state snapshot                     │
//! │                └── CommandStream ──► log                               │
//! │                                                                         │
//! │  Ctrl-C / SIGTERM ──► close (final flush, disconnect)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Environment
//! - `CHIEF_ACCESS_TOKEN` - bearer token, required unless a token file is set
//! - `CHIEF_ACCESS_TOKEN_FILE` - file holding the token; re-read after a 401
//! - `RUST_LOG` - log filter (default `info`)
//!
//! The first argument, if any, is the path of the config file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chief_protocol::tier::message_type;
use chief_uplink::{auth_refresher, Uplink, UplinkConfig, UplinkError, UplinkSettings};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TOKEN_ENV: &str = "CHIEF_ACCESS_TOKEN";
const TOKEN_FILE_ENV: &str = "CHIEF_ACCESS_TOKEN_FILE";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Chief agent");

    let config = UplinkConfig::load(std::env::args_os().nth(1).map(PathBuf::from))
        .context("loading uplink config")?;
    info!(
        server = %config.server.url,
        device = %config.device.name,
        "Configuration loaded"
    );

    let token_file = std::env::var_os(TOKEN_FILE_ENV).map(PathBuf::from);
    let access_token = match &token_file {
        Some(path) => read_token(path).await?,
        None => match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
            _ => bail!("{TOKEN_ENV} or {TOKEN_FILE_ENV} must be set"),
        },
    };

    let settings = UplinkSettings::from_config(&config, env!("CARGO_PKG_VERSION"));
    let device_name = config.device.name.clone();

    let mut builder = Uplink::builder(settings, access_token).on_reconnect({
        let device_name = device_name.clone();
        move |uplink| {
            info!("Reconnected, resending state snapshot");
            if let Err(e) = uplink.send(&state_snapshot(&device_name), message_type::STATE_SNAPSHOT) {
                warn!(error = %e, "Failed to queue state snapshot");
            }
        }
    });
    if let Some(path) = token_file {
        builder = builder.auth_refresher(auth_refresher(move || {
            let path = path.clone();
            async move {
                read_token(&path)
                    .await
                    .map_err(|e| UplinkError::AuthFailed(e.to_string()))
            }
        }));
    }
    let uplink = builder.build()?;

    uplink.connect().await.context("connecting to Chief server")?;
    uplink.send(&state_snapshot(&device_name), message_type::STATE_SNAPSHOT)?;

    let commands = uplink.receive();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            command = commands.recv() => match command {
                Some(command) => log_command(&command),
                None => break,
            },
        }
    }

    let status = uplink.status().await;
    info!(state = ?status.state, buffered = status.buffered, "Shutting down");
    if let Err(e) = uplink.close().await {
        warn!(error = %e, "Uplink did not close cleanly");
    }

    info!("Chief agent stopped");
    Ok(())
}

async fn read_token(path: &Path) -> anyhow::Result<String> {
    let token = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading token file {}", path.display()))?;
    let token = token.trim();
    if token.is_empty() {
        bail!("token file {} is empty", path.display());
    }
    Ok(token.to_string())
}

fn state_snapshot(device_name: &str) -> Value {
    json!({
        "type": message_type::STATE_SNAPSHOT,
        "device": device_name,
        "version": env!("CARGO_PKG_VERSION"),
        "projects": [],
    })
}

fn log_command(command: &Value) {
    let kind = command.get("type").and_then(Value::as_str).unwrap_or("unknown");
    info!(command = kind, payload = %command, "Command received");
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
