//! # Heartbeat
//!
//! Liveness probing for the control-plane session.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Heartbeat Tick                                 │
//! │                                                                         │
//! │  sent within skip window? ── yes ──► Skipped (traffic proves liveness) │
//! │            │ no                                                         │
//! │            ▼                                                            │
//! │  POST /heartbeat ── ok ──► Healthy (failures = 0)                      │
//! │            │ transient                                                  │
//! │            ▼                                                            │
//! │  sleep retry_delay, POST again ── ok ──► Healthy                       │
//! │            │ fails                                                      │
//! │            ▼                                                            │
//! │  failures += 1 ──► Failed { failures }                                 │
//! │                    (orchestrator reconnects at max_failures)           │
//! │                                                                         │
//! │  403 at any point ──► Revoked                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HeartbeatConfig;
use crate::control::ControlClient;
use crate::error::UplinkError;
use crate::retry::sleep_or_cancel;

/// Consecutive failures and the last successful outgoing send.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    failures: AtomicU32,
    last_send: Mutex<Option<(Instant, DateTime<Utc>)>>,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch went through: proof of liveness.
    pub fn record_send(&self) {
        *self.last_send.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((Instant::now(), Utc::now()));
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_send_at(&self) -> Option<DateTime<Utc>> {
        self.last_send
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|(_, at)| at)
    }

    /// True if a send succeeded less than `window` ago.
    pub fn sent_within(&self, window: std::time::Duration) -> bool {
        self.last_send
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|(at, _)| at.elapsed() < window)
            .unwrap_or(false)
    }
}

/// Result of one heartbeat tick.
#[derive(Debug)]
pub enum Beat {
    Skipped,
    Healthy,
    Failed { failures: u32, error: UplinkError },
    Revoked(UplinkError),
    Cancelled,
}

/// Runs one heartbeat tick.
pub async fn beat(
    control: &ControlClient,
    state: &HeartbeatState,
    config: &HeartbeatConfig,
    cancel: &CancellationToken,
) -> Beat {
    if state.sent_within(config.skip_window) {
        debug!("Recent send, skipping heartbeat");
        return Beat::Skipped;
    }

    let mut result = control.heartbeat(cancel).await;
    if let Err(e) = &result {
        if e.is_retryable() {
            debug!(error = %e, delay = ?config.retry_delay, "Heartbeat failed, retrying once");
            if sleep_or_cancel(config.retry_delay, cancel).await.is_err() {
                return Beat::Cancelled;
            }
            result = control.heartbeat(cancel).await;
        }
    }

    match result {
        Ok(()) => {
            state.record_success();
            Beat::Healthy
        }
        Err(UplinkError::Cancelled) => Beat::Cancelled,
        Err(e) if e.is_revoked() => Beat::Revoked(e),
        Err(e) => {
            let failures = state.record_failure();
            warn!(failures, max = config.max_failures, error = %e, "Heartbeat failed");
            Beat::Failed { failures, error: e }
        }
    }
}
