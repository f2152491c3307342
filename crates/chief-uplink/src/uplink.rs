//! # Uplink
//!
//! Owns one device session end to end: control-plane registration, the
//! outgoing [`Batcher`], the subscribed broadcast socket and the heartbeat.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Uplink State Machine                            │
//! │                                                                         │
//! │  Disconnected ──connect()──► Connecting ──ok──► Connected              │
//! │                                   │                 │                   │
//! │                                   │ error           │ socket lost /     │
//! │                                   ▼                 │ heartbeat budget  │
//! │                              Disconnected           ▼                   │
//! │                                              Reconnecting ◄──┐          │
//! │                                                 │   │        │ backoff  │
//! │                                  401 (refresh)──┘   └─error──┘          │
//! │                                                 │                       │
//! │                      403 ──► Revoked    refreshes spent ──► AuthFailed │
//! │                                                                         │
//! │  close() from any state ──► Closed                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session Legs
//! ```text
//! connect:   POST /connect ─► subscribe private-chief-server.{id}
//!                                   │ fails → POST /disconnect, error out
//!                                   ▼
//!            spawn: batcher.run │ command forwarder │ socket watcher
//!
//! teardown:  batcher.stop (final flush) ─► cancel session ─► socket close
//! ```
//!
//! Commands from every session are forwarded into one stable
//! [`CommandStream`], so a consumer keeps its handle across reconnects.
//! Background tasks only hold a [`WeakUplink`]; dropping every handle without
//! calling [`Uplink::close`] still lets them wind down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use backoff::backoff::Backoff;
use chief_protocol::device::{channel_name, WelcomeResponse};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{batch_sink, Admission, Batch, BatchSink, Batcher};
use crate::config::{
    BatcherConfig, ControlConfig, HeartbeatConfig, PusherConfig, RetryPolicy, UplinkConfig,
};
use crate::control::ControlClient;
use crate::error::{UplinkError, UplinkResult};
use crate::heartbeat::{self, Beat, HeartbeatState};
use crate::pusher::{channel_authorizer, CommandReceiver, PusherClient};
use crate::retry::sleep_or_cancel;

// =============================================================================
// Status
// =============================================================================

/// Connection state as seen by callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The server answered 403; nothing is retried.
    Revoked,
    /// 401s outlasted every token refresh; nothing is retried.
    AuthFailed,
    Closed,
}

impl ConnectionState {
    /// True for states the uplink never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Revoked | ConnectionState::AuthFailed | ConnectionState::Closed
        )
    }
}

/// Snapshot returned by [`Uplink::status`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct UplinkStatus {
    /// Current connection state
    pub state: ConnectionState,
    /// Server session id, while connected
    pub session_id: Option<String>,
    /// Server-assigned device id, while connected
    pub device_id: Option<i64>,
    /// Consecutive failed heartbeats
    pub heartbeat_failures: u32,
    /// Last batch the server accepted
    pub last_send_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Last error that changed the state
    pub last_error: Option<String>,
    /// Messages waiting in the batcher
    pub buffered: usize,
}

// =============================================================================
// Hooks & Settings
// =============================================================================

/// Called after every successful reconnect, e.g. to resend a state snapshot.
pub type ReconnectHook = Arc<dyn Fn(&Uplink) + Send + Sync>;

/// Produces a fresh access token after a 401 during reconnect.
pub type AuthRefresher = Arc<dyn Fn() -> BoxFuture<'static, UplinkResult<String>> + Send + Sync>;

/// Wraps an async closure as an [`AuthRefresher`].
pub fn auth_refresher<F, Fut>(f: F) -> AuthRefresher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = UplinkResult<String>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Runtime settings for every component of the uplink.
#[derive(Debug, Clone, Default)]
pub struct UplinkSettings {
    pub control: ControlConfig,
    pub batcher: BatcherConfig,
    pub pusher: PusherConfig,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryPolicy,
}

impl UplinkSettings {
    pub fn from_config(config: &UplinkConfig, chief_version: &str) -> Self {
        UplinkSettings {
            control: config.control(chief_version),
            batcher: config.batcher(),
            pusher: config.pusher(),
            heartbeat: config.heartbeat(),
            retry: config.retry(),
        }
    }
}

// =============================================================================
// Command Stream
// =============================================================================

/// Inbound commands from the server, stable across reconnects.
///
/// Clones share one queue: each command goes to exactly one reader.
#[derive(Clone)]
pub struct CommandStream {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Value>>>,
}

impl CommandStream {
    /// Next command, or `None` once the uplink is closed and drained.
    pub async fn recv(&self) -> Option<Value> {
        self.rx.lock().await.recv().await
    }
}

// =============================================================================
// Uplink
// =============================================================================

#[derive(Debug, Clone)]
struct Session {
    session_id: String,
    device_id: i64,
}

#[derive(Debug, Default)]
struct Shared {
    state: ConnectionState,
    session: Option<Session>,
    last_error: Option<String>,
}

/// Per-session components. Replaced wholesale on reconnect.
struct Legs {
    batcher: Batcher,
    pusher: Arc<PusherClient>,
    cancel: CancellationToken,
}

struct Inner {
    control: Arc<ControlClient>,
    settings: UplinkSettings,

    /// Status (state, session, last error)
    shared: RwLock<Shared>,

    /// Live session components, `None` while disconnected
    legs: std::sync::RwLock<Option<Legs>>,

    /// Heartbeat counters and last successful send
    heartbeat: Arc<HeartbeatState>,

    commands_tx: Mutex<Option<mpsc::Sender<Value>>>,
    commands: CommandStream,

    connected: AtomicBool,
    /// A server session may exist that nobody has disconnected yet
    registered: AtomicBool,
    reconnecting: AtomicBool,
    /// Set on terminal states; suppresses reconnects
    halted: AtomicBool,
    closed: AtomicBool,
    heartbeat_started: AtomicBool,

    /// Cancels reconnect attempts and the heartbeat loop
    root: CancellationToken,

    on_reconnect: Option<ReconnectHook>,
    auth_refresher: Option<AuthRefresher>,
}

/// Handle to the device uplink. Cheap to clone.
#[derive(Clone)]
pub struct Uplink {
    inner: Arc<Inner>,
}

/// Non-owning handle held by background tasks.
#[derive(Clone)]
pub struct WeakUplink {
    inner: Weak<Inner>,
}

impl WeakUplink {
    pub fn upgrade(&self) -> Option<Uplink> {
        self.inner.upgrade().map(|inner| Uplink { inner })
    }
}

impl Uplink {
    /// Starts building an uplink that authenticates with `access_token`.
    pub fn builder(settings: UplinkSettings, access_token: impl Into<String>) -> UplinkBuilder {
        UplinkBuilder::new(settings, access_token)
    }

    pub fn downgrade(&self) -> WeakUplink {
        WeakUplink {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Registers the device, subscribes to its command channel and starts the
    /// batcher and heartbeat.
    ///
    /// If the subscription fails after registration the server session is
    /// ended before the error is returned.
    pub async fn connect(&self) -> UplinkResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(UplinkError::Closed);
        }
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting, None).await;
        let result = match self.inner.control.connect_with_retry(&self.inner.root).await {
            Ok(welcome) => self.bring_up(welcome, &self.inner.root).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.start_heartbeat();
                Ok(())
            }
            Err(e) => {
                if e.is_revoked() {
                    self.inner.halted.store(true, Ordering::SeqCst);
                    self.set_state(ConnectionState::Revoked, Some(&e)).await;
                } else {
                    self.set_state(ConnectionState::Disconnected, Some(&e)).await;
                }
                Err(e)
            }
        }
    }

    /// Serializes `payload` and queues it for the next batch.
    ///
    /// Messages sent while the uplink is not connected are dropped.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T, message_type: &str) -> UplinkResult<()> {
        if !self.is_connected() {
            debug!(message_type, "Uplink not connected, dropping message");
            return Ok(());
        }
        let payload = serde_json::value::to_raw_value(payload)?;
        self.send_raw(payload, message_type);
        Ok(())
    }

    /// Queues an already-serialized payload.
    pub fn send_raw(&self, payload: Box<RawValue>, message_type: &str) {
        let batcher = self.legs().as_ref().map(|legs| legs.batcher.clone());
        match batcher {
            Some(batcher) if self.is_connected() => {
                if let Admission::Queued { .. } = batcher.enqueue(payload, message_type) {
                    debug!(message_type, "Message queued");
                }
            }
            _ => debug!(message_type, "Uplink not connected, dropping message"),
        }
    }

    /// Inbound commands. The same stream survives reconnects.
    pub fn receive(&self) -> CommandStream {
        self.inner.commands.clone()
    }

    /// Replaces the bearer token for every later request.
    pub async fn set_access_token(&self, token: impl Into<String>) {
        self.inner.control.set_access_token(token).await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Current status snapshot.
    pub async fn status(&self) -> UplinkStatus {
        let shared = self.inner.shared.read().await;
        UplinkStatus {
            state: shared.state,
            session_id: shared.session.as_ref().map(|s| s.session_id.clone()),
            device_id: shared.session.as_ref().map(|s| s.device_id),
            heartbeat_failures: self.inner.heartbeat.failures(),
            last_send_at: self.inner.heartbeat.last_send_at(),
            last_error: shared.last_error.clone(),
            buffered: self
                .legs()
                .as_ref()
                .map(|legs| legs.batcher.len())
                .unwrap_or(0),
        }
    }

    /// Flushes what is buffered, closes the socket and ends the server
    /// session. Idempotent; later calls return `Ok(())`.
    pub async fn close(&self) -> UplinkResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing uplink");

        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.root.cancel();
        self.inner.connected.store(false, Ordering::SeqCst);

        let legs = self.legs_mut().take();
        if let Some(legs) = legs {
            legs.batcher.stop().await;
            legs.pusher.close().await;
            legs.cancel.cancel();
        }
        // A reconnect in progress has no legs but may still hold a session
        let result = self.end_session().await;

        self.inner
            .commands_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        {
            let mut shared = self.inner.shared.write().await;
            shared.state = ConnectionState::Closed;
            shared.session = None;
        }

        if let Err(e) = &result {
            warn!(error = %e, "Disconnect failed during close");
        }
        info!("Uplink closed");
        result
    }

    // =========================================================================
    // Session Legs
    // =========================================================================

    /// Subscribes to the device channel and starts the per-session tasks.
    async fn bring_up(&self, welcome: WelcomeResponse, cancel: &CancellationToken) -> UplinkResult<()> {
        self.inner.registered.store(true, Ordering::SeqCst);
        let channel = channel_name(welcome.device_id);

        let authorize = {
            let control = self.inner.control.clone();
            let cancel = cancel.clone();
            channel_authorizer(move |socket_id, channel| {
                let control = control.clone();
                let cancel = cancel.clone();
                async move { control.channel_auth(&socket_id, &channel, &cancel).await }
            })
        };

        let connected = PusherClient::connect(
            &self.inner.settings.pusher,
            &welcome.reverb,
            &channel,
            authorize,
            cancel,
        )
        .await;

        let (pusher, commands) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                warn!(
                    error = %e,
                    session_id = %welcome.session_id,
                    "Broadcast subscription failed, ending session"
                );
                if let Err(disconnect_error) = self.end_session().await {
                    debug!(error = %disconnect_error, "Disconnect after failed subscription failed");
                }
                return Err(e);
            }
        };

        let pusher = Arc::new(pusher);
        let session_cancel = CancellationToken::new();
        let batcher = Batcher::new(
            self.inner.settings.batcher.clone(),
            self.batch_sink(session_cancel.clone()),
        );

        let stored = {
            let mut slot = self.legs_mut();
            if self.inner.closed.load(Ordering::SeqCst) {
                false
            } else {
                *slot = Some(Legs {
                    batcher: batcher.clone(),
                    pusher: pusher.clone(),
                    cancel: session_cancel.clone(),
                });
                true
            }
        };
        if !stored {
            pusher.close().await;
            self.end_session_quietly().await;
            return Err(UplinkError::Closed);
        }

        tokio::spawn({
            let batcher = batcher.clone();
            let cancel = session_cancel.clone();
            async move { batcher.run(cancel).await }
        });

        let sender = self
            .inner
            .commands_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sender) = sender {
            tokio::spawn(forward_commands(commands, sender, session_cancel.clone()));
        }

        tokio::spawn(watch_socket(
            self.downgrade(),
            pusher.terminated(),
            session_cancel.clone(),
        ));

        self.inner.heartbeat.reset();
        let closed = {
            let mut shared = self.inner.shared.write().await;
            let closed = self.inner.closed.load(Ordering::SeqCst);
            if !closed {
                shared.state = ConnectionState::Connected;
                shared.session = Some(Session {
                    session_id: welcome.session_id.clone(),
                    device_id: welcome.device_id,
                });
                shared.last_error = None;
                self.inner.connected.store(true, Ordering::SeqCst);
                self.inner.halted.store(false, Ordering::SeqCst);
            }
            closed
        };
        if closed {
            self.end_session_quietly().await;
            return Err(UplinkError::Closed);
        }

        info!(
            session_id = %welcome.session_id,
            device_id = welcome.device_id,
            channel = %channel,
            "Uplink connected"
        );
        Ok(())
    }

    /// Final flush, then stop the socket. Leaves the server session alone.
    async fn teardown(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        let legs = self.legs_mut().take();
        if let Some(legs) = legs {
            legs.batcher.stop().await;
            legs.cancel.cancel();
            legs.pusher.close().await;
        }
    }

    /// Sends `disconnect` once per registered session.
    async fn end_session(&self) -> UplinkResult<()> {
        if !self.inner.registered.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .control
            .disconnect(&CancellationToken::new())
            .await
    }

    async fn end_session_quietly(&self) {
        if let Err(e) = self.end_session().await {
            debug!(error = %e, "Disconnect after close failed");
        }
    }

    fn batch_sink(&self, cancel: CancellationToken) -> BatchSink {
        let control = self.inner.control.clone();
        let heartbeat = self.inner.heartbeat.clone();
        batch_sink(move |batch: Batch| {
            let control = control.clone();
            let heartbeat = heartbeat.clone();
            let cancel = cancel.clone();
            async move {
                control
                    .send_messages_with_retry(&batch.id, &batch.messages, &cancel)
                    .await?;
                heartbeat.record_send();
                Ok(())
            }
        })
    }

    // =========================================================================
    // Reconnection
    // =========================================================================

    /// Starts a reconnect in the background unless one is running or the
    /// uplink is halted.
    fn trigger_reconnect(&self, reason: &'static str) {
        if self.inner.halted.load(Ordering::SeqCst) {
            return;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(reason, "Reconnect already in progress");
            return;
        }

        let uplink = self.clone();
        tokio::spawn(async move {
            uplink.reconnect(reason).await;
            uplink.finish_reconnect();
        });
    }

    /// Releases the reconnect slot. A socket of the new session that died
    /// while the slot was held had its trigger collapsed, so it is picked
    /// up here.
    fn finish_reconnect(&self) {
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        if self.socket_lost() {
            warn!("Broadcast socket lost while reconnecting");
            self.trigger_reconnect("broadcast socket closed");
        }
    }

    fn socket_lost(&self) -> bool {
        self.legs()
            .as_ref()
            .is_some_and(|legs| legs.pusher.terminated().is_cancelled())
    }

    async fn reconnect(&self, reason: &'static str) {
        info!(reason, "Reconnecting");
        self.set_state(ConnectionState::Reconnecting, None).await;
        self.teardown().await;

        let cancel = self.inner.root.clone();
        let retry = &self.inner.settings.retry;
        let mut backoff = retry.backoff();
        let mut attempt: u32 = 0;
        let mut auth_refreshes: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            attempt += 1;

            let result = match self.inner.control.connect(&cancel).await {
                Ok(welcome) => self.bring_up(welcome, &cancel).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    if let Some(hook) = &self.inner.on_reconnect {
                        hook(self);
                    }
                    return;
                }
                Err(UplinkError::Cancelled) | Err(UplinkError::Closed) => return,
                Err(e) if e.is_revoked() => {
                    error!(error = %e, "Device access revoked, giving up");
                    self.halt(ConnectionState::Revoked, &e).await;
                    return;
                }
                Err(e) if e.is_auth_failure() => {
                    auth_refreshes += 1;
                    let Some(refresh) = self
                        .inner
                        .auth_refresher
                        .as_ref()
                        .filter(|_| auth_refreshes <= retry.max_auth_refreshes)
                    else {
                        error!(error = %e, refreshes = auth_refreshes - 1, "Authentication keeps failing, giving up");
                        self.halt(ConnectionState::AuthFailed, &e).await;
                        return;
                    };

                    warn!(attempt, refresh = auth_refreshes, "Authentication failed, refreshing token");
                    match refresh().await {
                        Ok(token) => {
                            self.inner.control.set_access_token(token).await;
                            continue;
                        }
                        Err(refresh_error) => {
                            warn!(error = %refresh_error, "Token refresh failed");
                            self.record_error(&refresh_error).await;
                        }
                    }
                }
                Err(e) => {
                    auth_refreshes = 0;
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.record_error(&e).await;
                }
            }

            let delay = backoff.next_backoff().unwrap_or(retry.max_interval);
            if sleep_or_cancel(delay, &cancel).await.is_err() {
                return;
            }
        }
    }

    /// Enters a terminal state: no more reconnects.
    async fn halt(&self, state: ConnectionState, cause: &UplinkError) {
        self.inner.halted.store(true, Ordering::SeqCst);
        // The server refused this device; there is no session left to end
        self.inner.registered.store(false, Ordering::SeqCst);
        self.teardown().await;
        self.set_state(state, Some(cause)).await;
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    fn start_heartbeat(&self) {
        if self.inner.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(heartbeat_loop(
            self.downgrade(),
            self.inner.settings.heartbeat.interval,
            self.inner.root.clone(),
        ));
    }

    /// One heartbeat tick. Returns false once the loop should stop.
    async fn tick_heartbeat(&self) -> bool {
        let inner = &self.inner;
        if !self.is_connected() || inner.reconnecting.load(Ordering::SeqCst) {
            return true;
        }

        match heartbeat::beat(&inner.control, &inner.heartbeat, &inner.settings.heartbeat, &inner.root)
            .await
        {
            Beat::Skipped | Beat::Healthy => true,
            Beat::Failed { failures, error } => {
                if failures >= inner.settings.heartbeat.max_failures {
                    warn!(failures, error = %error, "Heartbeat failure budget spent");
                    inner.heartbeat.reset();
                    self.record_error(&error).await;
                    self.trigger_reconnect("heartbeat failures");
                }
                true
            }
            Beat::Revoked(e) => {
                error!(error = %e, "Device access revoked");
                self.halt(ConnectionState::Revoked, &e).await;
                true
            }
            Beat::Cancelled => false,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn set_state(&self, state: ConnectionState, cause: Option<&UplinkError>) {
        let mut shared = self.inner.shared.write().await;
        if shared.state == ConnectionState::Closed {
            return;
        }
        if shared.state != state {
            debug!(from = ?shared.state, to = ?state, "Uplink state changed");
        }
        shared.state = state;
        if state != ConnectionState::Connected {
            shared.session = None;
        }
        if let Some(cause) = cause {
            shared.last_error = Some(cause.to_string());
        }
    }

    async fn record_error(&self, cause: &UplinkError) {
        self.inner.shared.write().await.last_error = Some(cause.to_string());
    }

    fn legs(&self) -> RwLockReadGuard<'_, Option<Legs>> {
        self.inner.legs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn legs_mut(&self) -> RwLockWriteGuard<'_, Option<Legs>> {
        self.inner.legs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Moves one session's commands into the stable stream.
async fn forward_commands(
    mut commands: CommandReceiver,
    sender: mpsc::Sender<Value>,
    session: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = session.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        tokio::select! {
            _ = session.cancelled() => break,
            sent = sender.send(command) => if sent.is_err() { break },
        }
    }
}

/// Reconnects when the socket dies on its own.
async fn watch_socket(uplink: WeakUplink, terminated: CancellationToken, session: CancellationToken) {
    tokio::select! {
        _ = session.cancelled() => {}
        _ = terminated.cancelled() => {
            if session.is_cancelled() {
                return;
            }
            if let Some(uplink) = uplink.upgrade() {
                warn!("Broadcast socket lost");
                uplink.trigger_reconnect("broadcast socket closed");
            }
        }
    }
}

async fn heartbeat_loop(uplink: WeakUplink, interval: Duration, cancel: CancellationToken) {
    debug!(interval = ?interval, "Heartbeat loop starting");
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(uplink) = uplink.upgrade() else {
            break;
        };
        if !uplink.tick_heartbeat().await {
            break;
        }
    }
    debug!("Heartbeat loop stopped");
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Uplink`].
pub struct UplinkBuilder {
    settings: UplinkSettings,
    access_token: String,
    on_reconnect: Option<ReconnectHook>,
    auth_refresher: Option<AuthRefresher>,
}

impl UplinkBuilder {
    pub fn new(settings: UplinkSettings, access_token: impl Into<String>) -> Self {
        Self {
            settings,
            access_token: access_token.into(),
            on_reconnect: None,
            auth_refresher: None,
        }
    }

    /// Runs after every successful reconnect.
    pub fn on_reconnect(mut self, hook: impl Fn(&Uplink) + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Arc::new(hook));
        self
    }

    /// Consulted when a reconnect is rejected with 401.
    pub fn auth_refresher(mut self, refresher: AuthRefresher) -> Self {
        self.auth_refresher = Some(refresher);
        self
    }

    /// Validates the settings and builds the uplink. Nothing is dialed yet.
    pub fn build(self) -> UplinkResult<Uplink> {
        let control = ControlClient::new(
            self.settings.control.clone(),
            self.settings.retry.clone(),
            self.access_token,
        )?;

        let (commands_tx, commands_rx) = mpsc::channel(self.settings.pusher.command_buffer.max(1));

        Ok(Uplink {
            inner: Arc::new(Inner {
                control: Arc::new(control),
                settings: self.settings,
                shared: RwLock::new(Shared::default()),
                legs: std::sync::RwLock::new(None),
                heartbeat: Arc::new(HeartbeatState::new()),
                commands_tx: Mutex::new(Some(commands_tx)),
                commands: CommandStream {
                    rx: Arc::new(tokio::sync::Mutex::new(commands_rx)),
                },
                connected: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                heartbeat_started: AtomicBool::new(false),
                root: CancellationToken::new(),
                on_reconnect: self.on_reconnect,
                auth_refresher: self.auth_refresher,
            }),
        })
    }
}
