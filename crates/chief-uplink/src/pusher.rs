//! # Broadcast Socket Client
//!
//! Subscribes to the device's private channel on the Pusher-compatible
//! broadcast server and hands inbound commands to a bounded queue.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PusherClient State Machine                         │
//! │                                                                         │
//! │   ┌──────┐  socket up  ┌─────────────┐  socket_id  ┌───────────────┐   │
//! │   │ Dial │ ──────────► │ Await       │ ──────────► │ Subscribe     │   │
//! │   └──────┘             │ Established │             │ (signed auth) │   │
//! │                        └─────────────┘             └───────┬───────┘   │
//! │                                                            │           │
//! │                                   subscription_succeeded   │           │
//! │                                                            ▼           │
//! │   ┌────────┐  close() / read error / liveness    ┌─────────────────┐   │
//! │   │ Closed │ ◄─────────────────────────────────  │ Active          │   │
//! │   └────────┘                                     │ (read loop task)│   │
//! │                                                  └─────────────────┘   │
//! │                                                                         │
//! │  Any pusher:error or timeout before Active fails connect().            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Liveness
//! The read loop tracks the last inbound frame. After `activity_timeout` of
//! silence it sends `pusher:ping`; if nothing arrives within `pong_grace`
//! after that, the socket is treated as dead and the loop ends.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chief_protocol::device::BroadcastParams;
use chief_protocol::pusher::{
    connect_url, events, ConnectionEstablished, PusherFrame, ServerError,
};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PusherConfig;
use crate::error::{UplinkError, UplinkResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Inbound command payloads, already unwrapped.
pub type CommandReceiver = mpsc::Receiver<Value>;

/// Produces the subscription signature for `(socket_id, channel)`.
pub type ChannelAuthorizer =
    Arc<dyn Fn(String, String) -> BoxFuture<'static, UplinkResult<String>> + Send + Sync>;

/// Wraps an async closure as a [`ChannelAuthorizer`].
pub fn channel_authorizer<F, Fut>(f: F) -> ChannelAuthorizer
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = UplinkResult<String>> + Send + 'static,
{
    Arc::new(move |socket_id, channel| f(socket_id, channel).boxed())
}

/// An established subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub socket_id: String,
    pub channel: String,
    pub activity_timeout: Duration,
}

/// A live, subscribed broadcast socket.
pub struct PusherClient {
    subscription: Subscription,
    writer: Arc<Mutex<WsSink>>,
    close_timeout: Duration,
    shutdown: CancellationToken,
    terminated: CancellationToken,
    closed: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl PusherClient {
    /// Dials, subscribes to `channel`, and starts the read loop.
    ///
    /// Returns the client and the receiving end of its command queue.
    pub async fn connect(
        config: &PusherConfig,
        params: &BroadcastParams,
        channel: &str,
        authorize: ChannelAuthorizer,
        cancel: &CancellationToken,
    ) -> UplinkResult<(PusherClient, CommandReceiver)> {
        let url = connect_url(&params.scheme, &params.host, params.port, &params.key)?;
        debug!(url = %url, channel, "Dialing broadcast server");

        let ws = cancellable(cancel, dial(&url, config.dial_timeout)).await?;
        let (mut write, mut read) = ws.split();

        let established = cancellable(
            cancel,
            await_established(&mut read, config.handshake_timeout),
        )
        .await?;
        debug!(socket_id = %established.socket_id, "Connection established");

        let auth = cancellable(
            cancel,
            authorize(established.socket_id.clone(), channel.to_string()),
        )
        .await?;
        let subscribe = PusherFrame::subscribe(channel, &auth).to_json()?;
        cancellable(cancel, async {
            write
                .send(Message::Text(subscribe.into()))
                .await
                .map_err(UplinkError::from)
        })
        .await?;

        cancellable(
            cancel,
            await_subscribed(&mut read, channel, config.subscribe_timeout),
        )
        .await?;

        let subscription = Subscription {
            socket_id: established.socket_id,
            channel: channel.to_string(),
            activity_timeout: Duration::from_secs(established.activity_timeout.max(1)),
        };
        info!(
            socket_id = %subscription.socket_id,
            channel = %subscription.channel,
            activity_timeout = ?subscription.activity_timeout,
            "Subscribed to private channel"
        );

        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let writer = Arc::new(Mutex::new(write));
        let shutdown = CancellationToken::new();
        let terminated = CancellationToken::new();

        let read_loop = ReadLoop {
            read,
            writer: writer.clone(),
            channel: subscription.channel.clone(),
            activity_timeout: subscription.activity_timeout,
            pong_grace: config.pong_grace,
            commands: commands_tx,
            shutdown: shutdown.clone(),
        };
        let done = terminated.clone();
        let read_task = tokio::spawn(async move {
            read_loop.run().await;
            done.cancel();
        });

        let client = PusherClient {
            subscription,
            writer,
            close_timeout: config.close_timeout,
            shutdown,
            terminated,
            closed: AtomicBool::new(false),
            read_task: Mutex::new(Some(read_task)),
        };
        Ok((client, commands_rx))
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Fires once the read loop has exited, for any reason.
    pub fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a best-effort close frame and waits for the read loop to exit.
    ///
    /// Idempotent. Once this returns nothing more is delivered.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.terminated.cancelled().await;
            return;
        }

        let writer = self.writer.clone();
        let close_frame = async move { writer.lock().await.send(Message::Close(None)).await };
        if timeout(self.close_timeout, close_frame).await.is_err() {
            debug!("Close frame timed out");
        }

        self.shutdown.cancel();
        if let Some(handle) = self.read_task.lock().await.take() {
            let _ = handle.await;
        }
        self.terminated.cancel();
        debug!(channel = %self.subscription.channel, "Broadcast socket closed");
    }
}

impl Drop for PusherClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Handshake
// =============================================================================

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = UplinkResult<T>>,
) -> UplinkResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UplinkError::Cancelled),
        result = fut => result,
    }
}

async fn dial(url: &str, dial_timeout: Duration) -> UplinkResult<WsStream> {
    match timeout(dial_timeout, connect_async(url)).await {
        Ok(Ok((ws, response))) => {
            debug!(status = ?response.status(), "WebSocket handshake complete");
            Ok(ws)
        }
        Ok(Err(e)) => Err(UplinkError::from(e)),
        Err(_) => Err(UplinkError::Timeout(dial_timeout.as_millis() as u64)),
    }
}

/// Next text frame, skipping control frames. `None` once the socket closes.
async fn next_frame(read: &mut WsRead) -> UplinkResult<Option<PusherFrame>> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match PusherFrame::parse(text.as_str()) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!(error = %e, "Skipping malformed frame"),
            },
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn await_established(
    read: &mut WsRead,
    wait: Duration,
) -> UplinkResult<ConnectionEstablished> {
    let handshake = async {
        loop {
            let Some(frame) = next_frame(read).await? else {
                return Err(UplinkError::Disconnected);
            };
            match frame.event.as_str() {
                events::CONNECTION_ESTABLISHED => {
                    return Ok(ConnectionEstablished::from_frame(&frame)?)
                }
                events::ERROR => {
                    return Err(UplinkError::ServerError(
                        ServerError::from_frame(&frame).to_string(),
                    ))
                }
                other => debug!(event = other, "Ignoring frame before handshake"),
            }
        }
    };
    timeout(wait, handshake)
        .await
        .map_err(|_| UplinkError::HandshakeTimeout("connection_established"))?
}

async fn await_subscribed(read: &mut WsRead, channel: &str, wait: Duration) -> UplinkResult<()> {
    let subscribed = async {
        loop {
            let Some(frame) = next_frame(read).await? else {
                return Err(UplinkError::Disconnected);
            };
            if frame.is_for(events::SUBSCRIPTION_SUCCEEDED, channel) {
                return Ok(());
            }
            if frame.event == events::ERROR {
                return Err(UplinkError::ServerError(
                    ServerError::from_frame(&frame).to_string(),
                ));
            }
            debug!(event = %frame.event, "Ignoring frame before subscription");
        }
    };
    timeout(wait, subscribed)
        .await
        .map_err(|_| UplinkError::HandshakeTimeout("subscription_succeeded"))?
}

// =============================================================================
// Read Loop
// =============================================================================

struct ReadLoop {
    read: WsRead,
    writer: Arc<Mutex<WsSink>>,
    channel: String,
    activity_timeout: Duration,
    pong_grace: Duration,
    commands: mpsc::Sender<Value>,
    shutdown: CancellationToken,
}

impl ReadLoop {
    async fn run(mut self) {
        let mut last_seen = Instant::now();
        let mut ping_sent: Option<Instant> = None;

        loop {
            let deadline = match ping_sent {
                Some(sent) => sent + self.pong_grace,
                None => last_seen + self.activity_timeout,
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Read loop shutting down");
                    break;
                }
                incoming = self.read.next() => {
                    last_seen = Instant::now();
                    ping_sent = None;
                    match incoming {
                        Some(Ok(message)) => {
                            if !self.on_message(message).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Broadcast socket read failed");
                            break;
                        }
                        None => {
                            info!("Broadcast socket closed by server");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    if ping_sent.is_some() {
                        warn!(
                            activity_timeout = ?self.activity_timeout,
                            grace = ?self.pong_grace,
                            "No pong from broadcast server, treating socket as dead"
                        );
                        break;
                    }
                    debug!("Socket idle, sending pusher:ping");
                    if !self.send_frame(PusherFrame::ping()).await {
                        break;
                    }
                    ping_sent = Some(Instant::now());
                }
            }
        }
        // Dropping `commands` closes the delivery queue
    }

    /// Handles one message. Returns false when the loop should end.
    async fn on_message(&mut self, message: Message) -> bool {
        match message {
            Message::Text(text) => match PusherFrame::parse(text.as_str()) {
                Ok(frame) => self.on_frame(frame).await,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed frame");
                    true
                }
            },
            Message::Ping(data) => self.send(Message::Pong(data)).await,
            Message::Close(frame) => {
                info!(?frame, "Received close frame");
                false
            }
            _ => true,
        }
    }

    async fn on_frame(&mut self, frame: PusherFrame) -> bool {
        match frame.event.as_str() {
            events::PING => self.send_frame(PusherFrame::pong()).await,
            events::PONG => {
                debug!("Received pusher:pong");
                true
            }
            events::ERROR => {
                warn!(error = %ServerError::from_frame(&frame), "Broadcast server error");
                true
            }
            events::COMMAND if frame.channel.as_deref() == Some(self.channel.as_str()) => {
                self.deliver(frame.payload());
                true
            }
            other => {
                debug!(event = other, channel = ?frame.channel, "Ignoring frame");
                true
            }
        }
    }

    fn deliver(&self, payload: Value) {
        match self.commands.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                let kind = dropped.get("type").and_then(Value::as_str).unwrap_or("unknown");
                warn!(command_type = kind, "Command queue full, dropping command");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Command receiver gone, dropping command");
            }
        }
    }

    async fn send_frame(&self, frame: PusherFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send(Message::Text(json.into())).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                true
            }
        }
    }

    async fn send(&self, message: Message) -> bool {
        let mut writer = self.writer.lock().await;
        match writer.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Broadcast socket write failed");
                false
            }
        }
    }
}
