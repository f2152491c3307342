//! # Control-Plane Client
//!
//! Bearer-authenticated HTTPS client for the device lifecycle endpoints.
//!
//! ## Failure Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Response → UplinkError                               │
//! │                                                                         │
//! │  2xx                     → Ok(body)                                    │
//! │  401                     → AuthFailed      (refresh token, no retry)   │
//! │  403                     → AccessRevoked   (terminal, no retry)        │
//! │  any other status        → Http{..}        (transient, retried)        │
//! │  connect/read failure    → Network         (transient, retried)        │
//! │  request timeout         → Timeout         (transient, retried)        │
//! │                                                                         │
//! │  Bodies are read in chunks up to `max_response_bytes`; the rest is     │
//! │  discarded.                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The access token lives behind an async `RwLock`: each request clones it
//! under the read lock, so a concurrent [`ControlClient::set_access_token`]
//! only affects requests that start after it.

use chief_protocol::device::{
    paths, ChannelAuthRequest, ChannelAuthResponse, ConnectRequest, ErrorEnvelope, IngestRequest,
    IngestResponse, WelcomeResponse,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::{validate_server_url, ControlConfig, RetryPolicy};
use crate::error::{UplinkError, UplinkResult};
use crate::retry::retry_transient;

/// HTTP client for `/api/device/*`.
pub struct ControlClient {
    http: reqwest::Client,
    base_url: Url,
    config: ControlConfig,
    retry: RetryPolicy,
    token: RwLock<String>,
}

impl ControlClient {
    /// Builds a client. Fails if the server URL is not https and not loopback.
    pub fn new(
        config: ControlConfig,
        retry: RetryPolicy,
        access_token: impl Into<String>,
    ) -> UplinkResult<Self> {
        let base_url = validate_server_url(&config.server_url)?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("chief/{}", config.chief_version))
            .build()
            .map_err(|e| UplinkError::InvalidConfig(e.to_string()))?;

        Ok(ControlClient {
            http,
            base_url,
            config,
            retry,
            token: RwLock::new(access_token.into()),
        })
    }

    /// Server base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Retry policy used by the `*_with_retry` calls.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Replaces the bearer token for subsequent requests.
    pub async fn set_access_token(&self, token: impl Into<String>) {
        *self.token.write().await = token.into();
        debug!("Access token replaced");
    }

    // =========================================================================
    // Device Lifecycle
    // =========================================================================

    /// Registers this device and opens a session.
    pub async fn connect(&self, cancel: &CancellationToken) -> UplinkResult<WelcomeResponse> {
        let request =
            ConnectRequest::for_this_device(&self.config.chief_version, &self.config.device_name);
        let body = self.post(paths::CONNECT, Some(&request), cancel).await?;
        let welcome: WelcomeResponse = decode(&body, paths::CONNECT)?;

        if welcome.kind != "welcome" {
            return Err(UplinkError::InvalidMessage(format!(
                "expected welcome from connect, got '{}'",
                welcome.kind
            )));
        }

        info!(
            device_id = welcome.device_id,
            session_id = %welcome.session_id,
            protocol_version = welcome.protocol_version,
            "Device connected"
        );
        Ok(welcome)
    }

    /// [`connect`](Self::connect) with backoff on transient failures.
    pub async fn connect_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> UplinkResult<WelcomeResponse> {
        retry_transient(&self.retry, cancel, "connect", || self.connect(cancel)).await
    }

    /// Ends the current session.
    pub async fn disconnect(&self, cancel: &CancellationToken) -> UplinkResult<()> {
        self.post::<()>(paths::DISCONNECT, None, cancel).await?;
        info!("Device disconnected");
        Ok(())
    }

    /// Liveness probe.
    pub async fn heartbeat(&self, cancel: &CancellationToken) -> UplinkResult<()> {
        self.post::<()>(paths::HEARTBEAT, None, cancel).await?;
        debug!("Heartbeat acknowledged");
        Ok(())
    }

    /// Uploads one batch of already-serialized messages.
    pub async fn send_messages(
        &self,
        batch_id: &str,
        messages: &[Box<RawValue>],
        cancel: &CancellationToken,
    ) -> UplinkResult<IngestResponse> {
        let request = IngestRequest { batch_id, messages };
        let body = self.post(paths::MESSAGES, Some(&request), cancel).await?;
        let response: IngestResponse = decode(&body, paths::MESSAGES)?;
        debug!(
            batch_id,
            sent = messages.len(),
            accepted = response.accepted,
            "Batch accepted"
        );
        Ok(response)
    }

    /// [`send_messages`](Self::send_messages) with backoff. Every attempt
    /// carries the same batch id so the server can deduplicate.
    pub async fn send_messages_with_retry(
        &self,
        batch_id: &str,
        messages: &[Box<RawValue>],
        cancel: &CancellationToken,
    ) -> UplinkResult<IngestResponse> {
        retry_transient(&self.retry, cancel, "send_messages", || {
            self.send_messages(batch_id, messages, cancel)
        })
        .await
    }

    /// Asks the server to sign a private channel subscription.
    pub async fn channel_auth(
        &self,
        socket_id: &str,
        channel_name: &str,
        cancel: &CancellationToken,
    ) -> UplinkResult<String> {
        let request = ChannelAuthRequest {
            socket_id: socket_id.to_string(),
            channel_name: channel_name.to_string(),
        };
        let body = self.post(paths::CHANNEL_AUTH, Some(&request), cancel).await?;
        let response: ChannelAuthResponse = decode(&body, paths::CHANNEL_AUTH)?;
        Ok(response.auth)
    }

    // =========================================================================
    // Request Plumbing
    // =========================================================================

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
        cancel: &CancellationToken,
    ) -> UplinkResult<Vec<u8>> {
        let url = self.base_url.join(path)?;
        let token = self.token.read().await.clone();

        let mut request = self.http.post(url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let exchange = async {
            let mut response = request.send().await.map_err(|e| self.transport_error(e))?;
            let status = response.status();
            let body = read_capped(&mut response, self.config.max_response_bytes)
                .await
                .map_err(|e| self.transport_error(e))?;
            classify(status, &body)?;
            Ok(body)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UplinkError::Cancelled),
            result = exchange => result,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> UplinkError {
        if err.is_timeout() {
            UplinkError::Timeout(self.config.request_timeout.as_millis() as u64)
        } else {
            UplinkError::from(err)
        }
    }
}

/// Reads the body up to `cap` bytes and drops the rest.
async fn read_capped(response: &mut reqwest::Response, cap: usize) -> reqwest::Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = cap.saturating_sub(body.len());
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            debug!(cap, "Response body truncated");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Maps a non-2xx status to the auth / revoked / transient buckets.
fn classify(status: StatusCode, body: &[u8]) -> UplinkResult<()> {
    if status.is_success() {
        return Ok(());
    }

    let envelope = ErrorEnvelope::parse(body).unwrap_or_default();
    let message = match envelope.description() {
        Some(text) => text.to_string(),
        None if !body.is_empty() => snippet(body),
        None => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };

    match status {
        StatusCode::UNAUTHORIZED => Err(UplinkError::AuthFailed(message)),
        StatusCode::FORBIDDEN => Err(UplinkError::AccessRevoked(message)),
        _ => Err(UplinkError::Http {
            status: status.as_u16(),
            code: envelope.code,
            message,
        }),
    }
}

fn snippet(body: &[u8]) -> String {
    const MAX: usize = 200;
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

fn decode<T: DeserializeOwned>(body: &[u8], endpoint: &str) -> UplinkResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| UplinkError::InvalidMessage(format!("{endpoint}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockServer;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            max_attempts: 0,
            max_auth_refreshes: 3,
        }
    }

    async fn client(server: &MockServer) -> ControlClient {
        ControlClient::new(server.control_config(), fast_retry(), "device-token").unwrap()
    }

    #[test]
    fn test_rejects_insecure_remote_url() {
        let config = ControlConfig {
            server_url: "http://chief.example.com".into(),
            ..ControlConfig::default()
        };
        let err = ControlClient::new(config, RetryPolicy::default(), "t")
            .err()
            .unwrap();
        assert!(matches!(err, UplinkError::InsecureUrl(_)));

        let config = ControlConfig {
            server_url: "http://127.0.0.1:9".into(),
            ..ControlConfig::default()
        };
        assert!(ControlClient::new(config, RetryPolicy::default(), "t").is_ok());
    }

    #[test]
    fn test_classify_statuses() {
        assert!(classify(StatusCode::OK, b"").is_ok());
        assert!(classify(StatusCode::UNAUTHORIZED, b"")
            .unwrap_err()
            .is_auth_failure());
        assert!(classify(StatusCode::FORBIDDEN, b"{}")
            .unwrap_err()
            .is_revoked());

        let err = classify(
            StatusCode::UNPROCESSABLE_ENTITY,
            br#"{"error":"invalid","code":"batch_empty","message":"no messages"}"#,
        )
        .unwrap_err();
        match err {
            UplinkError::Http {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 422);
                assert_eq!(code.as_deref(), Some("batch_empty"));
                assert_eq!(message, "no messages");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = classify(StatusCode::BAD_GATEWAY, b"<html>upstream down</html>").unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("upstream down"));
    }

    #[tokio::test]
    async fn test_connect_returns_welcome() {
        let server = MockServer::start().await;
        let control = client(&server).await;

        let welcome = control.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(welcome.device_id, MockServer::DEVICE_ID);
        assert_eq!(welcome.session_id, "sess-1");
        assert_eq!(welcome.reverb.key, MockServer::APP_KEY);

        let requests = server.requests();
        assert_eq!(requests[0].path, paths::CONNECT);
        assert_eq!(requests[0].auth.as_deref(), Some("Bearer device-token"));
        assert_eq!(requests[0].body["protocol_version"], 1);
    }

    #[tokio::test]
    async fn test_connect_401_is_not_retried() {
        let server = MockServer::start().await;
        server.fail_next(paths::CONNECT, &[401]);
        let control = client(&server).await;

        let err = control
            .connect_with_retry(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(server.count(paths::CONNECT), 1);
    }

    #[tokio::test]
    async fn test_connect_retries_500_until_recovery() {
        let server = MockServer::start().await;
        server.fail_next(paths::CONNECT, &[500, 500]);
        let control = client(&server).await;

        let welcome = control
            .connect_with_retry(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(welcome.device_id, MockServer::DEVICE_ID);
        assert_eq!(server.count(paths::CONNECT), 3);
    }

    #[tokio::test]
    async fn test_403_is_terminal() {
        let server = MockServer::start().await;
        server.fail_next(paths::HEARTBEAT, &[403]);
        let control = client(&server).await;

        let err = control
            .heartbeat(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_revoked());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_send_messages_retry_reuses_batch_id() {
        let server = MockServer::start().await;
        server.fail_next(paths::MESSAGES, &[503]);
        let control = client(&server).await;

        let messages = vec![RawValue::from_string(r#"{"type":"run_progress"}"#.into()).unwrap()];
        let response = control
            .send_messages_with_retry("batch-77", &messages, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.accepted, 1);
        assert_eq!(response.batch_id, "batch-77");

        let bodies: Vec<_> = server
            .requests()
            .into_iter()
            .filter(|r| r.path == paths::MESSAGES)
            .map(|r| r.body)
            .collect();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["batch_id"], "batch-77");
        assert_eq!(bodies[1]["batch_id"], "batch-77");
        assert_eq!(bodies[1]["messages"][0]["type"], "run_progress");
    }

    #[tokio::test]
    async fn test_token_swap_applies_to_next_request() {
        let server = MockServer::start().await;
        let control = client(&server).await;
        let cancel = CancellationToken::new();

        control.heartbeat(&cancel).await.unwrap();
        control.set_access_token("fresh-token").await;
        control.heartbeat(&cancel).await.unwrap();

        let auth: Vec<_> = server.requests().into_iter().map(|r| r.auth).collect();
        assert_eq!(auth[0].as_deref(), Some("Bearer device-token"));
        assert_eq!(auth[1].as_deref(), Some("Bearer fresh-token"));
    }

    #[tokio::test]
    async fn test_channel_auth_signature_verifies() {
        let server = MockServer::start().await;
        let control = client(&server).await;

        let auth = control
            .channel_auth("11.22", "private-chief-server.42", &CancellationToken::new())
            .await
            .unwrap();
        let expected = chief_protocol::pusher::sign_channel(
            MockServer::APP_KEY,
            MockServer::APP_SECRET,
            "11.22",
            "private-chief-server.42",
        )
        .unwrap();
        assert_eq!(auth, expected);
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let server = MockServer::start().await;
        let control = client(&server).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = control.heartbeat(&cancel).await.unwrap_err();
        assert!(matches!(err, UplinkError::Cancelled));
    }
}
