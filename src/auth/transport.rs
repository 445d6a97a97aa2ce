/// The authorization interaction seam. The PKCE flow suspends on an
/// external, user-driven round trip (browser popup, device flow, manual
/// paste); this trait abstracts it so any interaction surface fits.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use super::AuthError;

/// Tag identifying callback messages that belong to this module.
pub const CALLBACK_SOURCE: &str = "lorebound-oauth";

/// Message delivered by the authorization interaction surface: either
/// `{code, state}` on success or `{error, error_description}` on denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub origin: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl CallbackMessage {
    pub fn success(origin: &str, code: &str, state: &str) -> Self {
        Self {
            origin: origin.to_string(),
            source: CALLBACK_SOURCE.to_string(),
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            error: None,
            error_description: None,
        }
    }

    pub fn denied(origin: &str, error: &str, description: Option<&str>) -> Self {
        Self {
            origin: origin.to_string(),
            source: CALLBACK_SOURCE.to_string(),
            code: None,
            state: None,
            error: Some(error.to_string()),
            error_description: description.map(str::to_string),
        }
    }
}

/// One interaction at a time; `open` supersedes any previous one, `close`
/// tears the surface down whether or not a callback arrived.
#[async_trait]
pub trait AuthorizationTransport: Send + Sync {
    /// Point the interaction surface at the authorization URL.
    async fn open(&self, url: &str) -> Result<(), AuthError>;

    /// Wait for a callback from `trusted_origin`. Messages from any other
    /// origin, or without the module source tag, MUST be ignored without
    /// inspecting their contents. Must reject after `timeout` rather than
    /// hang when the user abandons the interaction.
    async fn await_callback(
        &self,
        trusted_origin: &str,
        timeout: Duration,
    ) -> Result<CallbackMessage, AuthError>;

    async fn close(&self);
}

/// Channel-backed transport for embedding hosts: `open` hands the
/// authorization URL to the host (which renders the popup), and the host
/// pushes origin-tagged callback messages back.
pub struct ChannelTransport {
    url_tx: mpsc::Sender<String>,
    callback_rx: Mutex<mpsc::Receiver<CallbackMessage>>,
}

/// Host-side ends of a [`ChannelTransport`].
pub struct TransportHost {
    /// Authorization URLs to open, one per flow start.
    pub opened_urls: mpsc::Receiver<String>,
    /// Where the interaction surface posts its callback messages.
    pub callbacks: mpsc::Sender<CallbackMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, TransportHost) {
        let (url_tx, url_rx) = mpsc::channel(4);
        let (callback_tx, callback_rx) = mpsc::channel(16);
        (
            Self {
                url_tx,
                callback_rx: Mutex::new(callback_rx),
            },
            TransportHost {
                opened_urls: url_rx,
                callbacks: callback_tx,
            },
        )
    }
}

#[async_trait]
impl AuthorizationTransport for ChannelTransport {
    async fn open(&self, url: &str) -> Result<(), AuthError> {
        self.url_tx
            .send(url.to_string())
            .await
            .map_err(|_| AuthError::InteractionBlocked("host is not listening".to_string()))
    }

    async fn await_callback(
        &self,
        trusted_origin: &str,
        timeout: Duration,
    ) -> Result<CallbackMessage, AuthError> {
        let mut rx = self.callback_rx.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let message = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .map_err(|_| AuthError::Timeout)?;

            let Some(message) = message else {
                return Err(AuthError::AuthorizationDenied(
                    "authorization interaction closed".to_string(),
                ));
            };

            if message.origin != trusted_origin {
                tracing::warn!(origin = %message.origin, "ignoring callback from untrusted origin");
                continue;
            }
            if message.source != CALLBACK_SOURCE {
                continue;
            }

            return Ok(message);
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "https://host.example";

    #[tokio::test]
    async fn test_untrusted_origin_ignored() {
        let (transport, host) = ChannelTransport::new();

        host.callbacks
            .send(CallbackMessage::success("https://evil.example", "abc", "s1"))
            .await
            .unwrap();
        host.callbacks
            .send(CallbackMessage::success(ORIGIN, "def", "s2"))
            .await
            .unwrap();

        let message = transport
            .await_callback(ORIGIN, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(message.code.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn test_foreign_source_ignored() {
        let (transport, host) = ChannelTransport::new();

        let mut foreign = CallbackMessage::success(ORIGIN, "abc", "s1");
        foreign.source = "some-other-module".to_string();
        host.callbacks.send(foreign).await.unwrap();
        host.callbacks
            .send(CallbackMessage::success(ORIGIN, "def", "s2"))
            .await
            .unwrap();

        let message = transport
            .await_callback(ORIGIN, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(message.code.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn test_times_out() {
        let (transport, _host) = ChannelTransport::new();
        let result = transport
            .await_callback(ORIGIN, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(AuthError::Timeout)));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects() {
        let (transport, host) = ChannelTransport::new();
        drop(host);
        let result = transport
            .await_callback(ORIGIN, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(AuthError::AuthorizationDenied(_))));
    }
}
