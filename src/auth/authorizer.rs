/// OAuth 2.0 authorization-code + PKCE flow against the identity provider.
///
/// One flow (interactive authorize or refresh) is in flight at a time;
/// concurrent starts serialize on the flow lock, and the transient PKCE
/// session is consumed exactly once per attempt.
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::config::{ConfigStore, SyncConfig};

use super::pkce::PkceSession;
use super::token::{RawToken, TokenStore};
use super::transport::AuthorizationTransport;
use super::AuthError;

const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

pub struct PkceAuthorizer {
    config: Arc<ConfigStore>,
    tokens: Arc<TokenStore>,
    transport: Arc<dyn AuthorizationTransport>,
    client: reqwest::Client,
    session: Mutex<Option<PkceSession>>,
    flow: tokio::sync::Mutex<()>,
    callback_timeout: Duration,
}

impl PkceAuthorizer {
    pub fn new(
        config: Arc<ConfigStore>,
        tokens: Arc<TokenStore>,
        transport: Arc<dyn AuthorizationTransport>,
    ) -> Self {
        Self {
            config,
            tokens,
            transport,
            client: reqwest::Client::new(),
            session: Mutex::new(None),
            flow: tokio::sync::Mutex::new(()),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }

    /// Bound on how long an abandoned authorization interaction may keep
    /// the flow suspended.
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Run the full authorization-code + PKCE flow. Suspends until the
    /// external interaction completes, times out, or is denied. Returns the
    /// raw token payload; normalization is [`TokenStore`]'s job.
    pub async fn authorize(&self) -> Result<RawToken, AuthError> {
        let _flow = self.flow.lock().await;

        let config = self.config.get();
        config.validate_for_authorize()?;
        let trusted_origin = redirect_origin(&config.redirect_url)?;

        let session = PkceSession::generate();
        let auth_url = build_authorize_url(&config, &session)?;
        // a stale session left by an abandoned attempt is superseded here
        *self.session.lock().unwrap() = Some(session);

        if let Err(e) = self.transport.open(&auth_url).await {
            self.session.lock().unwrap().take();
            return Err(e);
        }

        let message = match self
            .transport
            .await_callback(&trusted_origin, self.callback_timeout)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                self.session.lock().unwrap().take();
                self.transport.close().await;
                return Err(e);
            }
        };
        self.transport.close().await;

        if let Some(error) = message.error {
            self.session.lock().unwrap().take();
            let reason = message.error_description.unwrap_or(error);
            return Err(AuthError::AuthorizationDenied(reason));
        }

        // single-use: consumed here whether the attempt succeeds or not
        let session = self
            .session
            .lock()
            .unwrap()
            .take()
            .ok_or(AuthError::NoPendingSession)?;

        // CSRF check, before any token exchange is attempted
        if message.state.as_deref() != Some(session.state.as_str()) {
            return Err(AuthError::StateMismatch);
        }

        let code = message.code.ok_or_else(|| {
            AuthError::AuthorizationDenied("callback carried no authorization code".to_string())
        })?;

        self.exchange_code(&config, &code, &session.verifier).await
    }

    /// Refresh-token grant. Returns `None` when no refresh is possible or
    /// the exchange fails; refresh failure is always recoverable by
    /// re-authorization and never surfaces as an error.
    pub async fn refresh(&self) -> Option<RawToken> {
        let _flow = self.flow.lock().await;

        let config = self.config.get();
        let refresh_token = self.tokens.get()?.refresh_token?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.clone()),
        ];
        if let Some(secret) = config.client_secret.clone() {
            form.push(("client_secret", secret));
        }

        match self.token_request(&config, &form).await {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::error!(error = %e, "token refresh failed");
                None
            }
        }
    }

    async fn exchange_code(
        &self,
        config: &SyncConfig,
        code: &str,
        verifier: &str,
    ) -> Result<RawToken, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", config.redirect_url.clone()),
            ("client_id", config.client_id.clone()),
            ("code_verifier", verifier.to_string()),
        ];
        if let Some(secret) = config.client_secret.clone() {
            form.push(("client_secret", secret));
        }

        self.token_request(config, &form).await
    }

    /// POST form-encoded fields to the token endpoint. Absent fields are
    /// simply not included by callers.
    async fn token_request(
        &self,
        config: &SyncConfig,
        form: &[(&str, String)],
    ) -> Result<RawToken, AuthError> {
        let response = self.client.post(&config.token_url).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenRequestFailed {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

fn build_authorize_url(config: &SyncConfig, session: &PkceSession) -> Result<String, AuthError> {
    let mut url = Url::parse(&config.authorize_url)
        .map_err(|_| AuthError::ConfigIncomplete("authorize_url"))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", &config.redirect_url)
        .append_pair("scope", &config.scope)
        .append_pair("state", &session.state)
        .append_pair("code_challenge", &session.challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url.into())
}

/// Callback messages are trusted only when they come from the redirect
/// URL's own origin.
fn redirect_origin(redirect_url: &str) -> Result<String, AuthError> {
    let url =
        Url::parse(redirect_url).map_err(|_| AuthError::ConfigIncomplete("redirect_url"))?;
    Ok(url.origin().ascii_serialization())
}
