/// Authenticated sync pipeline: ensure a valid bearer token, then dispatch
/// the document payload. Fail-closed and retry-free; local document state
/// stays authoritative whatever the remote outcome.
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{PkceAuthorizer, Token, TokenStore};
use crate::config::{ConfigStore, SyncConfig, SyncTrigger};

use super::SyncError;
use super::document::{ExternalIdStore, JournalDocument, NotificationSink, SyncPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Create,
    Update,
    Delete,
}

/// Decision for one document event, computed before any network traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Dispatch,
    Skip,
    /// Update/delete with no recorded remote id: a sync-state inconsistency
    /// worth a warning, not an error.
    MissingExternalId,
}

/// Pure pipeline decision shared by all three lifecycle hooks. Testable
/// without a live host or network.
pub fn plan(
    config: &SyncConfig,
    event: SyncEvent,
    doc: &JournalDocument,
    has_external_id: bool,
) -> SyncAction {
    // in manual mode the hooks are inert; sync goes through sync_now
    if config.trigger == SyncTrigger::Manual {
        return SyncAction::Skip;
    }
    if let Some(allowed) = &config.allowed_journals {
        if !allowed.iter().any(|name| name == &doc.container) {
            return SyncAction::Skip;
        }
    }
    if matches!(event, SyncEvent::Update | SyncEvent::Delete) && !has_external_id {
        return SyncAction::MissingExternalId;
    }
    SyncAction::Dispatch
}

pub struct SyncClient {
    config: Arc<ConfigStore>,
    tokens: Arc<TokenStore>,
    authorizer: Arc<PkceAuthorizer>,
    external_ids: Arc<dyn ExternalIdStore>,
    notifier: Arc<dyn NotificationSink>,
    client: reqwest::Client,
    // serializes the expiry check + refresh so concurrent callers await the
    // in-flight refresh instead of issuing duplicates
    refresh_gate: tokio::sync::Mutex<()>,
}

impl SyncClient {
    pub fn new(
        config: Arc<ConfigStore>,
        tokens: Arc<TokenStore>,
        authorizer: Arc<PkceAuthorizer>,
        external_ids: Arc<dyn ExternalIdStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            tokens,
            authorizer,
            external_ids,
            notifier,
            client: reqwest::Client::new(),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// A valid token, refreshing if needed. `None` is the universal "cannot
    /// proceed" signal; the user has already been told to log in again.
    pub async fn ensure_token(&self) -> Option<Token> {
        if let Some(token) = self.tokens.get() {
            if !token.is_expired() {
                return Some(token);
            }
        }

        let _gate = self.refresh_gate.lock().await;

        // another caller may have refreshed while we waited on the gate
        let current = self.tokens.get();
        if let Some(token) = current.as_ref() {
            if !token.is_expired() {
                return Some(token.clone());
            }
        }

        if current.as_ref().is_some_and(|t| t.refresh_token.is_some()) {
            if let Some(raw) = self.authorizer.refresh().await {
                match self.tokens.set(raw) {
                    Ok(token) => return Some(token),
                    Err(e) => tracing::error!(error = %e, "failed to persist refreshed token"),
                }
            }
        }

        self.notifier
            .warn("Lorebound session expired - please log in again");
        None
    }

    /// Authenticated call against the journal API. Returns the parsed JSON
    /// body (`Value::Null` when the response has none, e.g. DELETE), or
    /// `None` when the call could not be made or failed.
    pub async fn dispatch(
        &self,
        path: &str,
        method: Method,
        payload: Option<&SyncPayload>,
    ) -> Option<Value> {
        let token = self.ensure_token().await?;
        let config = self.config.get();
        let url = format!("{}{}", config.api_base_url.trim_end_matches('/'), path);

        match self.try_dispatch(&url, method, &token, payload).await {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::error!(error = %e, url = %url, "sync dispatch failed");
                self.notifier.error("Lorebound sync request failed");
                None
            }
        }
    }

    async fn try_dispatch(
        &self,
        url: &str,
        method: Method,
        token: &Token,
        payload: Option<&SyncPayload>,
    ) -> Result<Value, SyncError> {
        let mut request = self.client.request(method, url).header(
            reqwest::header::AUTHORIZATION,
            format!("{} {}", token.token_type, token.access_token),
        );
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SyncError::DispatchFailed {
                status: status.as_u16(),
                body,
            });
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }

    pub async fn on_create(&self, doc: &JournalDocument) {
        self.handle(SyncEvent::Create, doc).await;
    }

    pub async fn on_update(&self, doc: &JournalDocument) {
        self.handle(SyncEvent::Update, doc).await;
    }

    pub async fn on_delete(&self, doc: &JournalDocument) {
        self.handle(SyncEvent::Delete, doc).await;
    }

    /// Explicit per-document sync, the manual half of the trigger toggle.
    /// Creates or updates depending on whether a remote id is recorded;
    /// the allow-list does not apply to a deliberate user action.
    pub async fn sync_now(&self, doc: &JournalDocument) {
        let config = self.config.get();
        let external_id = self.external_ids.get(&doc.id);
        let event = if external_id.is_some() {
            SyncEvent::Update
        } else {
            SyncEvent::Create
        };
        self.execute(event, doc, &config, external_id).await;
    }

    async fn handle(&self, event: SyncEvent, doc: &JournalDocument) {
        let config = self.config.get();
        let external_id = self.external_ids.get(&doc.id);

        match plan(&config, event, doc, external_id.is_some()) {
            SyncAction::Skip => return,
            SyncAction::MissingExternalId => {
                tracing::warn!(doc = %doc.id, "no external id recorded for document, skipping sync");
                return;
            }
            SyncAction::Dispatch => {}
        }

        self.execute(event, doc, &config, external_id).await;
    }

    async fn execute(
        &self,
        event: SyncEvent,
        doc: &JournalDocument,
        config: &SyncConfig,
        external_id: Option<String>,
    ) {
        match event {
            SyncEvent::Create => {
                let payload = SyncPayload::for_create(doc, config);
                if let Some(body) = self
                    .dispatch(&config.sync_endpoint, Method::POST, Some(&payload))
                    .await
                {
                    match body.get("_id").and_then(Value::as_str) {
                        Some(id) => self.external_ids.set(&doc.id, id),
                        None => {
                            tracing::warn!(doc = %doc.id, "create response carried no _id field")
                        }
                    }
                }
            }
            SyncEvent::Update => {
                let Some(id) = external_id else { return };
                let payload = SyncPayload::for_update(doc);
                self.dispatch(
                    &format!("{}/{}", config.sync_endpoint, id),
                    Method::PUT,
                    Some(&payload),
                )
                .await;
            }
            SyncEvent::Delete => {
                let Some(id) = external_id else { return };
                let deleted = self
                    .dispatch(&format!("{}/{}", config.sync_endpoint, id), Method::DELETE, None)
                    .await;
                if deleted.is_some() {
                    self.external_ids.remove(&doc.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::transport::ChannelTransport;
    use crate::auth::RawToken;
    use crate::storage::MemoryStore;
    use crate::sync::document::MemoryExternalIds;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(&'static str, String)>>,
    }

    impl RecordingNotifier {
        fn recorded(&self, level: &str) -> Vec<String> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .filter(|(l, _)| *l == level)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    impl NotificationSink for RecordingNotifier {
        fn info(&self, message: &str) {
            self.messages.lock().unwrap().push(("info", message.to_string()));
        }
        fn warn(&self, message: &str) {
            self.messages.lock().unwrap().push(("warn", message.to_string()));
        }
        fn error(&self, message: &str) {
            self.messages.lock().unwrap().push(("error", message.to_string()));
        }
    }

    struct Rig {
        client: SyncClient,
        tokens: Arc<TokenStore>,
        external_ids: Arc<MemoryExternalIds>,
        notifier: Arc<RecordingNotifier>,
    }

    fn rig(config: SyncConfig) -> Rig {
        let config = Arc::new(ConfigStore::fixed(config));
        let tokens = Arc::new(TokenStore::new(Arc::new(MemoryStore::new())));
        let (transport, _host) = ChannelTransport::new();
        let authorizer = Arc::new(PkceAuthorizer::new(
            config.clone(),
            tokens.clone(),
            Arc::new(transport),
        ));
        let external_ids = Arc::new(MemoryExternalIds::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let client = SyncClient::new(
            config,
            tokens.clone(),
            authorizer,
            external_ids.clone(),
            notifier.clone(),
        );
        Rig {
            client,
            tokens,
            external_ids,
            notifier,
        }
    }

    fn api_config(server: &mockito::Server, token_url: &str) -> SyncConfig {
        SyncConfig {
            client_id: "app".to_string(),
            api_base_url: server.url(),
            token_url: token_url.to_string(),
            ..SyncConfig::default()
        }
    }

    fn raw_token(access: &str, refresh: Option<&str>, expires_in: i64) -> RawToken {
        RawToken {
            access_token: access.to_string(),
            token_type: None,
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(expires_in),
            expires_at: None,
            received_at: None,
            scope: None,
        }
    }

    fn store_expired(tokens: &TokenStore, access: &str, refresh: Option<&str>) {
        let mut token = Token::normalize(raw_token(access, refresh, 3600));
        token.expires_at = Utc::now() - ChronoDuration::seconds(1);
        tokens.set(token.into()).unwrap();
    }

    fn doc(container: &str) -> JournalDocument {
        JournalDocument {
            id: "d1".to_string(),
            container: container.to_string(),
            title: "Entry".to_string(),
            content: "<p>text</p>".to_string(),
        }
    }

    #[test]
    fn test_plan_manual_trigger_skips_hooks() {
        let config = SyncConfig {
            trigger: SyncTrigger::Manual,
            ..SyncConfig::default()
        };
        assert_eq!(
            plan(&config, SyncEvent::Create, &doc("Lore"), false),
            SyncAction::Skip
        );
    }

    #[test]
    fn test_plan_allow_list() {
        let config = SyncConfig {
            allowed_journals: Some(vec!["Lore".to_string()]),
            ..SyncConfig::default()
        };
        assert_eq!(
            plan(&config, SyncEvent::Create, &doc("Other"), false),
            SyncAction::Skip
        );
        assert_eq!(
            plan(&config, SyncEvent::Create, &doc("Lore"), false),
            SyncAction::Dispatch
        );
    }

    #[test]
    fn test_plan_missing_external_id() {
        let config = SyncConfig::default();
        assert_eq!(
            plan(&config, SyncEvent::Update, &doc("Lore"), false),
            SyncAction::MissingExternalId
        );
        assert_eq!(
            plan(&config, SyncEvent::Delete, &doc("Lore"), true),
            SyncAction::Dispatch
        );
    }

    #[tokio::test]
    async fn test_ensure_token_valid_skips_refresh() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server.mock("POST", "/token").expect(0).create_async().await;

        let rig = rig(api_config(&server, &format!("{}/token", server.url())));
        rig.tokens.set(raw_token("t1", Some("r1"), 3600)).unwrap();

        let token = rig.client.ensure_token().await.unwrap();
        assert_eq!(token.access_token, "t1");
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_token_expired_without_refresh_token() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server.mock("POST", "/token").expect(0).create_async().await;

        let rig = rig(api_config(&server, &format!("{}/token", server.url())));
        store_expired(&rig.tokens, "t1", None);

        assert!(rig.client.ensure_token().await.is_none());
        assert_eq!(rig.notifier.recorded("warn").len(), 1);
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_token_refreshes_expired_token() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "refresh_token".into(),
            ))
            .with_status(200)
            .with_body(json!({"access_token": "t2", "expires_in": 3600}).to_string())
            .create_async()
            .await;

        let rig = rig(api_config(&server, &format!("{}/token", server.url())));
        store_expired(&rig.tokens, "t1", Some("r1"));

        let token = rig.client.ensure_token().await.unwrap();
        assert_eq!(token.access_token, "t2");

        let expected = Utc::now() + ChronoDuration::seconds(3600);
        let drift = (token.expires_at - expected).num_seconds().abs();
        assert!(drift < 5, "expires_at drifted by {drift}s");

        // the refreshed token was persisted
        assert_eq!(rig.tokens.get().unwrap().access_token, "t2");
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_allow_list_filters_container() {
        let mut server = mockito::Server::new_async().await;
        let api_mock = server.mock("POST", "/notes").expect(0).create_async().await;

        let mut config = api_config(&server, "https://idp/token");
        config.allowed_journals = Some(vec!["Lore".to_string()]);
        let rig = rig(config);
        rig.tokens.set(raw_token("t1", None, 3600)).unwrap();

        rig.client.on_create(&doc("Other")).await;
        api_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_records_external_id_then_update() {
        let mut server = mockito::Server::new_async().await;
        let create_mock = server
            .mock("POST", "/notes")
            .match_header("authorization", "Bearer t1")
            .with_status(201)
            .with_body(json!({"_id": "ext-1"}).to_string())
            .create_async()
            .await;
        let update_mock = server
            .mock("PUT", "/notes/ext-1")
            .match_header("authorization", "Bearer t1")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let rig = rig(api_config(&server, "https://idp/token"));
        rig.tokens.set(raw_token("t1", None, 3600)).unwrap();

        rig.client.on_create(&doc("Lore")).await;
        assert_eq!(rig.external_ids.get("d1").as_deref(), Some("ext-1"));

        rig.client.on_update(&doc("Lore")).await;
        create_mock.assert_async().await;
        update_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_without_external_id_warns_and_skips() {
        let mut server = mockito::Server::new_async().await;
        let api_mock = server
            .mock("PUT", mockito::Matcher::Regex("/notes/.*".into()))
            .expect(0)
            .create_async()
            .await;

        let rig = rig(api_config(&server, "https://idp/token"));
        rig.tokens.set(raw_token("t1", None, 3600)).unwrap();

        rig.client.on_update(&doc("Lore")).await;
        api_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_clears_external_id() {
        let mut server = mockito::Server::new_async().await;
        let delete_mock = server
            .mock("DELETE", "/notes/ext-1")
            .with_status(204)
            .create_async()
            .await;

        let rig = rig(api_config(&server, "https://idp/token"));
        rig.tokens.set(raw_token("t1", None, 3600)).unwrap();
        rig.external_ids.set("d1", "ext-1");

        rig.client.on_delete(&doc("Lore")).await;
        assert!(rig.external_ids.get("d1").is_none());
        delete_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_manual_trigger_only_syncs_explicitly() {
        let mut server = mockito::Server::new_async().await;
        let create_mock = server
            .mock("POST", "/notes")
            .with_status(201)
            .with_body(json!({"_id": "ext-9"}).to_string())
            .expect(1)
            .create_async()
            .await;

        let mut config = api_config(&server, "https://idp/token");
        config.trigger = SyncTrigger::Manual;
        let rig = rig(config);
        rig.tokens.set(raw_token("t1", None, 3600)).unwrap();

        // hook is inert in manual mode
        rig.client.on_create(&doc("Lore")).await;
        assert!(rig.external_ids.get("d1").is_none());

        // explicit action syncs
        rig.client.sync_now(&doc("Lore")).await;
        assert_eq!(rig.external_ids.get("d1").as_deref(), Some("ext-9"));
        create_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dispatch_failure_notifies_and_returns_none() {
        let mut server = mockito::Server::new_async().await;
        let _api_mock = server
            .mock("POST", "/notes")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let rig = rig(api_config(&server, "https://idp/token"));
        rig.tokens.set(raw_token("t1", None, 3600)).unwrap();

        rig.client.on_create(&doc("Lore")).await;
        assert!(rig.external_ids.get("d1").is_none());
        assert_eq!(rig.notifier.recorded("error").len(), 1);
    }
}
