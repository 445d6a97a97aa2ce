use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::SyncConfig;

/// Snapshot of a journal document at event time. Built by the host from its
/// live document state; never persisted by the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalDocument {
    /// Host-local document id.
    pub id: String,
    /// Name of the containing journal, matched against the allow-list.
    pub container: String,
    pub title: String,
    pub content: String,
}

/// Outbound payload for the journal API. Rebuilt per call from the
/// document snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPayload {
    pub title: String,
    pub content: String,
    #[serde(rename = "worldId", skip_serializing_if = "Option::is_none")]
    pub world_id: Option<String>,
}

impl SyncPayload {
    /// Create payloads carry the world id so the remote can scope the note.
    pub fn for_create(doc: &JournalDocument, config: &SyncConfig) -> Self {
        Self {
            world_id: (!config.world_id.is_empty()).then(|| config.world_id.clone()),
            ..Self::for_update(doc)
        }
    }

    pub fn for_update(doc: &JournalDocument) -> Self {
        Self {
            title: doc.title.clone(),
            content: if doc.content.is_empty() {
                "Content".to_string()
            } else {
                doc.content.clone()
            },
            world_id: None,
        }
    }
}

/// Per-document remote record ids, kept by the host alongside its documents
/// (the original stores these as a document flag).
pub trait ExternalIdStore: Send + Sync {
    fn get(&self, doc_id: &str) -> Option<String>;
    fn set(&self, doc_id: &str, external_id: &str);
    fn remove(&self, doc_id: &str);
}

#[derive(Default)]
pub struct MemoryExternalIds {
    ids: Mutex<HashMap<String, String>>,
}

impl MemoryExternalIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExternalIdStore for MemoryExternalIds {
    fn get(&self, doc_id: &str) -> Option<String> {
        self.ids.lock().unwrap().get(doc_id).cloned()
    }

    fn set(&self, doc_id: &str, external_id: &str) {
        self.ids
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), external_id.to_string());
    }

    fn remove(&self, doc_id: &str) {
        self.ids.lock().unwrap().remove(doc_id);
    }
}

/// User-visible notices. The host renders these however it wants
/// (toast, status bar, log pane).
pub trait NotificationSink: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Default sink for headless contexts: notices go to the log.
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}
