// Authenticated document sync against the remote journal API

pub mod client;
pub mod document;

pub use client::{SyncAction, SyncClient, SyncEvent, plan};
pub use document::{
    ExternalIdStore, JournalDocument, MemoryExternalIds, NotificationSink, SyncPayload,
    TracingNotifier,
};

use thiserror::Error;

/// Dispatch failures. Internal to the sync pipeline: callers observe a
/// `None` result plus a user-visible notification, never an exception.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync dispatch failed: {status} {body}")]
    DispatchFailed { status: u16, body: String },

    #[error("sync request error: {0}")]
    Http(#[from] reqwest::Error),
}
