pub mod auth;
pub mod config;
pub mod storage;
pub mod sync;

// Re-export commonly used types
pub use auth::{AuthError, PkceAuthorizer, RawToken, Token, TokenStore};
pub use config::{ConfigStore, SyncConfig, SyncTrigger};
pub use storage::{KeyValueStore, KeyringStore, MemoryStore};
pub use sync::{JournalDocument, SyncClient};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
