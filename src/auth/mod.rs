// OAuth PKCE flow, token lifecycle, and the authorization transport seam

pub mod authorizer;
pub mod pkce;
pub mod token;
pub mod transport;

pub use authorizer::PkceAuthorizer;
pub use pkce::PkceSession;
pub use token::{RawToken, StatusBadge, Token, TokenStore};
pub use transport::{
    AuthorizationTransport, CALLBACK_SOURCE, CallbackMessage, ChannelTransport, TransportHost,
};

use thiserror::Error;

/// Failures of the authorization-code + PKCE flow. Refresh failures are
/// deliberately absent: refresh degrades to `None` and re-authorization.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("oauth configuration incomplete: missing {0}")]
    ConfigIncomplete(&'static str),

    #[error("authorization interaction could not be opened: {0}")]
    InteractionBlocked(String),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// CSRF check failed. Checked before any token exchange is attempted.
    #[error("authorization callback state mismatch")]
    StateMismatch,

    #[error("no pending authorization session")]
    NoPendingSession,

    #[error("timed out waiting for the authorization callback")]
    Timeout,

    #[error("token request failed: {status} {body}")]
    TokenRequestFailed { status: u16, body: String },

    #[error("token endpoint request error: {0}")]
    Http(#[from] reqwest::Error),
}
