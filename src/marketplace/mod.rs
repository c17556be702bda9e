pub mod auth;
pub mod config;
pub mod conversations;

pub use conversations::{
    Attachment, AttachmentKind, Channel, MarketplaceClient, RemoteConversation, RemoteMessage,
};
use thiserror::Error;

/// Failures surfaced by the marketplace client. `Forbidden` is kept distinct
/// so callers can tell a scope problem from a transient outage.
#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("marketplace credentials are not configured")]
    NotConnected,
    #[error("marketplace denied access (missing authorization scope)")]
    Forbidden,
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Decode(String),
}
