//! Renewable credentials for mount processes.
//!
//! [`TokenManager::token_source`] wraps a base credential into a
//! [`TokenSource`] that hands out a lease which is always valid for at least
//! the configured expiry delta, refreshing it on demand with single-flight
//! semantics. The helper exposes a source to its mount process over a unix
//! socket (see [`server`]).

pub mod fetcher;
pub mod lease;
pub mod manager;
pub mod server;

pub use fetcher::{FileTokenFetcher, TokenFetcher};
pub use lease::CredentialLease;
pub use manager::{TokenManager, TokenSource};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("No credential available: {0}")]
    Unavailable(String),

    #[error("Credential expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("Credential record error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Token endpoint error: {0}")]
    Io(#[from] std::io::Error),
}
