use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::protocol::BaseCredential;

/// An access token and the instant it stops being accepted. Lives in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialLease {
    pub access_token: String,
    pub expiry: DateTime<Utc>,
}

impl CredentialLease {
    pub fn new(access_token: impl Into<String>, expiry: DateTime<Utc>) -> Self {
        Self { access_token: access_token.into(), expiry }
    }

    /// Valid at `now` with at least `delta` to spare.
    pub fn is_valid_at(&self, now: DateTime<Utc>, delta: Duration) -> bool {
        let delta = chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delta).map(|t| t < self.expiry).unwrap_or(false)
    }

    pub fn is_valid(&self, delta: Duration) -> bool {
        self.is_valid_at(Utc::now(), delta)
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining(&self) -> Duration {
        (self.expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl From<BaseCredential> for CredentialLease {
    fn from(credential: BaseCredential) -> Self {
        Self { access_token: credential.access_token, expiry: credential.expiry }
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("access_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}
