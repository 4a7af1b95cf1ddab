use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use super::{CredentialLease, TokenError};
use crate::protocol::VolumeDir;

/// Source of fresh leases used by a [`super::TokenSource`] when its cache runs out.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<CredentialLease, TokenError>;
}

/// Re-reads the base credential that the node daemon keeps current on republish.
#[derive(Debug, Clone)]
pub struct FileTokenFetcher {
    volume_dir: VolumeDir,
}

impl FileTokenFetcher {
    pub fn new(volume_dir: VolumeDir) -> Self {
        Self { volume_dir }
    }
}

#[async_trait]
impl TokenFetcher for FileTokenFetcher {
    async fn fetch(&self) -> Result<CredentialLease, TokenError> {
        let credential = self.volume_dir.read_credential().await?.ok_or_else(|| {
            TokenError::Unavailable(format!(
                "no credential record for volume {}",
                self.volume_dir.volume()
            ))
        })?;

        let lease = CredentialLease::from(credential);
        if !lease.is_valid(std::time::Duration::ZERO) {
            return Err(TokenError::Expired(lease.expiry));
        }
        Ok(lease)
    }
}
