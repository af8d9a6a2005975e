//! On-disk cache of acquired credentials.
//!
//! One JSON file holds a map of account id to credential record. Writes go
//! through a temporary file and a rename, so a crash mid-write leaves the
//! previous cache intact. The file is plain JSON; it is created with owner
//! -only permissions and its location is the deployment's responsibility.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A persisted credential for one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedCredential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl CachedCredential {
    /// True if the access token is still usable at `now`, keeping `margin`
    /// of headroom before the recorded expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin < self.expires_at
    }
}

/// File-backed credential store.
pub struct TokenCacheStore {
    path: PathBuf,
}

impl TokenCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the credential for `account_id`. A missing file, unreadable
    /// file, or unparsable content is a miss, never an error; corruption
    /// must not lock the client out of re-acquiring.
    pub async fn load(&self, account_id: &str) -> Option<CachedCredential> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "token cache unreadable");
                return None;
            }
        };
        match serde_json::from_slice::<HashMap<String, CachedCredential>>(&bytes) {
            Ok(mut entries) => entries.remove(account_id),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "token cache corrupt, ignoring");
                None
            }
        }
    }

    /// Persists the credential for `account_id`, replacing any prior entry
    /// and leaving other accounts' entries untouched.
    pub async fn store(&self, account_id: &str, credential: &CachedCredential) -> Result<()> {
        let mut entries = self.read_all().await;
        entries.insert(account_id.to_string(), credential.clone());
        self.write_all(&entries).await
    }

    /// Drops the credential for `account_id`, if present.
    pub async fn invalidate(&self, account_id: &str) -> Result<()> {
        let mut entries = self.read_all().await;
        if entries.remove(account_id).is_some() {
            debug!(account_id, "invalidated cached credential");
            self.write_all(&entries).await?;
        }
        Ok(())
    }

    async fn read_all(&self) -> HashMap<String, CachedCredential> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    async fn write_all(&self, entries: &HashMap<String, CachedCredential>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("creating cache directory: {e}")))?;
        }

        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| Error::Storage(format!("writing token cache: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| Error::Storage(format!("setting cache permissions: {e}")))?;
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Storage(format!("replacing token cache: {e}")))?;
        Ok(())
    }
}
