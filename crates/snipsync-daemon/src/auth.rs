//! Persisted authentication state.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use snipsync_core::{keys, Partition, StoreError};
use tracing::{debug, info, warn};

use crate::remote::TokenGrant;

/// Longest token lifetime taken at face value (a leap year).
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 366 * 24 * 60 * 60;

/// Clamp a server-supplied `expires_in` to [`MAX_TOKEN_LIFETIME_SECS`].
pub fn clamp_expires_in(expires_in: u64) -> u64 {
    expires_in.min(MAX_TOKEN_LIFETIME_SECS)
}

/// Access token, refresh token and absolute expiry in the local partition.
pub struct AuthStore {
    partition: Arc<dyn Partition>,
}

impl AuthStore {
    pub fn new(partition: Arc<dyn Partition>) -> Self {
        Self { partition }
    }

    pub async fn access_token(&self) -> Result<Option<String>, StoreError> {
        self.partition.get(keys::ACCESS_TOKEN).await
    }

    pub async fn refresh_token(&self) -> Result<Option<String>, StoreError> {
        self.partition.get(keys::REFRESH_TOKEN).await
    }

    pub async fn is_authenticated(&self) -> Result<bool, StoreError> {
        Ok(self.access_token().await?.is_some())
    }

    /// Absolute expiry of the access token, if recorded.
    pub async fn expires_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(raw) = self.partition.get(keys::TOKEN_EXPIRES_AT).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
            Err(e) => {
                warn!("Ignoring unparseable token expiry '{}': {}", raw, e);
                Ok(None)
            }
        }
    }

    /// Record the expiry `expires_in` seconds from now. Returns the absolute time.
    pub async fn set_expires_in(&self, expires_in: u64) -> Result<DateTime<Utc>, StoreError> {
        let lifetime = clamp_expires_in(expires_in);
        if lifetime < expires_in {
            warn!(
                "Token lifetime of {}s is out of range, using {}s",
                expires_in, lifetime
            );
        }
        let now = Utc::now();
        let expires_at = TimeDelta::try_seconds(lifetime as i64)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.partition
            .set(keys::TOKEN_EXPIRES_AT, &expires_at.to_rfc3339())
            .await?;
        debug!("Access token expires at {}", expires_at);
        Ok(expires_at)
    }

    /// Store a fresh session (login or refresh).
    pub async fn store_grant(&self, grant: &TokenGrant) -> Result<DateTime<Utc>, StoreError> {
        self.partition
            .set(keys::ACCESS_TOKEN, &grant.access_token)
            .await?;
        if let Some(refresh) = &grant.refresh_token {
            self.partition.set(keys::REFRESH_TOKEN, refresh).await?;
        }
        self.set_expires_in(grant.expires_in).await
    }

    /// Forget the session. The user must sign in again.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.partition.remove(keys::ACCESS_TOKEN).await?;
        self.partition.remove(keys::REFRESH_TOKEN).await?;
        self.partition.remove(keys::TOKEN_EXPIRES_AT).await?;
        info!("Cleared authentication state");
        Ok(())
    }
}
