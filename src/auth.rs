//! Access/refresh token handling.
//!
//! Tokens live in the [`KeyValueStore`] under the same keys the app has
//! always used. A [`TokenRefresher`] exchanges the refresh token for a new
//! pair; the backend client implements it over HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::store::{keys, KeyValueStore, StoreExt};
use crate::{NavError, Result};

/// An access token with the refresh token that renews it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(alias = "access_token")]
    pub access: String,
    #[serde(alias = "refresh_token")]
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

/// How eagerly a refresh should hit the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Refresh only if the access token is expired or about to expire.
    Opportunistic,
    /// Always refresh, e.g. after the backend rejected the access token.
    Forced,
}

/// Exchanges a refresh token for a new token pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// `Ok(Some(pair))` when new tokens were issued, `Ok(None)` when no
    /// refresh was needed, `Err(NavError::Auth)` when the refresh token itself
    /// was rejected.
    async fn refresh(&self, tokens: &TokenPair, mode: RefreshMode) -> Result<Option<TokenPair>>;
}

/// Token persistence on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, tokens: &TokenPair) -> Result<()> {
        self.store.set_as(keys::ACCESS_TOKEN, &tokens.access)?;
        self.store.set_as(keys::REFRESH_TOKEN, &tokens.refresh)?;
        debug!("[CredentialStore] Saved token pair");
        Ok(())
    }

    pub fn access_token(&self) -> Result<Option<String>> {
        self.store.get_as(keys::ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Result<Option<String>> {
        self.store.get_as(keys::REFRESH_TOKEN)
    }

    /// Both tokens, if both are stored.
    pub fn load(&self) -> Result<Option<TokenPair>> {
        match (self.access_token()?, self.refresh_token()?) {
            (Some(access), Some(refresh)) => Ok(Some(TokenPair { access, refresh })),
            _ => Ok(None),
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(keys::ACCESS_TOKEN)?;
        self.store.remove(keys::REFRESH_TOKEN)
    }

    /// Run `refresher` against the stored pair and persist whatever it issues.
    ///
    /// Returns the new pair, or `None` when nothing changed.
    pub async fn refresh_with(
        &self,
        refresher: &dyn TokenRefresher,
        mode: RefreshMode,
    ) -> Result<Option<TokenPair>> {
        let tokens = self
            .load()?
            .ok_or_else(|| NavError::auth("no stored credentials"))?;

        let refreshed = refresher.refresh(&tokens, mode).await?;
        if let Some(ref pair) = refreshed {
            self.save(pair)?;
            info!("[CredentialStore] Credentials refreshed ({:?})", mode);
        }
        Ok(refreshed)
    }
}
