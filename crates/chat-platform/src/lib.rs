//! Bearer credential storage for chat sessions.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// Keyring service name used by the OS-backed store.
pub const DEFAULT_SERVICE: &str = "fixitnow-chat";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenStoreError {
    #[error("no token stored for this account")]
    NotFound,
    #[error("token is empty")]
    Empty,
    #[error("token store unavailable: {0}")]
    Unavailable(String),
    #[error("token store backend failure: {0}")]
    Backend(String),
}

/// Opaque bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(raw: impl Into<String>) -> Result<Self, TokenStoreError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TokenStoreError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Value of the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

pub trait TokenStore: Send + Sync {
    fn store_token(&self, account: &str, token: &BearerToken) -> Result<(), TokenStoreError>;

    fn load_token(&self, account: &str) -> Result<BearerToken, TokenStoreError>;

    fn clear_token(&self, account: &str) -> Result<(), TokenStoreError>;
}

impl<S: TokenStore + ?Sized> TokenStore for Arc<S> {
    fn store_token(&self, account: &str, token: &BearerToken) -> Result<(), TokenStoreError> {
        (**self).store_token(account, token)
    }

    fn load_token(&self, account: &str) -> Result<BearerToken, TokenStoreError> {
        (**self).load_token(account)
    }

    fn clear_token(&self, account: &str) -> Result<(), TokenStoreError> {
        (**self).clear_token(account)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTokenStore {
    tokens: Arc<RwLock<HashMap<String, BearerToken>>>,
}

fn poisoned<T>(_: T) -> TokenStoreError {
    TokenStoreError::Backend("poisoned lock".to_owned())
}

impl TokenStore for InMemoryTokenStore {
    fn store_token(&self, account: &str, token: &BearerToken) -> Result<(), TokenStoreError> {
        self.tokens
            .write()
            .map_err(poisoned)?
            .insert(account.to_owned(), token.clone());
        Ok(())
    }

    fn load_token(&self, account: &str) -> Result<BearerToken, TokenStoreError> {
        self.tokens
            .read()
            .map_err(poisoned)?
            .get(account)
            .cloned()
            .ok_or(TokenStoreError::NotFound)
    }

    fn clear_token(&self, account: &str) -> Result<(), TokenStoreError> {
        self.tokens
            .write()
            .map_err(poisoned)?
            .remove(account)
            .map(|_| ())
            .ok_or(TokenStoreError::NotFound)
    }
}

/// Token store backed by the platform credential manager.
#[cfg(feature = "os-keyring")]
#[derive(Debug, Clone)]
pub struct OsKeyringTokenStore {
    service: String,
}

#[cfg(feature = "os-keyring")]
impl OsKeyringTokenStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, TokenStoreError> {
        keyring::Entry::new(&self.service, account).map_err(keyring_error)
    }
}

#[cfg(feature = "os-keyring")]
impl Default for OsKeyringTokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

#[cfg(feature = "os-keyring")]
fn keyring_error(err: keyring::Error) -> TokenStoreError {
    match err {
        keyring::Error::NoEntry => TokenStoreError::NotFound,
        keyring::Error::NoStorageAccess(inner) => TokenStoreError::Unavailable(inner.to_string()),
        other => TokenStoreError::Backend(other.to_string()),
    }
}

#[cfg(feature = "os-keyring")]
impl TokenStore for OsKeyringTokenStore {
    fn store_token(&self, account: &str, token: &BearerToken) -> Result<(), TokenStoreError> {
        self.entry(account)?
            .set_password(token.expose())
            .map_err(keyring_error)
    }

    fn load_token(&self, account: &str) -> Result<BearerToken, TokenStoreError> {
        let raw = self.entry(account)?.get_password().map_err(keyring_error)?;
        BearerToken::new(raw)
    }

    fn clear_token(&self, account: &str) -> Result<(), TokenStoreError> {
        self.entry(account)?
            .delete_credential()
            .map_err(keyring_error)
    }
}

/// Keyring account under which a user's bearer token is kept.
pub fn bearer_account(user_id: u64) -> String {
    format!("bearer-token:{user_id}")
}

/// Token store view bound to one session user.
#[derive(Clone)]
pub struct SessionTokens<S: TokenStore> {
    inner: S,
    account: String,
}

impl<S: TokenStore> SessionTokens<S> {
    pub fn new(inner: S, user_id: u64) -> Self {
        Self {
            inner,
            account: bearer_account(user_id),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn save(&self, token: &BearerToken) -> Result<(), TokenStoreError> {
        self.inner.store_token(&self.account, token)
    }

    pub fn bearer(&self) -> Result<BearerToken, TokenStoreError> {
        self.inner.load_token(&self.account)
    }

    pub fn forget(&self) -> Result<(), TokenStoreError> {
        self.inner.clear_token(&self.account)
    }
}
