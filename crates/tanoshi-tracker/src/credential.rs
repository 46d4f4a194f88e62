use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::Error;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

/// Persistence of per tracker credentials and opaque session tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credentials(&self, tracker_id: i32) -> Result<Option<Credentials>, Error>;

    async fn set_credentials(
        &self,
        tracker_id: i32,
        username: &str,
        secret: &str,
    ) -> Result<(), Error>;

    async fn clear_credentials(&self, tracker_id: i32) -> Result<(), Error>;

    async fn get_token(&self, tracker_id: i32) -> Result<Option<String>, Error>;

    async fn set_token(&self, tracker_id: i32, token: &str) -> Result<(), Error>;

    async fn clear_token(&self, tracker_id: i32) -> Result<(), Error>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<i32, Credentials>>,
    tokens: RwLock<HashMap<i32, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_credentials(&self, tracker_id: i32) -> Result<Option<Credentials>, Error> {
        Ok(self.credentials.read().await.get(&tracker_id).cloned())
    }

    async fn set_credentials(
        &self,
        tracker_id: i32,
        username: &str,
        secret: &str,
    ) -> Result<(), Error> {
        self.credentials.write().await.insert(
            tracker_id,
            Credentials {
                username: username.to_string(),
                secret: secret.to_string(),
            },
        );
        Ok(())
    }

    async fn clear_credentials(&self, tracker_id: i32) -> Result<(), Error> {
        self.credentials.write().await.remove(&tracker_id);
        Ok(())
    }

    async fn get_token(&self, tracker_id: i32) -> Result<Option<String>, Error> {
        Ok(self.tokens.read().await.get(&tracker_id).cloned())
    }

    async fn set_token(&self, tracker_id: i32, token: &str) -> Result<(), Error> {
        self.tokens
            .write()
            .await
            .insert(tracker_id, token.to_string());
        Ok(())
    }

    async fn clear_token(&self, tracker_id: i32) -> Result<(), Error> {
        self.tokens.write().await.remove(&tracker_id);
        Ok(())
    }
}

/// One tracker's view of the credential store.
///
/// Keeps the session token cached in memory and serializes login, logout and
/// token replacement behind one gate, so a logout fully completes before the
/// next login of the same tracker starts.
pub struct Vault {
    tracker_id: i32,
    store: Arc<dyn CredentialStore>,
    gate: Mutex<()>,
    token: Mutex<Option<String>>,
}

impl Vault {
    pub fn new(tracker_id: i32, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            tracker_id,
            store,
            gate: Mutex::new(()),
            token: Mutex::new(None),
        }
    }

    /// Hold this across a whole login, logout or re-authentication.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub async fn credentials(&self) -> Result<Option<Credentials>, Error> {
        let credentials = self.store.get_credentials(self.tracker_id).await?;
        Ok(credentials.filter(|c| !c.username.is_empty() && !c.secret.is_empty()))
    }

    pub async fn token(&self) -> Result<Option<String>, Error> {
        let mut cached = self.token.lock().await;
        if cached.is_none() {
            *cached = self.store.get_token(self.tracker_id).await?;
        }
        Ok(cached.clone())
    }

    pub async fn is_logged_in(&self) -> bool {
        matches!(self.credentials().await, Ok(Some(_)))
    }

    pub async fn save(&self, username: &str, secret: &str, token: &str) -> Result<(), Error> {
        self.store
            .set_credentials(self.tracker_id, username, secret)
            .await?;
        self.replace_token(token).await
    }

    pub async fn replace_token(&self, token: &str) -> Result<(), Error> {
        let mut cached = self.token.lock().await;
        self.store.set_token(self.tracker_id, token).await?;
        *cached = Some(token.to_string());
        Ok(())
    }

    /// Drop the token and credentials.
    ///
    /// The in-memory token is gone even if the store fails, the first store
    /// error is returned after every clear was attempted.
    pub async fn clear(&self) -> Result<(), Error> {
        let mut cached = self.token.lock().await;
        *cached = None;

        let token = self.store.clear_token(self.tracker_id).await;
        let credentials = self.store.clear_credentials(self.tracker_id).await;
        token.and(credentials)
    }

    /// Called when the service rejected our credentials, with the gate held.
    pub async fn expire(&self) -> Error {
        if let Err(e) = self.clear().await {
            error!("failed to clear credentials of tracker {}: {e}", self.tracker_id);
        }
        Error::AuthExpired
    }

    /// Expire the session a request was sent with.
    ///
    /// Takes the gate. Nothing is cleared when `is_rejected` doesn't match
    /// the stored token: the session was replaced while the request was in
    /// flight.
    pub async fn expire_rejected<F>(&self, is_rejected: F) -> Error
    where
        F: FnOnce(&str) -> bool + Send,
    {
        let _gate = self.exclusive().await;
        match self.token().await {
            Ok(Some(stored)) if is_rejected(&stored) => self.expire().await,
            Ok(_) => {
                debug!("tracker {} session changed, keeping it", self.tracker_id);
                Error::AuthExpired
            }
            Err(e) => {
                error!("failed to read token of tracker {}: {e}", self.tracker_id);
                self.expire().await
            }
        }
    }
}
