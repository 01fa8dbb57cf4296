//! Credential store seam.
//!
//! The relay consumes user records, contacts and login bookkeeping through
//! [`CredentialStore`]. [`MemoryStore`] is the in-process implementation the
//! binary runs with; durable backends plug in behind the same trait.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUser {
    pub login: String,
    pub addr: SocketAddr,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub login: String,
    pub addr: SocketAddr,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownUser {
    pub login: String,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStats {
    pub login: String,
    pub last_login: Option<DateTime<Utc>>,
    pub sent: u64,
    pub accepted: u64,
}

/// Everything the relay needs from persistent user storage.
///
/// Only the relay task calls the mutating methods. The operator console
/// calls the read-only queries from its own task.
pub trait CredentialStore: Send + Sync {
    /// Stored password hash for `login`, or `None` for an unknown login.
    fn hash_for(&self, login: &str) -> Result<Option<String>, StoreError>;

    fn record_login(
        &self,
        login: &str,
        addr: SocketAddr,
        public_key: &str,
    ) -> Result<(), StoreError>;

    /// Clears the active-session entry. A no-op for inactive logins.
    fn record_logout(&self, login: &str) -> Result<(), StoreError>;

    fn contacts_for(&self, login: &str) -> Result<Vec<String>, StoreError>;

    fn add_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError>;

    fn remove_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError>;

    fn all_known_users(&self) -> Result<Vec<String>, StoreError>;

    fn record_delivery(&self, from: &str, to: &str) -> Result<(), StoreError>;

    fn known_users(&self) -> Result<Vec<KnownUser>, StoreError>;

    fn active_users(&self) -> Result<Vec<ActiveUser>, StoreError>;

    fn login_history(&self, login: Option<&str>) -> Result<Vec<LoginRecord>, StoreError>;

    fn message_stats(&self) -> Result<Vec<MessageStats>, StoreError>;
}

#[derive(Debug, Default)]
struct UserRecord {
    password_hash: String,
    public_key: Option<String>,
    last_login: Option<DateTime<Utc>>,
    sent: u64,
    accepted: u64,
    contacts: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct StoreInner {
    users: BTreeMap<String, UserRecord>,
    active: BTreeMap<String, ActiveUser>,
    history: Vec<LoginRecord>,
}

impl StoreInner {
    fn user_mut(&mut self, login: &str) -> Result<&mut UserRecord, StoreError> {
        self.users
            .get_mut(login)
            .ok_or_else(|| StoreError::UnknownUser(login.to_string()))
    }
}

/// In-memory credential store. Active sessions reset with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from `(login, password_hash)` pairs.
    pub fn with_users<I, L, H>(users: I) -> Self
    where
        I: IntoIterator<Item = (L, H)>,
        L: Into<String>,
        H: Into<String>,
    {
        let store = Self::new();
        for (login, hash) in users {
            store.add_user(login, hash);
        }
        store
    }

    /// Adds or replaces a user's password hash.
    pub fn add_user(&self, login: impl Into<String>, password_hash: impl Into<String>) {
        let mut inner = self.inner.lock();
        let record = inner.users.entry(login.into()).or_default();
        record.password_hash = password_hash.into();
    }

    pub fn public_key(&self, login: &str) -> Option<String> {
        self.inner
            .lock()
            .users
            .get(login)
            .and_then(|user| user.public_key.clone())
    }
}

impl CredentialStore for MemoryStore {
    fn hash_for(&self, login: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .users
            .get(login)
            .map(|user| user.password_hash.clone()))
    }

    fn record_login(
        &self,
        login: &str,
        addr: SocketAddr,
        public_key: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let user = inner.user_mut(login)?;
        user.last_login = Some(now);
        user.public_key = Some(public_key.to_string());

        inner.active.insert(
            login.to_string(),
            ActiveUser {
                login: login.to_string(),
                addr,
                login_time: now,
            },
        );
        inner.history.push(LoginRecord {
            login: login.to_string(),
            addr,
            login_time: now,
        });
        Ok(())
    }

    fn record_logout(&self, login: &str) -> Result<(), StoreError> {
        self.inner.lock().active.remove(login);
        Ok(())
    }

    fn contacts_for(&self, login: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner.user_mut(login)?.contacts.iter().cloned().collect())
    }

    fn add_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.users.contains_key(contact) {
            return Ok(());
        }
        inner.user_mut(owner)?.contacts.insert(contact.to_string());
        Ok(())
    }

    fn remove_contact(&self, owner: &str, contact: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.user_mut(owner)?.contacts.remove(contact);
        Ok(())
    }

    fn all_known_users(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().users.keys().cloned().collect())
    }

    fn record_delivery(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.users.contains_key(to) {
            return Err(StoreError::UnknownUser(to.to_string()));
        }
        inner.user_mut(from)?.sent += 1;
        inner.user_mut(to)?.accepted += 1;
        Ok(())
    }

    fn known_users(&self) -> Result<Vec<KnownUser>, StoreError> {
        Ok(self
            .inner
            .lock()
            .users
            .iter()
            .map(|(login, user)| KnownUser {
                login: login.clone(),
                last_login: user.last_login,
            })
            .collect())
    }

    fn active_users(&self) -> Result<Vec<ActiveUser>, StoreError> {
        Ok(self.inner.lock().active.values().cloned().collect())
    }

    fn login_history(&self, login: Option<&str>) -> Result<Vec<LoginRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .history
            .iter()
            .filter(|record| login.is_none_or(|login| record.login == login))
            .cloned()
            .collect())
    }

    fn message_stats(&self) -> Result<Vec<MessageStats>, StoreError> {
        Ok(self
            .inner
            .lock()
            .users
            .iter()
            .map(|(login, user)| MessageStats {
                login: login.clone(),
                last_login: user.last_login,
                sent: user.sent,
                accepted: user.accepted,
            })
            .collect())
    }
}
