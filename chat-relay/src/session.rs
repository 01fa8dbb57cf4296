//! Session table: who is online, and on which connection.

use std::collections::HashMap;

use thiserror::Error;

/// Relay-assigned identifier for an accepted connection.
pub type ConnId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("login '{0}' is already in use")]
    LoginTaken(String),

    #[error("connection {0} already carries a session")]
    ConnectionBound(ConnId),
}

/// Bidirectional `login <-> connection` index.
///
/// Each login maps to at most one connection and each connection to at most
/// one login; both directions are updated together.
#[derive(Debug, Default)]
pub struct SessionTable {
    by_login: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, login: &str, conn: ConnId) -> Result<(), SessionError> {
        if self.by_login.contains_key(login) {
            return Err(SessionError::LoginTaken(login.to_string()));
        }
        if self.by_conn.contains_key(&conn) {
            return Err(SessionError::ConnectionBound(conn));
        }
        self.by_login.insert(login.to_string(), conn);
        self.by_conn.insert(conn, login.to_string());
        Ok(())
    }

    pub fn is_online(&self, login: &str) -> bool {
        self.by_login.contains_key(login)
    }

    pub fn conn_for(&self, login: &str) -> Option<ConnId> {
        self.by_login.get(login).copied()
    }

    pub fn login_for(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    /// Drops the session bound to `conn`, returning its login.
    pub fn remove_conn(&mut self, conn: ConnId) -> Option<String> {
        let login = self.by_conn.remove(&conn)?;
        self.by_login.remove(&login);
        Some(login)
    }

    pub fn len(&self) -> usize {
        self.by_login.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_login.is_empty()
    }

    /// Online logins in sorted order.
    pub fn logins(&self) -> Vec<String> {
        let mut logins: Vec<String> = self.by_login.keys().cloned().collect();
        logins.sort();
        logins
    }
}
