//! Account store backed by an embedded SQLite database.
//!
//! The store is the single authority for credentials, traffic quotas,
//! expiry, and activity state. Usage updates are additive at the SQL level
//! so concurrent flushes from different sessions merge instead of clobber.

use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::GatewayError;

/// A tunnel user record.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub username: String,
    /// Opaque secret, compared byte-exact.
    pub password: String,
    /// Quota in bytes; 0 means unlimited.
    pub traffic_limit: u64,
    /// Lifetime bytes transferred; monotonic.
    pub traffic_used: u64,
    /// Absent means never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    /// Last successful authentication.
    pub last_connection: Option<DateTime<Utc>>,
}

impl Account {
    /// The Active predicate: enabled, not expired, quota remaining.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.expires_at.map_or(true, |expires| now < expires)
            && (self.traffic_limit == 0 || self.traffic_used < self.traffic_limit)
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }
}

/// Fields supplied when creating an account. The rest is server-assigned.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    pub traffic_limit: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    username        TEXT NOT NULL UNIQUE,
    password        TEXT NOT NULL,
    traffic_limit   INTEGER NOT NULL DEFAULT 0,
    traffic_used    INTEGER NOT NULL DEFAULT 0,
    expires_at      TEXT,
    enabled         INTEGER NOT NULL DEFAULT 1,
    last_connection TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    deleted_at      TEXT
);
";

const ACCOUNT_COLUMNS: &str =
    "id, username, password, traffic_limit, traffic_used, expires_at, enabled, last_connection";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        traffic_limit: row.get::<_, i64>(3)? as u64,
        traffic_used: row.get::<_, i64>(4)? as u64,
        expires_at: row.get(5)?,
        enabled: row.get(6)?,
        last_connection: row.get(7)?,
    })
}

/// SQLite-backed account store. All access is serialized through one
/// connection; statements are short and the lock is never held across I/O.
pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    /// Open (or create) the accounts database at `path`.
    pub fn open(path: &str) -> Result<Self, GatewayError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!("Account database ready at {}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Authenticate a username/password pair.
    ///
    /// Every failure path returns the same `AuthFailed` so callers cannot
    /// distinguish unknown users from bad passwords or inactive accounts.
    /// On success the account's `last_connection` is stamped.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Account, GatewayError> {
        let denied = || GatewayError::AuthFailed(username.to_string());

        let conn = self.conn.lock().await;
        let account = match self.find_locked(&conn, username) {
            Ok(Some(account)) => account,
            Ok(None) => return Err(denied()),
            Err(e) => {
                warn!("Account lookup failed for '{}': {}", username, e);
                return Err(denied());
            }
        };

        if account.password.as_bytes() != password.as_bytes() {
            return Err(denied());
        }
        if !account.is_active() {
            return Err(denied());
        }

        let now = Utc::now();
        if let Err(e) = conn.execute(
            "UPDATE accounts SET last_connection = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, account.id],
        ) {
            warn!("Failed to stamp last_connection for '{}': {}", username, e);
        }

        Ok(Account {
            last_connection: Some(now),
            ..account
        })
    }

    /// Add `delta` bytes to an account's lifetime usage.
    ///
    /// The increment is an SQL expression so concurrent writers merge
    /// additively instead of last-writer-wins.
    pub async fn add_usage(&self, account_id: i64, delta: u64) -> Result<(), GatewayError> {
        if delta == 0 {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET traffic_used = traffic_used + ?1, updated_at = ?2 WHERE id = ?3",
            params![delta as i64, Utc::now(), account_id],
        )?;
        Ok(())
    }

    /// Recompute the Active predicate against the current clock.
    pub async fn is_active(&self, account_id: i64) -> Result<bool, GatewayError> {
        let conn = self.conn.lock().await;
        let account = conn
            .query_row(
                &format!(
                    "SELECT {} FROM accounts WHERE id = ?1 AND deleted_at IS NULL",
                    ACCOUNT_COLUMNS
                ),
                params![account_id],
                account_from_row,
            )
            .optional()?;
        Ok(account.map_or(false, |a| a.is_active()))
    }

    /// Look up a live (non-deleted) account by username.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<Account>, GatewayError> {
        let conn = self.conn.lock().await;
        self.find_locked(&conn, username).map_err(Into::into)
    }

    fn find_locked(&self, conn: &Connection, username: &str) -> rusqlite::Result<Option<Account>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM accounts WHERE username = ?1 AND deleted_at IS NULL",
                ACCOUNT_COLUMNS
            ),
            params![username],
            account_from_row,
        )
        .optional()
    }

    /// Insert a new account and return its id.
    pub async fn insert(&self, account: NewAccount) -> Result<i64, GatewayError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO accounts (username, password, traffic_limit, expires_at, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                account.username,
                account.password,
                account.traffic_limit as i64,
                account.expires_at,
                account.enabled,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Enable or disable an account.
    pub async fn set_enabled(&self, account_id: i64, enabled: bool) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled, Utc::now(), account_id],
        )?;
        Ok(())
    }

    /// Soft-delete an account; it stops authenticating immediately.
    pub async fn delete(&self, account_id: i64) -> Result<(), GatewayError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), account_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_account(username: &str, password: &str, limit: u64) -> NewAccount {
        NewAccount {
            username: username.to_string(),
            password: password.to_string(),
            traffic_limit: limit,
            expires_at: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let store = AccountStore::open_in_memory().unwrap();
        store.insert(new_account("alice", "secret", 0)).await.unwrap();

        let account = store.authenticate("alice", "secret").await.unwrap();
        assert_eq!(account.username, "alice");
        assert!(account.last_connection.is_some());
    }

    #[tokio::test]
    async fn test_authenticate_wrong_password() {
        let store = AccountStore::open_in_memory().unwrap();
        store.insert(new_account("alice", "secret", 0)).await.unwrap();

        let err = store.authenticate("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_authenticate_unknown_user_same_error() {
        let store = AccountStore::open_in_memory().unwrap();

        let err = store.authenticate("ghost", "x").await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_authenticate_disabled() {
        let store = AccountStore::open_in_memory().unwrap();
        let id = store.insert(new_account("bob", "pw", 0)).await.unwrap();
        store.set_enabled(id, false).await.unwrap();

        assert!(store.authenticate("bob", "pw").await.is_err());
        assert!(!store.is_active(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_authenticate_expired() {
        let store = AccountStore::open_in_memory().unwrap();
        let mut account = new_account("carol", "pw", 0);
        account.expires_at = Some(Utc::now() - Duration::hours(1));
        store.insert(account).await.unwrap();

        assert!(store.authenticate("carol", "pw").await.is_err());
    }

    #[tokio::test]
    async fn test_authenticate_quota_exhausted() {
        let store = AccountStore::open_in_memory().unwrap();
        let id = store.insert(new_account("dave", "pw", 1024)).await.unwrap();
        store.add_usage(id, 1024).await.unwrap();

        assert!(store.authenticate("dave", "pw").await.is_err());
        assert!(!store.is_active(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_usage_is_additive() {
        let store = AccountStore::open_in_memory().unwrap();
        let id = store.insert(new_account("erin", "pw", 0)).await.unwrap();

        store.add_usage(id, 100).await.unwrap();
        store.add_usage(id, 250).await.unwrap();

        let account = store.find_by_username("erin").await.unwrap().unwrap();
        assert_eq!(account.traffic_used, 350);
    }

    #[tokio::test]
    async fn test_usage_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        let path = path.to_str().unwrap();

        {
            let store = AccountStore::open(path).unwrap();
            let id = store.insert(new_account("alice", "secret", 0)).await.unwrap();
            store.add_usage(id, 4096).await.unwrap();
        }

        let store = AccountStore::open(path).unwrap();
        let account = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(account.traffic_used, 4096);
        assert!(store.authenticate("alice", "secret").await.is_ok());
    }

    #[tokio::test]
    async fn test_soft_deleted_account_never_authenticates() {
        let store = AccountStore::open_in_memory().unwrap();
        let id = store.insert(new_account("frank", "pw", 0)).await.unwrap();
        store.delete(id).await.unwrap();

        assert!(store.authenticate("frank", "pw").await.is_err());
        assert!(store.find_by_username("frank").await.unwrap().is_none());
    }

    #[test]
    fn test_active_predicate_unlimited_quota() {
        let account = Account {
            id: 1,
            username: "u".to_string(),
            password: "p".to_string(),
            traffic_limit: 0,
            traffic_used: u64::MAX / 2,
            expires_at: None,
            enabled: true,
            last_connection: None,
        };
        assert!(account.is_active());
    }

    #[test]
    fn test_active_predicate_boundary() {
        let mut account = Account {
            id: 1,
            username: "u".to_string(),
            password: "p".to_string(),
            traffic_limit: 1000,
            traffic_used: 999,
            expires_at: None,
            enabled: true,
            last_connection: None,
        };
        assert!(account.is_active());
        account.traffic_used = 1000;
        assert!(!account.is_active());
    }
}
