//! SQLite persistence for users and quota usage.
//!
//! Users are stored as JSON documents next to their usage counters.
//! Counter updates are single `UPDATE ... SET used = used + ?` statements,
//! so concurrent sessions never lose an increment. Trait calls run on the
//! blocking pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

use crate::store::{StoreError, Usage, UserStore};
use crate::user::User;

const SCHEMA: &str = r#"
-- Accounts, with the full user document as JSON
CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    data TEXT NOT NULL,
    used_size INTEGER NOT NULL DEFAULT 0,
    used_files INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER DEFAULT (unixepoch())
);

-- Virtual folder usage, keyed by folder name
CREATE TABLE IF NOT EXISTS folders (
    name TEXT PRIMARY KEY,
    used_size INTEGER NOT NULL DEFAULT 0,
    used_files INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQLite-backed [`UserStore`].
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // =========================================================================
    // User documents
    // =========================================================================

    /// Insert or replace a user document. Usage counters are kept.
    pub fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        let data = serde_json::to_string(user)?;
        self.conn.lock().execute(
            "INSERT INTO users (username, password_hash, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(username) DO UPDATE SET
                password_hash = excluded.password_hash,
                data = excluded.data,
                updated_at = unixepoch()",
            params![user.username, user.password_hash, data],
        )?;
        Ok(())
    }

    /// Delete a user. Returns false if there was nothing to delete.
    pub fn delete_user(&self, username: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM users WHERE username = ?1", params![username])?;
        Ok(n > 0)
    }

    /// All usernames, sorted.
    pub fn usernames(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT username FROM users ORDER BY username")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?
    }
}

fn read_usage(conn: &Connection, sql: &str, key: &str) -> Result<Option<Usage>, StoreError> {
    let usage = conn
        .query_row(sql, params![key], |row| {
            let files: i64 = row.get(0)?;
            let size: i64 = row.get(1)?;
            Ok(Usage {
                files: files.max(0) as u64,
                size: size.max(0) as u64,
            })
        })
        .optional()?;
    Ok(usage)
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn user(&self, username: &str) -> Result<User, StoreError> {
        let username = username.to_string();
        self.blocking(move |conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM users WHERE username = ?1",
                    params![username],
                    |row| row.get(0),
                )
                .optional()?;
            let data = data.ok_or(StoreError::UserNotFound(username))?;
            Ok(serde_json::from_str(&data)?)
        })
        .await
    }

    async fn used_quota(&self, username: &str) -> Result<Usage, StoreError> {
        let username = username.to_string();
        self.blocking(move |conn| {
            read_usage(
                conn,
                "SELECT used_files, used_size FROM users WHERE username = ?1",
                &username,
            )?
            .ok_or(StoreError::UserNotFound(username))
        })
        .await
    }

    async fn used_folder_quota(&self, folder: &str) -> Result<Usage, StoreError> {
        let folder = folder.to_string();
        self.blocking(move |conn| {
            Ok(read_usage(conn, "SELECT used_files, used_size FROM folders WHERE name = ?1", &folder)?
                .unwrap_or_default())
        })
        .await
    }

    async fn update_quota(&self, username: &str, files: i64, size: i64, reset: bool) -> Result<(), StoreError> {
        let sql = if reset {
            "UPDATE users SET used_files = MAX(?1, 0), used_size = MAX(?2, 0) WHERE username = ?3"
        } else {
            "UPDATE users SET used_files = MAX(used_files + ?1, 0), used_size = MAX(used_size + ?2, 0)
             WHERE username = ?3"
        };
        let username = username.to_string();
        self.blocking(move |conn| {
            let n = conn.execute(sql, params![files, size, username])?;
            if n == 0 {
                return Err(StoreError::UserNotFound(username));
            }
            Ok(())
        })
        .await
    }

    async fn update_folder_quota(&self, folder: &str, files: i64, size: i64, reset: bool) -> Result<(), StoreError> {
        let sql = if reset {
            "INSERT INTO folders (name, used_files, used_size) VALUES (?1, MAX(?2, 0), MAX(?3, 0))
             ON CONFLICT(name) DO UPDATE SET
                used_files = excluded.used_files,
                used_size = excluded.used_size"
        } else {
            "INSERT INTO folders (name, used_files, used_size) VALUES (?1, MAX(?2, 0), MAX(?3, 0))
             ON CONFLICT(name) DO UPDATE SET
                used_files = MAX(used_files + ?2, 0),
                used_size = MAX(used_size + ?3, 0)"
        };
        let folder = folder.to_string();
        self.blocking(move |conn| {
            conn.execute(sql, params![folder, files, size])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::hash_password_with_cost;
    use crate::user::Permission;

    fn alice() -> User {
        let mut user = User::new("alice", "/srv/alice")
            .with_permissions("/in", vec![Permission::Upload]);
        user.password_hash = hash_password_with_cost("pw", 4).unwrap();
        user.quota_size = 1024;
        user
    }

    #[tokio::test]
    async fn test_user_roundtrip() {
        let db = SqliteStore::in_memory().unwrap();
        db.upsert_user(&alice()).unwrap();

        let loaded = db.user("alice").await.unwrap();
        assert_eq!(loaded, alice_with_hash(&loaded));
        assert!(loaded.has_perm(Permission::Upload, "/in"));
        assert_eq!(db.usernames().unwrap(), vec!["alice".to_string()]);

        assert!(db.check_credentials("alice", "pw").await.is_ok());
        assert!(matches!(
            db.check_credentials("alice", "bad").await,
            Err(StoreError::InvalidCredentials)
        ));
        assert!(matches!(db.user("bob").await, Err(StoreError::UserNotFound(_))));

        assert!(db.delete_user("alice").unwrap());
        assert!(!db.delete_user("alice").unwrap());
    }

    fn alice_with_hash(loaded: &User) -> User {
        let mut expected = alice();
        expected.password_hash = loaded.password_hash.clone();
        expected
    }

    #[tokio::test]
    async fn test_usage_increments() {
        let db = SqliteStore::in_memory().unwrap();
        db.upsert_user(&alice()).unwrap();

        db.update_quota("alice", 1, 100, false).await.unwrap();
        db.update_quota("alice", 2, 50, false).await.unwrap();
        assert_eq!(db.used_quota("alice").await.unwrap(), Usage { files: 3, size: 150 });

        db.update_quota("alice", -5, -1000, false).await.unwrap();
        assert_eq!(db.used_quota("alice").await.unwrap(), Usage::default());

        db.update_quota("alice", 7, 70, true).await.unwrap();
        assert_eq!(db.used_quota("alice").await.unwrap(), Usage { files: 7, size: 70 });

        // Re-seeding the user keeps the counters.
        db.upsert_user(&alice()).unwrap();
        assert_eq!(db.used_quota("alice").await.unwrap(), Usage { files: 7, size: 70 });

        assert!(db.update_quota("ghost", 1, 1, false).await.is_err());
    }

    #[tokio::test]
    async fn test_folder_usage() {
        let db = SqliteStore::in_memory().unwrap();
        assert_eq!(db.used_folder_quota("shared").await.unwrap(), Usage::default());

        db.update_folder_quota("shared", 1, 10, false).await.unwrap();
        db.update_folder_quota("shared", 1, 5, false).await.unwrap();
        assert_eq!(db.used_folder_quota("shared").await.unwrap(), Usage { files: 2, size: 15 });

        db.update_folder_quota("shared", 0, 0, true).await.unwrap();
        assert_eq!(db.used_folder_quota("shared").await.unwrap(), Usage::default());
    }
}
