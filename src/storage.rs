use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

pub const ACCESS_TOKEN_KEY: &str = "tk_access";
pub const REFRESH_TOKEN_KEY: &str = "tk_refresh";
pub const SUBJECT_ID_KEY: &str = "tk_open_id";

const CREDENTIAL_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SUBJECT_ID_KEY];

/// String key-value persistence that survives process restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;
        debug!(path = %path.display(), "storage opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }
}

impl KeyValueStore for Store {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("storage: read {key}"))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            bail!("storage: key required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO kv (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
            params![key, value, Utc::now().timestamp()],
        )
        .with_context(|| format!("storage: write {key}"))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("storage: delete {key}"))?;
        Ok(())
    }
}

/// Process-local store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub subject_id: Option<String>,
}

impl CredentialPair {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.subject_id.is_none()
    }
}

/// Partial overwrite of the stored pair. `None` and empty strings leave the
/// stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub subject_id: Option<String>,
}

/// The single active credential pair, persisted through a [`KeyValueStore`].
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    pub fn subject_id(&self) -> Option<String> {
        self.read(SUBJECT_ID_KEY)
    }

    pub fn pair(&self) -> CredentialPair {
        CredentialPair {
            access_token: self.access_token(),
            refresh_token: self.refresh_token(),
            subject_id: self.subject_id(),
        }
    }

    pub fn set_tokens(&self, update: &TokenUpdate) -> Result<()> {
        let fields = [
            (ACCESS_TOKEN_KEY, update.access_token.as_deref()),
            (REFRESH_TOKEN_KEY, update.refresh_token.as_deref()),
            (SUBJECT_ID_KEY, update.subject_id.as_deref()),
        ];
        for (key, value) in fields {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                self.backend.set(key, value)?;
            }
        }
        debug!(
            access = update.access_token.is_some(),
            refresh = update.refresh_token.is_some(),
            subject = update.subject_id.is_some(),
            "credentials updated"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        for key in CREDENTIAL_KEYS {
            self.backend.remove(key)?;
        }
        debug!("credentials cleared");
        Ok(())
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(err) => {
                warn!(key, error = %err, "credential read failed");
                None
            }
        }
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pair = self.pair();
        f.debug_struct("CredentialStore")
            .field("access", &pair.access_token.is_some())
            .field("refresh", &pair.refresh_token.is_some())
            .field("subject", &pair.subject_id.is_some())
            .finish()
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("holo").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded(access: &str, refresh: &str) -> CredentialStore {
        let store = CredentialStore::in_memory();
        store
            .set_tokens(&TokenUpdate {
                access_token: Some(access.into()),
                refresh_token: Some(refresh.into()),
                subject_id: None,
            })
            .unwrap();
        store
    }

    #[test]
    fn sqlite_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        store.set(ACCESS_TOKEN_KEY, "A1").unwrap();
        store.set(ACCESS_TOKEN_KEY, "A2").unwrap();
        store.close().unwrap();

        let reopened = Store::open(Options { path: Some(path) }).unwrap();
        assert_eq!(
            reopened.get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
            Some("A2")
        );
        reopened.remove(ACCESS_TOKEN_KEY).unwrap();
        assert!(reopened.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    }

    #[test]
    fn update_skips_missing_fields() {
        let store = seeded("A1", "R1");
        store
            .set_tokens(&TokenUpdate {
                access_token: Some("A2".into()),
                refresh_token: Some(String::new()),
                subject_id: Some("user-1".into()),
            })
            .unwrap();
        assert_eq!(
            store.pair(),
            CredentialPair {
                access_token: Some("A2".into()),
                refresh_token: Some("R1".into()),
                subject_id: Some("user-1".into()),
            }
        );
    }

    #[test]
    fn clear_removes_every_field() {
        let store = seeded("A1", "R1");
        store.clear().unwrap();
        assert!(store.pair().is_empty());
    }

    #[test]
    fn clear_on_empty_store_is_noop() {
        let store = CredentialStore::in_memory();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.pair().is_empty());
    }

    #[test]
    fn debug_output_hides_token_values() {
        let store = seeded("secret-access", "secret-refresh");
        let rendered = format!("{store:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("access: true"));
    }
}
