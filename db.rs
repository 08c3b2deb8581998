use crate::cache::CacheBackend;
use crate::error::Result;
use crate::schema;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Initializes the cache database connection pool and runs migrations.
pub fn init_database(db_path: &Path) -> Result<DbPool> {
    log::info!("Cache database path: {}", db_path.display());

    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(db_path)
        .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
    let pool = r2d2::Pool::builder()
        .connection_timeout(Duration::from_secs(2))
        .build(manager)?;

    run_migrations(&pool.get()?)?;

    Ok(pool)
}

/// Applies all pending database migrations.
fn run_migrations(connection: &DbConnection) -> Result<()> {
    let connection: &Connection = connection;

    log::info!("Running cache migrations...");

    // Migration 0001: Cache entries
    connection.execute_batch(schema::MIGRATION_0001)?;

    log::info!("Cache migrations applied successfully.");
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline_millis(ttl: Duration) -> i64 {
    let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl)
}

/// SQLite-backed [`CacheBackend`]. Expired rows are hidden on read, removed
/// lazily per key, and swept in bulk by [`SqliteStore::purge_expired`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            pool: init_database(db_path)?,
        })
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE expires_at > ?1",
            params![now_millis()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl CacheBackend for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let now = now_millis();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        if value.is_none() {
            conn.execute(
                "DELETE FROM cache_entries WHERE key = ?1 AND expires_at <= ?2",
                params![key, now],
            )?;
        }
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                created_at = strftime('%s', 'now')",
            params![key, value, deadline_millis(ttl)],
        )?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE substr(key, 1, ?1) = ?2",
            params![prefix.chars().count() as i64, prefix],
        )?;
        Ok(removed)
    }

    fn purge_expired(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now_millis()],
        )?;
        if removed > 0 {
            log::info!("Purged {removed} expired cache entries");
        }
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_dir;

    #[test]
    fn stores_and_reads_until_expiry() {
        let dir = temp_dir("sqlite_ttl");
        let store = SqliteStore::open(&dir.join("cache.db")).unwrap();

        store.set("image:recognition:aa", "{}", Duration::from_secs(60)).unwrap();
        store.set("image:recognition:bb", "{}", Duration::ZERO).unwrap();
        assert_eq!(store.get("image:recognition:aa").unwrap().as_deref(), Some("{}"));
        assert_eq!(store.get("image:recognition:bb").unwrap(), None);
        assert_eq!(store.len().unwrap(), 1);

        store.set("image:recognition:aa", "{\"v\":2}", Duration::from_secs(60)).unwrap();
        assert_eq!(
            store.get("image:recognition:aa").unwrap().as_deref(),
            Some("{\"v\":2}")
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn prefix_delete_leaves_other_namespaces() {
        let dir = temp_dir("sqlite_prefix");
        let store = SqliteStore::open(&dir.join("nested").join("cache.db")).unwrap();
        store.set("image:recognition:aa", "1", Duration::from_secs(60)).unwrap();
        store.set("image:recognition:bb", "2", Duration::from_secs(60)).unwrap();
        store.set("image:recognitionX", "3", Duration::from_secs(60)).unwrap();
        store.set("session:1", "4", Duration::from_secs(60)).unwrap();

        assert_eq!(store.delete_prefix("image:recognition:").unwrap(), 2);
        assert!(store.get("image:recognitionX").unwrap().is_some());
        assert!(store.get("session:1").unwrap().is_some());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let dir = temp_dir("sqlite_purge");
        let store = SqliteStore::open(&dir.join("cache.db")).unwrap();
        store.set("a", "1", Duration::ZERO).unwrap();
        store.set("b", "2", Duration::ZERO).unwrap();
        store.set("c", "3", Duration::from_secs(60)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.purge_expired().unwrap(), 2);
        assert!(!store.is_empty().unwrap());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reopening_keeps_entries() {
        let dir = temp_dir("sqlite_reopen");
        let path = dir.join("cache.db");
        SqliteStore::open(&path)
            .unwrap()
            .set("k", "v", Duration::from_secs(60))
            .unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
