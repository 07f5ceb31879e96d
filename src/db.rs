use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::ledger::{Ledger, LedgerResult};
use crate::model::{BEGINNING_OF_TIME, LedgerEntry, format_timestamp, parse_timestamp};

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[
    ("001_seen_bookmarks.sql", include_str!("migrations/001_seen_bookmarks.sql")),
    ("002_pending_failures.sql", include_str!("migrations/002_pending_failures.sql")),
];

// Only overwrite when the incoming watermark is newer; timestamps are stored
// fixed-width so text comparison is chronological.
const UPSERT_ENTRY: &str = r#"
INSERT INTO seen_bookmarks (id, link, last_update)
VALUES (?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    link = excluded.link,
    last_update = excluded.last_update
WHERE excluded.last_update > seen_bookmarks.last_update
"#;

const RECORD_FAILURE: &str = r#"
INSERT INTO pending_failures (id, last_update)
VALUES (?, ?)
ON CONFLICT(id) DO UPDATE SET last_update = excluded.last_update
"#;

/// SQLite-backed ledger.
pub struct Database {
    // Keeps the underlying database alive for the connection's lifetime.
    _db: LibsqlDatabase,
    conn: Connection,
    tx_lock: Mutex<()>,
}

impl Database {
    pub async fn open(path: &Path) -> LedgerResult<Self> {
        tracing::debug!(path = ?path, "opening ledger");
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        Ok(Database {
            _db: db,
            conn,
            tx_lock: Mutex::new(()),
        })
    }

    /// Opens the ledger and applies any pending migrations.
    pub async fn open_initialized(path: &Path) -> LedgerResult<Self> {
        let db = Self::open(path).await?;
        db.initialize().await?;
        Ok(db)
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> LedgerResult<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> LedgerResult<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> LedgerResult<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql).await.map_err(|e| LedgerError::Migration {
            name: name.to_string(),
            detail: e.to_string(),
        })?;

        Self::record_migration(conn, name).await
    }

    fn decode_timestamp(id: i64, raw: String) -> LedgerResult<DateTime<Utc>> {
        parse_timestamp(&raw).ok_or(LedgerError::CorruptTimestamp { id, value: raw })
    }

    async fn write_entry(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        self.conn
            .execute(
                UPSERT_ENTRY,
                libsql::params![
                    entry.id,
                    entry.link.as_str(),
                    format_timestamp(&entry.last_synced_update)
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for Database {
    async fn initialize(&self) -> LedgerResult<()> {
        let _guard = self.tx_lock.lock().await;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&self.conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(&self.conn, filename, sql).await?;
        }

        Ok(())
    }

    /// True once every migration has been applied; an older ledger needs
    /// `init` again before it can be used.
    async fn is_initialized(&self) -> LedgerResult<bool> {
        for (filename, _) in MIGRATIONS {
            if !Self::is_migration_applied(&self.conn, filename).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn get(&self, id: i64) -> LedgerResult<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query("SELECT last_update FROM seen_bookmarks WHERE id = ?", libsql::params![id])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::decode_timestamp(id, row.get::<String>(0)?)?)),
            None => Ok(None),
        }
    }

    async fn find_by_link(&self, link: &str) -> LedgerResult<Option<i64>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM seen_bookmarks WHERE link = ? LIMIT 1", libsql::params![link])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    async fn max_watermark(&self) -> LedgerResult<DateTime<Utc>> {
        let query = r#"
SELECT id, last_update
FROM seen_bookmarks
ORDER BY last_update DESC
LIMIT 1
"#;
        let mut rows = self.conn.query(query, ()).await?;

        match rows.next().await? {
            Some(row) => Self::decode_timestamp(row.get::<i64>(0)?, row.get::<String>(1)?),
            None => Ok(BEGINNING_OF_TIME),
        }
    }

    async fn upsert(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let _guard = self.tx_lock.lock().await;
        self.write_entry(entry).await
    }

    async fn upsert_batch(&self, entries: &[LedgerEntry]) -> LedgerResult<()> {
        let _guard = self.tx_lock.lock().await;

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let result = async {
            for entry in entries {
                self.write_entry(entry).await?;
            }
            Ok::<(), LedgerError>(())
        }
        .await;

        match result {
            Ok(_) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }

    async fn count(&self) -> LedgerResult<u64> {
        let mut rows = self.conn.query("SELECT COUNT(*) FROM seen_bookmarks", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?.max(0) as u64),
            None => Ok(0),
        }
    }

    async fn record_failure(&self, id: i64, last_update: DateTime<Utc>) -> LedgerResult<()> {
        let _guard = self.tx_lock.lock().await;
        self.conn
            .execute(RECORD_FAILURE, libsql::params![id, format_timestamp(&last_update)])
            .await?;
        Ok(())
    }

    async fn clear_failure(&self, id: i64) -> LedgerResult<()> {
        let _guard = self.tx_lock.lock().await;
        self.conn
            .execute("DELETE FROM pending_failures WHERE id = ?", libsql::params![id])
            .await?;
        Ok(())
    }

    async fn clear_failures(&self) -> LedgerResult<()> {
        let _guard = self.tx_lock.lock().await;
        self.conn.execute("DELETE FROM pending_failures", ()).await?;
        Ok(())
    }

    async fn failures(&self) -> LedgerResult<Vec<(i64, DateTime<Utc>)>> {
        let mut rows = self
            .conn
            .query("SELECT id, last_update FROM pending_failures ORDER BY last_update ASC", ())
            .await?;

        let mut failures = Vec::new();
        while let Some(row) = rows.next().await? {
            let id = row.get::<i64>(0)?;
            failures.push((id, Self::decode_timestamp(id, row.get::<String>(1)?)?));
        }
        Ok(failures)
    }
}
