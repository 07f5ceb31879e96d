use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::LedgerError;
use crate::model::LedgerEntry;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Persistent record of which bookmark versions have already been forwarded.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Creates the backing store. Calling it on an initialized store is a no-op.
    async fn initialize(&self) -> LedgerResult<()>;

    async fn is_initialized(&self) -> LedgerResult<bool>;

    async fn get(&self, id: i64) -> LedgerResult<Option<DateTime<Utc>>>;

    /// Id currently holding `link`, if any.
    async fn find_by_link(&self, link: &str) -> LedgerResult<Option<i64>>;

    /// Highest recorded watermark, or `BEGINNING_OF_TIME` when empty.
    async fn max_watermark(&self) -> LedgerResult<DateTime<Utc>>;

    /// Creates or overwrites the entry for `entry.id`. A write carrying an
    /// older watermark than the stored one leaves the entry untouched.
    async fn upsert(&self, entry: &LedgerEntry) -> LedgerResult<()>;

    /// Same as `upsert` for every entry, all-or-nothing.
    async fn upsert_batch(&self, entries: &[LedgerEntry]) -> LedgerResult<()>;

    async fn count(&self) -> LedgerResult<u64>;

    /// Remembers a bookmark version that could not be forwarded, so later
    /// incremental runs keep reading back far enough to retry it.
    async fn record_failure(&self, id: i64, last_update: DateTime<Utc>) -> LedgerResult<()>;

    async fn clear_failure(&self, id: i64) -> LedgerResult<()>;

    async fn clear_failures(&self) -> LedgerResult<()>;

    /// Pending failures, oldest first.
    async fn failures(&self) -> LedgerResult<Vec<(i64, DateTime<Utc>)>>;
}
