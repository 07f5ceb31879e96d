use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ForwardError, LedgerError, Service, SyncError};
use crate::ledger::Ledger;
use crate::model::{Bookmark, LedgerEntry};
use crate::sink::{AddRequest, BookmarkSink};
use crate::source::{BookmarkSource, FetchQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Only bookmarks changed after the ledger watermark are considered.
    Incremental,
    /// The whole collection (within the page budget) is re-evaluated.
    FullRescan,
    /// Everything fetched is recorded as seen and nothing is forwarded.
    MarkAllSeen,
}

pub enum SyncResult<T> {
    Created(T),
    Updated(T),
    Unchanged(T),
    Conflict(T),
    Error,
}

impl<T> SyncResult<T> {
    pub fn record(&self, stats: &mut SyncStats) {
        match self {
            SyncResult::Created(_) => stats.created += 1,
            SyncResult::Updated(_) => stats.updated += 1,
            SyncResult::Unchanged(_) => stats.unchanged += 1,
            SyncResult::Conflict(_) => stats.link_conflicts += 1,
            SyncResult::Error => {}
        }
    }

    /// The bookmark no longer needs a retry.
    pub fn is_settled(&self) -> bool {
        !matches!(self, SyncResult::Error)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub fetched: u32,
    /// Forwarded for the first time.
    pub created: u32,
    /// Forwarded again because the bookmark changed.
    pub updated: u32,
    pub unchanged: u32,
    pub seeded: u32,
    pub link_conflicts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: i64,
    pub link: String,
    pub error: String,
}

impl ItemFailure {
    fn new(bookmark: &Bookmark, error: &ForwardError) -> Self {
        ItemFailure {
            id: bookmark.id,
            link: bookmark.link.clone(),
            error: crate::unpack_error(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub since: Option<DateTime<Utc>>,
    pub stats: SyncStats,
    /// Items whose add failed; they stay out of the ledger and are retried.
    pub failures: Vec<ItemFailure>,
    /// Items added but not favorited; they are recorded as synced.
    pub favorite_failures: Vec<ItemFailure>,
}

impl SyncReport {
    fn new(mode: SyncMode, since: Option<DateTime<Utc>>) -> Self {
        SyncReport {
            mode,
            since,
            stats: SyncStats::default(),
            failures: vec![],
            favorite_failures: vec![],
        }
    }

    pub fn forwarded(&self) -> u32 {
        self.stats.created + self.stats.updated
    }
}

const MAX_OVERLAP_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub page_size: u32,
    pub max_pages: u32,
    /// Subtracted from the ledger watermark to form the incremental lower bound.
    pub watermark_overlap: Duration,
}

impl SyncSettings {
    pub fn from_config(cfg: &Config) -> Self {
        SyncSettings {
            page_size: cfg.source.page_size,
            max_pages: cfg.source.max_pages,
            watermark_overlap: Duration::seconds(cfg.sync.watermark_overlap_seconds.min(MAX_OVERLAP_SECONDS) as i64),
        }
    }
}

/// A bookmark is forwarded when it has never been synced or has changed since.
pub fn needs_forward(stored: Option<DateTime<Utc>>, bookmark: &Bookmark) -> bool {
    match stored {
        None => true,
        Some(stored) => bookmark.last_modified > stored,
    }
}

pub struct SyncEngine<'a> {
    source: &'a dyn BookmarkSource,
    sink: &'a dyn BookmarkSink,
    ledger: &'a dyn Ledger,
    settings: SyncSettings,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        source: &'a dyn BookmarkSource,
        sink: &'a dyn BookmarkSink,
        ledger: &'a dyn Ledger,
        settings: SyncSettings,
    ) -> Self {
        SyncEngine {
            source,
            sink,
            ledger,
            settings,
        }
    }

    pub async fn sync(&self, incremental: bool) -> Result<SyncReport, SyncError> {
        let mode = if incremental {
            SyncMode::Incremental
        } else {
            SyncMode::FullRescan
        };
        self.run(mode).await
    }

    pub async fn seed_all_as_seen(&self) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::MarkAllSeen).await
    }

    pub async fn run(&self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        if !self.ledger.is_initialized().await? {
            return Err(LedgerError::NotInitialized.into());
        }

        let pending: HashMap<i64, DateTime<Utc>> = match mode {
            SyncMode::MarkAllSeen => HashMap::new(),
            SyncMode::Incremental | SyncMode::FullRescan => self.ledger.failures().await?.into_iter().collect(),
        };

        let since = match mode {
            SyncMode::Incremental => Some(self.incremental_since(&pending).await?),
            SyncMode::FullRescan | SyncMode::MarkAllSeen => None,
        };

        info!(mode = ?mode, since = ?since, "starting run");
        let query = FetchQuery {
            since,
            page_size: self.settings.page_size,
            max_pages: self.settings.max_pages,
        };
        let bookmarks = self.source.fetch(&query).await?;

        let mut report = SyncReport::new(mode, since);
        report.stats.fetched = bookmarks.len() as u32;

        if mode == SyncMode::MarkAllSeen {
            self.seed(&bookmarks, &mut report).await?;
            return Ok(report);
        }

        for (index, bookmark) in bookmarks.iter().enumerate() {
            match self.sync_bookmark(bookmark, &mut report).await {
                Ok(result) => {
                    result.record(&mut report.stats);
                    if result.is_settled() && pending.contains_key(&bookmark.id) {
                        self.settle_failure(bookmark.id).await;
                    }
                }
                Err(e) => {
                    error!(
                        id = bookmark.id,
                        link = %bookmark.link,
                        forwarded = report.forwarded(),
                        skipped = bookmarks.len() - index - 1,
                        "aborting run"
                    );
                    self.hold_back(&bookmarks[index..]).await;
                    return Err(e);
                }
            }
        }

        info!(
            forwarded = report.forwarded(),
            created = report.stats.created,
            updated = report.stats.updated,
            unchanged = report.stats.unchanged,
            failed = report.failures.len(),
            "run complete"
        );
        Ok(report)
    }

    /// Ledger watermark minus the configured overlap, pulled further back to
    /// just before the oldest pending failure.
    async fn incremental_since(&self, pending: &HashMap<i64, DateTime<Utc>>) -> Result<DateTime<Utc>, SyncError> {
        let since = self.ledger.max_watermark().await? - self.settings.watermark_overlap;
        Ok(match pending.values().min() {
            Some(oldest) => since.min(*oldest - Duration::nanoseconds(1)),
            None => since,
        })
    }

    async fn settle_failure(&self, id: i64) {
        if let Err(e) = self.ledger.clear_failure(id).await {
            warn!(id, error = %crate::unpack_error(&e), "could not clear pending failure");
        }
    }

    /// Records the oldest bookmark an aborted run left unforwarded, so the
    /// next incremental run still reaches it.
    async fn hold_back(&self, remaining: &[Bookmark]) {
        for bookmark in remaining.iter().rev() {
            let stored = match self.ledger.get(bookmark.id).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(error = %crate::unpack_error(&e), "could not check unprocessed bookmarks");
                    return;
                }
            };
            if !needs_forward(stored, bookmark) {
                continue;
            }
            if let Err(e) = self.ledger.record_failure(bookmark.id, bookmark.last_modified).await {
                warn!(id = bookmark.id, error = %crate::unpack_error(&e), "could not record pending failure");
            }
            return;
        }
    }

    async fn sync_bookmark(&self, bookmark: &Bookmark, report: &mut SyncReport) -> Result<SyncResult<i64>, SyncError> {
        let stored = self.ledger.get(bookmark.id).await?;
        if !needs_forward(stored, bookmark) {
            debug!(id = bookmark.id, "bookmark unchanged");
            return Ok(SyncResult::Unchanged(bookmark.id));
        }

        if let Some(owner) = self.ledger.find_by_link(&bookmark.link).await? {
            if owner != bookmark.id {
                warn!(
                    id = bookmark.id,
                    owner,
                    link = %bookmark.link,
                    "link already synced under another bookmark, skipping"
                );
                return Ok(SyncResult::Conflict(bookmark.id));
            }
        }

        let request = AddRequest {
            url: &bookmark.link,
            title: bookmark.title.as_deref(),
            tags: &bookmark.tags,
            favorite: bookmark.important,
        };

        info!(id = bookmark.id, link = %bookmark.link, "forwarding bookmark");
        let item_id = match self.sink.add(&request).await {
            Ok(item_id) => item_id,
            Err(e) if e.is_auth() => return Err(auth_error(e)),
            Err(e) => {
                error!(
                    id = bookmark.id,
                    link = %bookmark.link,
                    error = %crate::unpack_error(&e),
                    "failed to forward bookmark"
                );
                report.failures.push(ItemFailure::new(bookmark, &e));
                self.ledger.record_failure(bookmark.id, bookmark.last_modified).await?;
                return Ok(SyncResult::Error);
            }
        };

        // The add already happened, so a favorite failure never blocks the
        // ledger write; an auth failure still ends the run once recorded.
        let mut deferred = None;
        if bookmark.important {
            if let Err(e) = self.sink.favorite(&item_id).await {
                if e.is_auth() {
                    deferred = Some(auth_error(e));
                } else {
                    warn!(
                        id = bookmark.id,
                        item_id = %item_id,
                        error = %crate::unpack_error(&e),
                        "added but could not favorite"
                    );
                    report.favorite_failures.push(ItemFailure::new(bookmark, &e));
                }
            }
        }

        self.ledger
            .upsert(&LedgerEntry::from_bookmark(bookmark))
            .await
            .map_err(|source| {
                error!(
                    id = bookmark.id,
                    link = %bookmark.link,
                    error = %crate::unpack_error(&source),
                    "bookmark forwarded but not recorded, it will be duplicated on the next run"
                );
                SyncError::Persistence {
                    id: bookmark.id,
                    link: bookmark.link.clone(),
                    source,
                }
            })?;

        if let Some(e) = deferred {
            return Err(e);
        }

        Ok(match stored {
            Some(_) => SyncResult::Updated(bookmark.id),
            None => SyncResult::Created(bookmark.id),
        })
    }

    async fn seed(&self, bookmarks: &[Bookmark], report: &mut SyncReport) -> Result<(), SyncError> {
        let mut links = HashSet::new();
        let mut entries = Vec::with_capacity(bookmarks.len());

        // Newest first, so the most recently modified holder of a link wins.
        // The id already holding a link in the ledger always keeps it.
        for bookmark in bookmarks {
            let accepted = match self.ledger.find_by_link(&bookmark.link).await? {
                Some(owner) => owner == bookmark.id,
                None => !links.contains(bookmark.link.as_str()),
            };
            if !accepted {
                debug!(id = bookmark.id, link = %bookmark.link, "duplicate link, not seeding");
                report.stats.link_conflicts += 1;
                continue;
            }
            links.insert(bookmark.link.as_str());
            entries.push(LedgerEntry::from_bookmark(bookmark));
        }

        self.ledger.upsert_batch(&entries).await?;
        self.ledger.clear_failures().await?;
        report.stats.seeded = entries.len() as u32;
        info!(
            seeded = report.stats.seeded,
            skipped = report.stats.link_conflicts,
            "marked all current bookmarks as seen"
        );
        Ok(())
    }
}

fn auth_error(error: ForwardError) -> SyncError {
    SyncError::Auth {
        service: Service::Pocket,
        detail: crate::unpack_error(&error),
    }
}
