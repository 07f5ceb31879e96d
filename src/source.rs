use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FetchError;
use crate::model::Bookmark;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchQuery {
    /// Only bookmarks modified strictly after this instant are returned.
    pub since: Option<DateTime<Utc>>,
    pub page_size: u32,
    pub max_pages: u32,
}

/// Read-only view of the remote bookmark collection.
#[async_trait]
pub trait BookmarkSource: Send + Sync {
    /// Bookmarks ordered by descending modification time.
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Bookmark>, FetchError>;
}

#[derive(Debug)]
pub struct Pages<T> {
    pub items: Vec<T>,
    pub requests: u32,
    /// True when the page budget ran out on a full page, i.e. older items may
    /// exist that were never requested.
    pub truncated: bool,
}

/// Requests pages `0..max_pages` in order, stopping at the first page shorter
/// than `page_size`.
pub async fn collect_pages<T, F, Fut>(page_size: u32, max_pages: u32, mut fetch_page: F) -> Result<Pages<T>, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, FetchError>>,
{
    let mut items = Vec::new();
    let mut requests = 0;

    for page in 0..max_pages {
        let batch = fetch_page(page).await?;
        requests += 1;

        let short = batch.len() < page_size as usize;
        items.extend(batch);
        if short {
            return Ok(Pages {
                items,
                requests,
                truncated: false,
            });
        }
    }

    Ok(Pages {
        items,
        requests,
        truncated: max_pages > 0,
    })
}

/// Client-side window filter. The server cannot be trusted to cut off at
/// `since` across page boundaries, so this runs after pagination completes.
pub fn filter_since(bookmarks: Vec<Bookmark>, since: Option<DateTime<Utc>>) -> Vec<Bookmark> {
    match since {
        Some(since) => bookmarks.into_iter().filter(|b| b.last_modified > since).collect(),
        None => bookmarks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_timestamp;
    use std::cell::Cell;

    fn bookmark(id: i64, raw: &str) -> Bookmark {
        Bookmark {
            id,
            link: format!("https://example.com/{id}"),
            title: None,
            tags: vec![],
            last_modified: parse_timestamp(raw).unwrap(),
            important: false,
        }
    }

    #[tokio::test]
    async fn test_collect_pages_stops_on_short_page() {
        let calls = Cell::new(0u32);
        let pages = collect_pages(3, 10, |page| {
            calls.set(calls.get() + 1);
            async move {
                let len = if page < 2 { 3 } else { 1 };
                Ok((0..len).map(|i| page * 10 + i).collect::<Vec<u32>>())
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.get(), 3);
        assert_eq!(pages.requests, 3);
        assert_eq!(pages.items, vec![0, 1, 2, 10, 11, 12, 20]);
        assert!(!pages.truncated);
    }

    #[tokio::test]
    async fn test_collect_pages_respects_max_pages() {
        let calls = Cell::new(0u32);
        let pages = collect_pages(2, 4, |page| {
            calls.set(calls.get() + 1);
            async move { Ok(vec![page; 2]) }
        })
        .await
        .unwrap();

        assert_eq!(calls.get(), 4);
        assert_eq!(pages.items.len(), 8);
        assert!(pages.truncated);
    }

    #[tokio::test]
    async fn test_collect_pages_empty_first_page() {
        let pages = collect_pages(50, 5, |_| async { Ok(Vec::<u32>::new()) })
            .await
            .unwrap();
        assert_eq!(pages.requests, 1);
        assert!(pages.items.is_empty());
        assert!(!pages.truncated);
    }

    #[tokio::test]
    async fn test_collect_pages_propagates_failure() {
        let calls = Cell::new(0u32);
        let result = collect_pages(2, 5, |page| {
            calls.set(calls.get() + 1);
            async move {
                if page == 1 {
                    Err(FetchError::Response {
                        page,
                        detail: "boom".into(),
                    })
                } else {
                    Ok(vec![1u32, 2])
                }
            }
        })
        .await;

        assert!(matches!(result, Err(FetchError::Response { page: 1, .. })));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_filter_since_is_strict() {
        let items = vec![
            bookmark(3, "2024-01-03T00:00:00Z"),
            bookmark(2, "2024-01-02T00:00:00Z"),
            bookmark(1, "2024-01-01T00:00:00Z"),
        ];
        let since = parse_timestamp("2024-01-02T00:00:00.000Z");

        let kept: Vec<i64> = filter_since(items.clone(), since).iter().map(|b| b.id).collect();
        assert_eq!(kept, vec![3]);
        assert_eq!(filter_since(items, None).len(), 3);
    }
}
