use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{HttpConfig, SourceConfig};
use crate::error::FetchError;
use crate::model::{Bookmark, parse_timestamp};
use crate::source::{BookmarkSource, FetchQuery, collect_pages, filter_since};

#[derive(Debug, Deserialize)]
struct RaindropPage {
    result: bool,
    #[serde(default)]
    items: Vec<RaindropItem>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RaindropItem {
    #[serde(rename = "_id")]
    id: i64,
    link: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(rename = "lastUpdate")]
    last_update: String,
    #[serde(default)]
    important: bool,
}

impl RaindropItem {
    fn into_bookmark(self, page: u32) -> Result<Bookmark, FetchError> {
        let last_modified = parse_timestamp(&self.last_update).ok_or_else(|| FetchError::Response {
            page,
            detail: format!("bookmark {} has unparseable lastUpdate {:?}", self.id, self.last_update),
        })?;

        Ok(Bookmark {
            id: self.id,
            link: self.link,
            title: self.title.filter(|t| !t.trim().is_empty()),
            tags: self.tags.unwrap_or_default(),
            last_modified,
            important: self.important,
        })
    }
}

/// Reads a single Raindrop collection, newest changes first.
pub struct RaindropClient {
    client: Client,
    base_url: String,
    collection_id: i64,
    token: String,
}

impl RaindropClient {
    pub fn new(source: &SourceConfig, http: &HttpConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(http.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: source.base_url.trim_end_matches('/').to_string(),
            collection_id: source.collection_id,
            token: source.token.clone(),
        })
    }

    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Vec<Bookmark>, FetchError> {
        let url = format!("{}/raindrops/{}", self.base_url, self.collection_id);
        debug!(url = %url, page, page_size, "requesting raindrop page");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("sort", "-lastUpdate".to_string()),
                ("page", page.to_string()),
                ("perpage", page_size.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Auth {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                page,
                body,
            });
        }

        let body = response.bytes().await?;
        let parsed: RaindropPage = serde_json::from_slice(&body).map_err(|e| FetchError::Response {
            page,
            detail: format!("invalid JSON: {e}"),
        })?;

        if !parsed.result {
            return Err(FetchError::Response {
                page,
                detail: parsed
                    .error_message
                    .unwrap_or_else(|| "result: false".to_string()),
            });
        }

        parsed
            .items
            .into_iter()
            .map(|item| item.into_bookmark(page))
            .collect()
    }
}

#[async_trait]
impl BookmarkSource for RaindropClient {
    async fn fetch(&self, query: &FetchQuery) -> Result<Vec<Bookmark>, FetchError> {
        let pages = collect_pages(query.page_size, query.max_pages, |page| self.fetch_page(page, query.page_size)).await?;

        if pages.truncated {
            warn!(
                max_pages = query.max_pages,
                page_size = query.page_size,
                "page budget exhausted before the end of the collection; older changes were not read this run"
            );
        }

        let fetched = pages.items.len();
        let bookmarks = filter_since(pages.items, query.since);
        info!(
            requests = pages.requests,
            fetched,
            in_window = bookmarks.len(),
            since = ?query.since,
            "fetched raindrop collection {}",
            self.collection_id
        );

        Ok(bookmarks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_decoding() {
        let body = r#"{
            "result": true,
            "items": [
                {"_id": 11, "link": "https://a.example", "title": "A", "tags": ["x", "y"],
                 "lastUpdate": "2024-01-02T03:04:05.678Z", "important": true, "excerpt": "ignored"},
                {"_id": 12, "link": "https://b.example", "title": "", "lastUpdate": "2024-01-01T00:00:00Z"}
            ]
        }"#;
        let page: RaindropPage = serde_json::from_str(body).unwrap();
        let bookmarks: Vec<Bookmark> = page
            .items
            .into_iter()
            .map(|i| i.into_bookmark(0))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(bookmarks[0].id, 11);
        assert_eq!(bookmarks[0].title.as_deref(), Some("A"));
        assert_eq!(bookmarks[0].tags, vec!["x", "y"]);
        assert!(bookmarks[0].important);
        assert_eq!(bookmarks[1].title, None);
        assert!(bookmarks[1].tags.is_empty());
        assert!(!bookmarks[1].important);
    }

    #[test]
    fn test_null_tags_decode_as_empty() {
        let body = r#"{
            "result": true,
            "items": [
                {"_id": 13, "link": "https://c.example", "tags": null, "lastUpdate": "2024-01-01T00:00:00Z"}
            ]
        }"#;
        let page: RaindropPage = serde_json::from_str(body).unwrap();
        let item = page.items.into_iter().next().unwrap();
        let bookmark = item.into_bookmark(0).unwrap();
        assert_eq!(bookmark.id, 13);
        assert!(bookmark.tags.is_empty());
    }

    #[test]
    fn test_bad_timestamp_is_a_fetch_error() {
        let item = RaindropItem {
            id: 5,
            link: "https://a.example".into(),
            title: None,
            tags: None,
            last_update: "last tuesday".into(),
            important: false,
        };
        assert!(matches!(item.into_bookmark(2), Err(FetchError::Response { page: 2, .. })));
    }
}
