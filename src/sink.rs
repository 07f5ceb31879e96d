use async_trait::async_trait;

use crate::error::ForwardError;

/// What gets sent for one bookmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest<'a> {
    pub url: &'a str,
    pub title: Option<&'a str>,
    pub tags: &'a [String],
    pub favorite: bool,
}

/// Write-only destination for forwarded bookmarks.
#[async_trait]
pub trait BookmarkSink: Send + Sync {
    /// Returns the identifier the sink assigned to the item.
    async fn add(&self, request: &AddRequest<'_>) -> Result<String, ForwardError>;

    async fn favorite(&self, item_id: &str) -> Result<(), ForwardError>;
}
