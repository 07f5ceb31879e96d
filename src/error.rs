use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Raindrop,
    Pocket,
}

impl Service {
    /// Credentials the operator should look at when this service rejects us.
    pub fn credential_hint(&self) -> &'static str {
        match self {
            Service::Raindrop => "source.token (RAINDROP_TOKEN)",
            Service::Pocket => "sink.consumer_key / sink.access_token (POCKET_CONSUMER_KEY / POCKET_ACCESS_TOKEN)",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Raindrop => write!(f, "raindrop"),
            Service::Pocket => write!(f, "pocket"),
        }
    }
}

/// Failure reading the remote collection. Always fatal to the run.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("unauthorized (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("HTTP {status} on page {page}: {body}")]
    Status { status: u16, page: u32, body: String },

    #[error("transport error")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response on page {page}: {detail}")]
    Response { page: u32, detail: String },
}

/// Failure adding or favoriting a single item at the sink.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("unauthorized (HTTP {status}): {detail}")]
    Auth { status: u16, detail: String },

    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("transport error")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Response(String),
}

impl ForwardError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ForwardError::Auth { .. })
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("storage error")]
    Storage(#[from] libsql::Error),

    #[error("ledger is not initialized, run `marksync init` first")]
    NotInitialized,

    #[error("migration {name} failed: {detail}")]
    Migration { name: String, detail: String },

    #[error("stored timestamp {value:?} for bookmark {id} is not RFC 3339")]
    CorruptTimestamp { id: i64, value: String },
}

/// Run-level failure. Every variant aborts the run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("fetch failed")]
    Fetch(#[source] FetchError),

    #[error("{service} rejected the request ({detail}); check {}", .service.credential_hint())]
    Auth { service: Service, detail: String },

    #[error("ledger error")]
    Ledger(#[from] LedgerError),

    #[error("bookmark {id} ({link}) was forwarded but could not be recorded, it will be sent again on the next run")]
    Persistence {
        id: i64,
        link: String,
        #[source]
        source: LedgerError,
    },
}

impl From<FetchError> for SyncError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Auth { status, body } => SyncError::Auth {
                service: Service::Raindrop,
                detail: format!("HTTP {}: {}", status, body),
            },
            other => SyncError::Fetch(other),
        }
    }
}
