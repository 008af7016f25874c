use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by this crate.
///
/// The enum is `Clone` so that single-flight waiters can share the outcome of
/// the one in-flight load. Transport errors wrap `reqwest::Error` in an `Arc`
/// for the same reason.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    // --- configuration, fatal at construction ---
    #[error("Configuration is missing `host`.")]
    MissingHost,
    #[error("Invalid `host` `{host}`: {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("Insecure host `{0}`. Use https or set `allow_insecure` for development.")]
    InsecureHost(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // --- tenant resolution ---
    #[error("Tenant id is missing. Pass one explicitly or set TENANT_PROJECT_ID.")]
    MissingTenant,

    // --- transport ---
    #[error("Header name or value cannot be used. Must be ASCII.")]
    InvalidHeaderValue,
    #[error("Request failed: {0}")]
    RequestFailed(#[from] Arc<reqwest::Error>),
    #[error("Response body exceeds the {limit} byte limit")]
    ResponseTooLarge { limit: usize },
    #[error("Failed to decode response body: {0}")]
    DecodeFailed(String),

    // --- remote API, status-coded ---
    #[error("API request failed with status {status} (code `{code}`): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    // --- tokens ---
    #[error("Access token not found in auth service response")]
    TokenNotFound,
    #[error("Token is invalid or inactive")]
    InvalidToken,
    #[error("No token provided")]
    MissingToken,
    #[error("Refresh token not found")]
    RefreshTokenNotFound,
    #[error("Token was issued for tenant `{actual}`, expected `{expected}`")]
    TenantMismatch { expected: String, actual: String },

    // --- platform attributes ---
    #[error("Platform id not found for tenant `{0}`")]
    PlatformIdNotFound(String),
    #[error("Unclassified region id not found for tenant `{0}`")]
    UnclassRegionIdNotFound(String),

    // --- remote store (L2) ---
    #[error("Remote store operation failed: {0}")]
    Store(String),

    // --- cache control signal, not a user-facing failure ---
    #[error("Cache miss")]
    CacheMiss,

    // --- single-flight ---
    #[error("In-flight load was cancelled before producing a result")]
    LoadCancelled,

    // --- lifecycle ---
    #[error("Client is closed")]
    Closed,
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Transport-level failures, remote-store failures, and 5xx API responses
    /// are retryable. 4xx responses and typed permanent errors are not. The
    /// crate itself only retries the one 401 path in
    /// [`Client::request`](crate::Client::request); this predicate is exposed
    /// so callers can build their own retry policies on top.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RequestFailed(_) | Error::Store(_) | Error::LoadCancelled => true,
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether this is the unauthorized (401) class of API error.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Api { status: 401, .. })
    }

    /// Whether this is the forbidden (403) class of API error.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Api { status: 403, .. })
    }

    /// Whether this is the not-found (404) class of API error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { status: 404, .. })
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        Error::RequestFailed(Arc::new(e))
    }
}
