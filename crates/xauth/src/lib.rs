#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]

//! # Multi-Tenant Auth Client
//!
//! This crate mediates between application code and a remote OAuth-style auth
//! service. For each tenant it obtains, caches, refreshes, and validates
//! bearer tokens, and keeps a small set of per-tenant platform attributes
//! available on every request path. Features include:
//!
//! * Two-tier token cache (in-process LRU + pluggable shared store) with
//!   single-flight load coalescing
//! * Token acquisition via API key or the `OAuth2` client-credentials flow,
//!   with ordered fallback
//! * Background token refresh, de-duplicated per tenant and joined on
//!   shutdown
//! * Server-side token introspection - the auth service stays the sole
//!   authority, no local claim checks
//! * Authenticated outbound requests through a wrapped `reqwest` client, with
//!   an optional one-shot retry after a revoked-token 401
//! * Safe defaults - https-only hosts, no redirects, TLS 1.2 minimum, and
//!   sensitive data hidden in Debug
//!
//! # Example
//!
//! ```no_run
//! use xauth::{ApiRequest, Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> xauth::Result<()> {
//!     let client = Client::new(
//!         ClientConfig::builder()
//!             .host("https://auth.example.com")
//!             .client_id("my-client")
//!             .client_secret("my-secret")
//!             .build(),
//!     )?;
//!
//!     // A bearer token for the tenant, acquired or served from cache.
//!     let token = client.get_token("my-tenant").await?;
//!     println!("token: {} chars", token.len());
//!
//!     // An authenticated call; the Authorization header is injected.
//!     let req = ApiRequest::get("/api/v1/things").tenant("my-tenant");
//!     let things: serde_json::Value = client.request(&req).await?;
//!     println!("{things}");
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **all**: Includes `rustls-tls`.
//! - **default**: Includes `rustls-tls`.
//! - **rustls-tls**: Enables `reqwest/rustls-tls` and
//!   `reqwest/rustls-tls-native-roots`. Required for the TLS configuration
//!   surface (`tls.*` options).

mod cache;
mod client;
mod config;
pub mod error;
mod manager;
mod singleflight;
mod store;
mod token;
mod transport;

pub use cache::{LocalCache, TokenCache};
pub use client::{ApiRequest, Client};
pub use config::{
    ClientConfig, TlsConfig, DEFAULT_LOCAL_CACHE_MAX_SIZE, DEFAULT_PLATFORM_DATA_CACHE_TTL,
    DEFAULT_REFRESH_THRESHOLD, DEFAULT_TIMEOUT, DEFAULT_TOKEN_CACHE_TTL, DEPLOYMENT_TYPE_ENV,
    TENANT_ENV,
};
pub use error::{Error, Result};
pub use manager::{PlatformManager, TokenManager};
pub use store::{
    platform_key, token_key, NoopRemoteStore, PlatformField, RemoteStore, DEFAULT_KEY_PREFIX,
};
pub use token::{Token, TokenClaims};
pub use transport::{HttpTransport, Payload, MAX_RESPONSE_SIZE};
