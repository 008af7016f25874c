use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::header::AUTHORIZATION;
use http::Method;
use serde::de::DeserializeOwned;

use crate::cache::TokenCache;
use crate::config::{resolve_tenant, ClientConfig};
use crate::error::{Error, Result};
use crate::manager::{PlatformManager, TokenManager};
use crate::store::{NoopRemoteStore, RemoteStore};
use crate::token::TokenClaims;
use crate::transport::{is_insecure_url, HttpTransport, Payload};

/// An outbound request issued through [`Client::request`].
///
/// The tenant may be omitted; it is then resolved from the
/// `TENANT_PROJECT_ID` environment variable. Relative URLs are resolved
/// against the configured host.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub tenant: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<Payload>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        ApiRequest {
            method,
            url: url.into(),
            tenant: None,
            headers: None,
            body: None,
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    #[must_use]
    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    #[must_use]
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    #[must_use]
    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(Payload::Json(body));
        self
    }

    #[must_use]
    pub fn form_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Payload::Form(body.into()));
        self
    }
}

/// Facade over the credential lifecycle engine.
///
/// Composes the token and platform managers, resolves tenants, gates every
/// public operation on the closed latch, and issues authenticated outbound
/// requests with an optional one-shot retry after a revoked-token 401.
///
/// Uses `Arc` internally for cheap cloning; clones share caches, workers, and
/// the closed state.
///
/// ```no_run
/// use xauth::{ApiRequest, Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> xauth::Result<()> {
///     let client = Client::new(
///         ClientConfig::builder()
///             .host("https://auth.example.com")
///             .client_id("my-client")
///             .client_secret("my-secret")
///             .build(),
///     )?;
///
///     let req = ApiRequest::get("/api/v1/things").tenant("my-tenant");
///     let things: serde_json::Value = client.request(&req).await?;
///     println!("{things}");
///
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Arc<ClientConfig>,
    transport: Arc<HttpTransport>,
    cache: Arc<TokenCache>,
    tokens: TokenManager,
    platform: PlatformManager,
    /// Write-once latch; after `close` every public operation fails.
    closed: AtomicBool,
}

impl Client {
    /// Builds a client without a shared L2 cache.
    ///
    /// # Errors
    /// Configuration errors are fatal here: missing or invalid host, insecure
    /// host without `allow_insecure`, invalid timeout or threshold, and
    /// unreadable TLS material.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(NoopRemoteStore))
    }

    /// Builds a client that shares tokens and platform attributes through
    /// `store`.
    pub fn with_store(config: ClientConfig, store: Arc<dyn RemoteStore>) -> Result<Self> {
        let config = config.finalized();
        let base = config.validate()?;
        let http = config.build_http_client()?;
        let config = Arc::new(config);

        let transport = Arc::new(HttpTransport::new(base, http));
        let cache = Arc::new(TokenCache::new(store.clone(), &config));
        let tokens = TokenManager::new(config.clone(), transport.clone(), cache.clone());
        let platform = PlatformManager::new(
            config.clone(),
            transport.clone(),
            store,
            tokens.clone(),
        );

        Ok(Client {
            inner: Arc::new(Inner {
                config,
                transport,
                cache,
                tokens,
                platform,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Read-only view of the configuration snapshot taken at construction.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Issues `req` with a fresh bearer token injected.
    ///
    /// The caller's header map is cloned, never mutated. An absolute
    /// `http://` URL fails with [`Error::InsecureHost`] before any I/O unless
    /// `allow_insecure` is set. With `enable_auto_retry_on_401`, an
    /// unauthorized response invalidates the tenant's cached token and the
    /// request is repeated exactly once.
    pub async fn request<T: DeserializeOwned>(&self, req: &ApiRequest) -> Result<T> {
        self.ensure_open()?;
        let tenant = resolve_tenant(req.tenant.as_deref())?;
        if is_insecure_url(&req.url) && !self.inner.config.allow_insecure {
            return Err(Error::InsecureHost(req.url.clone()));
        }

        match self.send_authorized(&tenant, req).await {
            Err(e) if e.is_unauthorized() && self.inner.config.enable_auto_retry_on_401 => {
                tracing::debug!(
                    tenant,
                    "unauthorized response; invalidating cached token and retrying once"
                );
                if let Err(del) = self.inner.cache.delete(&tenant).await {
                    tracing::warn!(tenant, error = %del, "failed to invalidate token cache");
                }
                self.send_authorized(&tenant, req).await
            }
            outcome => outcome,
        }
    }

    async fn send_authorized<T: DeserializeOwned>(
        &self,
        tenant: &str,
        req: &ApiRequest,
    ) -> Result<T> {
        let token = self.inner.tokens.get_token(tenant).await?;
        let mut headers = req.headers.clone().unwrap_or_default();
        headers.insert(
            AUTHORIZATION.as_str().to_string(),
            format!("Bearer {token}"),
        );
        self.inner
            .transport
            .execute(req.method.clone(), &req.url, Some(&headers), req.body.clone())
            .await
    }

    /// A valid access token for the tenant (resolved from the environment
    /// when empty).
    pub async fn get_token(&self, tenant: &str) -> Result<String> {
        self.ensure_open()?;
        let tenant = resolve_tenant(Some(tenant))?;
        self.inner.tokens.get_token(&tenant).await
    }

    /// Validates a token via server-side introspection.
    pub async fn verify_token(&self, token: &str) -> Result<TokenClaims> {
        self.ensure_open()?;
        self.inner.tokens.verify_token(token).await
    }

    /// Validates a token and checks it was issued for `tenant`.
    pub async fn verify_token_for_tenant(
        &self,
        token: &str,
        tenant: &str,
    ) -> Result<TokenClaims> {
        self.ensure_open()?;
        self.inner.tokens.verify_token_for_tenant(token, tenant).await
    }

    /// Drops the tenant's cached token from both tiers, forcing the next
    /// acquisition to go to the auth service. For callers that learn about a
    /// revocation out of band.
    pub async fn invalidate_token(&self, tenant: &str) -> Result<()> {
        self.ensure_open()?;
        let tenant = resolve_tenant(Some(tenant))?;
        self.inner.tokens.invalidate(&tenant).await
    }

    pub async fn get_platform_id(&self, tenant: &str) -> Result<String> {
        self.ensure_open()?;
        let tenant = resolve_tenant(Some(tenant))?;
        self.inner.platform.get_platform_id(&tenant).await
    }

    pub async fn has_parent_platform(&self, tenant: &str) -> Result<bool> {
        self.ensure_open()?;
        let tenant = resolve_tenant(Some(tenant))?;
        self.inner.platform.has_parent_platform(&tenant).await
    }

    pub async fn get_unclass_region_id(&self, tenant: &str) -> Result<String> {
        self.ensure_open()?;
        let tenant = resolve_tenant(Some(tenant))?;
        self.inner.platform.get_unclass_region_id(&tenant).await
    }

    /// Drops the tenant's platform attributes from both cache tiers. The
    /// remote side uses the store's bulk delete, which removes the tenant's
    /// shared token entry too.
    pub async fn invalidate_platform_cache(&self, tenant: &str) -> Result<()> {
        self.ensure_open()?;
        let tenant = resolve_tenant(Some(tenant))?;
        self.inner.platform.invalidate_cache(&tenant).await
    }

    /// Shuts the client down: stops background refresh workers (waiting for
    /// in-flight ones) and clears both managers' local caches. Idempotent;
    /// afterwards every public operation fails with [`Error::Closed`].
    pub async fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.inner.tokens.stop().await;
        self.inner.cache.clear();
        self.inner.platform.clear_local_cache();
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
