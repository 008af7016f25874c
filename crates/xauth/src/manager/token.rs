use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::header::AUTHORIZATION;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::cache::TokenCache;
use crate::config::{ClientConfig, DEFAULT_TOKEN_CACHE_TTL};
use crate::error::{Error, Result};
use crate::token::{unix_now, Token, TokenClaims};
use crate::transport::{form_body, HttpTransport};

pub(crate) const TOKEN_ENDPOINT: &str = "/auth/v1/oauth/token";
pub(crate) const API_KEY_TOKEN_ENDPOINT: &str = "/auth/v1/apikey/token";
pub(crate) const INTROSPECT_ENDPOINT: &str = "/auth/v1/oauth/introspect";

const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Produces valid access tokens for tenants, delegates validation to the auth
/// service, and keeps cached tokens fresh with background refresh workers.
///
/// Uses `Arc` internally for cheap cloning; all clones share the refresh
/// de-duplication state and the shutdown handle.
#[derive(Debug, Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Arc<ClientConfig>,
    transport: Arc<HttpTransport>,
    cache: Arc<TokenCache>,
    /// Tenants with a background refresh in flight. Insert-if-absent gates
    /// spawning; the worker removes its entry on completion.
    refreshing: DashMap<String, ()>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Introspection envelope returned by the auth service.
#[derive(Debug, Deserialize)]
struct IntrospectEnvelope {
    #[serde(default)]
    data: IntrospectData,
}

#[derive(Debug, Default, Deserialize)]
struct IntrospectData {
    #[serde(default)]
    active: bool,
    #[serde(flatten)]
    claims: TokenClaims,
}

impl TokenManager {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<HttpTransport>,
        cache: Arc<TokenCache>,
    ) -> Self {
        TokenManager {
            inner: Arc::new(Inner {
                config,
                transport,
                cache,
                refreshing: DashMap::new(),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Returns a valid access token for the tenant, acquiring one if neither
    /// cache tier has it.
    ///
    /// When background refresh is enabled and the returned token is inside
    /// its refresh window, a refresh worker is spawned best-effort; at most
    /// one runs per tenant at a time.
    ///
    /// # Errors
    /// Propagates acquisition failures. The background spawn never fails the
    /// call.
    pub async fn get_token(&self, tenant: &str) -> Result<String> {
        if tenant.is_empty() {
            return Err(Error::MissingTenant);
        }
        let inner = &self.inner;
        let token = inner
            .cache
            .get_or_load(tenant, DEFAULT_TOKEN_CACHE_TTL, || inner.acquire_token(tenant))
            .await?;

        if inner.config.enable_background_refresh
            && token.expiring_within(inner.config.token_refresh_threshold)
        {
            self.spawn_refresh(tenant);
        }
        Ok(token.access_token)
    }

    /// Refreshes `current` via the refresh-token grant when one is present,
    /// falling back to a fresh acquisition on any failure. Refresh failure
    /// often means the refresh token itself is no longer honored; falling
    /// back preserves liveness.
    pub async fn refresh_token(&self, tenant: &str, current: &Token) -> Result<Token> {
        self.inner.refresh_token(tenant, current).await
    }

    /// Validates a token against the auth service's introspection endpoint
    /// and returns the server's claims.
    ///
    /// The server is the sole authority: no local exp/issuer/audience checks
    /// are performed, so server-side grace periods and revocations are always
    /// honored.
    ///
    /// # Errors
    /// [`Error::MissingToken`] for empty input, [`Error::InvalidToken`] when
    /// the server marks the token inactive.
    pub async fn verify_token(&self, token: &str) -> Result<TokenClaims> {
        if token.is_empty() {
            return Err(Error::MissingToken);
        }
        let body = form_body(&[("token", token)]);
        let envelope: IntrospectEnvelope = self
            .inner
            .transport
            .post_form(INTROSPECT_ENDPOINT, body, None)
            .await?;
        if !envelope.data.active {
            return Err(Error::InvalidToken);
        }
        Ok(envelope.data.claims)
    }

    /// Like [`Self::verify_token`], additionally rejecting a token whose
    /// claims name a different tenant. A token the server chose not to scope
    /// (empty claim tenant) passes.
    pub async fn verify_token_for_tenant(
        &self,
        token: &str,
        expected_tenant: &str,
    ) -> Result<TokenClaims> {
        let claims = self.verify_token(token).await?;
        if !claims.tenant_id.is_empty() && claims.tenant_id != expected_tenant {
            return Err(Error::TenantMismatch {
                expected: expected_tenant.to_string(),
                actual: claims.tenant_id,
            });
        }
        Ok(claims)
    }

    /// Drops the tenant's token from both cache tiers.
    pub async fn invalidate(&self, tenant: &str) -> Result<()> {
        self.inner.cache.delete(tenant).await
    }

    /// Cancels background refresh workers and waits for them to finish.
    /// Idempotent.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    fn spawn_refresh(&self, tenant: &str) {
        let inner = self.inner.clone();
        if inner.cancel.is_cancelled() || inner.tasks.is_closed() {
            return;
        }
        // At most one refresh per tenant; enqueue attempts while one is
        // running are silently skipped.
        if inner.refreshing.insert(tenant.to_string(), ()).is_some() {
            return;
        }
        let tenant = tenant.to_string();
        let span = tracing::debug_span!("background_refresh", tenant = %tenant);
        self.inner.tasks.spawn(
            async move {
                inner.background_refresh(&tenant).await;
                inner.refreshing.remove(&tenant);
            }
            .instrument(span),
        );
    }

    #[cfg(test)]
    pub(crate) fn refreshing_len(&self) -> usize {
        self.inner.refreshing.len()
    }
}

impl Inner {
    /// Acquires a token with the configured credential modes, in order:
    /// API key first when one is configured, then client credentials.
    async fn acquire_token(&self, tenant: &str) -> Result<Token> {
        if let Some(api_key) = self.config.api_key.as_deref() {
            match self.acquire_via_api_key(api_key).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    tracing::warn!(
                        tenant,
                        error = %e,
                        "api-key token acquisition failed; falling back to client credentials"
                    );
                }
            }
        }
        self.acquire_via_client_credentials(tenant).await
    }

    /// The API-key endpoint answers with only an access token; the lifetime
    /// defaults to [`DEFAULT_TOKEN_CACHE_TTL`] and the 401 retry path covers
    /// a server that expires it sooner.
    async fn acquire_via_api_key(&self, api_key: &str) -> Result<Token> {
        let body = form_body(&[("api_key", api_key)]);
        let mut token: Token = self
            .transport
            .post_form(API_KEY_TOKEN_ENDPOINT, body, None)
            .await?;
        if token.access_token.is_empty() {
            return Err(Error::TokenNotFound);
        }
        if token.expires_in <= 0 {
            token.expires_in = DEFAULT_TOKEN_CACHE_TTL.as_secs() as i64;
        }
        token.stamp_obtained_at(unix_now());
        Ok(token)
    }

    /// Client-credentials grant. Credentials travel in the form body, never
    /// in the URL.
    async fn acquire_via_client_credentials(&self, tenant: &str) -> Result<Token> {
        let mut pairs = vec![
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", GRANT_CLIENT_CREDENTIALS),
        ];
        if !tenant.is_empty() {
            pairs.push(("project_id", tenant));
        }
        let body = form_body(&pairs);
        let mut token: Token = self.transport.post_form(TOKEN_ENDPOINT, body, None).await?;
        if token.access_token.is_empty() {
            return Err(Error::TokenNotFound);
        }
        token.stamp_obtained_at(unix_now());
        Ok(token)
    }

    async fn refresh_token(&self, tenant: &str, current: &Token) -> Result<Token> {
        if let Some(refresh_token) = current
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
        {
            match self.refresh_via_grant(&current.access_token, refresh_token).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    tracing::warn!(
                        tenant,
                        error = %e,
                        "refresh grant failed; acquiring a fresh token"
                    );
                }
            }
        }
        self.acquire_token(tenant).await
    }

    async fn refresh_via_grant(&self, access_token: &str, refresh_token: &str) -> Result<Token> {
        let body = form_body(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", GRANT_REFRESH_TOKEN),
            ("refresh_token", refresh_token),
        ]);
        let headers = HashMap::from([(
            AUTHORIZATION.as_str().to_string(),
            format!("Bearer {access_token}"),
        )]);
        let mut token: Token = self
            .transport
            .post_form(TOKEN_ENDPOINT, body, Some(&headers))
            .await?;
        if token.access_token.is_empty() {
            return Err(Error::TokenNotFound);
        }
        token.stamp_obtained_at(unix_now());
        Ok(token)
    }

    /// One background refresh attempt. Runs under the manager's cancellation
    /// handle, not the caller context that triggered the spawn; that caller
    /// context may be bound to a short-lived request. Failures are logged,
    /// never retried here.
    async fn background_refresh(&self, tenant: &str) {
        if self.cancel.is_cancelled() {
            tracing::debug!("manager stopped before refresh started");
            return;
        }
        let current = match self.cache.get(tenant).await {
            Ok(Some((token, _))) => token,
            Ok(None) => {
                tracing::debug!("no cached token to refresh");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not read token for refresh");
                return;
            }
        };

        let refreshed = tokio::select! {
            () = self.cancel.cancelled() => {
                tracing::debug!("manager stopped during refresh");
                return;
            }
            outcome = tokio::time::timeout(
                self.config.timeout,
                self.refresh_token(tenant, &current),
            ) => outcome,
        };

        match refreshed {
            Err(_) => tracing::warn!("token refresh timed out"),
            Ok(Err(e)) => tracing::warn!(error = %e, "token refresh failed"),
            Ok(Ok(token)) => {
                let ttl = calculate_ttl(Some(&token), self.config.token_refresh_threshold);
                if let Err(e) = self.cache.set(tenant, token, ttl).await {
                    tracing::warn!(error = %e, "failed to cache refreshed token");
                }
            }
        }
    }
}

/// Cache TTL for a freshly acquired token.
pub(crate) fn calculate_ttl(token: Option<&Token>, threshold: Duration) -> Duration {
    let Some(token) = token.filter(|t| t.expires_in > 0) else {
        return DEFAULT_TOKEN_CACHE_TTL;
    };
    let expires_in = token.expires_in as u64;
    let ttl = expires_in.saturating_sub(threshold.as_secs());
    if ttl == 0 {
        Duration::from_secs(expires_in / 2)
    } else {
        Duration::from_secs(ttl)
    }
}
