use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::LocalCache;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::singleflight::Flight;
use crate::store::RemoteStore;
use crate::token::{unix_now, Token};

/// Margin subtracted from short token lifetimes so the L2 entry still expires
/// before the token does.
const SHORT_LIFETIME_MARGIN: i64 = 10;
/// Lifetimes at or below this are not worth sharing through L2 at all.
const MIN_SHARED_LIFETIME: i64 = SHORT_LIFETIME_MARGIN + 1;

const MIN_LOCAL_TTL: Duration = Duration::from_secs(60);

/// Two-tier token cache keyed by tenant.
///
/// Reads go local (L1) first, then the remote store (L2), backfilling L1 on a
/// remote hit. Loads for the same tenant are coalesced by a single-flight
/// group so one acquisition serves every concurrent caller.
#[derive(Debug)]
pub struct TokenCache {
    local: Option<LocalCache<Token>>,
    store: Arc<dyn RemoteStore>,
    flight: Flight<Token>,
    refresh_threshold: Duration,
    singleflight: bool,
}

impl TokenCache {
    pub fn new(store: Arc<dyn RemoteStore>, config: &ClientConfig) -> Self {
        // L1 must outlive the refresh point, otherwise a local hit could
        // never report needs_refresh.
        let local_ttl = (config.token_refresh_threshold * 2).max(MIN_LOCAL_TTL);
        let local = config
            .enable_local_cache
            .then(|| LocalCache::new(config.local_cache_max_size, local_ttl));
        TokenCache {
            local,
            store,
            flight: Flight::new(),
            refresh_threshold: config.token_refresh_threshold,
            singleflight: config.enable_singleflight,
        }
    }

    /// Looks the tenant's token up in L1 then L2. The second tuple element
    /// reports whether the token is inside its refresh window.
    ///
    /// An expired L1 entry is dropped and the lookup continues to L2. An L2
    /// hit is backfilled into L1.
    pub async fn get(&self, tenant: &str) -> Result<Option<(Token, bool)>> {
        let now = unix_now();
        if let Some(local) = &self.local {
            if let Some(token) = local.get(tenant) {
                if token.is_expired_at(now) {
                    local.delete(tenant);
                } else {
                    let needs_refresh = token.expiring_within_at(self.refresh_threshold, now);
                    return Ok(Some((token, needs_refresh)));
                }
            }
        }

        match self.store.get_token(tenant).await? {
            Some(token) if !token.is_expired_at(now) => {
                if let Some(local) = &self.local {
                    local.set(tenant, token.clone());
                }
                let needs_refresh = token.expiring_within_at(self.refresh_threshold, now);
                Ok(Some((token, needs_refresh)))
            }
            // An empty or expired remote entry is treated as a miss.
            _ => Ok(None),
        }
    }

    /// Stamps the acquisition instant, writes L1 unconditionally, and writes
    /// L2 with a TTL guaranteed to elapse before the token itself expires.
    /// `default_ttl` applies only when the token has no declared lifetime.
    pub async fn set(&self, tenant: &str, mut token: Token, default_ttl: Duration) -> Result<()> {
        token.stamp_obtained_at(unix_now());
        if let Some(local) = &self.local {
            local.set(tenant, token.clone());
        }
        match remote_ttl(token.expires_in, self.refresh_threshold, default_ttl) {
            Some(ttl) => self.store.set_token(tenant, &token, ttl).await,
            // Too short-lived to be worth sharing; any cross-instance reader
            // would have to refresh immediately anyway.
            None => Ok(()),
        }
    }

    /// Removes the tenant's token from both tiers.
    pub async fn delete(&self, tenant: &str) -> Result<()> {
        if let Some(local) = &self.local {
            local.delete(tenant);
        }
        self.store.delete_token(tenant).await
    }

    /// Returns the cached token, or runs `loader` under the tenant-keyed
    /// single-flight guard. The loaded token is written through [`Self::set`];
    /// a remote write failure is logged, not propagated, since the token is
    /// already in hand.
    pub async fn get_or_load<F, Fut>(
        &self,
        tenant: &str,
        default_ttl: Duration,
        loader: F,
    ) -> Result<Token>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token>>,
    {
        match self.get(tenant).await {
            Ok(Some((token, _))) => return Ok(token),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(tenant, error = %e, "token cache read failed; loading fresh");
            }
        }

        let load = || async {
            // Another flight may have populated the cache while this caller
            // waited for the leader slot.
            if let Ok(Some((token, _))) = self.get(tenant).await {
                return Ok(token);
            }
            let mut token = loader().await?;
            token.stamp_obtained_at(unix_now());
            if let Err(e) = self.set(tenant, token.clone(), default_ttl).await {
                tracing::warn!(tenant, error = %e, "failed to share token via remote cache");
            }
            Ok(token)
        };

        if self.singleflight {
            self.flight.run(tenant, load).await
        } else {
            load().await
        }
    }

    /// Drops every L1 entry. The remote tier is left untouched.
    pub fn clear(&self) {
        if let Some(local) = &self.local {
            local.clear();
        }
    }

    /// Number of L1 entries.
    #[must_use]
    pub fn local_size(&self) -> usize {
        self.local.as_ref().map_or(0, LocalCache::len)
    }
}

/// L2 TTL for a token with the given declared lifetime.
///
/// The remote entry must expire before the token, so a cross-instance reader
/// is forced to refresh rather than serve a stale token:
/// - lifetime beyond the refresh threshold: `expires_in - threshold`
/// - short lifetime: `expires_in - 10s`
/// - at or below 11s: not shared (`None`)
/// - no declared lifetime: `default_ttl`
fn remote_ttl(expires_in: i64, threshold: Duration, default_ttl: Duration) -> Option<Duration> {
    if expires_in <= 0 {
        return Some(default_ttl);
    }
    let threshold = threshold.as_secs() as i64;
    if expires_in > threshold {
        Some(Duration::from_secs((expires_in - threshold) as u64))
    } else if expires_in > MIN_SHARED_LIFETIME {
        Some(Duration::from_secs((expires_in - SHORT_LIFETIME_MARGIN) as u64))
    } else {
        None
    }
}
