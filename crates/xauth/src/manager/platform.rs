use std::collections::HashMap;
use std::sync::Arc;

use http::header::AUTHORIZATION;
use serde::Deserialize;

use crate::cache::LocalCache;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::manager::TokenManager;
use crate::singleflight::Flight;
use crate::store::{PlatformField, RemoteStore};
use crate::transport::{escape_query_value, HttpTransport};

const PLATFORM_ID_ENDPOINT: &str = "/auth/v1/platform/id";
const PARENT_PLATFORM_ENDPOINT: &str = "/auth/v1/platform/parent";
const UNCLASS_REGION_ENDPOINT: &str = "/auth/v1/platform/unclass-region";

const BOOL_TRUE: &str = "true";
const BOOL_FALSE: &str = "false";

/// Two-tier cache for the fixed set of per-tenant platform attributes.
///
/// Shares the local/remote/single-flight pattern of the token cache, keyed by
/// `"tenant:field"`. Holds a non-owning handle to the [`TokenManager`] so its
/// fetches can authenticate against the attribute endpoints.
#[derive(Debug)]
pub struct PlatformManager {
    config: Arc<ClientConfig>,
    transport: Arc<HttpTransport>,
    store: Arc<dyn RemoteStore>,
    tokens: TokenManager,
    local: Option<LocalCache<String>>,
    flight: Flight<String>,
}

#[derive(Debug, Deserialize)]
struct StringData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct BoolData {
    #[serde(default)]
    data: bool,
}

impl PlatformManager {
    pub fn new(
        config: Arc<ClientConfig>,
        transport: Arc<HttpTransport>,
        store: Arc<dyn RemoteStore>,
        tokens: TokenManager,
    ) -> Self {
        let local = config
            .enable_local_cache
            .then(|| LocalCache::new(config.local_cache_max_size, config.local_cache_ttl()));
        PlatformManager {
            config,
            transport,
            store,
            tokens,
            local,
            flight: Flight::new(),
        }
    }

    /// The tenant's platform identifier.
    ///
    /// # Errors
    /// [`Error::PlatformIdNotFound`] when the auth service has no identifier
    /// for the tenant.
    pub async fn get_platform_id(&self, tenant: &str) -> Result<String> {
        self.get_field(tenant, PlatformField::PlatformId).await
    }

    /// Whether the tenant's platform has a parent platform.
    pub async fn has_parent_platform(&self, tenant: &str) -> Result<bool> {
        let value = self.get_field(tenant, PlatformField::HasParent).await?;
        Ok(value == BOOL_TRUE)
    }

    /// The tenant's unclassified-region identifier.
    ///
    /// # Errors
    /// [`Error::UnclassRegionIdNotFound`] when the auth service has no region
    /// for the tenant.
    pub async fn get_unclass_region_id(&self, tenant: &str) -> Result<String> {
        self.get_field(tenant, PlatformField::UnclassRegionId).await
    }

    /// Removes all of the tenant's attributes from L1 and performs the
    /// remote store's bulk delete for the tenant. The bulk delete covers the
    /// tenant's token entry as well; callers wanting finer granularity use
    /// the store's field-specific deletes directly.
    pub async fn invalidate_cache(&self, tenant: &str) -> Result<()> {
        if let Some(local) = &self.local {
            for field in PlatformField::ALL {
                local.delete(&field_key(tenant, field));
            }
        }
        self.store.delete(tenant).await
    }

    /// Drops every L1 entry. The remote tier is left untouched.
    pub fn clear_local_cache(&self) {
        if let Some(local) = &self.local {
            local.clear();
        }
    }

    /// Number of L1 entries.
    #[must_use]
    pub fn local_size(&self) -> usize {
        self.local.as_ref().map_or(0, LocalCache::len)
    }

    async fn get_field(&self, tenant: &str, field: PlatformField) -> Result<String> {
        if tenant.is_empty() {
            return Err(Error::MissingTenant);
        }
        let key = field_key(tenant, field);
        if let Some(local) = &self.local {
            if let Some(value) = local.get(&key) {
                return Ok(value);
            }
        }

        match self.store.get_platform_data(tenant, field).await {
            Ok(Some(value)) if !value.is_empty() => {
                if let Some(local) = &self.local {
                    local.set(key, value.clone());
                }
                return Ok(value);
            }
            Ok(_) => {}
            // A failing store must not take the read path down; fall through
            // to a fetch.
            Err(e) => {
                tracing::warn!(tenant, %field, error = %e, "platform cache read failed");
            }
        }

        let load = || async {
            // The value may have landed in L1 while this caller waited for
            // the leader slot.
            if let Some(local) = &self.local {
                if let Some(value) = local.get(&key) {
                    return Ok(value);
                }
            }
            self.fetch_field(tenant, field).await
        };
        if self.config.enable_singleflight {
            self.flight.run(&key, load).await
        } else {
            load().await
        }
    }

    /// Fetches one attribute from the auth service and writes it through both
    /// cache tiers.
    async fn fetch_field(&self, tenant: &str, field: PlatformField) -> Result<String> {
        let token = self.tokens.get_token(tenant).await?;
        let target = format!(
            "{}?projectId={}",
            endpoint_for(field),
            escape_query_value(tenant)
        );
        let headers = HashMap::from([(
            AUTHORIZATION.as_str().to_string(),
            format!("Bearer {token}"),
        )]);

        let value = match field {
            PlatformField::HasParent => {
                let body: BoolData = self.transport.get_json(&target, Some(&headers)).await?;
                let encoded = if body.data { BOOL_TRUE } else { BOOL_FALSE };
                encoded.to_string()
            }
            PlatformField::PlatformId | PlatformField::UnclassRegionId => {
                let body: StringData = self.transport.get_json(&target, Some(&headers)).await?;
                if body.data.is_empty() {
                    return Err(not_found(tenant, field));
                }
                body.data
            }
        };

        if let Some(local) = &self.local {
            local.set(field_key(tenant, field), value.clone());
        }
        if let Err(e) = self
            .store
            .set_platform_data(tenant, field, &value, self.config.platform_data_cache_ttl)
            .await
        {
            tracing::warn!(tenant, %field, error = %e, "failed to share platform data via remote cache");
        }
        Ok(value)
    }
}

fn field_key(tenant: &str, field: PlatformField) -> String {
    format!("{tenant}:{field}")
}

fn endpoint_for(field: PlatformField) -> &'static str {
    match field {
        PlatformField::PlatformId => PLATFORM_ID_ENDPOINT,
        PlatformField::HasParent => PARENT_PLATFORM_ENDPOINT,
        PlatformField::UnclassRegionId => UNCLASS_REGION_ENDPOINT,
    }
}

fn not_found(tenant: &str, field: PlatformField) -> Error {
    match field {
        PlatformField::UnclassRegionId => Error::UnclassRegionIdNotFound(tenant.to_string()),
        _ => Error::PlatformIdNotFound(tenant.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;
    use url::Url;

    use super::*;
    use crate::cache::TokenCache;
    use crate::store::test_support::MemoryStore;

    fn setup(server_url: &str) -> (PlatformManager, Arc<MemoryStore>) {
        setup_with(server_url, base_config())
    }

    fn setup_with(server_url: &str, config: ClientConfig) -> (PlatformManager, Arc<MemoryStore>) {
        let config = Arc::new(config);
        let transport = Arc::new(HttpTransport::new(
            Url::parse(server_url).unwrap(),
            reqwest::Client::new(),
        ));
        let store = Arc::new(MemoryStore::default());
        let cache = Arc::new(TokenCache::new(store.clone(), &config));
        let tokens = TokenManager::new(config.clone(), transport.clone(), cache);
        (
            PlatformManager::new(config, transport, store.clone(), tokens),
            store,
        )
    }

    fn base_config() -> ClientConfig {
        ClientConfig::builder()
            .host("https://auth.example.com")
            .client_id("c")
            .client_secret("c")
            .build()
    }

    fn mock_token(server: &mut mockito::ServerGuard, hits: usize) -> mockito::Mock {
        let _mock = server
            .mock("POST", "/auth/v1/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"tok-1","expires_in":3600}"#)
            .expect(hits)
            .create();
        _mock
    }

    #[tokio::test]
    #[traced_test]
    async fn test_platform_id_escapes_tenant_and_caches_both_tiers() {
        let mut server = mockito::Server::new_async().await;
        let tenant = "t/with&special=chars";
        let token_mock = mock_token(&mut server, 1);
        let platform_mock = server
            .mock("GET", "/auth/v1/platform/id")
            .match_query(mockito::Matcher::UrlEncoded(
                "projectId".to_string(),
                tenant.to_string(),
            ))
            .match_header("authorization", "Bearer tok-1")
            .with_status(200)
            .with_body(r#"{"data":"platform-9"}"#)
            .expect(1)
            .create_async()
            .await;

        let (manager, store) = setup(&server.url());
        assert_eq!(manager.get_platform_id(tenant).await.unwrap(), "platform-9");

        // Cached in both tiers; repeat calls do no HTTP at all.
        assert_eq!(
            store.platform_value(tenant, PlatformField::PlatformId),
            Some("platform-9".to_string())
        );
        assert_eq!(manager.get_platform_id(tenant).await.unwrap(), "platform-9");
        token_mock.assert_async().await;
        platform_mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_has_parent_encodes_bool_as_literal_strings() {
        let mut server = mockito::Server::new_async().await;
        let _token_mock = mock_token(&mut server, 1);
        let _mock = server
            .mock("GET", "/auth/v1/platform/parent")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":true}"#)
            .create_async()
            .await;

        let (manager, store) = setup(&server.url());
        assert!(manager.has_parent_platform("t1").await.unwrap());
        assert_eq!(
            store.platform_value("t1", PlatformField::HasParent),
            Some("true".to_string())
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_platform_id_is_typed_not_found_and_not_cached() {
        let mut server = mockito::Server::new_async().await;
        let _token_mock = mock_token(&mut server, 1);
        let _mock = server
            .mock("GET", "/auth/v1/platform/id")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":""}"#)
            .create_async()
            .await;

        let (manager, store) = setup(&server.url());
        assert!(matches!(
            manager.get_platform_id("t1").await,
            Err(Error::PlatformIdNotFound(_))
        ));
        assert_eq!(manager.local_size(), 0);
        assert_eq!(store.platform_value("t1", PlatformField::PlatformId), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_region_id_maps_to_region_error() {
        let mut server = mockito::Server::new_async().await;
        let _token_mock = mock_token(&mut server, 1);
        let _mock = server
            .mock("GET", "/auth/v1/platform/unclass-region")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":""}"#)
            .create_async()
            .await;

        let (manager, _) = setup(&server.url());
        assert!(matches!(
            manager.get_unclass_region_id("t1").await,
            Err(Error::UnclassRegionIdNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_hit_backfills_local_without_http() {
        let (manager, store) = setup("https://auth.example.com");
        store
            .set_platform_data(
                "t1",
                PlatformField::PlatformId,
                "platform-7",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(manager.get_platform_id("t1").await.unwrap(), "platform-7");
        assert_eq!(manager.local_size(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_read_failure_is_demoted_to_miss() {
        let mut server = mockito::Server::new_async().await;
        let _token_mock = mock_token(&mut server, 1);
        let _mock = server
            .mock("GET", "/auth/v1/platform/id")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":"platform-9"}"#)
            .create_async()
            .await;

        let (manager, store) = setup(&server.url());
        *store.fail_reads.lock().unwrap() = true;
        assert_eq!(manager.get_platform_id("t1").await.unwrap(), "platform-9");
    }

    #[tokio::test]
    async fn test_empty_tenant_is_rejected() {
        let (manager, _) = setup("https://auth.example.com");
        assert!(matches!(
            manager.get_platform_id("").await,
            Err(Error::MissingTenant)
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalidate_cache_clears_both_tiers() {
        let (manager, store) = setup("https://auth.example.com");
        for field in PlatformField::ALL {
            store
                .set_platform_data("t1", field, "v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        // Warm L1 from the remote tier.
        manager.get_platform_id("t1").await.unwrap();
        assert!(manager.local_size() > 0);

        manager.invalidate_cache("t1").await.unwrap();
        assert_eq!(manager.local_size(), 0);
        assert_eq!(store.platform_value("t1", PlatformField::PlatformId), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn test_concurrent_callers_share_one_fetch() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = mock_token(&mut server, 1);
        let platform_mock = server
            .mock("GET", "/auth/v1/platform/id")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":"platform-9"}"#)
            .expect(1)
            .create_async()
            .await;

        let (manager, _) = setup(&server.url());
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.get_platform_id("t1").await },
            ));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "platform-9");
        }
        token_mock.assert_async().await;
        platform_mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_singleflight_disabled_still_serves() {
        let mut server = mockito::Server::new_async().await;
        let _token_mock = mock_token(&mut server, 1);
        let _mock = server
            .mock("GET", "/auth/v1/platform/id")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":"platform-9"}"#)
            .create_async()
            .await;

        let config = ClientConfig::builder()
            .host("https://auth.example.com")
            .client_id("c")
            .enable_singleflight(false)
            .build();
        let (manager, _) = setup_with(&server.url(), config);
        assert_eq!(manager.get_platform_id("t1").await.unwrap(), "platform-9");
    }
}
