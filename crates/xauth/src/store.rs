use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::token::Token;

/// Default key prefix when the remote store is a key-value store.
pub const DEFAULT_KEY_PREFIX: &str = "xauth:";

/// The fixed set of per-tenant platform attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformField {
    PlatformId,
    HasParent,
    UnclassRegionId,
}

impl PlatformField {
    pub const ALL: [PlatformField; 3] = [
        PlatformField::PlatformId,
        PlatformField::HasParent,
        PlatformField::UnclassRegionId,
    ];

    /// The hash-field name used in the remote store layout.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformField::PlatformId => "platform_id",
            PlatformField::HasParent => "has_parent",
            PlatformField::UnclassRegionId => "unclass_region_id",
        }
    }
}

impl fmt::Display for PlatformField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key under which a tenant's token is stored: `"<prefix>token:<tenant>"`.
#[must_use]
pub fn token_key(prefix: &str, tenant: &str) -> String {
    format!("{prefix}token:{tenant}")
}

/// Key under which a tenant's platform attributes are stored as a hash:
/// `"<prefix>platform:<tenant>"`.
#[must_use]
pub fn platform_key(prefix: &str, tenant: &str) -> String {
    format!("{prefix}platform:{tenant}")
}

/// Cross-process (L2) cache contract for tokens and platform attributes.
///
/// Implementations MUST return `Ok(None)` as the explicit miss signal; an
/// `Err` always means the store itself failed. Callers treat anything
/// ambiguous as a miss so a flaky store degrades to extra auth-service
/// traffic rather than an outage.
#[async_trait]
pub trait RemoteStore: fmt::Debug + Send + Sync {
    async fn get_token(&self, tenant: &str) -> Result<Option<Token>>;
    async fn set_token(&self, tenant: &str, token: &Token, ttl: Duration) -> Result<()>;
    async fn delete_token(&self, tenant: &str) -> Result<()>;

    async fn get_platform_data(
        &self,
        tenant: &str,
        field: PlatformField,
    ) -> Result<Option<String>>;
    async fn set_platform_data(
        &self,
        tenant: &str,
        field: PlatformField,
        value: &str,
        ttl: Duration,
    ) -> Result<()>;
    /// Removes the whole platform hash for the tenant.
    async fn delete_platform_data(&self, tenant: &str) -> Result<()>;

    /// Bulk removal of the tenant's token and all platform fields.
    async fn delete(&self, tenant: &str) -> Result<()>;
}

/// Store for deployments without a shared L2. Every read misses and every
/// write succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRemoteStore;

#[async_trait]
impl RemoteStore for NoopRemoteStore {
    async fn get_token(&self, _tenant: &str) -> Result<Option<Token>> {
        Ok(None)
    }

    async fn set_token(&self, _tenant: &str, _token: &Token, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete_token(&self, _tenant: &str) -> Result<()> {
        Ok(())
    }

    async fn get_platform_data(
        &self,
        _tenant: &str,
        _field: PlatformField,
    ) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set_platform_data(
        &self,
        _tenant: &str,
        _field: PlatformField,
        _value: &str,
        _ttl: Duration,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_platform_data(&self, _tenant: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _tenant: &str) -> Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_layout() {
        assert_eq!(token_key("xauth:", "t1"), "xauth:token:t1");
        assert_eq!(platform_key("xauth:", "t1"), "xauth:platform:t1");
        assert_eq!(token_key("", "t1"), "token:t1");
    }

    #[test]
    fn test_platform_field_names() {
        assert_eq!(PlatformField::PlatformId.as_str(), "platform_id");
        assert_eq!(PlatformField::HasParent.as_str(), "has_parent");
        assert_eq!(PlatformField::UnclassRegionId.as_str(), "unclass_region_id");
    }

    #[tokio::test]
    async fn test_noop_store_always_misses() {
        let store = NoopRemoteStore;
        assert!(store.get_token("t1").await.unwrap().is_none());
        assert!(store
            .get_platform_data("t1", PlatformField::PlatformId)
            .await
            .unwrap()
            .is_none());
        store.delete("t1").await.unwrap();
    }
}
