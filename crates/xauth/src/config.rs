use std::path::PathBuf;
use std::time::Duration;

use typed_builder::TypedBuilder;
use url::Url;

use crate::error::{Error, Result};

/// Per-HTTP-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Lead time before expiry at which a token is considered expiring soon.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// Remote-cache TTL for platform attributes.
pub const DEFAULT_PLATFORM_DATA_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
/// Cache TTL assumed for tokens whose response did not declare `expires_in`,
/// e.g. API-key tokens. Recovery from a server-side earlier expiry relies on
/// the 401 retry path.
pub const DEFAULT_TOKEN_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// Default L1 capacity.
pub const DEFAULT_LOCAL_CACHE_MAX_SIZE: usize = 1000;

/// Environment variable consulted when a request does not name a tenant.
pub const TENANT_ENV: &str = "TENANT_PROJECT_ID";
/// Environment variable selecting the default `client_id`.
pub const DEPLOYMENT_TYPE_ENV: &str = "DEPLOYMENT_TYPE";

const LOCAL_DEPLOYMENT: &str = "LOCAL";
const LOCAL_CLIENT_ID: &str = "localXdr";
const SAAS_CLIENT_ID: &str = "ngsoc";

/// TLS material for the HTTP client. Verification is on by default and the
/// minimum protocol version is TLS 1.2; the opt-outs live behind explicit
/// fields so configuration files can be audited for insecure deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub root_ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[cfg(not(feature = "rustls-tls"))]
impl TlsConfig {
    fn is_default(&self) -> bool {
        *self == TlsConfig::default()
    }
}

/// Client configuration. Deep-copied at construction and never mutated.
///
/// ```
/// use xauth::ClientConfig;
///
/// let config = ClientConfig::builder()
///     .host("https://auth.example.com")
///     .client_id("my-client")
///     .client_secret("my-secret")
///     .build();
/// ```
#[derive(Clone, veil::Redact, TypedBuilder)]
pub struct ClientConfig {
    /// Base URL of the auth service. Must parse with scheme and host, and
    /// must be https unless `allow_insecure` is set.
    #[builder(setter(into))]
    pub host: String,

    /// Permits `http://` for the host and for absolute request URLs.
    /// Development only.
    #[builder(default)]
    pub allow_insecure: bool,

    /// Credentials for the client-credentials flow. An empty id falls back to
    /// the deployment-type default; an empty secret falls back to the id.
    #[builder(default, setter(into))]
    pub client_id: String,
    #[redact]
    #[builder(default, setter(into))]
    pub client_secret: String,

    /// When present, API-key acquisition is preferred over client
    /// credentials.
    #[redact]
    #[builder(default, setter(strip_option, into))]
    pub api_key: Option<String>,

    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
    #[builder(default = DEFAULT_REFRESH_THRESHOLD)]
    pub token_refresh_threshold: Duration,
    #[builder(default = DEFAULT_PLATFORM_DATA_CACHE_TTL)]
    pub platform_data_cache_ttl: Duration,

    #[builder(default)]
    pub tls: TlsConfig,

    #[builder(default = true)]
    pub enable_local_cache: bool,
    #[builder(default = DEFAULT_LOCAL_CACHE_MAX_SIZE)]
    pub local_cache_max_size: usize,
    /// L1 TTL for platform attributes. Defaults to
    /// `platform_data_cache_ttl`.
    #[builder(default, setter(strip_option))]
    pub local_cache_ttl: Option<Duration>,

    #[builder(default = true)]
    pub enable_singleflight: bool,
    #[builder(default = true)]
    pub enable_background_refresh: bool,
    #[builder(default)]
    pub enable_auto_retry_on_401: bool,
}

impl ClientConfig {
    /// Fills credential defaults: an empty `client_id` resolves from
    /// `DEPLOYMENT_TYPE`, an empty `client_secret` falls back to the id.
    #[must_use]
    pub(crate) fn finalized(mut self) -> Self {
        if self.client_id.is_empty() {
            self.client_id = client_id_for_deployment(
                std::env::var(DEPLOYMENT_TYPE_ENV).ok().as_deref(),
            )
            .to_string();
        }
        if self.client_secret.is_empty() {
            self.client_secret = self.client_id.clone();
        }
        self
    }

    /// Validates the configuration and returns the parsed base URL.
    pub(crate) fn validate(&self) -> Result<Url> {
        if self.host.is_empty() {
            return Err(Error::MissingHost);
        }
        let url = Url::parse(&self.host).map_err(|e| Error::InvalidHost {
            host: self.host.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "https" => {}
            "http" if self.allow_insecure => {}
            "http" => return Err(Error::InsecureHost(self.host.clone())),
            other => {
                return Err(Error::InvalidHost {
                    host: self.host.clone(),
                    reason: format!("unsupported scheme `{other}`"),
                })
            }
        }
        if url.host_str().is_none() {
            return Err(Error::InvalidHost {
                host: self.host.clone(),
                reason: "missing host".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig("`timeout` must be positive".to_string()));
        }
        if self.token_refresh_threshold.is_zero() {
            return Err(Error::InvalidConfig(
                "`token_refresh_threshold` must be positive".to_string(),
            ));
        }
        Ok(url)
    }

    /// L1 TTL for platform attributes.
    #[must_use]
    pub fn local_cache_ttl(&self) -> Duration {
        self.local_cache_ttl.unwrap_or(self.platform_data_cache_ttl)
    }

    /// Builds the `reqwest::Client` used for all HTTP calls. Redirects are
    /// disabled so a misbehaving endpoint cannot bounce bearer tokens to a
    /// third party.
    pub(crate) fn build_http_client(&self) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout);

        #[cfg(feature = "rustls-tls")]
        let builder = self.apply_tls(builder)?;
        #[cfg(not(feature = "rustls-tls"))]
        if !self.tls.is_default() {
            return Err(Error::InvalidConfig(
                "TLS options require the `rustls-tls` feature".to_string(),
            ));
        }

        builder.build().map_err(Error::from_reqwest)
    }

    #[cfg(feature = "rustls-tls")]
    fn apply_tls(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder> {
        builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_2);
        if self.tls.insecure_skip_verify {
            tracing::warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(path) = &self.tls.root_ca_file {
            let pem = std::fs::read(path).map_err(|e| {
                Error::InvalidConfig(format!("failed to read root CA file {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(Error::from_reqwest)?;
            builder = builder.add_root_certificate(cert);
        }
        match (&self.tls.cert_file, &self.tls.key_file) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = std::fs::read(cert_path).map_err(|e| {
                    Error::InvalidConfig(format!(
                        "failed to read certificate file {}: {e}",
                        cert_path.display()
                    ))
                })?;
                let key = std::fs::read(key_path).map_err(|e| {
                    Error::InvalidConfig(format!(
                        "failed to read key file {}: {e}",
                        key_path.display()
                    ))
                })?;
                pem.extend_from_slice(&key);
                let identity = reqwest::Identity::from_pem(&pem).map_err(Error::from_reqwest)?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(Error::InvalidConfig(
                    "`tls.cert_file` and `tls.key_file` must be set together".to_string(),
                ))
            }
        }
        Ok(builder)
    }
}

/// Default `client_id` for a deployment type. `LOCAL` deployments talk to the
/// local XDR auth service; everything else is treated as SaaS.
pub(crate) fn client_id_for_deployment(deployment: Option<&str>) -> &'static str {
    match deployment {
        Some(kind) if kind.eq_ignore_ascii_case(LOCAL_DEPLOYMENT) => LOCAL_CLIENT_ID,
        _ => SAAS_CLIENT_ID,
    }
}

/// Resolves the effective tenant: the explicit value when non-empty,
/// otherwise the environment fallback.
pub(crate) fn resolve_tenant_value(explicit: Option<&str>, env: Option<String>) -> Result<String> {
    if let Some(tenant) = explicit.filter(|t| !t.is_empty()) {
        return Ok(tenant.to_string());
    }
    match env {
        Some(tenant) if !tenant.trim().is_empty() => Ok(tenant.trim().to_string()),
        _ => Err(Error::MissingTenant),
    }
}

/// Resolves the effective tenant from an optional explicit value and the
/// `TENANT_PROJECT_ID` environment variable.
pub(crate) fn resolve_tenant(explicit: Option<&str>) -> Result<String> {
    resolve_tenant_value(explicit, std::env::var(TENANT_ENV).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base() -> ClientConfig {
        ClientConfig::builder()
            .host("https://auth.example.com")
            .client_id("c")
            .build()
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.token_refresh_threshold, Duration::from_secs(300));
        assert_eq!(config.platform_data_cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.local_cache_max_size, 1000);
        assert_eq!(config.local_cache_ttl(), config.platform_data_cache_ttl);
        assert!(config.enable_local_cache);
        assert!(config.enable_singleflight);
        assert!(config.enable_background_refresh);
        assert!(!config.enable_auto_retry_on_401);
    }

    #[test]
    fn test_validate_accepts_https() {
        let url = base().validate().unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("auth.example.com"));
    }

    #[test]
    fn test_validate_rejects_missing_host() {
        let config = ClientConfig::builder().host("").build();
        assert!(matches!(config.validate(), Err(Error::MissingHost)));
    }

    #[test]
    fn test_validate_rejects_unparseable_host() {
        let config = ClientConfig::builder().host("not a url").build();
        assert!(matches!(config.validate(), Err(Error::InvalidHost { .. })));
    }

    #[test]
    fn test_validate_rejects_http_unless_allowed() {
        let config = ClientConfig::builder().host("http://auth.local").build();
        assert!(matches!(config.validate(), Err(Error::InsecureHost(_))));

        let config = ClientConfig::builder()
            .host("http://auth.local")
            .allow_insecure(true)
            .build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unsupported_scheme() {
        let config = ClientConfig::builder().host("ftp://auth.example.com").build();
        assert!(matches!(config.validate(), Err(Error::InvalidHost { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = ClientConfig::builder()
            .host("https://auth.example.com")
            .timeout(Duration::ZERO)
            .build();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_secret_defaults_to_client_id() {
        let config = ClientConfig::builder()
            .host("https://auth.example.com")
            .client_id("c")
            .build()
            .finalized();
        assert_eq!(config.client_secret, "c");

        let config = ClientConfig::builder()
            .host("https://auth.example.com")
            .client_id("c")
            .client_secret("s")
            .build()
            .finalized();
        assert_eq!(config.client_secret, "s");
    }

    #[test]
    fn test_client_id_for_deployment() {
        assert_eq!(client_id_for_deployment(Some("LOCAL")), "localXdr");
        assert_eq!(client_id_for_deployment(Some("local")), "localXdr");
        assert_eq!(client_id_for_deployment(Some("SAAS")), "ngsoc");
        assert_eq!(client_id_for_deployment(None), "ngsoc");
    }

    #[test]
    fn test_resolve_tenant_prefers_explicit() {
        assert_eq!(
            resolve_tenant_value(Some("t1"), Some("env-t".to_string())).unwrap(),
            "t1"
        );
        assert_eq!(
            resolve_tenant_value(Some(""), Some("env-t".to_string())).unwrap(),
            "env-t"
        );
        assert!(matches!(
            resolve_tenant_value(None, None),
            Err(Error::MissingTenant)
        ));
        assert!(matches!(
            resolve_tenant_value(Some(""), Some("  ".to_string())),
            Err(Error::MissingTenant)
        ));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let config = ClientConfig::builder()
            .host("https://auth.example.com")
            .client_id("c")
            .client_secret("super-secret")
            .api_key("api-key-value")
            .build();
        let out = format!("{config:?}");
        assert!(!out.contains("super-secret"));
        assert!(!out.contains("api-key-value"));
    }
}
