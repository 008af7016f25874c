use std::collections::HashMap;

use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Responses larger than this are rejected with
/// [`Error::ResponseTooLarge`].
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

const APPLICATION_JSON: &str = "application/json";
const APPLICATION_FORM: &str = "application/x-www-form-urlencoded";
const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

/// Request body accepted by the transport.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Serialized as JSON; `Content-Type: application/json` unless the caller
    /// already set one.
    Json(serde_json::Value),
    /// A pre-encoded form body; `Content-Type:
    /// application/x-www-form-urlencoded` unless the caller already set one.
    Form(String),
    /// Raw bytes; `Content-Type: application/octet-stream` unless the caller
    /// already set one.
    Bytes(Vec<u8>),
}

/// Encodes `pairs` as an `application/x-www-form-urlencoded` body.
pub(crate) fn form_body(pairs: &[(&str, &str)]) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        ser.append_pair(key, value);
    }
    ser.finish()
}

/// Percent-encodes a single query-string value.
pub(crate) fn escape_query_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn has_prefix_ignore_case(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Whether `target` is an absolute URL (scheme detection is case-insensitive).
pub(crate) fn is_absolute_url(target: &str) -> bool {
    has_prefix_ignore_case(target, "http://") || has_prefix_ignore_case(target, "https://")
}

/// Whether `target` is an absolute plaintext-HTTP URL.
pub(crate) fn is_insecure_url(target: &str) -> bool {
    has_prefix_ignore_case(target, "http://")
}

/// JSON request/response helper shared by the managers and the client facade.
///
/// Relative paths are resolved against the configured base URL; absolute URLs
/// pass through untouched. Error responses (status >= 400) are mapped to
/// [`Error::Api`] carrying the status, service code, and message from the
/// body. Transport-level failures are wrapped as retryable.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base: Url,
    client: reqwest::Client,
}

/// Error body shape used by the auth service. Parsed tolerantly: a body that
/// is not JSON, or uses different field names, degrades to an empty code with
/// the raw text as the message.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default, alias = "error_code")]
    code: String,
    #[serde(default, alias = "error", alias = "detail")]
    message: String,
}

impl HttpTransport {
    pub fn new(base: Url, client: reqwest::Client) -> Self {
        HttpTransport { base, client }
    }

    /// The configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        target: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<T> {
        self.execute(Method::GET, target, headers, None).await
    }

    pub async fn post_form<T: DeserializeOwned>(
        &self,
        target: &str,
        form: String,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<T> {
        self.execute(Method::POST, target, headers, Some(Payload::Form(form)))
            .await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        target: &str,
        body: serde_json::Value,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<T> {
        self.execute(Method::POST, target, headers, Some(Payload::Json(body)))
            .await
    }

    /// Issues a request and decodes the JSON response into `T`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        target: &str,
        headers: Option<&HashMap<String, String>>,
        body: Option<Payload>,
    ) -> Result<T> {
        let url = self.resolve_url(target)?;
        let header_map = build_headers(headers)?;
        let caller_set_content_type = header_map.contains_key(CONTENT_TYPE);

        let mut request = self
            .client
            .request(method, url)
            .header(ACCEPT, APPLICATION_JSON)
            .headers(header_map);

        request = match body {
            Some(Payload::Json(value)) => {
                if !caller_set_content_type {
                    request = request.header(CONTENT_TYPE, APPLICATION_JSON);
                }
                request.body(serde_json::to_vec(&value).map_err(|e| {
                    Error::InvalidConfig(format!("failed to encode request body: {e}"))
                })?)
            }
            Some(Payload::Form(form)) => {
                if !caller_set_content_type {
                    request = request.header(CONTENT_TYPE, APPLICATION_FORM);
                }
                request.body(form)
            }
            Some(Payload::Bytes(bytes)) => {
                if !caller_set_content_type {
                    request = request.header(CONTENT_TYPE, APPLICATION_OCTET_STREAM);
                }
                request.body(bytes)
            }
            None => request,
        };

        let response = request.send().await.map_err(Error::from_reqwest)?;
        let status = response.status();
        let bytes = read_capped(response, MAX_RESPONSE_SIZE).await?;

        if !status.is_success() {
            return Err(map_api_error(status.as_u16(), &bytes));
        }
        decode_json(&bytes)
    }

    pub(crate) fn resolve_url(&self, target: &str) -> Result<Url> {
        if is_absolute_url(target) {
            return Url::parse(target).map_err(|e| Error::InvalidHost {
                host: target.to_string(),
                reason: e.to_string(),
            });
        }
        self.base.join(target.trim_start_matches('/')).map_err(|e| {
            Error::InvalidHost {
                host: target.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

fn build_headers(headers: Option<&HashMap<String, String>>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    if let Some(headers) = headers {
        for (key, value) in headers {
            let name =
                HeaderName::from_bytes(key.as_bytes()).map_err(|_| Error::InvalidHeaderValue)?;
            let mut value =
                HeaderValue::from_str(value).map_err(|_| Error::InvalidHeaderValue)?;
            if name == AUTHORIZATION {
                value.set_sensitive(true);
            }
            map.insert(name, value);
        }
    }
    Ok(map)
}

/// Reads the response body, refusing to buffer more than `limit` bytes.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    if let Some(declared) = response.content_length() {
        if declared > limit as u64 {
            return Err(Error::ResponseTooLarge { limit });
        }
    }
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(Error::from_reqwest)? {
        if buf.len() + chunk.len() > limit {
            return Err(Error::ResponseTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    // Some endpoints answer success with an empty body.
    let bytes: &[u8] = if bytes.is_empty() { b"null" } else { bytes };
    serde_json::from_slice(bytes).map_err(|e| Error::DecodeFailed(e.to_string()))
}

fn map_api_error(status: u16, body: &[u8]) -> Error {
    let parsed: ApiErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        String::from_utf8_lossy(&body[..body.len().min(512)]).into_owned()
    } else {
        parsed.message
    };
    Error::Api {
        status,
        code: parsed.code,
        message,
    }
}
