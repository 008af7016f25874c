use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time as seconds since the Unix epoch.
///
/// Wall time is only used where a value must survive serialization across
/// processes (`obtained_at_unix`). Expiry checks take an explicit `now` so
/// tests can inject time.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Authorization data returned by the auth service for a validated token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_type: String,
}

/// A bearer token issued by the auth service for one tenant.
///
/// The wire JSON carries `obtained_at_unix` instead of a derived `expires_at`
/// so the true acquisition instant survives round-trips through the remote
/// cache. Deserializing an aged token therefore does not extend its perceived
/// lifetime.
#[derive(Clone, PartialEq, Eq, veil::Redact, Serialize, Deserialize)]
pub struct Token {
    #[redact]
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[redact]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Server-declared lifetime in seconds. Zero means the server did not
    /// declare one.
    #[serde(default)]
    pub expires_in: i64,
    /// Wall-clock second at which this client received the token.
    #[serde(default)]
    pub obtained_at_unix: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<TokenClaims>,
}

impl Token {
    /// Builds a bearer token carrying only an access token, as returned by
    /// the API-key endpoint.
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Token {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            expires_in: 0,
            obtained_at_unix: 0,
            claims: None,
        }
    }

    /// Records the acquisition instant if it has not been stamped yet.
    pub fn stamp_obtained_at(&mut self, now_unix: i64) {
        if self.obtained_at_unix == 0 {
            self.obtained_at_unix = now_unix;
        }
    }

    /// Absolute expiry second, when both `obtained_at_unix` and `expires_in`
    /// are known.
    #[must_use]
    pub fn expires_at_unix(&self) -> Option<i64> {
        (self.expires_in > 0 && self.obtained_at_unix > 0)
            .then(|| self.obtained_at_unix + self.expires_in)
    }

    /// A token with an empty access token, or one past its expiry, is expired.
    /// Tokens without a declared lifetime never expire on the client side.
    #[must_use]
    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        self.expires_at_unix().is_some_and(|at| now_unix > at)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    /// Whether the token enters its refresh window within `threshold` of
    /// `now_unix`.
    #[must_use]
    pub fn expiring_within_at(&self, threshold: Duration, now_unix: i64) -> bool {
        self.expires_at_unix()
            .is_some_and(|at| at - now_unix < threshold.as_secs() as i64)
    }

    #[must_use]
    pub fn expiring_within(&self, threshold: Duration) -> bool {
        self.expiring_within_at(threshold, unix_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn token(expires_in: i64, obtained_at: i64) -> Token {
        Token {
            access_token: "tok".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: None,
            expires_in,
            obtained_at_unix: obtained_at,
            claims: None,
        }
    }

    #[test]
    fn test_empty_access_token_is_expired() {
        let mut t = token(3600, 1_000);
        t.access_token.clear();
        assert!(t.is_expired_at(1_001));
    }

    #[test]
    fn test_expiry_boundaries() {
        let t = token(100, 1_000);
        assert_eq!(t.expires_at_unix(), Some(1_100));
        assert!(!t.is_expired_at(1_100));
        assert!(t.is_expired_at(1_101));
    }

    #[test]
    fn test_token_without_lifetime_never_expires() {
        let t = token(0, 1_000);
        assert_eq!(t.expires_at_unix(), None);
        assert!(!t.is_expired_at(i64::MAX));
        assert!(!t.expiring_within_at(Duration::from_secs(300), i64::MAX - 1));
    }

    #[test]
    fn test_expiring_within_threshold() {
        let t = token(600, 1_000);
        let threshold = Duration::from_secs(300);
        // 600s of life left: outside the window.
        assert!(!t.expiring_within_at(threshold, 1_000));
        // 299s left: inside.
        assert!(t.expiring_within_at(threshold, 1_301));
        // exactly 300s left: not yet inside.
        assert!(!t.expiring_within_at(threshold, 1_300));
    }

    #[test]
    fn test_stamp_obtained_at_is_write_once() {
        let mut t = token(60, 0);
        t.stamp_obtained_at(500);
        t.stamp_obtained_at(900);
        assert_eq!(t.obtained_at_unix, 500);
    }

    #[test]
    fn test_wire_json_round_trip_preserves_obtained_at() {
        let mut t = token(3600, 0);
        t.refresh_token = Some("refresh".to_string());
        t.stamp_obtained_at(1_700_000_000);

        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"obtained_at_unix\":1700000000"));
        assert!(!json.contains("expires_at"));

        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.expires_at_unix(), Some(1_700_000_000 + 3600));
    }

    #[test]
    fn test_deserializes_plain_auth_service_response() {
        // The acquisition response has no obtained_at_unix; the field defaults
        // and is stamped by the manager afterwards.
        let t: Token = serde_json::from_str(
            r#"{"access_token":"tok-1","token_type":"Bearer","expires_in":3600}"#,
        )
        .unwrap();
        assert_eq!(t.access_token, "tok-1");
        assert_eq!(t.expires_in, 3600);
        assert_eq!(t.obtained_at_unix, 0);
        assert_eq!(t.expires_at_unix(), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut t = token(60, 1);
        t.access_token = "sekrit-access".to_string();
        t.refresh_token = Some("sekrit-refresh".to_string());
        let out = format!("{t:?}");
        assert!(!out.contains("sekrit-access"));
        assert!(!out.contains("sekrit-refresh"));
    }
}
