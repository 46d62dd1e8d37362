//! Stored credential bundle for one site
//!
//! OAuth and API-key credentials are two variants of one record, tagged by
//! `token_type`. Constructors enforce the API-key invariant: no expiry and
//! no refresh token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    Bearer,
    #[serde(rename = "APIKey")]
    ApiKey,
}

impl TokenType {
    pub fn label(&self) -> &'static str {
        match self {
            TokenType::Bearer => "Bearer",
            TokenType::ApiKey => "APIKey",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    /// Absolute expiry, unix seconds. `None` never auto-refreshes.
    #[serde(default)]
    pub expires_at: Option<u64>,
    pub token_type: TokenType,
}

impl TokenRecord {
    pub fn bearer(
        access_token: impl Into<Secret<String>>,
        refresh_token: Option<String>,
        expires_at: Option<u64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.map(Secret::new),
            expires_at,
            token_type: TokenType::Bearer,
        }
    }

    /// `<api_key>:<api_secret>`, never expiring.
    pub fn api_key(api_key: &str, api_secret: &str) -> Self {
        Self {
            access_token: Secret::new(format!("{api_key}:{api_secret}")),
            refresh_token: None,
            expires_at: None,
            token_type: TokenType::ApiKey,
        }
    }

    /// True when the token must be refreshed before use at time `now`.
    ///
    /// API keys and records without an expiry never need refreshing.
    pub fn needs_refresh(&self, now: u64, margin: Duration) -> bool {
        match (self.token_type, self.expires_at) {
            (TokenType::ApiKey, _) | (_, None) => false,
            (TokenType::Bearer, Some(expires_at)) => {
                now >= expires_at.saturating_sub(margin.as_secs())
            }
        }
    }

    pub fn access(&self) -> AccessToken {
        AccessToken {
            token_type: self.token_type,
            token: self.access_token.clone(),
        }
    }
}

/// A usable credential handed to API callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token_type: TokenType,
    pub token: Secret<String>,
}

impl AccessToken {
    /// Full `Authorization` header value: `Bearer <t>` or `token <k>:<s>`.
    pub fn header_value(&self) -> Secret<String> {
        let scheme = match self.token_type {
            TokenType::Bearer => "Bearer",
            TokenType::ApiKey => "token",
        };
        Secret::new(format!("{scheme} {}", self.token.expose()))
    }
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARGIN: Duration = Duration::from_secs(300);

    #[test]
    fn api_key_record_never_expires() {
        let record = TokenRecord::api_key("K", "S");
        assert_eq!(record.access_token.expose(), "K:S");
        assert_eq!(record.expires_at, None);
        assert!(record.refresh_token.is_none());
        assert!(!record.needs_refresh(u64::MAX, MARGIN));
    }

    #[test]
    fn bearer_refresh_boundary_respects_margin() {
        let record = TokenRecord::bearer("a", Some("r".into()), Some(10_000));
        assert!(!record.needs_refresh(10_000 - 301, MARGIN));
        assert!(record.needs_refresh(10_000 - 300, MARGIN));
        assert!(record.needs_refresh(10_010, MARGIN));
    }

    #[test]
    fn bearer_without_expiry_is_not_refreshed() {
        let record = TokenRecord::bearer("a", None, None);
        assert!(!record.needs_refresh(now_secs(), MARGIN));
    }

    #[test]
    fn header_value_depends_on_token_type() {
        let bearer = TokenRecord::bearer("a1", None, None).access();
        assert_eq!(bearer.header_value().expose(), "Bearer a1");

        let key = TokenRecord::api_key("K", "S").access();
        assert_eq!(key.header_value().expose(), "token K:S");
    }

    #[test]
    fn serialized_form_uses_wire_names() {
        let json = serde_json::to_value(TokenRecord::api_key("K", "S")).unwrap();
        assert_eq!(json["token_type"], "APIKey");
        assert_eq!(json["access_token"], "K:S");
        assert!(json["expires_at"].is_null());
        assert!(json.get("refresh_token").is_none());
    }
}
