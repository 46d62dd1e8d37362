//! Headless credentials from environment variables
//!
//! With `ERPNEXT_API_KEY` and `ERPNEXT_API_SECRET` set, API calls use that
//! key pair for the current process only. The token store is neither read
//! nor written. `ERPNEXT_URL` optionally replaces the site's base URL.

use common::Secret;

use crate::record::TokenRecord;

pub const ENV_URL: &str = "ERPNEXT_URL";
pub const ENV_API_KEY: &str = "ERPNEXT_API_KEY";
pub const ENV_API_SECRET: &str = "ERPNEXT_API_SECRET";

#[derive(Debug, Clone)]
pub struct EnvOverride {
    pub base_url: Option<String>,
    pub api_key: String,
    pub api_secret: Secret<String>,
}

impl EnvOverride {
    /// Read the process environment. `None` unless both key and secret are set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` over an arbitrary lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let api_key = get(ENV_API_KEY)?;
        let api_secret = get(ENV_API_SECRET)?;
        Some(Self {
            base_url: get(ENV_URL).map(|u| u.trim_end_matches('/').to_string()),
            api_key,
            api_secret: Secret::new(api_secret),
        })
    }

    pub fn record(&self) -> TokenRecord {
        TokenRecord::api_key(&self.api_key, self.api_secret.expose())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::record::TokenType;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn requires_key_and_secret() {
        assert!(EnvOverride::from_lookup(lookup(&[])).is_none());
        assert!(EnvOverride::from_lookup(lookup(&[(ENV_API_KEY, "K")])).is_none());
        assert!(
            EnvOverride::from_lookup(lookup(&[(ENV_API_KEY, "K"), (ENV_API_SECRET, " ")]))
                .is_none()
        );
    }

    #[test]
    fn builds_api_key_record() {
        let env = EnvOverride::from_lookup(lookup(&[
            (ENV_API_KEY, "K"),
            (ENV_API_SECRET, "S"),
            (ENV_URL, "https://ci.example.com/"),
        ]))
        .unwrap();
        assert_eq!(env.base_url.as_deref(), Some("https://ci.example.com"));

        let record = env.record();
        assert_eq!(record.token_type, TokenType::ApiKey);
        assert_eq!(record.access_token.expose(), "K:S");
    }
}
