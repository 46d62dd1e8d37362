//! Site records and endpoint resolution
//!
//! A `Site` is owned by the configuration layer; this crate only reads it.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::constants::{DEFAULT_AUTHORIZE_PATH, DEFAULT_SCOPE, DEFAULT_TOKEN_PATH};
use crate::error::{Error, Result};

/// One configured remote ERPNext/Frappe instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub base_url: String,
    pub client_id: String,
    /// Space-delimited OAuth scopes
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
}

impl Site {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client_id: client_id.into(),
            scope: DEFAULT_SCOPE.to_string(),
            authorize_path: None,
            token_path: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Parsed `base_url`. Must be an absolute http(s) URL with a host.
    pub fn base(&self) -> Result<Url> {
        parse_base_url(&self.base_url)
            .map_err(|msg| Error::Config(format!("site '{}': {msg}", self.name)))
    }

    /// `client_id`, rejecting blank values.
    pub fn client_id(&self) -> Result<&str> {
        let id = self.client_id.trim();
        if id.is_empty() {
            return Err(Error::Config(format!(
                "site '{}' has no client_id",
                self.name
            )));
        }
        Ok(id)
    }

    pub fn authorize_endpoint(&self) -> Result<Url> {
        self.endpoint(self.authorize_path.as_deref().unwrap_or(DEFAULT_AUTHORIZE_PATH))
    }

    pub fn token_endpoint(&self) -> Result<Url> {
        self.endpoint(self.token_path.as_deref().unwrap_or(DEFAULT_TOKEN_PATH))
    }

    /// Append `path` to the base URL, keeping any path prefix the base has
    /// (e.g. `https://host/erp` + `/api/...`).
    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self.base()?;
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| Error::Config(format!("site '{}': bad endpoint {joined}: {e}", self.name)))
    }
}

/// Validate a base URL string. Returns a human-readable reason on failure.
pub fn parse_base_url(raw: &str) -> std::result::Result<Url, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("base_url is empty".to_string());
    }
    let url = Url::parse(raw).map_err(|e| format!("base_url {raw:?} is not a valid URL: {e}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!(
            "base_url must start with http:// or https://, got: {raw}"
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(format!("base_url {raw:?} has no host"));
    }
    Ok(url)
}
