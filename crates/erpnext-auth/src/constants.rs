//! Defaults for Frappe/ERPNext OAuth sites
//!
//! Paths are relative to a site's `base_url`. A site may override either
//! endpoint path in its configuration.

use std::time::Duration;

/// Frappe's OAuth2 authorization endpoint
pub const DEFAULT_AUTHORIZE_PATH: &str = "/api/method/frappe.integrations.oauth2.authorize";

/// Frappe's OAuth2 token endpoint (code exchange and refresh)
pub const DEFAULT_TOKEN_PATH: &str = "/api/method/frappe.integrations.oauth2.get_token";

/// Scope requested when a site does not configure one
pub const DEFAULT_SCOPE: &str = "openid all";

/// Local port the callback listener binds when none is given
pub const DEFAULT_CALLBACK_PORT: u16 = 8585;

/// Path the authorization server redirects the browser to
pub const CALLBACK_PATH: &str = "/callback";

/// How long a login waits for the browser redirect
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Tokens expiring within this margin are refreshed before use
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Upper bound on a single token endpoint round trip
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// PKCE verifier length in characters (RFC 7636 allows 43-128)
pub const VERIFIER_LEN: usize = 64;
