//! Authenticated calls against a site's REST API

use anyhow::{Context, Result, bail};
use erpnext_auth::{ResolvedAuth, TOKEN_REQUEST_TIMEOUT};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::debug;

/// Frappe method returning the session user
pub const WHOAMI_PATH: &str = "/api/method/frappe.auth.get_logged_user";

/// Frappe wraps method results as `{"message": ...}`.
#[derive(Debug, Deserialize)]
struct MethodResponse<T> {
    message: T,
}

/// HTTP client for API calls, bounded like the token endpoint requests.
pub fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(TOKEN_REQUEST_TIMEOUT)
        .build()
        .context("building HTTP client")
}

/// Join `path` onto the base URL, keeping any path prefix the base has.
fn endpoint(auth: &ResolvedAuth, path: &str) -> String {
    format!(
        "{}/{}",
        auth.base_url.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// The user the resolved credentials authenticate as.
pub async fn whoami(client: &reqwest::Client, auth: &ResolvedAuth) -> Result<String> {
    let url = endpoint(auth, WHOAMI_PATH);
    debug!(url = %url, "calling whoami");
    let resp = client
        .get(&url)
        .header(AUTHORIZATION, auth.authorization.expose())
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        bail!("server rejected the stored credentials ({status})");
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("whoami failed ({status}): {}", body.trim());
    }

    let body: MethodResponse<String> = resp
        .json()
        .await
        .context("unexpected whoami response body")?;
    Ok(body.message)
}
