//! OAuth token endpoint client
//!
//! Two interactions, both form-encoded POSTs to the site's token endpoint:
//! 1. Authorization code exchange (completes a browser login)
//! 2. Refresh (keeps a stored token usable)
//!
//! Neither retries. A failed refresh is surfaced so the caller can force a
//! new login.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::record::{TokenRecord, now_secs};
use crate::site::Site;

/// Token endpoint response for both grant types.
///
/// `refresh_token` is often omitted on refresh (no rotation); `expires_in`
/// is a delta in seconds and may be absent.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    /// Convert to a stored record, anchoring `expires_in` at `now`.
    pub fn into_record(self, now: u64) -> TokenRecord {
        TokenRecord::bearer(
            self.access_token,
            self.refresh_token,
            self.expires_in.map(|secs| now.saturating_add(secs)),
        )
    }
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchange an authorization code (plus the PKCE verifier) for tokens.
pub async fn exchange_code(
    client: &reqwest::Client,
    site: &Site,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenRecord> {
    let endpoint = site.token_endpoint()?;
    let client_id = site.client_id()?;

    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
            ("code_verifier", verifier),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let message = error_message(response).await;
        return Err(Error::TokenExchange {
            status: status.as_u16(),
            message,
        });
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange {
            status: status.as_u16(),
            message: format!("invalid token response: {e}"),
        })?;
    debug!(site = %site.name, expires_in = ?token.expires_in, "authorization code exchanged");
    Ok(token.into_record(now_secs()))
}

/// Obtain a new access token with a refresh token.
///
/// The returned record carries `refresh_token: None` when the server did
/// not rotate it; the caller decides what to carry forward.
pub async fn refresh(
    client: &reqwest::Client,
    site: &Site,
    refresh_token: &str,
) -> Result<TokenRecord> {
    let endpoint = site.token_endpoint()?;
    let client_id = site.client_id()?;

    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let message = error_message(response).await;
        return Err(Error::Refresh {
            status: status.as_u16(),
            message,
        });
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Refresh {
            status: status.as_u16(),
            message: format!("invalid refresh response: {e}"),
        })?;
    debug!(site = %site.name, rotated = token.refresh_token.is_some(), "access token refreshed");
    Ok(token.into_record(now_secs()))
}

/// Prefer the structured OAuth error; fall back to the raw body.
async fn error_message(response: reqwest::Response) -> String {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody {
            error: Some(error),
            error_description,
        }) => match error_description {
            Some(d) if !d.is_empty() => format!("{error}: {d}"),
            _ => error,
        },
        _ if body.is_empty() => String::from("<no body>"),
        _ => body,
    }
}
