//! Authorization URL construction
//!
//! The browser is sent to the site's authorize endpoint with the PKCE
//! challenge and CSRF state. Query values are form-encoded by `url`.

use url::Url;

use crate::error::Result;
use crate::pkce::PkcePair;
use crate::site::Site;

/// Build the GET URL for the site's authorization endpoint.
///
/// Fails with `Error::Config` when the site has no usable `base_url` or
/// `client_id`.
pub fn build_authorization_url(
    site: &Site,
    pkce: &PkcePair,
    state: &str,
    redirect_uri: &str,
) -> Result<Url> {
    let client_id = site.client_id()?;
    let mut url = site.authorize_endpoint()?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &site.scope)
        .append_pair("state", state)
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", pkce.method());
    Ok(url)
}
