//! Error types for login, token storage and refresh

/// Errors from the authentication core.
///
/// Every variant is reported to the caller; none are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("callback port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("no authorization callback received within {timeout_secs} seconds")]
    CallbackTimeout { timeout_secs: u64 },

    #[error("callback state does not match this login attempt (stale tab or forged request)")]
    StateMismatch,

    #[error("authorization denied: {}", describe(.error, .description.as_deref()))]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("login cancelled")]
    LoginCancelled,

    #[error("token exchange failed ({status}): {message}")]
    TokenExchange { status: u16, message: String },

    #[error("token refresh failed ({status}): {message}")]
    Refresh { status: u16, message: String },

    #[error("site '{site}' needs to log in again")]
    ReauthRequired { site: String },

    #[error("encryption key is corrupt: {0}")]
    KeyCorrupt(String),

    #[error("token store is corrupt or was encrypted with another key: {0}")]
    TokenStoreCorrupt(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the only way forward is an explicit `login` for the site.
    pub fn is_reauth_hint(&self) -> bool {
        matches!(
            self,
            Error::ReauthRequired { .. }
                | Error::Refresh { .. }
                | Error::KeyCorrupt(_)
                | Error::TokenStoreCorrupt(_)
        )
    }
}

fn describe(error: &str, description: Option<&str>) -> String {
    match description {
        Some(d) if !d.is_empty() => format!("{error} ({d})"),
        _ => error.to_string(),
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_message_includes_description() {
        let err = Error::AuthorizationDenied {
            error: "access_denied".into(),
            description: Some("user declined".into()),
        };
        assert_eq!(
            err.to_string(),
            "authorization denied: access_denied (user declined)"
        );

        let bare = Error::AuthorizationDenied {
            error: "access_denied".into(),
            description: None,
        };
        assert_eq!(bare.to_string(), "authorization denied: access_denied");
    }

    #[test]
    fn reauth_hint_covers_unrecoverable_errors() {
        assert!(Error::ReauthRequired { site: "acme".into() }.is_reauth_hint());
        assert!(
            Error::Refresh {
                status: 400,
                message: "invalid_grant".into()
            }
            .is_reauth_hint()
        );
        assert!(Error::TokenStoreCorrupt("bad tag".into()).is_reauth_hint());
        assert!(!Error::PortInUse { port: 8585 }.is_reauth_hint());
        assert!(!Error::Http("connection refused".into()).is_reauth_hint());
    }
}
