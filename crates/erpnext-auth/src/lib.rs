//! ERPNext/Frappe authentication library
//!
//! Browser-based OAuth 2.0 login with PKCE, an encrypted multi-site token
//! store, and transparent refresh. Standalone: the CLI only supplies site
//! definitions and file locations.
//!
//! Credential flow:
//! 1. `pkce::PkcePair::generate()` + `pkce::generate_state()`
//! 2. `callback::CallbackListener::bind()` on the loopback interface
//! 3. User authorizes via `authorize::build_authorization_url()`
//! 4. Listener validates `state` and yields the code
//! 5. `token::exchange_code()` turns it into a `TokenRecord`
//! 6. Record sealed into the store via `store::save()`
//! 7. `CredentialManager::get_valid_token()` calls `token::refresh()` when
//!    the token is within the refresh margin of expiry
//!
//! `manager::CredentialManager` drives all of the above.

pub mod authorize;
pub mod browser;
pub mod callback;
pub mod constants;
pub mod env;
pub mod error;
mod fsutil;
pub mod keys;
pub mod manager;
pub mod pkce;
pub mod record;
pub mod site;
pub mod store;
pub mod token;

pub use browser::{Browser, SystemBrowser};
pub use constants::*;
pub use env::EnvOverride;
pub use error::{Error, Result};
pub use manager::{
    AuthPaths, CredentialManager, LoginOptions, LoginState, ResolvedAuth, TokenStatus,
};
pub use record::{AccessToken, TokenRecord, TokenType};
pub use site::Site;
