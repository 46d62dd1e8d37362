//! Credential manager: login, logout and transparent refresh
//!
//! Drives one login attempt through
//! `Idle -> AwaitingCallback -> Exchanging -> Stored` (or `Failed`), the
//! headless API-key path `Idle -> Exchanging -> Stored`, and hands out
//! valid access tokens, refreshing them shortly before expiry.
//!
//! Store access is a read-modify-write of the whole encrypted file,
//! serialized in-process by `store_lock`. Refreshes are serialized per site
//! so parallel API calls trigger at most one refresh.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use url::Url;

use crate::authorize::build_authorization_url;
use crate::browser::{Browser, SystemBrowser};
use crate::callback::CallbackListener;
use crate::constants::{
    DEFAULT_CALLBACK_PORT, DEFAULT_CALLBACK_TIMEOUT, DEFAULT_REFRESH_MARGIN,
    TOKEN_REQUEST_TIMEOUT,
};
use crate::env::EnvOverride;
use crate::error::{Error, Result};
use crate::keys::{EncryptionKey, load_or_create_key};
use crate::pkce::{PkcePair, generate_state};
use crate::record::{AccessToken, TokenRecord, TokenType, now_secs};
use crate::site::{Site, parse_base_url};
use crate::store::{self, TokenMap};
use crate::token;

/// Where the token store and its key live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPaths {
    pub token_file: PathBuf,
    pub key_file: PathBuf,
}

impl AuthPaths {
    /// `<dir>/tokens.enc` and `<dir>/.key`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            token_file: dir.join("tokens.enc"),
            key_file: dir.join(".key"),
        }
    }
}

/// Per-attempt knobs for the browser login.
#[derive(Debug, Clone)]
pub struct LoginOptions {
    /// Callback port; 0 picks an ephemeral one
    pub port: u16,
    pub timeout: Duration,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_CALLBACK_PORT,
            timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

/// Phase of a single login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    AwaitingCallback,
    Exchanging,
    Stored,
    Failed,
}

/// Base URL plus `Authorization` header value for one API call.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub base_url: Url,
    pub authorization: Secret<String>,
}

/// Read-only summary of a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub token_type: TokenType,
    pub expires_at: Option<u64>,
    pub has_refresh_token: bool,
    pub token_hint: String,
}

pub struct CredentialManager {
    paths: AuthPaths,
    sites: HashMap<String, Site>,
    http: reqwest::Client,
    browser: Arc<dyn Browser>,
    env_override: Option<EnvOverride>,
    refresh_margin: Duration,
    key: OnceCell<EncryptionKey>,
    store_lock: Mutex<()>,
    refresh_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialManager {
    /// Manager over the given files and site definitions.
    ///
    /// Does not consult the process environment; see `with_process_env`.
    pub fn new(paths: AuthPaths, sites: impl IntoIterator<Item = Site>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))?;
        Ok(Self {
            paths,
            sites: sites.into_iter().map(|s| (s.name.clone(), s)).collect(),
            http,
            browser: Arc::new(SystemBrowser),
            env_override: None,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            key: OnceCell::new(),
            store_lock: Mutex::new(()),
            refresh_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn with_browser(mut self, browser: Arc<dyn Browser>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn with_env_override(mut self, env_override: Option<EnvOverride>) -> Self {
        self.env_override = env_override;
        self
    }

    /// Honor `ERPNEXT_API_KEY` / `ERPNEXT_API_SECRET` / `ERPNEXT_URL`.
    pub fn with_process_env(self) -> Self {
        let env_override = EnvOverride::from_env();
        if env_override.is_some() {
            info!("using API key credentials from the environment");
        }
        self.with_env_override(env_override)
    }

    pub fn paths(&self) -> &AuthPaths {
        &self.paths
    }

    pub fn site(&self, name: &str) -> Result<&Site> {
        self.sites
            .get(name)
            .ok_or_else(|| Error::Config(format!("site '{name}' is not configured")))
    }

    /// Browser login with PKCE. Blocks until the redirect arrives, the
    /// timeout elapses or `cancel` resolves.
    ///
    /// The store is written only after a successful exchange; any failure
    /// leaves the site's existing record untouched.
    pub async fn login_oauth<C>(
        &self,
        site_name: &str,
        options: &LoginOptions,
        cancel: C,
    ) -> Result<TokenRecord>
    where
        C: Future<Output = ()>,
    {
        let site = self.site(site_name)?;
        site.base()?;
        site.client_id()?;
        // Fail on a broken key before sending the user to the browser
        self.key().await?;

        let pkce = PkcePair::generate();
        let state = generate_state();
        let listener = CallbackListener::bind(options.port, state.clone()).await?;
        let redirect_uri = listener.redirect_uri();
        let url = build_authorization_url(site, &pkce, &state, &redirect_uri)?;

        transition(site_name, LoginState::Idle, LoginState::AwaitingCallback);
        if let Err(e) = self.browser.open(&url) {
            warn!(site = site_name, error = %e, "could not open a browser");
        }

        let code = match listener.wait(options.timeout, cancel).await {
            Ok(code) => code,
            Err(e) => {
                transition(site_name, LoginState::AwaitingCallback, LoginState::Failed);
                return Err(e);
            }
        };

        transition(site_name, LoginState::AwaitingCallback, LoginState::Exchanging);
        let record =
            match token::exchange_code(&self.http, site, &code, &pkce.verifier, &redirect_uri).await
            {
                Ok(record) => record,
                Err(e) => {
                    transition(site_name, LoginState::Exchanging, LoginState::Failed);
                    return Err(e);
                }
            };

        self.put(site_name, record.clone()).await?;
        transition(site_name, LoginState::Exchanging, LoginState::Stored);
        info!(site = site_name, "logged in");
        Ok(record)
    }

    /// Store an API key pair for headless use. No network round trip.
    pub async fn login_api_key(
        &self,
        site_name: &str,
        api_key: &str,
        api_secret: &str,
    ) -> Result<()> {
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(Error::Config("API key and secret must not be empty".into()));
        }
        transition(site_name, LoginState::Idle, LoginState::Exchanging);
        self.put(site_name, TokenRecord::api_key(api_key, api_secret))
            .await?;
        transition(site_name, LoginState::Exchanging, LoginState::Stored);
        info!(site = site_name, "stored API key credentials");
        Ok(())
    }

    /// A token that is valid now, refreshing it first if it expires within
    /// the refresh margin.
    ///
    /// An expired token with no refresh token is `ReauthRequired`; a
    /// rejected refresh is `Refresh`. Neither falls back to the stale token.
    pub async fn get_valid_token(&self, site_name: &str) -> Result<AccessToken> {
        if let Some(env) = &self.env_override {
            return Ok(env.record().access());
        }

        let record = self.require(site_name).await?;
        if !record.needs_refresh(now_secs(), self.refresh_margin) {
            return Ok(record.access());
        }

        let lock = self.refresh_lock(site_name);
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited for the lock
        let record = self.require(site_name).await?;
        if !record.needs_refresh(now_secs(), self.refresh_margin) {
            debug!(site = site_name, "token refreshed by a concurrent caller");
            return Ok(record.access());
        }
        let Some(refresh_token) = record.refresh_token else {
            info!(site = site_name, "token expired and no refresh token is stored");
            return Err(Error::ReauthRequired {
                site: site_name.to_string(),
            });
        };

        debug!(site = site_name, "token expiring, refreshing");
        let site = self.site(site_name)?;
        let mut fresh = token::refresh(&self.http, site, refresh_token.expose()).await?;
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token);
        }
        self.put(site_name, fresh.clone()).await?;
        info!(site = site_name, "token refreshed");
        Ok(fresh.access())
    }

    /// Base URL and `Authorization` header for an API call to `site_name`.
    pub async fn resolve(&self, site_name: &str) -> Result<ResolvedAuth> {
        if let Some(env) = &self.env_override {
            let base_url = match &env.base_url {
                Some(url) => parse_base_url(url).map_err(Error::Config)?,
                None => self.site(site_name)?.base()?,
            };
            return Ok(ResolvedAuth {
                base_url,
                authorization: env.record().access().header_value(),
            });
        }

        let base_url = self.site(site_name)?.base()?;
        let token = self.get_valid_token(site_name).await?;
        Ok(ResolvedAuth {
            base_url,
            authorization: token.header_value(),
        })
    }

    /// Remove one site's record, or all records when `site_name` is `None`.
    ///
    /// Returns the sites that were logged out. Logging out a site with no
    /// record is a no-op. Logging out everything deletes the token file
    /// without decrypting it, so it also recovers from a corrupt store.
    pub async fn logout(&self, site_name: Option<&str>) -> Result<Vec<String>> {
        let _guard = self.store_lock.lock().await;
        if !self.store_exists().await? {
            return Ok(Vec::new());
        }

        let Some(site_name) = site_name else {
            let removed = match self.load_unlocked().await {
                Ok(tokens) => tokens.into_keys().collect(),
                Err(e) => {
                    warn!(error = %e, "discarding unreadable token store");
                    Vec::new()
                }
            };
            tokio::fs::remove_file(&self.paths.token_file)
                .await
                .map_err(|e| {
                    Error::Io(format!(
                        "removing {}: {e}",
                        self.paths.token_file.display()
                    ))
                })?;
            info!(sites = removed.len(), "logged out of all sites");
            return Ok(removed);
        };

        let mut tokens = self.load_unlocked().await?;
        if tokens.remove(site_name).is_none() {
            debug!(site = site_name, "logout: no stored credentials");
            return Ok(Vec::new());
        }
        store::save(&self.paths.token_file, self.key().await?, &tokens).await?;
        info!(site = site_name, "logged out");
        Ok(vec![site_name.to_string()])
    }

    /// Stored record summary without refreshing.
    pub async fn status(&self, site_name: &str) -> Result<Option<TokenStatus>> {
        Ok(self.load().await?.remove(site_name).map(|record| TokenStatus {
            token_type: record.token_type,
            expires_at: record.expires_at,
            has_refresh_token: record.refresh_token.is_some(),
            token_hint: record.access_token.hint(),
        }))
    }

    pub async fn logged_in_sites(&self) -> Result<Vec<String>> {
        Ok(self.load().await?.into_keys().collect())
    }

    async fn require(&self, site_name: &str) -> Result<TokenRecord> {
        self.load()
            .await?
            .remove(site_name)
            .ok_or_else(|| Error::ReauthRequired {
                site: site_name.to_string(),
            })
    }

    async fn load(&self) -> Result<TokenMap> {
        let _guard = self.store_lock.lock().await;
        self.load_unlocked().await
    }

    async fn load_unlocked(&self) -> Result<TokenMap> {
        if !self.store_exists().await? {
            return Ok(TokenMap::new());
        }
        store::load(&self.paths.token_file, self.key().await?).await
    }

    async fn put(&self, site_name: &str, record: TokenRecord) -> Result<()> {
        let key = self.key().await?;
        let _guard = self.store_lock.lock().await;
        let mut tokens = store::load(&self.paths.token_file, key).await?;
        tokens.insert(site_name.to_string(), record);
        store::save(&self.paths.token_file, key, &tokens).await
    }

    async fn store_exists(&self) -> Result<bool> {
        path_exists(&self.paths.token_file).await
    }

    /// Machine key, loaded once per manager.
    ///
    /// A missing key next to an existing store is corruption, not a first
    /// run: generating a new key would make the store undecryptable.
    async fn key(&self) -> Result<&EncryptionKey> {
        self.key
            .get_or_try_init(|| async {
                let key_exists = path_exists(&self.paths.key_file).await?;
                if !key_exists && self.store_exists().await? {
                    return Err(Error::KeyCorrupt(format!(
                        "{} is missing but {} exists; log out of all sites to reset",
                        self.paths.key_file.display(),
                        self.paths.token_file.display()
                    )));
                }
                load_or_create_key(&self.paths.key_file).await
            })
            .await
    }

    fn refresh_lock(&self, site_name: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.refresh_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(site_name.to_string()).or_default().clone()
    }
}

/// `Ok(false)` only for a path that is really absent; other probe failures
/// (permissions, a file where a directory should be) are errors.
async fn path_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| Error::Io(format!("checking {}: {e}", path.display())))
}

fn transition(site: &str, from: LoginState, to: LoginState) {
    debug!(site, ?from, ?to, "login state");
}
