//! Command-line surface and command handlers

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use erpnext_auth::{
    AuthPaths, Browser, CredentialManager, DEFAULT_CALLBACK_PORT, LoginOptions, SystemBrowser,
    TokenStatus, TokenType,
};
use tracing::warn;
use url::Url;

use crate::api;
use crate::config::{self, SiteRegistry};

#[derive(Debug, Parser)]
#[command(name = "erpnext", version, about = "Command-line access to ERPNext/Frappe sites")]
pub struct Cli {
    /// Directory holding config.toml and the encrypted token store
    #[arg(long, global = true, env = "ERPNEXT_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Log output format (written to stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Authenticate to a site (browser OAuth, or an API key pair)
    Login(LoginArgs),
    /// Clear stored credentials (all sites when --site is omitted)
    Logout {
        #[arg(long)]
        site: Option<String>,
    },
    /// Show the user the stored credentials authenticate as
    Whoami {
        #[arg(long)]
        site: Option<String>,
    },
    /// List configured sites and their login state
    Sites,
    /// Register a site without logging in
    AddSite(AddSiteArgs),
    /// Remove a site and its stored credentials
    RemoveSite { name: String },
    /// Make a site the default
    SetDefault { name: String },
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Site name (defaults to the configured default site)
    #[arg(long)]
    pub site: Option<String>,
    /// Site base URL; registers the site when given
    #[arg(long)]
    pub url: Option<String>,
    /// OAuth client ID of the site's connected app
    #[arg(long)]
    pub client_id: Option<String>,
    /// OAuth scope
    #[arg(long)]
    pub scope: Option<String>,
    /// Local callback port
    #[arg(long, default_value_t = DEFAULT_CALLBACK_PORT)]
    pub port: u16,
    /// Seconds to wait for the browser redirect
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,
    /// API key for headless login
    #[arg(long, requires = "api_secret")]
    pub api_key: Option<String>,
    /// API secret paired with --api-key
    #[arg(long, requires = "api_key")]
    pub api_secret: Option<String>,
}

#[derive(Debug, Args)]
pub struct AddSiteArgs {
    pub name: String,
    /// Base URL, e.g. https://acme.erpnext.com
    pub url: String,
    pub client_id: String,
    #[arg(long)]
    pub scope: Option<String>,
    /// Make this the default site
    #[arg(long)]
    pub default: bool,
}

/// Marks an error with the site it concerns, for hints.
#[derive(Debug, Clone)]
pub struct ForSite(pub String);

impl std::fmt::Display for ForSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "site '{}'", self.0)
    }
}

/// Follow-up advice for an error, if any.
pub fn hint(err: &anyhow::Error) -> Option<String> {
    let auth = err.downcast_ref::<erpnext_auth::Error>()?;
    let site = err
        .downcast_ref::<ForSite>()
        .map(|s| s.0.as_str())
        .unwrap_or("<name>");
    match auth {
        erpnext_auth::Error::PortInUse { .. } => {
            Some("retry with another callback port: `erpnext login --port <other>`".into())
        }
        erpnext_auth::Error::KeyCorrupt(_) | erpnext_auth::Error::TokenStoreCorrupt(_) => Some(
            "run `erpnext logout` to discard the unreadable token store, then log in again".into(),
        ),
        e if e.is_reauth_hint() => Some(format!("run `erpnext login --site {site}`")),
        _ => None,
    }
}

/// Prints the authorization URL before handing it to the system browser.
struct ConsoleBrowser;

impl Browser for ConsoleBrowser {
    fn open(&self, url: &Url) -> std::io::Result<()> {
        eprintln!("Opening the browser to authorize. If it does not open, visit:\n\n  {url}\n");
        SystemBrowser.open(url)
    }
}

/// Run one command. `cancel` resolves on operator interrupt.
pub async fn run<C>(cli: Cli, cancel: C) -> Result<()>
where
    C: Future<Output = ()>,
{
    run_with_browser(cli, Arc::new(ConsoleBrowser), cancel).await
}

/// Races the whole command against `cancel`. An interrupted store write
/// leaves the previous file, since the store is replaced by rename.
async fn run_with_browser<C>(cli: Cli, browser: Arc<dyn Browser>, cancel: C) -> Result<()>
where
    C: Future<Output = ()>,
{
    let is_login = matches!(cli.command, Command::Login(_));
    tokio::select! {
        result = dispatch(cli, browser) => result,
        () = cancel => {
            if is_login {
                Err(erpnext_auth::Error::LoginCancelled.into())
            } else {
                Err(anyhow::anyhow!("interrupted"))
            }
        }
    }
}

async fn dispatch(cli: Cli, browser: Arc<dyn Browser>) -> Result<()> {
    let dir = config::resolve_dir(cli.config_dir.as_deref())?;
    let mut registry = SiteRegistry::load(&dir)
        .with_context(|| format!("failed to load site registry from {}", dir.display()))?;
    let paths = AuthPaths::in_dir(&dir);

    match cli.command {
        Command::Login(args) => login(&mut registry, paths, args, browser).await,
        Command::Logout { site } => logout(&registry, paths, site).await,
        Command::Whoami { site } => whoami(&registry, paths, site).await,
        Command::Sites => sites(&registry, paths).await,
        Command::AddSite(args) => {
            registry.add(
                &args.name,
                &args.url,
                &args.client_id,
                args.scope.as_deref().unwrap_or_default(),
                args.default,
            )?;
            registry.save()?;
            println!("Site '{}' added.", args.name);
            if registry.default_site() == Some(args.name.as_str()) {
                println!("Set as default site.");
            }
            println!("Next: erpnext login --site {}", args.name);
            Ok(())
        }
        Command::RemoveSite { name } => {
            registry.remove(&name)?;
            registry.save()?;
            let manager = CredentialManager::new(paths, registry.sites())?;
            if let Err(e) = manager.logout(Some(&name)).await {
                warn!(site = %name, error = %e, "could not clear stored credentials");
            }
            println!("Site '{name}' removed.");
            Ok(())
        }
        Command::SetDefault { name } => {
            registry.set_default(&name)?;
            registry.save()?;
            println!("Default site is now '{name}'.");
            Ok(())
        }
    }
}

async fn login(
    registry: &mut SiteRegistry,
    paths: AuthPaths,
    args: LoginArgs,
    browser: Arc<dyn Browser>,
) -> Result<()> {
    let site = match (&args.site, &args.url) {
        (Some(site), _) => site.clone(),
        (None, Some(url)) => config::site_name_from_url(url)?,
        (None, None) => registry.select(None)?,
    };

    if let Some(url) = &args.url {
        let existing = registry.entry(&site);
        let client_id = args
            .client_id
            .clone()
            .or_else(|| existing.map(|e| e.client_id.clone()))
            .unwrap_or_default();
        // Nothing is registered unless a browser login could use it
        if args.api_key.is_none() && client_id.trim().is_empty() {
            bail!(
                "--client-id is required to register site '{site}' for browser login \
                 (or pass --api-key and --api-secret)"
            );
        }
        let scope = args
            .scope
            .clone()
            .or_else(|| existing.map(|e| e.scope.clone()))
            .unwrap_or_default();
        registry.add(&site, url, &client_id, &scope, true)?;
        registry.save()?;
        println!("Site '{site}' configured.");
    } else if let Some(entry) = registry.entry_mut(&site) {
        if let Some(client_id) = &args.client_id {
            entry.client_id = client_id.trim().to_string();
        }
        if let Some(scope) = &args.scope {
            entry.scope = scope.trim().to_string();
        }
        if args.client_id.is_some() || args.scope.is_some() {
            registry.save()?;
        }
    } else {
        bail!("site '{site}' is not configured (available: {registry}); pass --url to register it");
    }

    let manager = CredentialManager::new(paths, registry.sites())?
        .with_browser(browser);

    if let (Some(key), Some(secret)) = (&args.api_key, &args.api_secret) {
        manager
            .login_api_key(&site, key, secret)
            .await
            .context(ForSite(site.clone()))?;
        println!("API key stored for site '{site}'.");
        return Ok(());
    }

    let options = LoginOptions {
        port: args.port,
        timeout: Duration::from_secs(args.timeout),
    };
    let base_url = manager.site(&site)?.base_url.clone();
    eprintln!("Authenticating to {base_url}...");
    manager
        .login_oauth(&site, &options, std::future::pending())
        .await
        .context(ForSite(site.clone()))?;

    let client = api::client()?;
    match manager.resolve(&site).await {
        Ok(auth) => match api::whoami(&client, &auth).await {
            Ok(user) => println!("Logged in to '{site}' as {user}."),
            Err(e) => println!("Logged in to '{site}', but could not verify the user: {e:#}"),
        },
        Err(e) => println!("Logged in to '{site}', but could not verify the user: {e}"),
    }
    Ok(())
}

async fn logout(registry: &SiteRegistry, paths: AuthPaths, site: Option<String>) -> Result<()> {
    let manager = CredentialManager::new(paths, registry.sites())?;
    let removed = manager
        .logout(site.as_deref())
        .await
        .context(ForSite(site.clone().unwrap_or_else(|| "*".into())))?;

    match (site, removed.is_empty()) {
        (Some(site), true) => println!("No stored credentials for site '{site}'."),
        (Some(site), false) => println!("Logged out of site '{site}'."),
        (None, true) => println!("No active sessions."),
        (None, false) => println!(
            "Logged out of all sites ({} session(s) cleared).",
            removed.len()
        ),
    }
    Ok(())
}

async fn whoami(registry: &SiteRegistry, paths: AuthPaths, site: Option<String>) -> Result<()> {
    let manager = CredentialManager::new(paths, registry.sites())?.with_process_env();
    // With the environment override a site is only needed for its URL
    let site = match registry.select(site.as_deref()) {
        Ok(site) => site,
        Err(_) if erpnext_auth::EnvOverride::from_env().is_some() => {
            site.unwrap_or_else(|| "env".into())
        }
        Err(e) => return Err(e.into()),
    };

    let auth = manager
        .resolve(&site)
        .await
        .context(ForSite(site.clone()))?;
    let user = api::whoami(&api::client()?, &auth).await?;
    println!("{user} ({site})");
    Ok(())
}

async fn sites(registry: &SiteRegistry, paths: AuthPaths) -> Result<()> {
    let sites = registry.sites();
    if sites.is_empty() {
        println!("No sites configured. Add one with: erpnext add-site <name> <url> <client-id>");
        return Ok(());
    }

    let manager = CredentialManager::new(paths, sites.clone())?;
    for site in &sites {
        let marker = if registry.default_site() == Some(site.name.as_str()) {
            "*"
        } else {
            " "
        };
        let state = match manager.status(&site.name).await {
            Ok(status) => describe_status(status.as_ref(), erpnext_auth::record::now_secs()),
            Err(e) => format!("unreadable ({e})"),
        };
        println!("{marker} {:<16} {:<40} {state}", site.name, site.base_url);
    }
    Ok(())
}

fn describe_status(status: Option<&TokenStatus>, now: u64) -> String {
    let Some(status) = status else {
        return "not logged in".to_string();
    };
    match (status.token_type, status.expires_at) {
        (TokenType::ApiKey, _) => format!("API key {}", status.token_hint),
        (TokenType::Bearer, None) => "logged in".to_string(),
        (TokenType::Bearer, Some(at)) if at > now => {
            format!("logged in, expires in {}m", (at - now) / 60)
        }
        (TokenType::Bearer, Some(_)) if status.has_refresh_token => {
            "logged in, token expired (refreshes on next use)".to_string()
        }
        (TokenType::Bearer, Some(_)) => "session expired, log in again".to_string(),
    }
}
