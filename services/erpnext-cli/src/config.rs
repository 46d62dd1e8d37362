//! Site registry and configuration directory
//!
//! Directory precedence: `--config-dir` / `ERPNEXT_CONFIG_DIR` >
//! `$XDG_CONFIG_HOME/erpnext-cli` > platform config dir.
//!
//! `config.toml` holds no secrets; credentials live in the encrypted token
//! store next to it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use erpnext_auth::Site;
use erpnext_auth::site::parse_base_url;
use serde::{Deserialize, Serialize};
use tracing::debug;

const APP_DIR: &str = "erpnext-cli";
const CONFIG_FILE: &str = "config.toml";

/// Resolve the configuration directory.
///
/// `explicit` already carries `ERPNEXT_CONFIG_DIR` through clap's `env`.
pub fn resolve_dir(explicit: Option<&Path>) -> common::Result<PathBuf> {
    resolve_dir_with(explicit, |name| std::env::var_os(name).map(PathBuf::from))
}

fn resolve_dir_with(
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<PathBuf>,
) -> common::Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Some(xdg) = lookup("XDG_CONFIG_HOME").filter(|p| !p.as_os_str().is_empty()) {
        return Ok(xdg.join(APP_DIR));
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or_else(|| common::Error::Config("cannot determine a config directory; pass --config-dir".into()))
}

/// One `[sites.<name>]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
}

fn default_scope() -> String {
    erpnext_auth::DEFAULT_SCOPE.to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_site: Option<String>,
    #[serde(default)]
    sites: BTreeMap<String, SiteEntry>,
}

/// `config.toml` loaded into memory. Mutations apply on `save()`.
#[derive(Debug)]
pub struct SiteRegistry {
    path: PathBuf,
    file: RegistryFile,
}

impl SiteRegistry {
    /// Load `<dir>/config.toml`. A missing file is an empty registry.
    pub fn load(dir: &Path) -> common::Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), sites = file.sites.len(), "loaded site registry");
        Ok(Self { path, file })
    }

    pub fn save(&self) -> common::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, toml::to_string_pretty(&self.file)?)?;
        debug!(path = %self.path.display(), "saved site registry");
        Ok(())
    }

    /// Add or replace a site. The first site added becomes the default.
    pub fn add(
        &mut self,
        name: &str,
        base_url: &str,
        client_id: &str,
        scope: &str,
        make_default: bool,
    ) -> common::Result<()> {
        validate_name(name)?;
        parse_base_url(base_url).map_err(common::Error::Config)?;
        let scope = scope.trim();
        let (authorize_path, token_path) = match self.file.sites.get(name) {
            Some(existing) => (existing.authorize_path.clone(), existing.token_path.clone()),
            None => (None, None),
        };
        self.file.sites.insert(
            name.to_string(),
            SiteEntry {
                base_url: base_url.trim().trim_end_matches('/').to_string(),
                client_id: client_id.trim().to_string(),
                scope: if scope.is_empty() { default_scope() } else { scope.to_string() },
                authorize_path,
                token_path,
            },
        );
        if make_default || self.file.default_site.is_none() {
            self.file.default_site = Some(name.to_string());
        }
        Ok(())
    }

    /// Remove a site, promoting the first remaining one if it was the default.
    pub fn remove(&mut self, name: &str) -> common::Result<()> {
        if self.file.sites.remove(name).is_none() {
            return Err(not_found(name));
        }
        if self.file.default_site.as_deref() == Some(name) {
            self.file.default_site = self.file.sites.keys().next().cloned();
        }
        Ok(())
    }

    pub fn set_default(&mut self, name: &str) -> common::Result<()> {
        if !self.file.sites.contains_key(name) {
            return Err(not_found(name));
        }
        self.file.default_site = Some(name.to_string());
        Ok(())
    }

    pub fn default_site(&self) -> Option<&str> {
        self.file.default_site.as_deref()
    }

    pub fn entry(&self, name: &str) -> Option<&SiteEntry> {
        self.file.sites.get(name)
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut SiteEntry> {
        self.file.sites.get_mut(name)
    }

    /// The site to act on: `explicit`, else the default.
    pub fn select(&self, explicit: Option<&str>) -> common::Result<String> {
        let name = match explicit {
            Some(name) => name,
            None => self.default_site().ok_or_else(|| {
                common::Error::Config(
                    "no site given and no default site configured; use --site or `erpnext add-site`"
                        .into(),
                )
            })?,
        };
        if !self.file.sites.contains_key(name) {
            return Err(not_found(name));
        }
        Ok(name.to_string())
    }

    /// All sites, sorted by name, as the auth crate sees them.
    pub fn sites(&self) -> Vec<Site> {
        self.file
            .sites
            .iter()
            .map(|(name, entry)| Site {
                name: name.clone(),
                base_url: entry.base_url.clone(),
                client_id: entry.client_id.clone(),
                scope: entry.scope.clone(),
                authorize_path: entry.authorize_path.clone(),
                token_path: entry.token_path.clone(),
            })
            .collect()
    }

    fn available(&self) -> String {
        if self.file.sites.is_empty() {
            return "none".to_string();
        }
        self.file.sites.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}

fn not_found(name: &str) -> common::Error {
    common::Error::Config(format!("site '{name}' is not configured"))
}

fn validate_name(name: &str) -> common::Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '.' || c == '/') {
        return Err(common::Error::Config(format!(
            "invalid site name {name:?}: must be non-empty without whitespace, '.' or '/'"
        )));
    }
    Ok(())
}

/// Site name derived from a URL: the first label of its host.
///
/// `https://acme.erpnext.com` -> `acme`
pub fn site_name_from_url(raw: &str) -> common::Result<String> {
    let url = parse_base_url(raw).map_err(common::Error::Config)?;
    url.host_str()
        .and_then(|host| host.split('.').next())
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .ok_or_else(|| common::Error::Config(format!("cannot derive a site name from {raw}")))
}

impl std::fmt::Display for SiteRegistry {
    /// Lists configured site names, for error messages.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.available())
    }
}
