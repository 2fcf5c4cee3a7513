use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tally_core::{GuardPolicy, LifetimePolicy};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";

#[derive(Parser, Debug, Default)]
#[command(name = "tally-gate")]
#[command(about = "Edge session gate for the Tally web app", long_about = None)]
pub struct Args {
    /// TOML config file
    #[arg(long, default_value = "")]
    pub config: String,
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    #[default]
    Memory,
    Gotrue,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedUser {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub mode: IdentityMode,
    pub url: String,
    pub anon_key: String,
    /// Supabase-style project ref used in the session cookie name.
    pub project_ref: String,
    pub timeout_ms: u64,
    /// Memory mode only: sessions older than this are rotated on revalidation.
    pub session_rotate_secs: u64,
    pub users: Vec<SeedUser>,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            mode: IdentityMode::Memory,
            url: String::new(),
            anon_key: String::new(),
            project_ref: "local".to_string(),
            timeout_ms: 5_000,
            session_rotate_secs: 3_600,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub addr: String,
    /// Trust `X-Forwarded-Host` on auth callback redirects.
    pub production: bool,
    /// Coerce identity cookies to session scope.
    pub session_cookies_only: bool,
    pub secure_cookies: bool,
    pub log_dir: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            production: false,
            session_cookies_only: true,
            secure_cookies: false,
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub identity: IdentitySection,
    pub policy: GuardPolicy,
}

impl FileConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse config")
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&raw)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub log_dir: String,
    pub production: bool,
    pub lifetime_policy: LifetimePolicy,
    pub secure_cookies: bool,
    pub identity: IdentitySection,
    pub policy: GuardPolicy,
}

pub fn load_config() -> Result<Config> {
    resolve_config(Args::parse())
}

/// Flags win over environment, environment wins over the config file.
pub fn resolve_config(args: Args) -> Result<Config> {
    let file = match resolve_config_path(&args.config) {
        Some(path) => FileConfig::read(&path)?,
        None => FileConfig::default(),
    };
    let mut identity = file.identity;
    if let Some(url) = env_value("TALLY_IDENTITY_URL") {
        identity.url = url;
        identity.mode = IdentityMode::Gotrue;
    }
    if let Some(key) = env_value("TALLY_IDENTITY_ANON_KEY") {
        identity.anon_key = key;
    }
    if identity.mode == IdentityMode::Gotrue && identity.url.trim().is_empty() {
        anyhow::bail!("identity.mode = \"gotrue\" requires identity.url");
    }

    file.policy
        .validate()
        .context("Invalid [policy] section")?;

    Ok(Config {
        addr: first_non_empty(&args.addr, "TALLY_ADDR", &file.server.addr)
            .unwrap_or_else(|| DEFAULT_ADDR.to_string()),
        debug: args.debug || env_true("TALLY_DEBUG"),
        log_dir: first_non_empty(&args.log_dir, "TALLY_LOG_DIR", &file.server.log_dir)
            .unwrap_or_default(),
        production: file.server.production,
        lifetime_policy: if file.server.session_cookies_only {
            LifetimePolicy::SessionScoped
        } else {
            LifetimePolicy::Preserve
        },
        secure_cookies: file.server.secure_cookies,
        identity,
        policy: file.policy,
    })
}

fn resolve_config_path(flag: &str) -> Option<PathBuf> {
    if !flag.trim().is_empty() {
        return Some(PathBuf::from(flag));
    }
    env_value("TALLY_CONFIG").map(PathBuf::from)
}

fn first_non_empty(flag: &str, env_key: &str, file_value: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    if let Some(value) = env_value(env_key) {
        return Some(value);
    }
    if !file_value.trim().is_empty() {
        return Some(file_value.to_string());
    }
    None
}

fn env_value(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
