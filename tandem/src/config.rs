//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use tandem_core::{ChunkPolicy, LinkConfig};

/// Binary configuration. File: ~/.config/tandem/config.toml or /etc/tandem/config.toml.
/// Env overrides: TANDEM_PORT, TANDEM_DOWNLOAD_DIR, TANDEM_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen port, and the default port when dialing (default 5000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where received files land.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
    #[serde(default)]
    pub chunk: ChunkPolicy,
}

fn default_port() -> u16 {
    5000
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_log_filter() -> String {
    "info".to_string()
}
fn default_connect_attempts() -> u32 {
    10
}
fn default_connect_retry_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            download_dir: default_download_dir(),
            log_filter: default_log_filter(),
            connect_attempts: default_connect_attempts(),
            connect_retry_ms: default_connect_retry_ms(),
            chunk: ChunkPolicy::default(),
        }
    }
}

impl Config {
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            chunk: self.chunk,
            download_dir: self.download_dir.clone(),
        }
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("TANDEM_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("TANDEM_DOWNLOAD_DIR") {
        if !s.is_empty() {
            c.download_dir = PathBuf::from(s);
        }
    }
    if let Some(s) = var("TANDEM_LOG") {
        if !s.is_empty() {
            c.log_filter = s;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tandem/config.toml"));
    }
    out.push(PathBuf::from("/etc/tandem/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => eprintln!("tandem: ignoring {}: {}", p.display(), e),
                Err(e) => eprintln!("tandem: cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}
