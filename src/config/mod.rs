use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::drawer::{DrawerSettings, HydratePolicy};
use crate::source::http::HttpSettings;
use crate::tabs::TabId;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".rundrawer";

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_token_env() -> String {
    "RUNDRAWER_TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_millis() -> u64 {
    1000
}

fn default_poll_secs() -> u64 {
    5
}

fn default_journal_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("journal")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Live stream reconnect behaviour.
///
/// ```toml
/// [stream]
/// reconnect_attempts = 3
/// reconnect_backoff_millis = 1000
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_millis")]
    pub reconnect_backoff_millis: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_millis: default_reconnect_backoff_millis(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DrawerConfig {
    #[serde(default)]
    pub default_tab: TabId,
    #[serde(default)]
    pub hydrate: HydratePolicy,
    #[serde(default = "default_poll_secs")]
    pub artifact_poll_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub status_poll_secs: u64,
}

impl Default for DrawerConfig {
    fn default() -> Self {
        Self {
            default_tab: TabId::default(),
            hydrate: HydratePolicy::default(),
            artifact_poll_secs: default_poll_secs(),
            status_poll_secs: default_poll_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Relative paths resolve against the directory holding `.rundrawer/`.
    #[serde(default = "default_journal_dir")]
    pub dir: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_journal_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub drawer: DrawerConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.rundrawer/config.toml` file and load
    /// it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Bearer token from the configured environment variable. Empty values
    /// count as unset.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.api.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            base_url: self.api.base_url.trim_end_matches('/').to_string(),
            token: self.token(),
            timeout: Duration::from_secs(self.api.timeout_secs),
            reconnect_attempts: self.stream.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.stream.reconnect_backoff_millis),
        }
    }

    pub fn drawer_settings(&self) -> DrawerSettings {
        DrawerSettings {
            default_tab: self.drawer.default_tab,
            hydrate: self.drawer.hydrate,
            artifact_poll: Duration::from_secs(self.drawer.artifact_poll_secs),
            status_poll: Duration::from_secs(self.drawer.status_poll_secs),
        }
    }

    /// Journal directory, anchored at the project root when relative.
    pub fn journal_dir(&self, config_path: Option<&Path>) -> PathBuf {
        if self.journal.dir.is_absolute() {
            return self.journal.dir.clone();
        }
        // config_path is <root>/.rundrawer/config.toml
        match config_path.and_then(Path::parent).and_then(Path::parent) {
            Some(root) => root.join(&self.journal.dir),
            None => self.journal.dir.clone(),
        }
    }
}
