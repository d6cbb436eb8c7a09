use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub gitter: GitterConfig,
    pub bot: BotConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub rooms: Vec<RoomConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitterConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// Public web host, used for room and archive links
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub community: String,
    #[serde(default = "default_help_topic")]
    pub help_topic: String,
    #[serde(default = "default_wiki_url")]
    pub wiki_url: String,
    #[serde(default = "default_avatar_url")]
    pub avatar_url: String,
    /// Rooms (by name) where help and thanks replies are suppressed
    #[serde(default)]
    pub quiet_rooms: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_scan_cron")]
    pub cron: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    #[serde(default = "default_wiki_dir")]
    pub directory: PathBuf,
    /// SQLite file for the topic index; in-memory when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub static_replies: HashMap<String, String>,
}

/// One entry of the room directory
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RoomConfig {
    pub title: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_api_url() -> String {
    "https://api.gitter.im".to_string()
}

fn default_stream_url() -> String {
    "https://stream.gitter.im".to_string()
}

fn default_host() -> String {
    "https://gitter.im/".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_help_topic() -> String {
    "bothelp".to_string()
}

fn default_wiki_url() -> String {
    "https://github.com/bothelpers/kbase/wiki/".to_string()
}

fn default_avatar_url() -> String {
    "https://avatars1.githubusercontent.com/bothelp?v=3&s=32".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_scan_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_wiki_dir() -> PathBuf {
    PathBuf::from("wiki")
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cron: default_scan_cron(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            directory: default_wiki_dir(),
            database_path: None,
            static_replies: HashMap::new(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl BotConfig {
    /// Direct-message link for a topic, e.g. `https://gitter.im/bothelp?topic=loops`
    pub fn topic_dm_uri(&self, host: &str, topic: &str) -> String {
        format!("{}{}?topic={}", host, self.name, topic)
    }

    pub fn is_quiet_room(&self, room_name: &str) -> bool {
        self.quiet_rooms.iter().any(|r| r == room_name)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config file")?;

        if config.gitter.token.is_empty() {
            if let Ok(token) = std::env::var("GITTER_TOKEN") {
                config.gitter.token = token;
            }
        }

        if config.rooms.is_empty() {
            anyhow::bail!("No rooms configured: add at least one [[rooms]] entry");
        }

        Ok(config)
    }
}
