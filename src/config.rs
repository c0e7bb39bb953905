use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_SCHEMA_VERSION: u32 = 1;
const CONFIG_FILE_NAME: &str = "session-archive.json";
const DEFAULT_EXTENSION: &str = "jsonl";
const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3940;
const DEFAULT_LIST_PROMPT_CHARS: usize = 200;
const DEFAULT_DETAIL_PROMPT_CHARS: usize = 2_000;
const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_MAX_PAGE_SIZE: usize = 500;
pub const DEFAULT_SYNTHETIC_MODEL: &str = "delivery-mirror";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub schema_version: u32,
    pub sessions_dir: Option<String>,
    pub file_extension: String,
    pub synthetic_models: Vec<String>,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub list_prompt_chars: usize,
    pub detail_prompt_chars: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            sessions_dir: None,
            file_extension: DEFAULT_EXTENSION.to_string(),
            synthetic_models: vec![DEFAULT_SYNTHETIC_MODEL.to_string()],
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            list_prompt_chars: DEFAULT_LIST_PROMPT_CHARS,
            detail_prompt_chars: DEFAULT_DETAIL_PROMPT_CHARS,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

impl ArchiveConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(cfg_path: &Path) -> Result<Self> {
        if cfg_path.exists() {
            let raw = fs::read_to_string(cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: ArchiveConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(cfg_path)?;
            }
            Ok(parsed)
        } else {
            let cfg = ArchiveConfig::default();
            cfg.save_to(cfg_path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// `$SESSION_ARCHIVE_DIR`, then the configured directory, then the producer's default layout.
    pub fn sessions_dir(&self) -> PathBuf {
        if let Some(dir) = env_path("SESSION_ARCHIVE_DIR") {
            return dir;
        }
        self.sessions_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_sessions_path)
    }

    pub fn effective_port(&self) -> u16 {
        env_u64("SESSION_ARCHIVE_PORT", u64::from(self.server.port))
            .try_into()
            .unwrap_or(self.server.port)
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;
        let defaults = ArchiveConfig::default();

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        if self
            .sessions_dir
            .as_deref()
            .is_some_and(|dir| dir.trim().is_empty())
        {
            self.sessions_dir = None;
            changed = true;
        }

        let extension = self.file_extension.trim().trim_start_matches('.').to_string();
        if extension.is_empty() {
            self.file_extension = defaults.file_extension.clone();
            changed = true;
        } else if extension != self.file_extension {
            self.file_extension = extension;
            changed = true;
        }

        let mut models: Vec<String> = Vec::new();
        for model in &self.synthetic_models {
            let model = model.trim().to_ascii_lowercase();
            if !model.is_empty() && !models.contains(&model) {
                models.push(model);
            }
        }
        if models != self.synthetic_models {
            self.synthetic_models = models;
            changed = true;
        }

        if self.server.bind.trim().is_empty() {
            self.server.bind = defaults.server.bind.clone();
            changed = true;
        }
        if self.server.port == 0 {
            self.server.port = defaults.server.port;
            changed = true;
        }

        let limits = &mut self.limits;
        for (value, default) in [
            (&mut limits.list_prompt_chars, defaults.limits.list_prompt_chars),
            (&mut limits.detail_prompt_chars, defaults.limits.detail_prompt_chars),
            (&mut limits.max_page_size, defaults.limits.max_page_size),
            (&mut limits.default_page_size, defaults.limits.default_page_size),
        ] {
            if *value == 0 {
                *value = default;
                changed = true;
            }
        }
        if limits.default_page_size > limits.max_page_size {
            limits.default_page_size = limits.max_page_size;
            changed = true;
        }

        changed
    }
}

pub fn archive_home() -> PathBuf {
    if let Some(custom) = env_path("SESSION_ARCHIVE_HOME") {
        return custom;
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
}

pub fn default_sessions_path() -> PathBuf {
    archive_home().join("agents").join("main").join("sessions")
}

pub fn config_path() -> PathBuf {
    archive_home().join(CONFIG_FILE_NAME)
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
