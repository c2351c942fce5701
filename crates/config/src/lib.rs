use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use core_types::{Theme, UiLanguage};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const APP_DIR_NAME: &str = "quicknote";
const DEFAULT_DEBOUNCE_MS: u64 = 750;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_category")]
    pub default_category: String,
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            default_category: default_category(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageSettings {
    /// Relative paths resolve against the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: PathBuf,
    #[serde(default)]
    pub composite_index: bool,
}

impl StorageSettings {
    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        if self.database_file.is_absolute() {
            self.database_file.clone()
        } else {
            data_dir.join(&self.database_file)
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            composite_index: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub schema_version: u32,
    pub language: UiLanguage,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            language: UiLanguage::EnUs,
            theme: Theme::default(),
            sync: SyncSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_category() -> String {
    "Uncategorized".to_string()
}

fn default_database_file() -> PathBuf {
    PathBuf::from("quicknote.db")
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("failed to resolve config_dir")?;
        dir.push(APP_DIR_NAME);
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            let config = AppConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).context("failed to parse app config json")?;
        self.migrate(&mut config);
        self.save(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut AppConfig) {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating app config schema"
        );

        if config.sync.debounce_ms == 0 {
            config.sync.debounce_ms = DEFAULT_DEBOUNCE_MS;
        }
        if config.sync.default_category.trim().is_empty() {
            config.sync.default_category = default_category();
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
    }
}
