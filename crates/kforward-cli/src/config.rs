//! Global settings management
//!
//! Stores the kubectl binary and launch settle window in ~/.kforward/settings.json

use anyhow::{Context, Result};
use kforward_core::{KubectlLauncher, DEFAULT_SETTLE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the kubectl binary
pub const KUBECTL_ENV: &str = "KFORWARD_KUBECTL";

/// Global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// kubectl binary; `kubectl` from PATH when unset
    #[serde(default)]
    pub kubectl_path: Option<PathBuf>,

    /// Milliseconds to wait after spawning before checking the process
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
}

fn default_settle_millis() -> u64 {
    DEFAULT_SETTLE.as_millis() as u64
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kubectl_path: None,
            settle_millis: default_settle_millis(),
        }
    }
}

impl Settings {
    /// kubectl binary to run, honouring the environment override
    pub fn kubectl_program(&self) -> PathBuf {
        if let Some(path) = std::env::var_os(KUBECTL_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(path);
        }
        self.kubectl_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("kubectl"))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    /// Build the launcher described by these settings
    pub fn launcher(&self) -> KubectlLauncher {
        KubectlLauncher::new()
            .with_program(self.kubectl_program())
            .with_settle(self.settle())
    }
}

/// Settings manager
pub struct SettingsManager;

impl SettingsManager {
    /// Get the settings file path
    pub fn settings_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".kforward").join("settings.json"))
    }

    /// Load the settings from disk
    pub fn load() -> Result<Settings> {
        Self::load_from(&Self::settings_path()?)
    }

    /// Load settings from a specific file, defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Ok(Settings::default());
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {:?}", path))?;

        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings file: {:?}", path))
    }

    /// Save the settings to disk
    pub fn save(settings: &Settings) -> Result<()> {
        Self::save_to(&Self::settings_path()?, settings)
    }

    pub fn save_to(path: &Path, settings: &Settings) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory: {:?}", parent))?;
        }

        let json =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

        fs::write(path, json).with_context(|| format!("Failed to write settings file: {:?}", path))
    }

    /// Set the kubectl binary
    pub fn set_kubectl(path: PathBuf) -> Result<()> {
        let mut settings = Self::load()?;
        settings.kubectl_path = Some(path);
        Self::save(&settings)
    }

    /// Set the settle window
    pub fn set_settle(millis: u64) -> Result<()> {
        let mut settings = Self::load()?;
        settings.settle_millis = millis;
        Self::save(&settings)
    }
}
