use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::frame::{DEFAULT_MAX_PAYLOAD, MAGIC};
use crate::protocol::{ByteOrder, FrameCodec};

/// Application configuration stored as TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Order of the two checksum bytes on the wire.
    pub byte_order: ByteOrder,
    /// Start-of-frame byte.
    pub magic: u8,
    /// Largest payload accepted in either direction.
    pub max_payload: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Big,
            magic: MAGIC,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl AppConfig {
    /// Config file path: ~/.config/blecrc/config.toml
    pub fn path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blecrc");
        config_dir.join("config.toml")
    }

    /// Load config from the default location, or return defaults.
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, or return defaults.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Failed to parse config {}: {}", path.display(), e),
                },
                Err(e) => tracing::warn!("Failed to read config {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.magic, self.byte_order, self.max_payload)
    }
}
