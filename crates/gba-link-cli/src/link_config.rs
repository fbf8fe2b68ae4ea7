use std::path::{Path, PathBuf};

use gba_link_core::LinkConfig;
use log::warn;
use serde::{Deserialize, Serialize};

/// On-disk settings for the `gba-link` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// SI ports the host drives. Ports outside 0..4 are ignored.
    pub ports: Vec<u8>,
    /// Address the peer connects to.
    pub host: String,
    pub link: LinkConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            ports: vec![0, 1, 2, 3],
            host: "127.0.0.1".to_string(),
            link: LinkConfig::default(),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("gba-link").join("link.toml");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gba-link").join("link.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("gba-link")
            .join("link.toml");
    }

    PathBuf::from("link.toml")
}

pub fn load_from_file(path: &Path) -> CliConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return CliConfig::default(),
    };

    match toml::from_str::<CliConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse link config {}: {e}; using defaults",
                path.display()
            );
            CliConfig::default()
        }
    }
}

pub fn save_to_file(path: &Path, cfg: &CliConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let text = toml::to_string_pretty(cfg).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
}
