//! Configuration management for wlcast.
//!
//! The configuration lives in the platform config directory
//! (`~/.config/wlcast/config.json` on Linux). A missing or unreadable file
//! yields the defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How the output to capture is picked when a client asks for a source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChooserType {
    /// Try the simple choosers, then the dmenu choosers, then fall back to `None`.
    #[default]
    Default,
    /// Use the configured output name or the first output, without asking.
    None,
    /// Run a command that prints the chosen output name.
    Simple,
    /// Pipe output names into a dmenu-style command and read back the selection.
    Dmenu,
}

impl ChooserType {
    /// Convert from string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "default" => Some(Self::Default),
            "none" => Some(Self::None),
            "simple" => Some(Self::Simple),
            "dmenu" => Some(Self::Dmenu),
            _ => None,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::None => "none",
            Self::Simple => "simple",
            Self::Dmenu => "dmenu",
        }
    }
}

/// Screencast settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreencastConfig {
    /// Output to capture when the chooser does not ask (e.g. "DP-1").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    /// Frame rate ceiling. Zero or negative means unlimited.
    #[serde(default)]
    pub max_fps: f64,
    /// Shell command run before the first cast starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_before: Option<String>,
    /// Shell command run after the last cast ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_after: Option<String>,
    /// Chooser command overriding the built-in candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chooser_cmd: Option<String>,
    #[serde(default)]
    pub chooser_type: ChooserType,
    /// Allocate implicit-modifier GPU buffers with a linear layout.
    #[serde(default)]
    pub force_mod_linear: bool,
    /// Never offer GPU-shared (dmabuf) buffers.
    #[serde(default)]
    pub disable_dmabuf: bool,
    /// Largest shared-memory buffer that may be allocated, in bytes.
    #[serde(default = "default_max_shm_bytes")]
    pub max_shm_bytes: u64,
    /// DRM render node used for GPU buffer allocation.
    #[serde(default = "default_render_node")]
    pub render_node: String,
}

fn default_max_shm_bytes() -> u64 {
    // 8K RGBA with room to spare
    256 * 1024 * 1024
}

fn default_render_node() -> String {
    "/dev/dri/renderD128".to_string()
}

impl Default for ScreencastConfig {
    fn default() -> Self {
        Self {
            output_name: None,
            max_fps: 0.0,
            exec_before: None,
            exec_after: None,
            chooser_cmd: None,
            chooser_type: ChooserType::Default,
            force_mod_linear: false,
            disable_dmabuf: false,
            max_shm_bytes: default_max_shm_bytes(),
            render_node: default_render_node(),
        }
    }
}

impl ScreencastConfig {
    /// Frame rate ceiling, or `None` when unlimited.
    pub fn fps_cap(&self) -> Option<f64> {
        (self.max_fps > 0.0).then_some(self.max_fps)
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    /// Screencast settings group.
    #[serde(default)]
    pub screencast: ScreencastConfig,
}

impl AppConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Get the path to the config file.
pub fn get_config_path() -> Result<PathBuf, String> {
    let proj_dirs =
        ProjectDirs::from("", "", "wlcast").ok_or("Could not determine config directory")?;

    Ok(proj_dirs.config_dir().join("config.json"))
}

/// Load configuration from the default location.
/// Returns default config if file doesn't exist or is invalid.
pub fn load_config() -> AppConfig {
    match get_config_path() {
        Ok(path) => load_config_from(&path),
        Err(e) => {
            tracing::warn!("Failed to get config path: {}", e);
            AppConfig::default()
        }
    }
}

/// Load configuration from an explicit path, falling back to defaults.
pub fn load_config_from(config_path: &Path) -> AppConfig {
    if !config_path.exists() {
        tracing::info!("No config file found, using defaults");
        return AppConfig::default();
    }

    match fs::read_to_string(config_path) {
        Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", config_path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file: {}. Using defaults.", e);
                AppConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file: {}. Using defaults.", e);
            AppConfig::default()
        }
    }
}

/// Save configuration to disk.
/// Creates the config directory if it doesn't exist.
pub fn save_config(config: &AppConfig) -> Result<(), String> {
    save_config_to(config, &get_config_path()?)
}

/// Save configuration to an explicit path.
pub fn save_config_to(config: &AppConfig, config_path: &Path) -> Result<(), String> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(config_path, json).map_err(|e| format!("Failed to write config file: {}", e))?;

    tracing::info!("Saved config to {:?}", config_path);
    Ok(())
}
