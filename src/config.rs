//! Configuration management for oxterm.
//!
//! # Configuration File
//!
//! The configuration file is located at `~/.oxterm/config.toml`:
//!
//! ```toml
//! # Program to run in the session (optional; defaults to $SHELL, then /bin/sh)
//! shell = "/bin/zsh"
//!
//! # Terminal type advertised to the child via TERM
//! term = "linux"
//!
//! [size]
//! rows = 24
//! cols = 80
//! ```
//!
//! Command-line arguments always override values from the file.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program to run in the session
    pub shell: Option<String>,
    /// Terminal type advertised to the child
    pub term: String,
    /// Fallback window size when the hosting terminal's cannot be detected
    pub size: SizeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            term: "linux".to_string(),
            size: SizeConfig::default(),
        }
    }
}

/// Window size configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeConfig {
    pub rows: u16,
    pub cols: u16,
}

impl Default for SizeConfig {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(config) = toml::from_str(&content) {
                        return config;
                    }
                }
            }
        }
        Self::default()
    }

    /// Save configuration to file
    #[allow(dead_code)]
    pub fn save(&self) -> Result<(), String> {
        if let Some(path) = Self::get_config_path() {
            let content = toml::to_string_pretty(self)
                .map_err(|e| format!("Failed to serialize config: {}", e))?;
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
            Ok(())
        } else {
            Err("Could not determine config path".to_string())
        }
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        if let Some(home) = home_dir() {
            let oxterm_dir = home.join(".oxterm");
            if !oxterm_dir.exists() {
                let _ = fs::create_dir_all(&oxterm_dir);
            }
            return Some(oxterm_dir.join("config.toml"));
        }
        None
    }
}

// Get home directory
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
