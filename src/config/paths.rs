//! Platform config location via the `dirs` crate.
//!
//!   Windows: %APPDATA%\wake-stream\settings.toml
//!   macOS:   ~/Library/Application Support/wake-stream/settings.toml
//!   Linux:   ~/.config/wake-stream/settings.toml

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "wake-stream";

    /// Falls back to the working directory when the platform has no config
    /// directory.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);
        let settings_file = config_dir.join("settings.toml");

        Self {
            config_dir,
            settings_file,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
