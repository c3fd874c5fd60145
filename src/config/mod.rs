//! Configuration: `AppConfig` and its per-subsystem sections, `AppPaths` for
//! the platform settings location, TOML persistence via `AppConfig::load` /
//! `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{AppConfig, AudioConfig, DetectionConfig, DeviceConfig, StreamConfig};
