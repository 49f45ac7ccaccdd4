use std::{path::{Path, PathBuf}, time::Duration};

use app_dirs2::{get_app_root, AppDataType, AppInfo};
use serde::{Deserialize, Serialize};

use crate::device::DiscoveryMode;

pub const APP_INFO: AppInfo = AppInfo {
    name: "locationsimulator",
    author: "locationsimulator",
};

const SETTINGS_FILE: &str = "settings.json";
const DISK_IMAGE_DIR: &str = "DeveloperDiskImages";

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub detect_network_devices: bool,
    pub prefer_network_connection: bool,
    /// Overrides the developer disk image root.
    pub support_directory: Option<PathBuf>,
    pub upload_chunk_size: usize,
    pub emulator: EmulatorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            detect_network_devices: false,
            prefer_network_connection: false,
            support_directory: None,
            upload_chunk_size: 8192,
            emulator: EmulatorSettings::default(),
        }
    }
}

impl Settings {
    /// Mode used for devices the registry has not seen yet.
    pub fn default_discovery_mode(&self) -> DiscoveryMode {
        match (self.detect_network_devices, self.prefer_network_connection) {
            (false, _) => DiscoveryMode::LocalOnly,
            (true, false) => DiscoveryMode::LocalAndNetwork,
            (true, true) => DiscoveryMode::PreferNetwork,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorSettings {
    pub bundle_id: String,
    /// Executable names that host the emulator.
    pub process_names: Vec<String>,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            bundle_id: "com.apple.iphonesimulator".into(),
            process_names: vec!["Simulator".into()],
            poll_interval_ms: 2000,
            request_timeout_ms: 2000,
        }
    }
}

impl EmulatorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn settings_path() -> Result<PathBuf> {
    let config_dir = get_app_root(AppDataType::UserConfig, &APP_INFO)?;
    Ok(config_dir.join(SETTINGS_FILE))
}

pub fn settings() -> Result<Settings> {
    settings_from_path(&settings_path()?)
}

pub fn settings_from_path(path: &Path) -> Result<Settings> {
    if path.exists() {
        tracing::info!("Loading settings from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Ok(json5::from_str(&contents)?)
    } else {
        tracing::warn!("Settings file not found, using default values");
        Ok(Default::default())
    }
}

pub fn settings_save(settings: &Settings) -> Result<()> {
    settings_save_to_path(settings, &settings_path()?)
}

pub fn settings_save_to_path(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json5::to_string(settings)?)?;
    Ok(())
}

/// Root of the developer disk image store.
pub fn support_directory(settings: &Settings) -> Result<PathBuf> {
    match &settings.support_directory {
        Some(dir) => Ok(dir.clone()),
        None => Ok(get_app_root(AppDataType::UserData, &APP_INFO)?.join(DISK_IMAGE_DIR)),
    }
}
