use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::BackendConfig;
use crate::hittest::{HitTestConfig, DEFAULT_BOX_PADDING, DEFAULT_HANDLE_RADIUS};
use crate::hover::HoverTimings;
use crate::launch::LaunchRequest;
use crate::navigation::DEFAULT_PIXELS_PER_FRAME_STEP;
use crate::registry::GridLayout;

pub const BACKEND_URL_ENV: &str = "RADVIEW_BACKEND_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendSettings,
    pub viewer: ViewerSettings,
    pub hover: HoverSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerSettings {
    pub layout: GridLayout,
    pub wheel_pixels_per_step: f32,
    pub notification_lifetime_ms: u64,
    /// Reject drops that would replace a series with another modality.
    pub same_modality_only: bool,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            layout: GridLayout::Quad,
            wheel_pixels_per_step: DEFAULT_PIXELS_PER_FRAME_STEP,
            notification_lifetime_ms: 4000,
            same_modality_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoverSettings {
    pub confirm_ms: u64,
    pub refresh_ms: u64,
    pub clear_ms: u64,
    pub handle_radius: f32,
    pub box_padding: f32,
}

impl Default for HoverSettings {
    fn default() -> Self {
        Self {
            confirm_ms: 300,
            refresh_ms: 100,
            clear_ms: 200,
            handle_radius: DEFAULT_HANDLE_RADIUS,
            box_padding: DEFAULT_BOX_PADDING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub cache_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

impl Settings {
    /// Missing file means defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Could not read settings file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Could not parse settings file {}", path.display()))
    }

    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!("{err:#}; using default settings");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Could not create settings directory {}", parent.display())
            })?;
        }
        let contents = toml::to_string_pretty(self).context("Could not serialize settings")?;
        fs::write(path, contents)
            .with_context(|| format!("Could not write settings file {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        self.apply_backend_override(env::var(BACKEND_URL_ENV).ok());
    }

    fn apply_backend_override(&mut self, url: Option<String>) {
        if let Some(url) = url.filter(|url| !url.trim().is_empty()) {
            self.backend.url = Some(url.trim().to_string());
        }
    }

    /// Launch arguments win over the file and the environment.
    pub fn apply_launch(&mut self, request: &LaunchRequest) {
        if let Some(url) = request.backend_url.as_ref() {
            self.backend.url = Some(url.clone());
        }
        if request.username.is_some() {
            self.backend.username = request.username.clone();
            self.backend.password = request.password.clone();
        }
        if let Some(layout) = request.layout {
            self.viewer.layout = layout;
        }
    }

    pub fn backend_config(&self) -> Option<BackendConfig> {
        let base_url = self.backend.url.as_ref()?.trim().to_string();
        if base_url.is_empty() {
            return None;
        }
        Some(BackendConfig {
            base_url,
            username: self.backend.username.clone(),
            password: self.backend.password.clone(),
        })
    }

    pub fn hover_timings(&self) -> HoverTimings {
        HoverTimings {
            confirm_new: Duration::from_millis(self.hover.confirm_ms),
            refresh: Duration::from_millis(self.hover.refresh_ms),
            clear: Duration::from_millis(self.hover.clear_ms),
        }
    }

    pub fn hit_test_config(&self) -> HitTestConfig {
        HitTestConfig {
            handle_radius: self.hover.handle_radius.max(0.0),
            box_padding: self.hover.box_padding.max(0.0),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.sync.cache_ttl_secs)
    }

    pub fn notification_lifetime(&self) -> Duration {
        Duration::from_millis(self.viewer.notification_lifetime_ms)
    }

    pub fn wheel_pixels_per_step(&self) -> f32 {
        if self.viewer.wheel_pixels_per_step > 0.0 {
            self.viewer.wheel_pixels_per_step
        } else {
            DEFAULT_PIXELS_PER_FRAME_STEP
        }
    }
}

pub fn settings_file_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        return env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|base| base.join("radview").join("settings.toml"));
    }

    #[cfg(target_os = "macos")]
    {
        return env::var_os("HOME").map(PathBuf::from).map(|home| {
            home.join("Library")
                .join("Application Support")
                .join("radview")
                .join("settings.toml")
        });
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("radview").join("settings.toml"));
        }
        env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".config").join("radview").join("settings.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "radview-settings-{tag}-{}-{}.toml",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ))
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        let timings = settings.hover_timings();
        assert_eq!(timings.confirm_new, Duration::from_millis(300));
        assert_eq!(timings.refresh, Duration::from_millis(100));
        assert_eq!(timings.clear, Duration::from_millis(200));
        assert_eq!(settings.hit_test_config(), HitTestConfig::default());
        assert_eq!(settings.cache_ttl(), Duration::from_secs(30));
        assert_eq!(settings.notification_lifetime(), Duration::from_secs(4));
        assert_eq!(settings.viewer.layout, GridLayout::Quad);
        assert!(settings.backend_config().is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let path = temp_settings_path("partial");
        fs::write(
            &path,
            "[viewer]\nlayout = \"1x2\"\n\n[hover]\nhandle_radius = 12.0\n",
        )
        .expect("should write temp settings");

        let settings = Settings::load(&path).expect("settings should load");
        assert_eq!(settings.viewer.layout, GridLayout::SideBySide);
        assert_eq!(settings.hover.handle_radius, 12.0);
        assert_eq!(settings.hover.confirm_ms, 300);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn settings_toml_roundtrip() {
        let path = temp_settings_path("roundtrip");
        let mut settings = Settings::default();
        settings.backend.url = Some("http://pacs.local/api".to_string());
        settings.sync.cache_ttl_secs = 5;
        settings.save(&path).expect("settings should save");
        assert_eq!(Settings::load(&path).expect("settings should load"), settings);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let path = temp_settings_path("malformed");
        fs::write(&path, "viewer = [not toml").expect("should write temp settings");
        assert!(Settings::load(&path).is_err());
        assert_eq!(Settings::load_or_default(Some(&path)), Settings::default());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn launch_arguments_override_file_and_env() {
        let mut settings = Settings::default();
        settings.backend.url = Some("http://file".to_string());
        settings.apply_backend_override(Some("http://env".to_string()));
        assert_eq!(settings.backend.url.as_deref(), Some("http://env"));
        settings.apply_backend_override(Some("  ".to_string()));
        assert_eq!(settings.backend.url.as_deref(), Some("http://env"));

        settings.apply_launch(&LaunchRequest {
            backend_url: Some("http://cli".to_string()),
            layout: Some(GridLayout::Single),
            ..LaunchRequest::default()
        });
        let config = settings.backend_config().expect("backend configured");
        assert_eq!(config.base_url, "http://cli");
        assert_eq!(settings.viewer.layout, GridLayout::Single);
    }
}
