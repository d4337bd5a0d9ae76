//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use sada_core::{AudioConfig, InterruptPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub volume: f32,
    pub muted: bool,
    pub speaking_threshold: f32,
    pub capture_frame_size: usize,
    pub interrupt_policy: InterruptPolicy,
    pub voice_name: String,
    /// Text the live assistant is grounded in.
    pub initial_context: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        let audio = AudioConfig::default();
        Self {
            preferred_input_device: None,
            volume: audio.default_volume,
            muted: false,
            speaking_threshold: audio.speaking_threshold,
            capture_frame_size: audio.capture_frame_size,
            interrupt_policy: audio.interrupt_policy,
            voice_name: audio.voice_name,
            initial_context: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.volume = if self.volume.is_nan() {
            1.0
        } else {
            self.volume.clamp(0.0, 1.0)
        };
        self.speaking_threshold = if self.speaking_threshold.is_nan() {
            0.05
        } else {
            self.speaking_threshold.clamp(0.001, 1.0)
        };
        self.capture_frame_size = self.capture_frame_size.clamp(256, 16_384);
        self.voice_name = normalize_voice_name(&self.voice_name);
        self.preferred_input_device = trimmed(self.preferred_input_device.as_deref());
        self.initial_context = trimmed(self.initial_context.as_deref());
    }

    /// Engine configuration for these settings.
    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            default_volume: self.volume,
            speaking_threshold: self.speaking_threshold,
            capture_frame_size: self.capture_frame_size,
            preferred_input_device: self.preferred_input_device.clone(),
            interrupt_policy: self.interrupt_policy,
            voice_name: self.voice_name.clone(),
            system_instruction: Some(sada_core::protocol::build_system_instruction(
                self.initial_context.as_deref(),
            )),
            ..AudioConfig::default()
        }
    }
}

pub fn normalize_voice_name(raw: &str) -> String {
    let name = raw.trim();
    if name.is_empty() {
        sada_core::protocol::DEFAULT_VOICE.into()
    } else {
        name.into()
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Sada")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("sada")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("sada-settings-{}-{name}", std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn normalize_clamps_and_trims() {
        let mut settings = AppSettings {
            preferred_input_device: Some("   ".into()),
            volume: 3.0,
            speaking_threshold: 0.0,
            capture_frame_size: 10,
            voice_name: "  ".into(),
            initial_context: Some("  notes  ".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.volume, 1.0);
        assert_eq!(settings.speaking_threshold, 0.001);
        assert_eq!(settings.capture_frame_size, 256);
        assert_eq!(settings.voice_name, "Kore");
        assert_eq!(settings.initial_context.as_deref(), Some("notes"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"volume":0.4,"interruptPolicy":"stopScheduled"}"#).unwrap();
        assert_eq!(settings.volume, 0.4);
        assert_eq!(settings.interrupt_policy, InterruptPolicy::StopScheduled);
        assert_eq!(settings.capture_frame_size, 4096);
    }

    #[test]
    fn save_then_load() {
        let path = scratch("roundtrip");
        let settings = AppSettings {
            muted: true,
            voice_name: "Puck".into(),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_or_missing_file_gives_defaults() {
        let path = scratch("corrupt");
        assert_eq!(load_settings(&path), AppSettings::default());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert_eq!(load_settings(&path), AppSettings::default());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn audio_config_carries_instruction() {
        let settings = AppSettings {
            initial_context: Some("cell biology".into()),
            ..AppSettings::default()
        };
        let config = settings.audio_config();
        assert!(config
            .system_instruction
            .unwrap()
            .contains("Context provided by user: cell biology"));
        assert_eq!(config.playback_sample_rate, 24_000);
    }
}
