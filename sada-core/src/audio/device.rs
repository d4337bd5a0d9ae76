//! Audio device enumeration.

use serde::{Deserialize, Serialize};

/// Which side of the audio graph a device sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about one audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    /// Input that most likely records system output rather than a voice.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Order devices: inputs before outputs, defaults first, loopbacks last.
pub fn sort_devices(devices: &mut [DeviceInfo]) {
    devices.sort_by_key(|d| {
        (
            d.direction == DeviceDirection::Output,
            !d.is_default,
            d.is_loopback_like,
            d.name.to_ascii_lowercase(),
        )
    });
}

/// List all input and output devices on the default host.
///
/// Returns an empty `Vec` if cpal is not available or enumeration fails.
#[cfg(feature = "audio-cpal")]
pub fn list_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut list = Vec::new();
    match host.input_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_in.as_deref() == Some(name.as_str()),
                    is_loopback_like: is_loopback_like_name(&name),
                    direction: DeviceDirection::Input,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate input devices: {e}"),
    }
    match host.output_devices() {
        Ok(devices) => {
            for (idx, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                list.push(DeviceInfo {
                    is_default: default_out.as_deref() == Some(name.as_str()),
                    is_loopback_like: false,
                    direction: DeviceDirection::Output,
                    name,
                });
            }
        }
        Err(e) => tracing::warn!("failed to enumerate output devices: {e}"),
    }

    sort_devices(&mut list);
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, direction: DeviceDirection, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            direction,
            is_default,
            is_loopback_like: is_loopback_like_name(name),
        }
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("USB Microphone"));
    }

    #[test]
    fn sorts_inputs_then_defaults_then_non_loopback() {
        let mut list = vec![
            info("Speakers", DeviceDirection::Output, true),
            info("Stereo Mix", DeviceDirection::Input, false),
            info("Headset Mic", DeviceDirection::Input, false),
            info("Built-in Mic", DeviceDirection::Input, true),
        ];
        sort_devices(&mut list);
        let names: Vec<&str> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Built-in Mic", "Headset Mic", "Stereo Mix", "Speakers"]);
    }
}
