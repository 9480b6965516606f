use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Number of output slots carried by every configuration.
pub const MAX_CHANNELS: usize = 8;

/// Upper bound for a persisted configuration document.
pub const CONFIG_MAX_BYTES: usize = 1024;

/// Longest accepted device or channel name.
pub const NAME_MAX_LEN: usize = 32;

/// Prefix of the identity synthesized from the hardware id.
pub const IDENTITY_PREFIX: &str = "dimmer-";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config document is {len} bytes, limit is {max}", max = CONFIG_MAX_BYTES)]
    TooLarge { len: usize },
    #[error("config document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One persisted output slot. An empty name means the slot is unused;
/// callers test presence through [`ChannelSlot::configured`] instead of
/// inspecting the name directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSlot {
    #[serde(default, deserialize_with = "lenient")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient")]
    pub pin: u8,
}

/// A slot that actually drives an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredChannel {
    pub slot: usize,
    pub name: String,
    pub pin: u8,
}

impl ChannelSlot {
    pub fn configured(&self, slot: usize) -> Option<ConfiguredChannel> {
        if self.name.is_empty() {
            return None;
        }
        Some(ConfiguredChannel {
            slot,
            name: self.name.clone(),
            pin: self.pin,
        })
    }

    pub fn clear(&mut self) {
        self.name.clear();
        self.pin = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "deviceName", default, deserialize_with = "lenient")]
    pub device_name: String,
    #[serde(rename = "invertPwmOutput", default, deserialize_with = "lenient")]
    pub invert_pwm_output: bool,
    #[serde(rename = "otaUsername", default, deserialize_with = "lenient")]
    pub ota_username: String,
    #[serde(rename = "otaPassword", default, deserialize_with = "lenient")]
    pub ota_password: String,
    #[serde(default, deserialize_with = "lenient")]
    pub devices: Vec<ChannelSlot>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            invert_pwm_output: false,
            ota_username: String::new(),
            ota_password: String::new(),
            devices: vec![ChannelSlot::default(); MAX_CHANNELS],
        }
    }
}

impl DeviceConfig {
    /// Parses a persisted document. Individual absent or wrongly-typed
    /// fields fall back to their defaults; only an unparseable document or
    /// one over [`CONFIG_MAX_BYTES`] is an error. The result is normalized.
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        if raw.len() > CONFIG_MAX_BYTES {
            return Err(ConfigError::TooLarge { len: raw.len() });
        }
        let mut config = serde_json::from_slice::<Self>(raw)?;
        config.normalize();
        Ok(config)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Restores the structural invariants: exactly [`MAX_CHANNELS`] slots,
    /// names within the length cap, and no two configured slots sharing a
    /// pin (the later duplicate is cleared).
    pub fn normalize(&mut self) {
        self.devices.truncate(MAX_CHANNELS);
        self.devices.resize(MAX_CHANNELS, ChannelSlot::default());

        truncate_name(&mut self.device_name);

        let mut used_pins: Vec<u8> = Vec::new();
        for slot in &mut self.devices {
            truncate_name(&mut slot.name);
            if slot.name.is_empty() {
                continue;
            }
            if used_pins.contains(&slot.pin) {
                slot.clear();
            } else {
                used_pins.push(slot.pin);
            }
        }
    }

    /// Substitutes an identity derived from the hardware id when the stored
    /// name is empty. Deterministic for a fixed `chip_id`.
    pub fn resolve_identity(&mut self, chip_id: u32) {
        if self.device_name.is_empty() {
            self.device_name = format!("{IDENTITY_PREFIX}{chip_id:08x}");
        }
    }

    pub fn configured_channels(&self) -> Vec<ConfiguredChannel> {
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.configured(slot))
            .collect()
    }

    /// Empty credentials disable update-service authentication.
    pub fn ota_auth_enabled(&self) -> bool {
        !self.ota_username.is_empty() || !self.ota_password.is_empty()
    }
}

fn truncate_name(name: &mut String) {
    if name.len() <= NAME_MAX_LEN {
        return;
    }
    let mut cut = NAME_MAX_LEN;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    name.truncate(cut);
}

/// Accepts a wrongly-typed field by falling back to the field default, the
/// same way absent fields do.
fn lenient<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: DeserializeOwned + Default,
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_config() -> DeviceConfig {
        let mut config = DeviceConfig {
            device_name: "living-room".to_string(),
            invert_pwm_output: true,
            ota_username: "admin".to_string(),
            ota_password: "hunter2".to_string(),
            ..DeviceConfig::default()
        };
        config.devices[0] = ChannelSlot {
            name: "Ceiling".to_string(),
            pin: 16,
        };
        config.devices[3] = ChannelSlot {
            name: "Desk lamp".to_string(),
            pin: 17,
        };
        config
    }

    #[test]
    fn defaults_carry_a_full_slot_table() {
        let config = DeviceConfig::default();
        assert_eq!(config.devices.len(), MAX_CHANNELS);
        assert!(config.configured_channels().is_empty());
        assert!(!config.ota_auth_enabled());
    }

    #[test]
    fn missing_fields_fall_back_per_field() {
        let config = DeviceConfig::from_json(br#"{"deviceName":"porch"}"#).unwrap();
        assert_eq!(config.device_name, "porch");
        assert!(!config.invert_pwm_output);
        assert_eq!(config.ota_username, "");
        assert_eq!(config.devices.len(), MAX_CHANNELS);
    }

    #[test]
    fn wrongly_typed_fields_fall_back_per_field() {
        let raw = br#"{
            "deviceName": 42,
            "invertPwmOutput": "yes",
            "otaUsername": "admin",
            "devices": [{"name": "Ceiling", "pin": "high"}, {"name": 7, "pin": 300}]
        }"#;
        let config = DeviceConfig::from_json(raw).unwrap();
        assert_eq!(config.device_name, "");
        assert!(!config.invert_pwm_output);
        assert_eq!(config.ota_username, "admin");
        assert_eq!(config.devices[0].name, "Ceiling");
        assert_eq!(config.devices[0].pin, 0);
        assert_eq!(config.devices[1].name, "");
        assert_eq!(config.devices[1].pin, 0);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config = DeviceConfig::from_json(br#"{"deviceName":"porch","ledCount":12}"#).unwrap();
        assert_eq!(config.device_name, "porch");
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(matches!(
            DeviceConfig::from_json(b"not json"),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_document_is_an_error() {
        let raw = vec![b' '; CONFIG_MAX_BYTES + 1];
        assert!(matches!(
            DeviceConfig::from_json(&raw),
            Err(ConfigError::TooLarge { .. })
        ));
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let config = sample_config();
        let reloaded = DeviceConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, config);

        let again = DeviceConfig::from_json(&reloaded.to_json().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn identity_fallback_is_deterministic() {
        let mut first = DeviceConfig::default();
        let mut second = DeviceConfig::default();
        first.resolve_identity(0x00c0_ffee);
        second.resolve_identity(0x00c0_ffee);

        assert_eq!(first.device_name, "dimmer-00c0ffee");
        assert_eq!(first.device_name, second.device_name);
    }

    #[test]
    fn identity_is_kept_when_present() {
        let mut config = sample_config();
        config.resolve_identity(0x00c0_ffee);
        assert_eq!(config.device_name, "living-room");
    }

    #[test]
    fn empty_stored_name_still_gets_an_identity() {
        let mut config = DeviceConfig::from_json(br#"{"deviceName":""}"#).unwrap();
        config.resolve_identity(7);
        assert_eq!(config.device_name, "dimmer-00000007");
    }

    #[test]
    fn duplicate_pins_clear_the_later_slot() {
        let mut config = sample_config();
        config.devices[3].pin = 16;
        config.normalize();

        let configured = config.configured_channels();
        assert_eq!(configured.len(), 1);
        assert_eq!(configured[0].name, "Ceiling");
        assert_eq!(config.devices[3], ChannelSlot::default());
    }

    #[test]
    fn empty_slots_do_not_reserve_pins() {
        let mut config = DeviceConfig::default();
        config.devices[5] = ChannelSlot {
            name: "Sconce".to_string(),
            pin: 0,
        };
        config.normalize();

        let configured = config.configured_channels();
        assert_eq!(configured.len(), 1);
        assert_eq!(configured[0].slot, 5);
        assert_eq!(configured[0].pin, 0);
    }

    #[test]
    fn long_names_are_capped() {
        let mut config = DeviceConfig::default();
        config.device_name = "x".repeat(100);
        config.devices[0] = ChannelSlot {
            name: "y".repeat(100),
            pin: 4,
        };
        config.normalize();

        assert_eq!(config.device_name.len(), NAME_MAX_LEN);
        assert_eq!(config.devices[0].name.len(), NAME_MAX_LEN);
    }

    #[test]
    fn short_slot_arrays_are_padded() {
        let config =
            DeviceConfig::from_json(br#"{"devices":[{"name":"Ceiling","pin":16}]}"#).unwrap();
        assert_eq!(config.devices.len(), MAX_CHANNELS);
        assert_eq!(config.configured_channels().len(), 1);
    }
}
