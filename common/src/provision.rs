use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;

/// Boot-time operating mode, decided once per boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Normal,
    Setup,
}

impl BootMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Setup => "SETUP",
        }
    }
}

/// Missing credentials force setup; a double reset requests it.
pub fn boot_mode(has_network_credentials: bool, double_reset: bool) -> BootMode {
    if !has_network_credentials || double_reset {
        BootMode::Setup
    } else {
        BootMode::Normal
    }
}

/// Value the portal submits for a checked inversion checkbox.
pub const CHECKBOX_CHECKED: &str = "T";

/// One editable channel row, as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalChannel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pin: String,
}

/// The editable configuration fields exchanged with the captive portal.
/// Everything is text; parsing happens on the way back in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalForm {
    #[serde(rename = "deviceName", default)]
    pub device_name: String,
    #[serde(rename = "otaUsername", default)]
    pub ota_username: String,
    #[serde(rename = "otaPassword", default)]
    pub ota_password: String,
    #[serde(rename = "invertPwmOutput", default)]
    pub invert_pwm_output: String,
    #[serde(default)]
    pub channels: Vec<PortalChannel>,
}

impl PortalForm {
    /// Initial field values presented to the portal.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            device_name: config.device_name.clone(),
            ota_username: config.ota_username.clone(),
            ota_password: config.ota_password.clone(),
            invert_pwm_output: if config.invert_pwm_output {
                CHECKBOX_CHECKED.to_string()
            } else {
                String::new()
            },
            channels: config
                .devices
                .iter()
                .map(|slot| PortalChannel {
                    name: slot.name.clone(),
                    pin: slot.pin.to_string(),
                })
                .collect(),
        }
    }

    /// Overwrites `config` with the edited values. Non-numeric or
    /// out-of-range pin text resolves to 0; the inversion flag is set only
    /// on an exact match of the checked sentinel.
    pub fn apply_to(&self, config: &mut DeviceConfig) {
        config.device_name = self.device_name.clone();
        config.ota_username = self.ota_username.clone();
        config.ota_password = self.ota_password.clone();
        config.invert_pwm_output = self.invert_pwm_output == CHECKBOX_CHECKED;

        for (slot, field) in config.devices.iter_mut().zip(&self.channels) {
            slot.name = field.name.clone();
            slot.pin = parse_pin(&field.pin);
        }

        config.normalize();
    }
}

fn parse_pin(text: &str) -> u8 {
    text.trim().parse().unwrap_or(0)
}
