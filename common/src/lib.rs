pub mod config;
pub mod mapper;
pub mod provision;
pub mod reset;

pub use config::{
    ChannelSlot, ConfigError, ConfiguredChannel, DeviceConfig, CONFIG_MAX_BYTES, MAX_CHANNELS,
};
pub use mapper::{
    driven_level, logical_level, ChannelBinding, ChannelRegistry, PwmWrite, VirtualDeviceId,
    LEVEL_MAX, PWM_FREQUENCY_HZ,
};
pub use provision::{boot_mode, BootMode, PortalChannel, PortalForm, CHECKBOX_CHECKED};
pub use reset::{ResetCycleTracker, ResetMarker, DOUBLE_RESET_TIMEOUT_MS};
