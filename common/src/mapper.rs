use serde::Serialize;

use crate::config::DeviceConfig;

/// Identifier assigned by the discovery service when a channel is
/// registered; inbound commands are routed by it.
pub type VirtualDeviceId = u8;

/// PWM carrier for every bound output.
pub const PWM_FREQUENCY_HZ: u32 = 10_000;

/// Full scale of the 8-bit output range.
pub const LEVEL_MAX: u8 = 255;

/// Brightness after on/off and clamping logic, before polarity inversion.
///
/// "Off" is always level 0. "On" clamps into 1..=255: the upstream
/// controller reports full brightness inconsistently as 254 or 255, and a
/// lit output must never sit at level 0.
pub fn logical_level(state: bool, value: u8) -> u8 {
    if state {
        value.min(LEVEL_MAX - 1) + 1
    } else {
        0
    }
}

/// The level actually driven to hardware.
pub fn driven_level(level: u8, inverted: bool) -> u8 {
    if inverted {
        LEVEL_MAX - level
    } else {
        level
    }
}

/// One registered channel: the discovery-service id bound to its output pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelBinding {
    pub id: VirtualDeviceId,
    pub slot: usize,
    pub name: String,
    pub pin: u8,
}

/// A duty value to drive on a physical output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmWrite {
    pub pin: u8,
    pub duty: u8,
}

/// Built once at startup from the final configuration; read-only afterward.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    bindings: Vec<ChannelBinding>,
    inverted: bool,
}

impl ChannelRegistry {
    /// Registers every configured channel with the discovery service (the
    /// `register` callback returns the assigned id) and binds id to pin.
    /// Unconfigured slots are skipped entirely.
    pub fn build<F>(config: &DeviceConfig, mut register: F) -> Self
    where
        F: FnMut(&str) -> VirtualDeviceId,
    {
        let bindings = config
            .configured_channels()
            .into_iter()
            .map(|channel| {
                let id = register(&channel.name);
                ChannelBinding {
                    id,
                    slot: channel.slot,
                    name: channel.name,
                    pin: channel.pin,
                }
            })
            .collect();

        Self {
            bindings,
            inverted: config.invert_pwm_output,
        }
    }

    pub fn bindings(&self) -> &[ChannelBinding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn inverted(&self) -> bool {
        self.inverted
    }

    /// The off-level writes applied to every bound output at startup.
    pub fn initial_writes(&self) -> Vec<PwmWrite> {
        self.bindings
            .iter()
            .map(|binding| PwmWrite {
                pin: binding.pin,
                duty: driven_level(0, self.inverted),
            })
            .collect()
    }

    /// Resolves an inbound state change into the write to apply. Pure and
    /// non-blocking; ids that were never registered yield `None`.
    pub fn on_state_change(
        &self,
        id: VirtualDeviceId,
        state: bool,
        value: u8,
    ) -> Option<PwmWrite> {
        let binding = self.bindings.iter().find(|binding| binding.id == id)?;
        Some(PwmWrite {
            pin: binding.pin,
            duty: driven_level(logical_level(state, value), self.inverted),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelSlot;

    fn config_with(slots: &[(usize, &str, u8)], inverted: bool) -> DeviceConfig {
        let mut config = DeviceConfig {
            invert_pwm_output: inverted,
            ..DeviceConfig::default()
        };
        for (slot, name, pin) in slots {
            config.devices[*slot] = ChannelSlot {
                name: (*name).to_string(),
                pin: *pin,
            };
        }
        config
    }

    fn sequential_registry(config: &DeviceConfig) -> ChannelRegistry {
        let mut next_id = 0;
        ChannelRegistry::build(config, |_| {
            let id = next_id;
            next_id += 1;
            id
        })
    }

    #[test]
    fn logical_level_table() {
        assert_eq!(logical_level(false, 0), 0);
        assert_eq!(logical_level(false, 200), 0);
        assert_eq!(logical_level(true, 0), 1);
        assert_eq!(logical_level(true, 254), 255);
        assert_eq!(logical_level(true, 255), 255);
    }

    #[test]
    fn on_never_maps_to_level_zero() {
        for value in 0..=255 {
            assert!(logical_level(true, value) >= 1);
        }
    }

    #[test]
    fn inversion_law_holds_over_the_full_range() {
        for level in 0..=255 {
            assert_eq!(driven_level(level, true), 255 - driven_level(level, false));
            assert_eq!(driven_level(driven_level(level, true), true), level);
        }
    }

    #[test]
    fn empty_slots_are_never_registered() {
        let config = config_with(&[(1, "Ceiling", 16), (4, "Desk", 17)], false);
        let mut registered = Vec::new();
        let registry = ChannelRegistry::build(&config, |name| {
            registered.push(name.to_string());
            registered.len() as VirtualDeviceId - 1
        });

        assert_eq!(registered, vec!["Ceiling", "Desk"]);
        assert_eq!(registry.bindings().len(), 2);
        assert_eq!(registry.bindings()[0].slot, 1);
        assert_eq!(registry.bindings()[1].slot, 4);
    }

    #[test]
    fn all_empty_slots_build_an_empty_registry() {
        let registry = sequential_registry(&DeviceConfig::default());
        assert!(registry.is_empty());
        assert!(registry.initial_writes().is_empty());
    }

    #[test]
    fn state_change_resolves_to_the_bound_pin() {
        let config = config_with(&[(0, "Ceiling", 16), (1, "Desk", 17)], false);
        let registry = sequential_registry(&config);

        assert_eq!(
            registry.on_state_change(1, true, 127),
            Some(PwmWrite { pin: 17, duty: 128 })
        );
        assert_eq!(
            registry.on_state_change(0, false, 200),
            Some(PwmWrite { pin: 16, duty: 0 })
        );
    }

    #[test]
    fn unknown_ids_resolve_to_nothing() {
        let config = config_with(&[(0, "Ceiling", 16)], false);
        let registry = sequential_registry(&config);
        assert_eq!(registry.on_state_change(9, true, 10), None);
    }

    #[test]
    fn inversion_applies_to_the_driven_duty() {
        let config = config_with(&[(0, "Ceiling", 16)], true);
        let registry = sequential_registry(&config);

        assert_eq!(
            registry.on_state_change(0, false, 0),
            Some(PwmWrite { pin: 16, duty: 255 })
        );
        assert_eq!(
            registry.on_state_change(0, true, 255),
            Some(PwmWrite { pin: 16, duty: 0 })
        );
    }

    #[test]
    fn startup_writes_park_every_output_off() {
        let config = config_with(&[(0, "Ceiling", 16), (2, "Desk", 17)], false);
        let registry = sequential_registry(&config);
        assert_eq!(
            registry.initial_writes(),
            vec![
                PwmWrite { pin: 16, duty: 0 },
                PwmWrite { pin: 17, duty: 0 },
            ]
        );

        let inverted = config_with(&[(0, "Ceiling", 16)], true);
        let registry = sequential_registry(&inverted);
        assert_eq!(
            registry.initial_writes(),
            vec![PwmWrite { pin: 16, duty: 255 }]
        );
    }
}
