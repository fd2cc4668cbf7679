//! Coupling of channel 1 and 2 and the device wide state that goes with it.

use embedded_hal::delay::DelayNs;
use log::{info, warn};
use strum_macros::{EnumIter, IntoStaticStr};

use crate::{
    channel::Channel,
    error::{Error, Result},
    event::Event,
    hal::{Backplane, ChannelHardware},
    protection::ChannelProtectionConfig,
    psu::{ChannelId, Psu},
    types::CurrentRangeSelectionMode,
};

/// Time the backplane relays need to settle after switching.
pub const RELAY_DEBOUNCE_MS: u32 = 100;

/// How the outputs of channel 1 and 2 are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumIter, IntoStaticStr)]
pub enum CouplingMode {
    /// Independent channels.
    #[default]
    #[strum(serialize = "NONE")]
    None,
    /// Outputs wired in series, voltages add up.
    #[strum(serialize = "SERIES")]
    Series,
    /// Outputs wired in parallel, currents add up.
    #[strum(serialize = "PARALLEL")]
    Parallel,
    /// Independent outputs programmed with the same values.
    #[strum(serialize = "TRACKED")]
    Tracked,
}

impl CouplingMode {
    /// Series or parallel, the outputs are physically tied together.
    pub fn is_coupled(self) -> bool {
        matches!(self, Self::Series | Self::Parallel)
    }

    pub fn is_coupled_or_tracked(self) -> bool {
        self != Self::None
    }

    /// The logical voltage is the sum of both channels.
    pub fn adds_voltage(self) -> bool {
        self == Self::Series
    }

    /// The logical current is the sum of both channels.
    pub fn adds_current(self) -> bool {
        self == Self::Parallel
    }

    /// The logical power is the sum of both channels.
    pub fn adds_power(self) -> bool {
        self.is_coupled()
    }
}

/// Device wide state owned by the [`Psu`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemState {
    pub(crate) coupling: CouplingMode,
    /// A trip on any channel switches every output off.
    pub output_protection_couple: bool,
    /// A trip asks the instrument to power down.
    pub shutdown_when_protection_tripped: bool,
}

impl SystemState {
    pub fn coupling_mode(&self) -> CouplingMode {
        self.coupling
    }

    pub fn is_coupled(&self) -> bool {
        self.coupling.is_coupled()
    }

    pub fn is_coupled_or_tracked(&self) -> bool {
        self.coupling.is_coupled_or_tracked()
    }

    pub fn is_series(&self) -> bool {
        self.coupling == CouplingMode::Series
    }

    pub fn is_parallel(&self) -> bool {
        self.coupling == CouplingMode::Parallel
    }

    pub fn is_tracked(&self) -> bool {
        self.coupling == CouplingMode::Tracked
    }
}

/// Settings both channels share while coupled or tracked.
struct SharedSettings {
    u_min: f32,
    i_min: f32,
    u_limit: f32,
    i_limit: f32,
    p_limit: f32,
    protection: ChannelProtectionConfig,
}

impl SharedSettings {
    fn of<H: ChannelHardware>(a: &Channel<H>, b: &Channel<H>) -> Self {
        Self {
            u_min: a.voltage().min().max(b.voltage().min()),
            i_min: a.current().min().max(b.current().min()),
            u_limit: a.voltage().limit().min(b.voltage().limit()),
            i_limit: a.current().limit().min(b.current().limit()),
            p_limit: a.power_limit().min(b.power_limit()),
            protection: a.protection_config().merge(b.protection_config()),
        }
    }
}

impl<H: ChannelHardware, B: Backplane, D: DelayNs> Psu<H, B, D> {
    pub fn coupling_mode(&self) -> CouplingMode {
        self.state.coupling_mode()
    }

    pub fn is_coupled(&self) -> bool {
        self.state.is_coupled()
    }

    pub fn is_series(&self) -> bool {
        self.state.is_series()
    }

    pub fn is_parallel(&self) -> bool {
        self.state.is_parallel()
    }

    pub fn is_tracked(&self) -> bool {
        self.state.is_tracked()
    }

    /// Channel 1 and 2 both exist and are OK.
    pub fn is_coupling_allowed(&self) -> bool {
        self.channels.len() >= 2 && self.channels[0].is_ok() && self.channels[1].is_ok()
    }

    /// Switch the coupling of channel 1 and 2.
    ///
    /// Both outputs are switched off, remote modes and triggers reset and the
    /// setpoints moved to the lowest value valid in the new mode. While coupled
    /// or tracked the channels share their limits and the stricter protection
    /// settings. Blocks for [`RELAY_DEBOUNCE_MS`] after switching the relays.
    pub fn set_coupling_mode(&mut self, mode: CouplingMode) -> Result<()> {
        if mode == self.state.coupling {
            return Ok(());
        }
        if mode.is_coupled_or_tracked() && !self.is_coupling_allowed() {
            let name: &'static str = mode.into();
            warn!("coupling {} rejected", name);
            return Err(Error::CouplingNotAllowed);
        }

        let shared = mode
            .is_coupled_or_tracked()
            .then(|| SharedSettings::of(&self.channels[0], &self.channels[1]));
        self.state.coupling = mode;

        for n in 0..self.channels.len().min(2) {
            let id = ChannelId(n);
            let trigger_voltage = self.u_min(id);
            let trigger_current = self.i_min(id);
            let channel = &mut self.channels[n];
            if channel.is_ok() {
                channel.force_output_off();
                channel.disable_remote_modes();
                channel.reset_trigger();
                let (u_min, i_min) = match &shared {
                    Some(shared) => {
                        channel.set_voltage_limit(shared.u_limit);
                        channel.set_current_limit(shared.i_limit);
                        channel.set_power_limit(shared.p_limit);
                        channel.set_protection_config(shared.protection);
                        (shared.u_min, shared.i_min)
                    }
                    None => (channel.voltage().min(), channel.current().min()),
                };
                channel.set_voltage(u_min);
                channel.set_current(i_min);
                let trigger = channel.trigger_mut();
                trigger.voltage = trigger_voltage;
                trigger.current = trigger_current;
            }
            channel.set_current_range_selection_mode(CurrentRangeSelectionMode::UseBoth);
            channel.enable_auto_select_current_range(false);
            channel.reset_history();
        }

        self.backplane.switch_coupling(mode);
        self.push_event(Event::CouplingChanged(mode));
        let name: &'static str = mode.into();
        info!("coupling {}", name);
        self.delay.delay_ms(RELAY_DEBOUNCE_MS);
        Ok(())
    }
}
