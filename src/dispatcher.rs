//! Logical channel operations.
//!
//! Channel 1 and 2 form one logical channel while they are coupled or tracked.
//! Every method here takes the [`ChannelId`] of a logical channel and routes
//! the request to one or both physical channels:
//!
//! | Mode     | Voltage                         | Current                         |
//! |----------|---------------------------------|---------------------------------|
//! | None     | pass-through                    | pass-through                    |
//! | Series   | sum, half on each channel       | same on both                    |
//! | Parallel | same on both                    | sum, half on each channel       |
//! | Tracked  | mirrored                        | mirrored                        |
//!
//! Limits of an added axis are twice the lower of the two channel limits.
//! Trigger settings of a pair live on channel 1. Setters validate first and
//! leave everything untouched when they fail.

use core::ops::Range;

use embedded_hal::delay::DelayNs;

use crate::{
    board::ChannelParams,
    channel::{Channel, TriggerSettings},
    coupling::CouplingMode,
    error::{Error, Result},
    hal::{Backplane, ChannelHardware},
    protection::ProtectionConfig,
    psu::{ChannelId, Psu},
    types::{CurrentRangeSelectionMode, ProtectionKind, RegulationMode, TriggerMode, TriggerOnListStop},
};

type Adds = fn(CouplingMode) -> bool;

impl<H: ChannelHardware, B: Backplane, D: DelayNs> Psu<H, B, D> {
    fn is_pair(&self, id: ChannelId) -> bool {
        self.state.is_coupled_or_tracked() && id.0 < 2
    }

    fn mode_for(&self, id: ChannelId) -> CouplingMode {
        if self.is_pair(id) {
            self.state.coupling
        } else {
            CouplingMode::None
        }
    }

    fn targets(&self, id: ChannelId) -> Range<usize> {
        if self.is_pair(id) { 0..2 } else { id.0..id.0 + 1 }
    }

    fn primary(&self, id: ChannelId) -> &Channel<H> {
        &self.channels[self.targets(id).start]
    }

    fn primary_mut(&mut self, id: ChannelId) -> &mut Channel<H> {
        let n = self.targets(id).start;
        &mut self.channels[n]
    }

    fn check_ok(&self, id: ChannelId) -> Result<()> {
        match self.channels[self.targets(id)].iter().find(|ch| !ch.is_ok()) {
            Some(ch) => Err(Error::ChannelNotOk(ch.index())),
            None => Ok(()),
        }
    }

    /// Sum over the pair when the mode adds this quantity, the primary channel otherwise.
    fn combined(&self, id: ChannelId, adds: Adds, f: impl Fn(&Channel<H>) -> f32) -> f32 {
        if adds(self.mode_for(id)) {
            self.channels[self.targets(id)].iter().map(f).sum()
        } else {
            f(self.primary(id))
        }
    }

    /// The tighter of both channel bounds, doubled when the mode adds this quantity.
    fn bound(
        &self,
        id: ChannelId,
        adds: Adds,
        tighter: fn(f32, f32) -> f32,
        f: impl Fn(&Channel<H>) -> f32,
    ) -> f32 {
        if !self.is_pair(id) {
            return f(self.primary(id));
        }
        let value = tighter(f(&self.channels[0]), f(&self.channels[1]));
        if adds(self.state.coupling) { 2.0 * value } else { value }
    }

    /// Apply to every target, halved when the mode adds this quantity.
    fn split(&mut self, id: ChannelId, adds: Adds, value: f32, mut f: impl FnMut(&mut Channel<H>, f32)) {
        let value = if adds(self.mode_for(id)) { value / 2.0 } else { value };
        for n in self.targets(id) {
            f(&mut self.channels[n], value);
        }
    }

    fn for_each(&mut self, id: ChannelId, mut f: impl FnMut(&mut Channel<H>)) {
        for n in self.targets(id) {
            f(&mut self.channels[n]);
        }
    }

    fn try_for_each(&mut self, id: ChannelId, mut f: impl FnMut(&mut Channel<H>) -> Result<()>) -> Result<()> {
        for n in self.targets(id) {
            f(&mut self.channels[n])?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Voltage

    /// Programmed voltage of the logical channel.
    pub fn u_set(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_voltage, |ch| ch.voltage().set())
    }

    /// Voltage as requested, before power balancing lowered it.
    pub fn u_set_unbalanced(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_voltage, |ch| ch.u_set_unbalanced())
    }

    /// Measured voltage, averaged.
    pub fn u_mon(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_voltage, |ch| ch.voltage().mon())
    }

    /// Latest voltage sample.
    pub fn u_mon_last(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_voltage, |ch| ch.voltage().mon_last())
    }

    /// Voltage DAC output read back.
    pub fn u_mon_dac(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_voltage, |ch| ch.voltage().mon_dac())
    }

    /// Voltage limit of the logical channel.
    pub fn u_limit(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_voltage, f32::min, |ch| ch.voltage().limit())
    }

    /// Lowest voltage setting.
    pub fn u_min(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_voltage, f32::max, |ch| ch.voltage().min())
    }

    /// Default voltage setting.
    pub fn u_def(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_voltage, f32::max, |ch| ch.voltage().def())
    }

    /// Highest voltage setting.
    pub fn u_max(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_voltage, f32::min, |ch| ch.voltage().max())
    }

    /// Program the voltage, split over a series pair.
    pub fn set_voltage(&mut self, id: ChannelId, value: f32) -> Result<()> {
        self.check_ok(id)?;
        if !(value >= self.u_min(id) && value <= self.u_max(id)) {
            return Err(Error::OutOfRange);
        }
        if value > self.u_limit(id) {
            return Err(Error::LimitExceeded);
        }
        self.split(id, CouplingMode::adds_voltage, value, |ch, v| ch.set_voltage(v));
        Ok(())
    }

    /// Set the voltage limit, split over a series pair.
    pub fn set_voltage_limit(&mut self, id: ChannelId, limit: f32) -> Result<()> {
        self.check_ok(id)?;
        if !(limit >= self.u_min(id) && limit <= self.u_max(id)) {
            return Err(Error::OutOfRange);
        }
        self.split(id, CouplingMode::adds_voltage, limit, |ch, v| ch.set_voltage_limit(v));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Current

    /// Programmed current of the logical channel.
    pub fn i_set(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_current, |ch| ch.current().set())
    }

    /// Current as requested, before power balancing lowered it.
    pub fn i_set_unbalanced(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_current, |ch| ch.i_set_unbalanced())
    }

    /// Measured current, averaged.
    pub fn i_mon(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_current, |ch| ch.current().mon())
    }

    /// Latest current sample.
    pub fn i_mon_last(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_current, |ch| ch.current().mon_last())
    }

    /// Current DAC output read back.
    pub fn i_mon_dac(&self, id: ChannelId) -> f32 {
        self.combined(id, CouplingMode::adds_current, |ch| ch.current().mon_dac())
    }

    /// Current limit of the logical channel.
    pub fn i_limit(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_current, f32::min, |ch| ch.current().limit())
    }

    /// Highest current limit allowed right now, see [`Channel::max_current_limit`].
    pub fn i_max_limit(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_current, f32::min, |ch| ch.max_current_limit())
    }

    /// Lowest current setting.
    pub fn i_min(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_current, f32::max, |ch| ch.current().min())
    }

    /// Default current setting.
    pub fn i_def(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_current, f32::max, |ch| ch.current().def())
    }

    /// Highest current setting.
    pub fn i_max(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_current, f32::min, |ch| ch.current().max())
    }

    /// Program the current, split over a parallel pair.
    pub fn set_current(&mut self, id: ChannelId, value: f32) -> Result<()> {
        self.check_ok(id)?;
        if !(value >= self.i_min(id) && value <= self.i_max(id)) {
            return Err(Error::OutOfRange);
        }
        if value > self.i_limit(id) {
            return Err(Error::LimitExceeded);
        }
        self.split(id, CouplingMode::adds_current, value, |ch, v| ch.set_current(v));
        Ok(())
    }

    /// Set the current limit, split over a parallel pair.
    pub fn set_current_limit(&mut self, id: ChannelId, limit: f32) -> Result<()> {
        self.check_ok(id)?;
        if !(limit >= self.i_min(id) && limit <= self.i_max_limit(id)) {
            return Err(Error::OutOfRange);
        }
        self.split(id, CouplingMode::adds_current, limit, |ch, v| ch.set_current_limit(v));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Monitoring history

    /// Position of the next history sample.
    pub fn history_position(&self, id: ChannelId) -> u32 {
        self.primary(id).history().position()
    }

    /// Voltage sample at a history position.
    pub fn u_mon_history(&self, id: ChannelId, position: u32) -> Option<f32> {
        if CouplingMode::adds_voltage(self.mode_for(id)) {
            let ch0 = self.channels[0].history().u_mon(position)?;
            let ch1 = self.channels[1].history().u_mon(position)?;
            Some(ch0 + ch1)
        } else {
            self.primary(id).history().u_mon(position)
        }
    }

    /// Current sample at a history position.
    pub fn i_mon_history(&self, id: ChannelId, position: u32) -> Option<f32> {
        if CouplingMode::adds_current(self.mode_for(id)) {
            let ch0 = self.channels[0].history().i_mon(position)?;
            let ch1 = self.channels[1].history().i_mon(position)?;
            Some(ch0 + ch1)
        } else {
            self.primary(id).history().i_mon(position)
        }
    }

    // ------------------------------------------------------------------
    // Power

    /// Power limit of the logical channel.
    pub fn power_limit(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_power, f32::min, |ch| ch.power_limit())
    }

    /// Lowest power limit setting.
    pub fn power_min_limit(&self, _id: ChannelId) -> f32 {
        0.0
    }

    /// Highest power limit, twice the lower rating for a coupled pair.
    pub fn power_max_limit(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_power, f32::min, |ch| ch.power_max_limit())
    }

    /// Power limit after reset.
    pub fn power_default_limit(&self, id: ChannelId) -> f32 {
        self.power_max_limit(id)
    }

    /// Set the power limit, split over a coupled pair.
    pub fn set_power_limit(&mut self, id: ChannelId, limit: f32) -> Result<()> {
        self.check_ok(id)?;
        if !(limit >= self.power_min_limit(id) && limit <= self.power_max_limit(id)) {
            return Err(Error::OutOfRange);
        }
        self.split(id, CouplingMode::adds_power, limit, |ch, v| ch.set_power_limit(v));
        Ok(())
    }

    /// Lowest OPP level.
    pub fn opp_min_level(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_power, f32::max, |ch| ch.params().opp_min_level)
    }

    /// Default OPP level.
    pub fn opp_default_level(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_power, f32::min, |ch| ch.params().opp_default_level)
    }

    /// Highest OPP level.
    pub fn opp_max_level(&self, id: ChannelId) -> f32 {
        self.bound(id, CouplingMode::adds_power, f32::min, |ch| ch.params().opp_max_level)
    }

    // ------------------------------------------------------------------
    // Protection

    // Logical level / per channel level.
    fn protection_scale(&self, id: ChannelId, kind: ProtectionKind) -> f32 {
        let mode = self.mode_for(id);
        match kind {
            ProtectionKind::Ovp if mode.adds_voltage() => 2.0,
            ProtectionKind::Opp if mode.adds_power() => 2.0,
            _ => 1.0,
        }
    }

    /// Is the protection function enabled?
    pub fn protection_state(&self, id: ChannelId, kind: ProtectionKind) -> bool {
        self.primary(id).protection_config().get(kind).enabled
    }

    /// Trip level in logical units. OCP trips on current regulation and has no level.
    pub fn protection_level(&self, id: ChannelId, kind: ProtectionKind) -> Result<f32> {
        if kind == ProtectionKind::Ocp {
            return Err(Error::NotSupported);
        }
        let level = self.primary(id).protection_config().get(kind).level;
        Ok(level * self.protection_scale(id, kind))
    }

    /// Trip delay in seconds.
    pub fn protection_delay(&self, id: ChannelId, kind: ProtectionKind) -> f32 {
        self.primary(id).protection_config().get(kind).delay
    }

    /// Allowed `(min, max)` trip level in logical units.
    pub fn protection_level_range(&self, id: ChannelId, kind: ProtectionKind) -> Result<(f32, f32)> {
        match kind {
            ProtectionKind::Ovp => Ok((self.u_min(id), self.u_max(id))),
            ProtectionKind::Ocp => Err(Error::NotSupported),
            ProtectionKind::Opp => Ok((self.opp_min_level(id), self.opp_max_level(id))),
            ProtectionKind::Otp => Ok((
                self.bound(id, |_| false, f32::max, |ch| ch.params().otp_min_level),
                self.bound(id, |_| false, f32::min, |ch| ch.params().otp_max_level),
            )),
        }
    }

    /// Allowed `(min, max)` trip delay in seconds.
    pub fn protection_delay_range(&self, id: ChannelId, kind: ProtectionKind) -> (f32, f32) {
        (
            self.bound(id, |_| false, f32::max, |ch| delay_range(ch.params(), kind).0),
            self.bound(id, |_| false, f32::min, |ch| delay_range(ch.params(), kind).1),
        )
    }

    fn check_protection_level(&self, id: ChannelId, kind: ProtectionKind, level: f32) -> Result<()> {
        let (min, max) = self.protection_level_range(id, kind)?;
        if level >= min && level <= max { Ok(()) } else { Err(Error::OutOfRange) }
    }

    fn check_protection_delay(&self, id: ChannelId, kind: ProtectionKind, delay: f32) -> Result<()> {
        let (min, max) = self.protection_delay_range(id, kind);
        if delay >= min && delay <= max { Ok(()) } else { Err(Error::OutOfRange) }
    }

    /// Switch a protection function on or off on every channel of the pair.
    pub fn set_protection_state(&mut self, id: ChannelId, kind: ProtectionKind, enabled: bool) {
        self.for_each(id, |ch| ch.set_protection_state(kind, enabled));
    }

    /// Set the trip level in logical units.
    pub fn set_protection_level(&mut self, id: ChannelId, kind: ProtectionKind, level: f32) -> Result<()> {
        self.check_protection_level(id, kind, level)?;
        let level = level / self.protection_scale(id, kind);
        self.for_each(id, |ch| ch.set_protection_level(kind, level));
        Ok(())
    }

    /// Set the trip delay in seconds.
    pub fn set_protection_delay(&mut self, id: ChannelId, kind: ProtectionKind, delay: f32) -> Result<()> {
        self.check_protection_delay(id, kind, delay)?;
        self.for_each(id, |ch| ch.set_protection_delay(kind, delay));
        Ok(())
    }

    /// State, level and delay at once, level in logical units. The OCP level is ignored.
    pub fn set_protection_parameters(
        &mut self,
        id: ChannelId,
        kind: ProtectionKind,
        config: ProtectionConfig,
    ) -> Result<()> {
        if kind != ProtectionKind::Ocp {
            self.check_protection_level(id, kind, config.level)?;
        }
        self.check_protection_delay(id, kind, config.delay)?;
        let scale = self.protection_scale(id, kind);
        self.for_each(id, |ch| {
            let level = if kind == ProtectionKind::Ocp {
                ch.protection_config().get(kind).level
            } else {
                config.level / scale
            };
            ch.set_protection(kind, ProtectionConfig::new(config.enabled, level, config.delay));
        });
        Ok(())
    }

    /// Any protection tripped on any channel of the pair.
    pub fn is_tripped(&self, id: ChannelId) -> bool {
        self.channels[self.targets(id)].iter().any(|ch| ch.is_tripped())
    }

    /// Protection function tripped on any channel of the pair.
    pub fn is_protection_tripped(&self, id: ChannelId, kind: ProtectionKind) -> bool {
        self.channels[self.targets(id)]
            .iter()
            .any(|ch| ch.protection(kind).is_tripped())
    }

    /// Clear the trips. Outputs stay off.
    pub fn clear_protection(&mut self, id: ChannelId, clear_otp: bool) {
        self.for_each(id, |ch| ch.clear_protection(clear_otp));
    }

    /// Clear the trips and switch every protection function off.
    pub fn disable_protection(&mut self, id: ChannelId) {
        self.for_each(id, |ch| ch.disable_protection());
    }

    // ------------------------------------------------------------------
    // Output and modes

    /// Output of the logical channel is on.
    pub fn is_output_enabled(&self, id: ChannelId) -> bool {
        self.channels[self.targets(id)]
            .iter()
            .any(|ch| ch.is_output_enabled())
    }

    /// Switch the output of the logical channel. Both channels of a pair are
    /// checked before either one is switched on.
    pub fn output_enable(&mut self, id: ChannelId, enable: bool) -> Result<()> {
        if enable {
            for ch in &self.channels[self.targets(id)] {
                ch.can_enable_output()?;
            }
        }
        self.try_for_each(id, |ch| ch.output_enable(enable))
    }

    /// Voltage is sensed at the load.
    pub fn is_remote_sensing_enabled(&self, id: ChannelId) -> bool {
        self.primary(id).is_remote_sensing_enabled()
    }

    /// Switch remote sensing on every channel of the pair.
    pub fn remote_sensing_enable(&mut self, id: ChannelId, enable: bool) -> Result<()> {
        self.check_ok(id)?;
        self.for_each(id, |ch| ch.remote_sensing_enable(enable));
        Ok(())
    }

    /// Setpoints come from the analog programming input.
    pub fn is_remote_programming_enabled(&self, id: ChannelId) -> bool {
        self.primary(id).is_remote_programming_enabled()
    }

    /// Switch remote programming, every channel of the pair needs the feature.
    pub fn remote_programming_enable(&mut self, id: ChannelId, enable: bool) -> Result<()> {
        self.check_ok(id)?;
        if enable
            && !self.channels[self.targets(id)]
                .iter()
                .all(|ch| ch.features().remote_programming())
        {
            return Err(Error::NotSupported);
        }
        self.try_for_each(id, |ch| ch.remote_programming_enable(enable))
    }

    /// Pre-regulator bypassed.
    pub fn is_low_ripple_enabled(&self, id: ChannelId) -> bool {
        self.primary(id).is_low_ripple_enabled()
    }

    /// Low ripple goes on for both channels of a pair or for none.
    pub fn low_ripple_enable(&mut self, id: ChannelId, enable: bool) -> Result<()> {
        self.check_ok(id)?;
        let result = self.try_for_each(id, |ch| ch.low_ripple_enable(enable));
        if result.is_err() && enable {
            self.for_each(id, |ch| ch.low_ripple_off());
        }
        result
    }

    /// Low ripple mode follows the operating point.
    pub fn is_low_ripple_auto_enabled(&self, id: ChannelId) -> bool {
        self.primary(id).is_low_ripple_auto_enabled()
    }

    /// Let the channels switch low ripple mode by themselves.
    pub fn low_ripple_auto_enable(&mut self, id: ChannelId, enable: bool) -> Result<()> {
        self.check_ok(id)?;
        if enable
            && !self.channels[self.targets(id)]
                .iter()
                .all(|ch| ch.features().low_ripple())
        {
            return Err(Error::NotSupported);
        }
        self.try_for_each(id, |ch| ch.low_ripple_auto_enable(enable))
    }

    /// CV or CC when both channels of a pair agree, unregulated otherwise.
    pub fn regulation_mode(&self, id: ChannelId) -> RegulationMode {
        let mode = self.primary(id).regulation_mode();
        if self.channels[self.targets(id)]
            .iter()
            .all(|ch| ch.regulation_mode() == mode)
        {
            mode
        } else {
            RegulationMode::Unregulated
        }
    }

    // ------------------------------------------------------------------
    // Current range

    /// Low current range usable on any channel of the pair.
    pub fn is_current_low_range_allowed(&self, id: ChannelId) -> bool {
        self.channels[self.targets(id)]
            .iter()
            .any(|ch| ch.is_current_low_range_allowed())
    }

    /// Choose how the current range is selected.
    pub fn set_current_range_selection_mode(&mut self, id: ChannelId, mode: CurrentRangeSelectionMode) {
        self.for_each(id, |ch| ch.set_current_range_selection_mode(mode));
    }

    /// Switch the current range from the measured current.
    pub fn enable_auto_select_current_range(&mut self, id: ChannelId, enable: bool) {
        self.for_each(id, |ch| ch.enable_auto_select_current_range(enable));
    }

    // ------------------------------------------------------------------
    // Trigger

    /// Trigger settings of the logical channel.
    pub fn trigger(&self, id: ChannelId) -> &TriggerSettings {
        self.primary(id).trigger()
    }

    /// How the voltage changes when the trigger fires.
    pub fn set_trigger_voltage_mode(&mut self, id: ChannelId, mode: TriggerMode) {
        self.primary_mut(id).trigger_mut().voltage_mode = mode;
    }

    /// How the current changes when the trigger fires.
    pub fn set_trigger_current_mode(&mut self, id: ChannelId, mode: TriggerMode) {
        self.primary_mut(id).trigger_mut().current_mode = mode;
    }

    /// Output state applied when the trigger fires.
    pub fn set_trigger_output_state(&mut self, id: ChannelId, enable: bool) {
        self.primary_mut(id).trigger_mut().output_state = enable;
    }

    /// What happens when a list stops.
    pub fn set_trigger_on_list_stop(&mut self, id: ChannelId, on_stop: TriggerOnListStop) {
        self.primary_mut(id).trigger_mut().on_list_stop = on_stop;
    }

    /// Voltage applied when the trigger fires, in logical units.
    pub fn set_trigger_voltage(&mut self, id: ChannelId, value: f32) -> Result<()> {
        if !(value >= self.u_min(id) && value <= self.u_max(id)) {
            return Err(Error::OutOfRange);
        }
        if value > self.u_limit(id) {
            return Err(Error::LimitExceeded);
        }
        if value * self.trigger(id).current > self.power_limit(id) {
            return Err(Error::PowerLimitExceeded);
        }
        self.primary_mut(id).trigger_mut().voltage = value;
        Ok(())
    }

    /// Current applied when the trigger fires, in logical units.
    pub fn set_trigger_current(&mut self, id: ChannelId, value: f32) -> Result<()> {
        if !(value >= self.i_min(id) && value <= self.i_max(id)) {
            return Err(Error::OutOfRange);
        }
        if value > self.i_limit(id) {
            return Err(Error::LimitExceeded);
        }
        if self.trigger(id).voltage * value > self.power_limit(id) {
            return Err(Error::PowerLimitExceeded);
        }
        self.primary_mut(id).trigger_mut().current = value;
        Ok(())
    }
}

fn delay_range(params: &ChannelParams, kind: ProtectionKind) -> (f32, f32) {
    match kind {
        ProtectionKind::Ovp => (params.ovp_min_delay, params.ovp_max_delay),
        ProtectionKind::Ocp => (params.ocp_min_delay, params.ocp_max_delay),
        ProtectionKind::Opp => (params.opp_min_delay, params.opp_max_delay),
        ProtectionKind::Otp => (params.otp_min_delay, params.otp_max_delay),
    }
}
