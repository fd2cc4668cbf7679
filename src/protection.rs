//! Protection configuration and the delayed trip timer shared by OVP, OCP, OPP and OTP.

use crate::{
    board::ChannelParams,
    types::{Duration, Instant, ProtectionKind, elapsed, seconds},
};

/// Level and delay of one protection function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionConfig {
    pub enabled: bool,
    /// Threshold in volts, watts or degrees Celsius.
    pub level: f32,
    /// Time the condition must persist before tripping, in seconds.
    pub delay: f32,
}

impl ProtectionConfig {
    pub const fn new(enabled: bool, level: f32, delay: f32) -> Self {
        Self {
            enabled,
            level,
            delay,
        }
    }

    pub fn delay_duration(&self) -> Duration {
        seconds(self.delay)
    }

    /// Combination used when two channels are coupled: enabled if either is,
    /// smallest level and delay.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            enabled: self.enabled || other.enabled,
            level: self.level.min(other.level),
            delay: self.delay.min(other.delay),
        }
    }
}

/// Protection configuration of a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelProtectionConfig {
    pub ovp: ProtectionConfig,
    /// OCP trips when the current loop takes control, its `level` is not used.
    pub ocp: ProtectionConfig,
    pub opp: ProtectionConfig,
    pub otp: ProtectionConfig,
}

impl ChannelProtectionConfig {
    /// Factory defaults of a channel board.
    pub fn defaults(params: &ChannelParams) -> Self {
        Self {
            ovp: ProtectionConfig::new(params.ovp_default_state, params.u_max, params.ovp_default_delay),
            ocp: ProtectionConfig::new(params.ocp_default_state, 0.0, params.ocp_default_delay),
            opp: ProtectionConfig::new(
                params.opp_default_state,
                params.opp_default_level,
                params.opp_default_delay,
            ),
            otp: ProtectionConfig::new(
                params.otp_default_state,
                params.otp_default_level,
                params.otp_default_delay,
            ),
        }
    }

    pub fn get(&self, kind: ProtectionKind) -> &ProtectionConfig {
        match kind {
            ProtectionKind::Ovp => &self.ovp,
            ProtectionKind::Ocp => &self.ocp,
            ProtectionKind::Opp => &self.opp,
            ProtectionKind::Otp => &self.otp,
        }
    }

    pub fn get_mut(&mut self, kind: ProtectionKind) -> &mut ProtectionConfig {
        match kind {
            ProtectionKind::Ovp => &mut self.ovp,
            ProtectionKind::Ocp => &mut self.ocp,
            ProtectionKind::Opp => &mut self.opp,
            ProtectionKind::Otp => &mut self.otp,
        }
    }

    /// Field by field [`ProtectionConfig::merge`].
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            ovp: self.ovp.merge(&other.ovp),
            ocp: self.ocp.merge(&other.ocp),
            opp: self.opp.merge(&other.opp),
            otp: self.otp.merge(&other.otp),
        }
    }
}

/// Runtime state of one protection function.
///
/// Once tripped it stays tripped until [`ProtectionValue::clear`] is called,
/// whatever the condition does in the meantime.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProtectionValue {
    alarm_started: Option<Instant>,
    tripped: bool,
}

impl ProtectionValue {
    /// The condition is present but the delay has not run out yet.
    pub fn is_alarmed(&self) -> bool {
        self.alarm_started.is_some()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn alarm_started(&self) -> Option<Instant> {
        self.alarm_started
    }

    /// Feed the current condition. Returns `true` on the evaluation that trips.
    pub fn evaluate(&mut self, exceeded: bool, delay: Duration, now: Instant) -> bool {
        if self.tripped {
            return false;
        }
        if !exceeded {
            self.alarm_started = None;
            return false;
        }
        let started = *self.alarm_started.get_or_insert(now);
        if elapsed(started, now) >= delay {
            self.alarm_started = None;
            self.tripped = true;
        }
        self.tripped
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Heatsink temperature sensor of a channel with its OTP state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemperatureSensor {
    celsius: Option<f32>,
    pub(crate) state: ProtectionValue,
}

impl TemperatureSensor {
    /// Last reading, `None` until the first one arrives.
    pub fn celsius(&self) -> Option<f32> {
        self.celsius
    }

    pub fn update(&mut self, celsius: f32) {
        self.celsius = Some(celsius);
    }

    pub fn protection(&self) -> &ProtectionValue {
        &self.state
    }

    /// Run the OTP timer against `config`. Returns `true` when it trips.
    pub fn check(&mut self, config: &ProtectionConfig, now: Instant) -> bool {
        let exceeded = config.enabled && self.celsius.is_some_and(|t| t > config.level);
        self.state.evaluate(exceeded, config.delay_duration(), now)
    }
}
