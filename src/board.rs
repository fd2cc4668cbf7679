//! Board constants for the supported channel board revisions.
//!
//! Every channel is built from an immutable [`ChannelParams`] describing what the
//! power stage can do: voltage and current bounds, protection defaults, the safe
//! operating area used by low ripple mode and the total power it may dissipate.

use modular_bitfield::prelude::*;
use strum_macros::{EnumIter, IntoStaticStr};

/// Full scale DAC code.
pub const DAC_MAX: u16 = 0xFFFF;

/// Full scale ADC code.
pub const ADC_MAX: i16 = 0x7FFF;

/// Maximum channels a single instrument may carry.
pub const CH_MAX: usize = 6;

/// Current cap applied while the max current is limited (e.g. fan failure).
pub const ERR_MAX_CURRENT: f32 = 2.0;

/// Features implemented by a channel board.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub voltage: bool,
    pub current: bool,
    pub power: bool,
    /// Output can be switched on and off.
    pub output_enable: bool,
    pub down_programmer: bool,
    pub low_ripple: bool,
    pub remote_programming: bool,
    /// Remote sense reverse polarity detection.
    pub remote_polarity: bool,
}

impl Features {
    /// Every feature present.
    pub fn all() -> Self {
        Self::from_bytes([0xFF])
    }
}

/// This enum represents all supported channel board revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
pub enum BoardRevision {
    #[strum(serialize = "r3B4")]
    R3B4,
    /// Adds remote programming, remote polarity detection and a 500mA range.
    #[strum(serialize = "r5B12")]
    R5B12,
}

impl BoardRevision {
    /// Factory constants for this revision.
    pub fn params(&self) -> ChannelParams {
        match self {
            BoardRevision::R3B4 => ChannelParams {
                revision: *self,
                features: Features::new()
                    .with_voltage(true)
                    .with_current(true)
                    .with_power(true)
                    .with_output_enable(true)
                    .with_down_programmer(true)
                    .with_low_ripple(true),
                ..ChannelParams::BASE
            },
            BoardRevision::R5B12 => ChannelParams {
                revision: *self,
                features: Features::all(),
                ..ChannelParams::BASE
            },
        }
    }
}

/// Immutable constants a channel is constructed from.
#[derive(Debug, Clone, Copy)]
pub struct ChannelParams {
    pub revision: BoardRevision,
    pub features: Features,

    pub u_min: f32,
    pub u_def: f32,
    pub u_max: f32,
    pub u_def_step: f32,
    /// Nominal voltage levels used by the calibration procedure.
    pub u_cal_val: [f32; 3],

    pub ovp_default_state: bool,
    pub ovp_min_delay: f32,
    pub ovp_default_delay: f32,
    pub ovp_max_delay: f32,

    pub i_min: f32,
    pub i_def: f32,
    pub i_max: f32,
    pub i_def_step: f32,
    /// Nominal current levels used by the calibration procedure.
    pub i_cal_val: [f32; 3],
    /// Full scale of the low current range.
    pub i_low_range_max: f32,

    pub ocp_default_state: bool,
    pub ocp_min_delay: f32,
    pub ocp_default_delay: f32,
    pub ocp_max_delay: f32,

    pub opp_default_state: bool,
    pub opp_min_delay: f32,
    pub opp_default_delay: f32,
    pub opp_max_delay: f32,
    pub opp_min_level: f32,
    pub opp_default_level: f32,
    pub opp_max_level: f32,

    pub otp_default_state: bool,
    pub otp_min_level: f32,
    pub otp_default_level: f32,
    pub otp_max_level: f32,
    pub otp_min_delay: f32,
    pub otp_default_delay: f32,
    pub otp_max_delay: f32,

    /// Pre-regulator input voltage.
    pub soa_vin: f32,
    /// Highest current allowed with the pre-regulator bypassed.
    pub soa_preg_curr: f32,
    /// Highest dissipation of the post-regulator with the pre-regulator bypassed.
    pub soa_postreg_ptot: f32,

    /// Total output power of the channel.
    pub ptot: f32,
}

impl ChannelParams {
    // Features are filled in by the revision.
    const BASE: ChannelParams = ChannelParams {
        revision: BoardRevision::R3B4,
        features: Features::new(),

        u_min: 0.0,
        u_def: 0.0,
        u_max: 40.0,
        u_def_step: 0.01,
        u_cal_val: [0.15, 20.0, 38.0],

        ovp_default_state: false,
        ovp_min_delay: 0.0,
        ovp_default_delay: 0.005,
        ovp_max_delay: 10.0,

        i_min: 0.0,
        i_def: 0.0,
        i_max: 5.0,
        i_def_step: 0.01,
        i_cal_val: [0.05, 2.425, 4.8],
        i_low_range_max: 0.5,

        ocp_default_state: false,
        ocp_min_delay: 0.0,
        ocp_default_delay: 0.02,
        ocp_max_delay: 10.0,

        opp_default_state: true,
        opp_min_delay: 1.0,
        opp_default_delay: 10.0,
        opp_max_delay: 300.0,
        opp_min_level: 0.0,
        opp_default_level: 155.0,
        opp_max_level: 155.0,

        otp_default_state: true,
        otp_min_level: 0.0,
        otp_default_level: 75.0,
        otp_max_level: 100.0,
        otp_min_delay: 0.0,
        otp_default_delay: 10.0,
        otp_max_delay: 300.0,

        soa_vin: 58.0,
        soa_preg_curr: 2.0,
        soa_postreg_ptot: 25.0,

        ptot: 155.0,
    };

    /// Does this board switch between a high and a low current range?
    pub fn has_dual_current_range(&self) -> bool {
        self.revision == BoardRevision::R5B12
    }

    /// Override the total output power. OPP level bounds follow.
    pub fn with_ptot(mut self, ptot: f32) -> Self {
        self.ptot = ptot;
        self.opp_max_level = ptot;
        self.opp_default_level = ptot;
        self
    }

    /// Override the voltage bounds.
    pub fn with_voltage_range(mut self, min: f32, def: f32, max: f32) -> Self {
        self.u_min = min;
        self.u_def = def;
        self.u_max = max;
        self
    }

    /// Override the current bounds.
    pub fn with_current_range(mut self, min: f32, def: f32, max: f32) -> Self {
        self.i_min = min;
        self.i_def = def;
        self.i_max = max;
        self
    }

    /// Override the feature set.
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }
}
