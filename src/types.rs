//! Small enums shared between the channel and the dispatcher.

use strum_macros::{EnumCount, EnumIter, IntoStaticStr};

/// Timestamp with microsecond resolution, supplied by the caller's time base.
pub type Instant = fugit::TimerInstantU64<1_000_000>;

/// Duration with microsecond resolution.
pub type Duration = fugit::TimerDurationU64<1_000_000>;

/// Time elapsed from `since` to `now`, zero if the clock went backwards.
pub fn elapsed(since: Instant, now: Instant) -> Duration {
    now.checked_duration_since(since)
        .unwrap_or(Duration::from_ticks(0))
}

/// Convert a delay in seconds into a [`Duration`], non positive values become zero.
pub fn seconds(value: f32) -> Duration {
    if value > 0.0 {
        Duration::micros((value * 1_000_000.0) as u64)
    } else {
        Duration::from_ticks(0)
    }
}

/// Used to be less ambiguous about whether something is on or off.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    /// Disabled.
    #[default]
    Off = 0x00,
    /// Enabled.
    On = 0x01,
}

impl From<State> for bool {
    fn from(value: State) -> Self {
        match value {
            State::Off => false,
            State::On => true,
        }
    }
}

impl From<bool> for State {
    fn from(value: bool) -> Self {
        match value {
            true => State::On,
            false => State::Off,
        }
    }
}

/// Regulation state of the output stage.
///
/// CV and CC can never both be asserted, a channel that would satisfy both
/// (or neither) is reported as unregulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, IntoStaticStr)]
pub enum RegulationMode {
    /// Constant voltage regulation mode.
    #[strum(serialize = "CV")]
    Cv,
    /// Constant current regulation mode.
    #[strum(serialize = "CC")]
    Cc,
    #[default]
    #[strum(serialize = "UR")]
    Unregulated,
}

impl RegulationMode {
    /// Combine the two regulation conditions, keeping them mutually exclusive.
    pub fn from_conditions(cv: bool, cc: bool) -> Self {
        match (cv, cc) {
            (true, false) => Self::Cv,
            (false, true) => Self::Cc,
            _ => Self::Unregulated,
        }
    }
}

/// How a setpoint is driven by the trigger subsystem.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumIter)]
pub enum TriggerMode {
    #[default]
    Fixed = 0,
    List = 1,
    Step = 2,
}

impl TryFrom<u8> for TriggerMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Fixed),
            1 => Ok(Self::List),
            2 => Ok(Self::Step),
            _ => Err(()),
        }
    }
}

/// What a channel does when its list program stops.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumIter)]
pub enum TriggerOnListStop {
    #[default]
    OutputOff = 0,
    SetToFirstStep = 1,
    SetToLastStep = 2,
    Standby = 3,
}

impl TryFrom<u8> for TriggerOnListStop {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::OutputOff),
            1 => Ok(Self::SetToFirstStep),
            2 => Ok(Self::SetToLastStep),
            3 => Ok(Self::Standby),
            _ => Err(()),
        }
    }
}

/// Policy for picking between the two current ranges on dual range boards.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumIter)]
pub enum CurrentRangeSelectionMode {
    #[default]
    UseBoth = 0,
    AlwaysHigh = 1,
    AlwaysLow = 2,
}

impl TryFrom<u8> for CurrentRangeSelectionMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::UseBoth),
            1 => Ok(Self::AlwaysHigh),
            2 => Ok(Self::AlwaysLow),
            _ => Err(()),
        }
    }
}

/// Physical current range of the output stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumIter)]
pub enum CurrentRange {
    /// Full scale range (e.g. 5A).
    #[default]
    High,
    /// Low range (e.g. 500mA) for better resolution on small loads.
    Low,
}

impl CurrentRange {
    /// Index into per range tables such as the current calibration.
    pub const fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Low => 1,
        }
    }
}

/// The protection functions every channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumCount, IntoStaticStr)]
pub enum ProtectionKind {
    /// Over-voltage protection.
    #[strum(serialize = "OVP")]
    Ovp,
    /// Over-current protection.
    #[strum(serialize = "OCP")]
    Ocp,
    /// Over-power protection.
    #[strum(serialize = "OPP")]
    Opp,
    /// Over-temperature protection of the channel heatsink sensor.
    #[strum(serialize = "OTP")]
    Otp,
}

/// Why the maximum current of a channel is temporarily capped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxCurrentLimitCause {
    #[default]
    None,
    /// Cooling fan failed or is not present.
    Fan,
    /// Temperature is too high to allow full current.
    Temperature,
}

/// Externally visible state of a channel output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Disabled,
    /// Output switched on in hardware but not yet settled.
    Enabling,
    Enabled,
    /// Output disabled by a protection trip that has not been cleared.
    Tripped,
}
