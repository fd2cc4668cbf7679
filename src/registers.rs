//! Register images of the per channel IO expander.
//!
//! The output register drives the relays and switches of the power stage, the
//! input register reports the analog status lines back. Bit 0 is the first field.

use modular_bitfield::prelude::*;

/// __W__ - IO expander output latch.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoOutputs {
    /// Output stage enabled.
    pub output_enable: bool,
    /// Down-programmer engaged (sinks current to pull the output down quickly).
    pub down_programmer: bool,
    /// Remote sense relay closed.
    pub remote_sense: bool,
    /// Voltage programmed from the external input.
    pub remote_programming: bool,
    /// Pre-regulator bypassed for low ripple operation.
    pub low_ripple: bool,
    /// Low current range shunt selected.
    pub current_range_low: bool,
    #[skip]
    __: B2,
}

impl IoOutputs {
    pub fn to_byte(self) -> u8 {
        self.into_bytes()[0]
    }
}

/// __R__ - IO expander input port.
#[bitfield(bits = 8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoInputs {
    /// Power good from the channel's auxiliary supply.
    pub power_good: bool,
    /// Current loop is in control.
    pub cc_active: bool,
    /// Voltage loop is in control.
    pub cv_active: bool,
    /// Remote sense leads are connected with reversed polarity.
    pub remote_polarity_reversed: bool,
    #[skip]
    __: B4,
}

impl IoInputs {
    pub fn from_byte(value: u8) -> Self {
        Self::from_bytes([value])
    }
}
