//! Hardware seams of the core.
//!
//! Register level drivers for the DAC, ADC and IO expander live outside of this
//! crate. A channel only needs to write codes, start conversions and latch the IO
//! expander, conversion results are handed back, tagged with the selector the
//! conversion was started with, through
//! [`Channel::post_adc_data`](crate::channel::Channel::post_adc_data) or
//! [`Channel::event_adc_data`](crate::channel::Channel::event_adc_data).
//!
//! Delays use [`embedded_hal::delay::DelayNs`].

use crate::{coupling::CouplingMode, error::HardwareFault, registers::IoOutputs};

/// Which DAC output a code is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacTarget {
    Voltage,
    Current,
}

/// What the next ADC conversion measures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdcSelector {
    /// Output voltage.
    #[default]
    UMon,
    /// Output current.
    IMon,
    /// Voltage DAC output.
    UMonDac,
    /// Current DAC output.
    IMonDac,
}

/// Converters and IO expander of one channel board.
pub trait ChannelHardware {
    fn write_dac(&mut self, target: DacTarget, code: u16);

    /// Start a conversion, the result arrives asynchronously.
    fn start_adc(&mut self, selector: AdcSelector);

    fn write_io(&mut self, outputs: IoOutputs);

    /// Probe the converters and IO expander.
    fn self_test(&mut self) -> Result<(), HardwareFault>;
}

/// Relays that tie the outputs of channel 1 and 2 together.
pub trait Backplane {
    fn switch_coupling(&mut self, mode: CouplingMode);
}
