//! We use this mocking module in unit tests to emulate the channel hardware.

use embedded_hal::delay::DelayNs;

use crate::{
    coupling::CouplingMode,
    error::HardwareFault,
    hal::{AdcSelector, Backplane, ChannelHardware, DacTarget},
    registers::IoOutputs,
};

/// Our mock type used to emulate the converters and IO expander of a channel.
#[derive(Debug, Default)]
pub struct MockHardware {
    /// Last code written to the voltage DAC
    pub voltage_dac: Option<u16>,
    /// Last code written to the current DAC
    pub current_dac: Option<u16>,
    pub dac_writes: usize,
    /// Last IO expander image
    pub io: Option<IoOutputs>,
    pub io_writes: usize,
    /// Last conversion started
    pub adc_started: Option<AdcSelector>,
    pub adc_starts: usize,
    /// Fault to report from the next self-tests
    pub self_test_fault: Option<HardwareFault>,
}

impl MockHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(fault: HardwareFault) -> Self {
        Self {
            self_test_fault: Some(fault),
            ..Self::default()
        }
    }

    /// Last IO image, all off if nothing was written yet.
    pub fn last_io(&self) -> IoOutputs {
        self.io.unwrap_or_else(IoOutputs::new)
    }
}

impl ChannelHardware for MockHardware {
    fn write_dac(&mut self, target: DacTarget, code: u16) {
        match target {
            DacTarget::Voltage => self.voltage_dac = Some(code),
            DacTarget::Current => self.current_dac = Some(code),
        }
        self.dac_writes += 1;
    }

    fn start_adc(&mut self, selector: AdcSelector) {
        self.adc_started = Some(selector);
        self.adc_starts += 1;
    }

    fn write_io(&mut self, outputs: IoOutputs) {
        self.io = Some(outputs);
        self.io_writes += 1;
    }

    fn self_test(&mut self) -> Result<(), HardwareFault> {
        match self.self_test_fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// Records every relay switch.
#[derive(Debug, Default)]
pub struct MockBackplane {
    pub switches: heapless::Vec<CouplingMode, 16>,
}

impl Backplane for MockBackplane {
    fn switch_coupling(&mut self, mode: CouplingMode) {
        // Dropped when full, tests never switch that often.
        let _ = self.switches.push(mode);
    }
}

/// Accumulates the requested delays instead of waiting.
#[derive(Debug, Default)]
pub struct MockDelay {
    pub total_ns: u64,
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += ns as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_last_writes() {
        let mut hw = MockHardware::new();
        hw.write_dac(DacTarget::Voltage, 100);
        hw.write_dac(DacTarget::Current, 200);
        hw.write_dac(DacTarget::Voltage, 300);
        assert_eq!(hw.voltage_dac, Some(300));
        assert_eq!(hw.current_dac, Some(200));
        assert_eq!(hw.dac_writes, 3);

        hw.start_adc(AdcSelector::IMon);
        assert_eq!(hw.adc_started, Some(AdcSelector::IMon));

        let io = IoOutputs::new().with_output_enable(true);
        hw.write_io(io);
        assert_eq!(hw.last_io(), io);
    }

    #[test]
    fn test_self_test_failure() {
        let mut hw = MockHardware::failing(HardwareFault::Adc);
        assert_eq!(hw.self_test(), Err(HardwareFault::Adc));
        hw.self_test_fault = None;
        assert_eq!(hw.self_test(), Ok(()));
    }

    #[test]
    fn test_delay_accumulates() {
        let mut delay = MockDelay::default();
        delay.delay_ms(100);
        delay.delay_us(5);
        assert_eq!(delay.total_ns, 100_005_000);
    }
}
