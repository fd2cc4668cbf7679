//! Mapping between physical values and converter codes.
//!
//! A calibration table holds three points measured on the real instrument. Only
//! `min` and `max` take part in the mapping:
//!
//! `dac = min.dac + (value - min.val) * (max.dac - min.dac) / (max.val - min.val)`
//!
//! `value = min.val + (adc - min.adc) * (max.val - min.val) / (max.adc - min.adc)`
//!
//! The `mid` point only proves the table is consistent. Tables that would make
//! the mapping divide by zero are refused when loaded, so the transform itself
//! never has to check.

use strum_macros::EnumIter;

use crate::{
    board::{ADC_MAX, DAC_MAX},
    error::{CalibrationError, Error},
    types::CurrentRange,
};

/// Max length of the user remark stored with a calibration.
pub const CALIBRATION_REMARK_MAX_LENGTH: usize = 32;

/// One measured calibration point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationPoint {
    /// Code written to the DAC.
    pub dac: f32,
    /// Real value read on an external meter.
    pub val: f32,
    /// Code read back from the ADC.
    pub adc: f32,
}

impl CalibrationPoint {
    pub const fn new(dac: f32, val: f32, adc: f32) -> Self {
        Self { dac, val, adc }
    }

    fn is_finite(&self) -> bool {
        self.dac.is_finite() && self.val.is_finite() && self.adc.is_finite()
    }
}

/// Three point calibration of one axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationTable {
    pub min: CalibrationPoint,
    pub mid: CalibrationPoint,
    pub max: CalibrationPoint,
}

impl CalibrationTable {
    /// Check the table can be used for the mapping.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if !(self.min.is_finite() && self.mid.is_finite() && self.max.is_finite()) {
            return Err(CalibrationError::NotFinite);
        }
        if self.max.val == self.min.val {
            return Err(CalibrationError::DegenerateValue);
        }
        if self.max.adc == self.min.adc {
            return Err(CalibrationError::DegenerateAdc);
        }
        let between = |lo: f32, mid: f32, hi: f32| (lo < mid && mid < hi) || (lo > mid && mid > hi);
        if !between(self.min.dac, self.mid.dac, self.max.dac)
            || !between(self.min.val, self.mid.val, self.max.val)
            || !between(self.min.adc, self.mid.adc, self.max.adc)
        {
            return Err(CalibrationError::MidPointOutOfOrder);
        }
        Ok(())
    }

    /// Validate and build the transform.
    pub fn transform(&self) -> Result<CalibrationTransform, CalibrationError> {
        self.validate()?;
        Ok(CalibrationTransform {
            min: self.min,
            max: self.max,
        })
    }
}

/// Linear mapping between physical values and raw converter codes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationTransform {
    min: CalibrationPoint,
    max: CalibrationPoint,
}

impl CalibrationTransform {
    /// Uncalibrated mapping of `0..=full_scale` onto the full code range of both converters.
    pub fn factory(full_scale: f32) -> Self {
        Self {
            min: CalibrationPoint::new(0.0, 0.0, 0.0),
            max: CalibrationPoint::new(DAC_MAX as f32, full_scale, ADC_MAX as f32),
        }
    }

    pub fn physical_to_dac(&self, value: f32) -> f32 {
        self.min.dac
            + (value - self.min.val) * (self.max.dac - self.min.dac) / (self.max.val - self.min.val)
    }

    pub fn dac_to_physical(&self, dac: f32) -> f32 {
        self.min.val
            + (dac - self.min.dac) * (self.max.val - self.min.val) / (self.max.dac - self.min.dac)
    }

    pub fn adc_to_physical(&self, adc: f32) -> f32 {
        self.min.val
            + (adc - self.min.adc) * (self.max.val - self.min.val) / (self.max.adc - self.min.adc)
    }

    pub fn physical_to_adc(&self, value: f32) -> f32 {
        self.min.adc
            + (value - self.min.val) * (self.max.adc - self.min.adc) / (self.max.val - self.min.val)
    }

    /// DAC code for `value`, rounded and saturated to the converter range.
    pub fn dac_code(&self, value: f32) -> u16 {
        let code = self.physical_to_dac(value);
        if !(code > 0.0) {
            0
        } else if code >= DAC_MAX as f32 {
            DAC_MAX
        } else {
            (code + 0.5) as u16
        }
    }
}

/// A validated table together with what it can reach.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedAxis {
    pub table: CalibrationTable,
    pub transform: CalibrationTransform,
    /// Lowest physical value reachable with this calibration.
    pub min_possible: f32,
    /// Highest physical value reachable with this calibration.
    pub max_possible: f32,
}

impl CalibratedAxis {
    pub fn new(table: CalibrationTable) -> Result<Self, CalibrationError> {
        let transform = table.transform()?;
        let at_zero = transform.dac_to_physical(0.0);
        let at_full = transform.dac_to_physical(DAC_MAX as f32);
        Ok(Self {
            table,
            transform,
            min_possible: at_zero.min(at_full),
            max_possible: at_zero.max(at_full),
        })
    }
}

/// Calibration data of a channel as handed over by the persistence layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationConfig {
    pub voltage: Option<CalibrationTable>,
    /// Indexed by [`CurrentRange::index`].
    pub current: [Option<CalibrationTable>; 2],
    /// Format is YYYYMMDD.
    pub date: heapless::String<8>,
    pub remark: heapless::String<CALIBRATION_REMARK_MAX_LENGTH>,
}

/// Which table a calibration run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationAxis {
    Voltage,
    Current(CurrentRange),
}

/// The three calibration points in the order they are usually taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum CalibrationLevel {
    Min,
    Mid,
    Max,
}

impl CalibrationLevel {
    pub const fn index(self) -> usize {
        match self {
            Self::Min => 0,
            Self::Mid => 1,
            Self::Max => 2,
        }
    }
}

/// What a calibration run needs from a channel, and nothing more.
pub trait CalibrationAccess {
    /// Nominal physical levels for the min, mid and max points.
    fn calibration_levels(&self, axis: CalibrationAxis) -> [f32; 3];

    /// Uncalibrated transform used to pick the DAC codes.
    fn factory_transform(&self, axis: CalibrationAxis) -> CalibrationTransform;

    /// Write a raw DAC code for the axis, bypassing the setpoint.
    fn write_calibration_dac(&mut self, axis: CalibrationAxis, code: u16);

    /// Averaged raw ADC code of the axis since the last DAC write.
    fn calibration_adc_average(&self, axis: CalibrationAxis) -> Option<f32>;

    /// Store a new table for the axis and start using it.
    fn apply_calibration(&mut self, axis: CalibrationAxis, table: CalibrationTable) -> Result<(), Error>;
}

/// Drives a channel through the three calibration points of one axis.
#[derive(Debug, Clone)]
pub struct Calibrator {
    axis: CalibrationAxis,
    dac: [Option<f32>; 3],
    points: [Option<CalibrationPoint>; 3],
}

impl Calibrator {
    pub fn new(axis: CalibrationAxis) -> Self {
        Self {
            axis,
            dac: [None; 3],
            points: [None; 3],
        }
    }

    pub fn axis(&self) -> CalibrationAxis {
        self.axis
    }

    /// Drive the output to the nominal value of `level` and return that value.
    pub fn select_level<T: CalibrationAccess>(&mut self, target: &mut T, level: CalibrationLevel) -> f32 {
        let nominal = target.calibration_levels(self.axis)[level.index()];
        let code = target.factory_transform(self.axis).dac_code(nominal);
        target.write_calibration_dac(self.axis, code);
        self.dac[level.index()] = Some(code as f32);
        log::debug!("calibration: {:?} {:?} at {} (dac {})", self.axis, level, nominal, code);
        nominal
    }

    /// Record the value read on the external meter for `level`.
    pub fn record<T: CalibrationAccess>(
        &mut self,
        target: &T,
        level: CalibrationLevel,
        measured: f32,
    ) -> Result<(), CalibrationError> {
        let dac = self.dac[level.index()].ok_or(CalibrationError::MissingPoint)?;
        let adc = target
            .calibration_adc_average(self.axis)
            .ok_or(CalibrationError::MissingPoint)?;
        self.points[level.index()] = Some(CalibrationPoint::new(dac, measured, adc));
        Ok(())
    }

    /// The table built from the recorded points.
    pub fn table(&self) -> Result<CalibrationTable, CalibrationError> {
        let point = |level: CalibrationLevel| self.points[level.index()].ok_or(CalibrationError::MissingPoint);
        let table = CalibrationTable {
            min: point(CalibrationLevel::Min)?,
            mid: point(CalibrationLevel::Mid)?,
            max: point(CalibrationLevel::Max)?,
        };
        table.validate()?;
        Ok(table)
    }

    /// Apply the recorded table to the channel.
    pub fn save<T: CalibrationAccess>(self, target: &mut T) -> Result<CalibrationTable, Error> {
        let table = self.table()?;
        target.apply_calibration(self.axis, table)?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CalibrationTable {
        CalibrationTable {
            min: CalibrationPoint::new(250.0, 0.15, 250.0),
            mid: CalibrationPoint::new(32800.0, 20.02, 32800.0),
            max: CalibrationPoint::new(62200.0, 38.05, 62200.0),
        }
    }

    fn close(a: f32, b: f32, tolerance: f32) -> bool {
        (a - b).abs() <= tolerance
    }

    #[test]
    fn dac_formula_uses_min_and_max() {
        let t = table().transform().unwrap();
        assert!(close(t.physical_to_dac(0.15), 250.0, 1e-2));
        assert!(close(t.physical_to_dac(38.05), 62200.0, 1e-1));
        // Mid point does not bend the line.
        let expected = 250.0 + (20.0 - 0.15) * (62200.0 - 250.0) / (38.05 - 0.15);
        assert!(close(t.physical_to_dac(20.0), expected, 1e-1));
    }

    #[test]
    fn adc_dac_round_trip_inside_range() {
        let t = table().transform().unwrap();
        for code in [500.0_f32, 10_000.0, 31_000.0, 60_000.0] {
            let value = t.adc_to_physical(code);
            assert!(close(t.physical_to_dac(value), code, 0.5));
            assert!(close(t.physical_to_adc(value), code, 0.5));
        }
    }

    #[test]
    fn degenerate_tables_are_rejected() {
        let mut t = table();
        t.max.val = t.min.val;
        assert_eq!(t.validate(), Err(CalibrationError::DegenerateValue));

        let mut t = table();
        t.max.adc = t.min.adc;
        assert_eq!(t.validate(), Err(CalibrationError::DegenerateAdc));

        let mut t = table();
        t.mid.val = 40.0;
        assert_eq!(t.validate(), Err(CalibrationError::MidPointOutOfOrder));

        let mut t = table();
        t.mid.dac = f32::NAN;
        assert_eq!(t.validate(), Err(CalibrationError::NotFinite));
    }

    #[test]
    fn factory_transform_spans_full_scale() {
        let t = CalibrationTransform::factory(40.0);
        assert_eq!(t.dac_code(0.0), 0);
        assert_eq!(t.dac_code(40.0), DAC_MAX);
        assert_eq!(t.dac_code(80.0), DAC_MAX);
        assert_eq!(t.dac_code(-1.0), 0);
        assert!(close(t.adc_to_physical(ADC_MAX as f32), 40.0, 1e-4));
    }

    #[test]
    fn calibrated_axis_reachable_range() {
        let axis = CalibratedAxis::new(table()).unwrap();
        assert!(axis.min_possible < 0.15);
        assert!(axis.max_possible > 38.05);
        assert!(close(axis.transform.dac_to_physical(250.0), 0.15, 1e-4));
    }

    #[test]
    fn calibrator_requires_all_points() {
        let calibrator = Calibrator::new(CalibrationAxis::Voltage);
        assert_eq!(calibrator.table(), Err(CalibrationError::MissingPoint));
    }
}
