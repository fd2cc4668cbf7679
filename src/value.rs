//! One regulated axis of a channel (voltage or current).

use heapless::HistoryBuf as HistoryBuffer;

use crate::calibration::CalibrationTransform;

/// Number of raw ADC samples averaged into the monitored value.
pub const NUM_ADC_AVERAGING_VALUES: usize = 8;

/// Setpoint, limits and monitored values of one axis.
///
/// The bounds are kept ordered as `min <= set <= limit <= max` by the owning
/// channel, this type only stores them.
pub struct Value {
    pub(crate) set: f32,
    pub(crate) limit: f32,
    min: f32,
    def: f32,
    max: f32,
    step: f32,

    mon: f32,
    mon_last: f32,
    mon_measured: bool,
    mon_adc: HistoryBuffer<f32, NUM_ADC_AVERAGING_VALUES>,

    mon_dac: f32,
    mon_dac_adc: HistoryBuffer<f32, NUM_ADC_AVERAGING_VALUES>,
}

impl Value {
    pub fn new(min: f32, def: f32, max: f32, step: f32) -> Self {
        Self {
            set: def,
            limit: max,
            min,
            def,
            max,
            step,
            mon: 0.0,
            mon_last: 0.0,
            mon_measured: false,
            mon_adc: HistoryBuffer::new(),
            mon_dac: 0.0,
            mon_dac_adc: HistoryBuffer::new(),
        }
    }

    /// Programmed setpoint.
    pub fn set(&self) -> f32 {
        self.set
    }

    pub fn limit(&self) -> f32 {
        self.limit
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn def(&self) -> f32 {
        self.def
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    /// Default encoder step.
    pub fn step(&self) -> f32 {
        self.step
    }

    /// Averaged measured value.
    pub fn mon(&self) -> f32 {
        self.mon
    }

    /// Latest sample without averaging.
    pub fn mon_last(&self) -> f32 {
        self.mon_last
    }

    /// Has at least one sample arrived since the last reset?
    pub fn is_measured(&self) -> bool {
        self.mon_measured
    }

    /// DAC output read back through the ADC.
    pub fn mon_dac(&self) -> f32 {
        self.mon_dac
    }

    /// Average of the raw ADC codes behind [`Value::mon`].
    pub fn adc_average(&self) -> Option<f32> {
        average(self.mon_adc.as_slice())
    }

    /// Clamp `value` into `[min, limit]`.
    pub fn clamp_to_limit(&self, value: f32) -> f32 {
        value.max(self.min).min(self.limit)
    }

    pub(crate) fn add_mon_sample(&mut self, code: i16, transform: &CalibrationTransform) {
        let raw = code as f32;
        self.mon_adc.write(raw);
        self.mon_last = transform.adc_to_physical(raw);
        self.mon = self
            .adc_average()
            .map_or(self.mon_last, |avg| transform.adc_to_physical(avg));
        self.mon_measured = true;
    }

    pub(crate) fn add_mon_dac_sample(&mut self, code: i16, transform: &CalibrationTransform) {
        self.mon_dac_adc.write(code as f32);
        if let Some(avg) = average(self.mon_dac_adc.as_slice()) {
            self.mon_dac = transform.adc_to_physical(avg);
        }
    }

    /// Forget all samples, e.g. after the transform changed.
    pub(crate) fn reset_mon_values(&mut self) {
        self.mon = 0.0;
        self.mon_last = 0.0;
        self.mon_measured = false;
        self.mon_adc.clear();
        self.mon_dac = 0.0;
        self.mon_dac_adc.clear();
    }
}

fn average(samples: &[f32]) -> Option<f32> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f32>() / samples.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_value_starts_at_default_with_full_limit() {
        let value = Value::new(0.0, 1.0, 40.0, 0.01);
        assert_eq!(value.set(), 1.0);
        assert_eq!(value.limit(), 40.0);
        assert!(!value.is_measured());
        assert_eq!(value.adc_average(), None);
    }

    #[test]
    fn monitored_value_is_a_moving_average() {
        let transform = CalibrationTransform::factory(32767.0);
        let mut value = Value::new(0.0, 0.0, 40.0, 0.01);
        value.add_mon_sample(100, &transform);
        value.add_mon_sample(300, &transform);
        assert_eq!(value.mon_last(), 300.0);
        assert_eq!(value.mon(), 200.0);

        for _ in 0..NUM_ADC_AVERAGING_VALUES {
            value.add_mon_sample(1000, &transform);
        }
        // Old samples fell out of the window.
        assert_eq!(value.mon(), 1000.0);

        value.reset_mon_values();
        assert!(!value.is_measured());
        assert_eq!(value.mon(), 0.0);
    }

    #[test]
    fn clamp_respects_min_and_limit() {
        let mut value = Value::new(1.0, 1.0, 40.0, 0.01);
        value.limit = 20.0;
        assert_eq!(value.clamp_to_limit(0.0), 1.0);
        assert_eq!(value.clamp_to_limit(30.0), 20.0);
        assert_eq!(value.clamp_to_limit(12.5), 12.5);
    }
}
