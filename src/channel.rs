//! One physical output channel.
//!
//! A [`Channel`] owns the setpoints and monitored values of its voltage and
//! current axes, the protection state, the calibration data and the image of
//! its IO expander. It is driven by three inputs:
//!
//! - commands (setters, output enable, ...) coming from the dispatcher,
//! - ADC codes tagged with their selector, queued with [`Channel::post_adc_data`],
//! - [`Channel::tick`], which drains the queue and advances everything that is
//!   time based (output settling, down-programmer, low ripple, auto range,
//!   protection timers, on-time).

use heapless::Deque;
use log::{debug, info, trace, warn};
use strum::IntoEnumIterator;

use crate::{
    board::{ChannelParams, ERR_MAX_CURRENT, Features},
    calibration::{
        CALIBRATION_REMARK_MAX_LENGTH, CalibratedAxis, CalibrationAccess, CalibrationAxis,
        CalibrationConfig, CalibrationTable, CalibrationTransform,
    },
    error::{CalibrationError, Error, HardwareFault, Result},
    event::{Event, push_event},
    hal::{AdcSelector, ChannelHardware, DacTarget},
    history::History,
    ontime::OnTimeCounter,
    protection::{ChannelProtectionConfig, ProtectionConfig, ProtectionValue, TemperatureSensor},
    registers::{IoInputs, IoOutputs},
    types::{
        CurrentRange, CurrentRangeSelectionMode, Duration, Instant, MaxCurrentLimitCause,
        OutputState, ProtectionKind, RegulationMode, State, TriggerMode, TriggerOnListStop,
        elapsed,
    },
    value::Value,
};

/// Time from switching the output on until it counts as settled.
pub const OUTPUT_SETTLE_TIME: Duration = Duration::millis(10);

/// The down-programmer stays engaged this long after the output is switched on.
pub const DP_OFF_DELAY: Duration = Duration::millis(100);

/// Output must be settled this long before low ripple mode may be used.
pub const LOW_RIPPLE_SETTLE_TIME: Duration = Duration::millis(500);

/// Capacity of the raw ADC sample queue.
pub const ADC_INBOX_SIZE: usize = 16;

/// Number of history samples the auto range logic looks at.
pub const AUTO_RANGE_WINDOW: usize = 4;

// Switch down when every recent sample is below this share of the low range.
const AUTO_RANGE_DOWN_RATIO: f32 = 0.9;
// Switch up when the latest sample reaches this share of the low range.
const AUTO_RANGE_UP_RATIO: f32 = 0.98;

const POWER_TOLERANCE: f32 = 1e-4;

const CHANNEL_EVENT_QUEUE_SIZE: usize = 8;

/// Outcome of the last hardware self-test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TestResult {
    #[default]
    Unknown,
    Passed,
    Failed(HardwareFault),
}

/// Settings read by the trigger and list engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerSettings {
    pub voltage_mode: TriggerMode,
    pub current_mode: TriggerMode,
    /// Output state applied when the trigger fires.
    pub output_state: bool,
    pub on_list_stop: TriggerOnListStop,
    pub voltage: f32,
    pub current: f32,
}

impl TriggerSettings {
    fn defaults(params: &ChannelParams) -> Self {
        Self {
            voltage_mode: TriggerMode::Fixed,
            current_mode: TriggerMode::Fixed,
            output_state: true,
            on_list_stop: TriggerOnListStop::OutputOff,
            voltage: params.u_def,
            current: params.i_def,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Output {
    Disabled,
    Enabling { since: Instant },
    Enabled { since: Instant },
}

pub struct Channel<H: ChannelHardware> {
    /// One based channel number.
    index: u8,
    params: ChannelParams,
    hw: H,
    io: IoOutputs,
    now: Instant,

    u: Value,
    i: Value,
    p_limit: f32,
    u_before_balancing: Option<f32>,
    i_before_balancing: Option<f32>,

    prot_conf: ChannelProtectionConfig,
    ovp: ProtectionValue,
    ocp: ProtectionValue,
    opp: ProtectionValue,
    temperature: TemperatureSensor,

    voltage_cal: Option<CalibratedAxis>,
    current_cal: [Option<CalibratedAxis>; 2],
    cal_date: heapless::String<8>,
    cal_remark: heapless::String<CALIBRATION_REMARK_MAX_LENGTH>,
    cal_enabled: bool,

    output: Output,
    dp_off_at: Option<Instant>,
    saved_output_enabled: bool,
    regulation: RegulationMode,
    power_good: bool,
    test_result: TestResult,
    remote_polarity_reversed: bool,
    lripple_auto: bool,

    trigger: TriggerSettings,

    range: CurrentRange,
    range_mode: CurrentRangeSelectionMode,
    auto_range: bool,
    range_switched_at: u32,
    max_current_limit_cause: MaxCurrentLimitCause,

    adc_selector: AdcSelector,
    mon_dac_pending: bool,
    adc_inbox: Deque<(AdcSelector, i16), ADC_INBOX_SIZE>,
    history: History,
    on_time: OnTimeCounter,
    events: Deque<Event, CHANNEL_EVENT_QUEUE_SIZE>,
}

impl<H: ChannelHardware> Channel<H> {
    /// Build a channel in its default state. Nothing is written to the
    /// hardware until [`Channel::init`].
    pub fn new(index: u8, params: ChannelParams, hardware: H) -> Self {
        let mut channel = Self {
            index,
            params,
            hw: hardware,
            io: IoOutputs::new(),
            now: Instant::from_ticks(0),
            u: voltage_value(&params),
            i: current_value(&params),
            p_limit: params.ptot,
            u_before_balancing: None,
            i_before_balancing: None,
            prot_conf: ChannelProtectionConfig::defaults(&params),
            ovp: ProtectionValue::default(),
            ocp: ProtectionValue::default(),
            opp: ProtectionValue::default(),
            temperature: TemperatureSensor::default(),
            voltage_cal: None,
            current_cal: [None; 2],
            cal_date: heapless::String::new(),
            cal_remark: heapless::String::new(),
            cal_enabled: false,
            output: Output::Disabled,
            dp_off_at: None,
            saved_output_enabled: false,
            regulation: RegulationMode::Unregulated,
            power_good: true,
            test_result: TestResult::Unknown,
            remote_polarity_reversed: false,
            lripple_auto: false,
            trigger: TriggerSettings::defaults(&params),
            range: CurrentRange::High,
            range_mode: CurrentRangeSelectionMode::UseBoth,
            auto_range: false,
            range_switched_at: 0,
            max_current_limit_cause: MaxCurrentLimitCause::None,
            adc_selector: AdcSelector::UMon,
            mon_dac_pending: false,
            adc_inbox: Deque::new(),
            history: History::default(),
            on_time: OnTimeCounter::default(),
            events: Deque::new(),
        };
        channel.io = channel.idle_io();
        channel.range = channel.desired_current_range();
        channel.io.set_current_range_low(channel.range == CurrentRange::Low);
        channel
    }

    /// One based channel number.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Board constants the channel was built from.
    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    /// Features of the channel board.
    pub fn features(&self) -> Features {
        self.params.features
    }

    /// Converters and IO expander of the channel.
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Mutable access to the hardware, e.g. for a driver feeding results.
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Last IO expander image written.
    pub fn io_outputs(&self) -> IoOutputs {
        self.io
    }

    /// Timestamp of the last tick.
    pub fn now(&self) -> Instant {
        self.now
    }

    fn idle_io(&self) -> IoOutputs {
        IoOutputs::new().with_down_programmer(self.params.features.down_programmer())
    }

    fn write_io(&mut self) {
        self.hw.write_io(self.io);
    }

    fn event(&mut self, event: Event) {
        push_event(&mut self.events, event);
    }

    /// Next event raised by this channel.
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Health

    /// Self-test the hardware, then bring it to the current state and start sampling.
    pub fn init(&mut self) -> Result<()> {
        self.test()?;
        self.update();
        self.hw.start_adc(self.adc_selector);
        Ok(())
    }

    /// Run the hardware self-test. A failure leaves the channel not OK until a test passes.
    pub fn test(&mut self) -> Result<()> {
        let result = self.hw.self_test().and_then(|()| {
            if self.power_good {
                Ok(())
            } else {
                Err(HardwareFault::PowerGood)
            }
        });
        match result {
            Ok(()) => {
                self.test_result = TestResult::Passed;
                Ok(())
            }
            Err(fault) => {
                self.fail(fault);
                Err(fault.into())
            }
        }
    }

    fn fail(&mut self, fault: HardwareFault) {
        warn!("CH{}: {}", self.index, fault);
        self.test_result = TestResult::Failed(fault);
        if self.is_output_enabled() {
            self.do_output_enable(false);
        }
        self.event(Event::ChannelFault {
            channel: self.index,
            fault,
        });
    }

    /// Outcome of the last self-test.
    pub fn test_result(&self) -> TestResult {
        self.test_result
    }

    /// Power good signal of the board.
    pub fn is_power_ok(&self) -> bool {
        self.power_good
    }

    /// Self-test passed and power is good.
    pub fn is_ok(&self) -> bool {
        self.power_good && self.test_result == TestResult::Passed
    }

    /// Write the whole state to the hardware again, e.g. after recovering from a fault.
    pub fn update(&mut self) {
        self.write_io();
        self.write_voltage_dac();
        self.write_current_dac();
    }

    /// Back to factory defaults. Calibration, history and on-time are kept.
    pub fn reset(&mut self) {
        if self.is_output_enabled() {
            self.do_output_enable(false);
        }
        self.u = voltage_value(&self.params);
        self.i = current_value(&self.params);
        self.p_limit = self.params.ptot;
        self.u_before_balancing = None;
        self.i_before_balancing = None;
        self.prot_conf = ChannelProtectionConfig::defaults(&self.params);
        self.clear_protection(true);
        self.saved_output_enabled = false;
        self.lripple_auto = false;
        self.trigger = TriggerSettings::defaults(&self.params);
        self.range_mode = CurrentRangeSelectionMode::UseBoth;
        self.auto_range = false;
        self.max_current_limit_cause = MaxCurrentLimitCause::None;
        self.io = self.idle_io();
        self.range = self.desired_current_range();
        self.io.set_current_range_low(self.range == CurrentRange::Low);
        self.update();
    }

    /// New state of the IO expander input port.
    pub fn event_gpio(&mut self, inputs: IoInputs) {
        let power_good = inputs.power_good();
        if self.power_good && !power_good {
            self.power_good = false;
            self.fail(HardwareFault::PowerGood);
        }
        self.power_good = power_good;
        self.remote_polarity_reversed =
            self.params.features.remote_polarity() && inputs.remote_polarity_reversed();
        self.regulation = if self.is_output_enabled() {
            RegulationMode::from_conditions(inputs.cv_active(), inputs.cc_active())
        } else {
            RegulationMode::Unregulated
        };
    }

    /// Sense leads connected the wrong way round.
    pub fn is_remote_polarity_reversed(&self) -> bool {
        self.remote_polarity_reversed
    }

    // ------------------------------------------------------------------
    // ADC

    /// Queue a conversion result, tagged with the selector the conversion was
    /// started with, for the next tick. Hands the sample back when the queue is full.
    pub fn post_adc_data(
        &mut self,
        selector: AdcSelector,
        code: i16,
    ) -> core::result::Result<(), (AdcSelector, i16)> {
        self.adc_inbox.push_back((selector, code))
    }

    /// Handle a conversion result right away. The sample goes to the axis named
    /// by `selector`, a lost sample never shifts the following ones.
    pub fn event_adc_data(&mut self, selector: AdcSelector, code: i16, start_again: bool) {
        let next = match selector {
            AdcSelector::UMon => {
                let transform = self.voltage_transform();
                self.u.add_mon_sample(code, &transform);
                AdcSelector::IMon
            }
            AdcSelector::IMon => {
                let transform = self.current_transform();
                self.i.add_mon_sample(code, &transform);
                self.history.push(self.u.mon(), self.i.mon());
                if self.mon_dac_pending {
                    AdcSelector::UMonDac
                } else {
                    AdcSelector::UMon
                }
            }
            AdcSelector::UMonDac => {
                let transform = self.voltage_transform();
                self.u.add_mon_dac_sample(code, &transform);
                AdcSelector::IMonDac
            }
            AdcSelector::IMonDac => {
                let transform = self.current_transform();
                self.i.add_mon_dac_sample(code, &transform);
                self.mon_dac_pending = false;
                AdcSelector::UMon
            }
        };
        trace!("CH{}: {:?} = {}", self.index, selector, code);
        self.adc_selector = next;
        if start_again {
            self.hw.start_adc(next);
        }
    }

    /// Read back both DAC outputs after the next measurement cycle.
    pub fn adc_read_mon_dac(&mut self) {
        self.mon_dac_pending = true;
    }

    /// Selector of the conversion in progress.
    pub fn adc_selector(&self) -> AdcSelector {
        self.adc_selector
    }

    /// Past monitored samples.
    pub fn history(&self) -> &History {
        &self.history
    }

    pub(crate) fn reset_history(&mut self) {
        self.history.reset();
        self.range_switched_at = 0;
    }

    // ------------------------------------------------------------------
    // Tick

    /// Advance the channel to `now`.
    pub fn tick(&mut self, now: Instant) {
        self.now = now;
        while let Some((selector, code)) = self.adc_inbox.pop_front() {
            self.event_adc_data(selector, code, true);
        }
        self.output_tick();
        self.low_ripple_check();
        self.auto_select_current_range();
        self.protection_check();
        self.on_time.tick(now);
    }

    fn output_tick(&mut self) {
        if let Some(at) = self.dp_off_at {
            if self.now >= at {
                self.dp_off_at = None;
                self.io.set_down_programmer(false);
                self.write_io();
                debug!("CH{}: down-programmer off", self.index);
            }
        }
        if let Output::Enabling { since } = self.output {
            if self.dp_off_at.is_none() && elapsed(since, self.now) >= OUTPUT_SETTLE_TIME {
                self.output = Output::Enabled { since: self.now };
            }
        }
    }

    // ------------------------------------------------------------------
    // Output

    /// Output switched on, settled or not.
    pub fn is_output_enabled(&self) -> bool {
        !matches!(self.output, Output::Disabled)
    }

    /// Output state as shown to the user.
    pub fn output_state(&self) -> OutputState {
        match self.output {
            Output::Disabled if self.is_tripped() => OutputState::Tripped,
            Output::Disabled => OutputState::Disabled,
            Output::Enabling { .. } => OutputState::Enabling,
            Output::Enabled { .. } => OutputState::Enabled,
        }
    }

    /// Check the output may be switched on.
    pub fn can_enable_output(&self) -> Result<()> {
        if !self.is_ok() {
            return Err(Error::ChannelNotOk(self.index));
        }
        if let Some(kind) = self.tripped_protection() {
            return Err(Error::ProtectionTripped(kind));
        }
        Ok(())
    }

    /// Switch the output. Enabling fails on a channel that is not OK or has tripped.
    pub fn output_enable(&mut self, enable: impl Into<State>) -> Result<()> {
        let enable: bool = enable.into().into();
        if enable == self.is_output_enabled() {
            return Ok(());
        }
        if enable {
            self.can_enable_output()?;
        }
        self.do_output_enable(enable);
        Ok(())
    }

    pub(crate) fn force_output_off(&mut self) {
        if self.is_output_enabled() {
            self.do_output_enable(false);
        }
    }

    fn do_output_enable(&mut self, enable: bool) {
        let now = self.now;
        if enable {
            if self.params.features.down_programmer() {
                self.io.set_down_programmer(true);
                self.dp_off_at = Some(now + DP_OFF_DELAY);
            }
            self.io.set_output_enable(true);
            self.output = Output::Enabling { since: now };
            self.on_time.start(now);
        } else {
            self.io.set_output_enable(false);
            self.io.set_low_ripple(false);
            self.dp_off_at = None;
            if self.params.features.down_programmer() {
                self.io.set_down_programmer(true);
            }
            self.output = Output::Disabled;
            self.regulation = RegulationMode::Unregulated;
            self.on_time.stop(now);
        }
        self.write_io();
        info!("CH{}: output {}", self.index, if enable { "on" } else { "off" });
    }

    /// Remember the output state and switch it off.
    pub fn save_and_disable_output(&mut self) {
        self.saved_output_enabled = self.is_output_enabled();
        self.force_output_off();
    }

    /// Switch the output back on if it was on when saved.
    pub fn restore_output(&mut self) {
        if core::mem::take(&mut self.saved_output_enabled) && self.can_enable_output().is_ok() {
            self.do_output_enable(true);
        }
    }

    /// Output on-time counter.
    pub fn on_time(&self) -> &OnTimeCounter {
        &self.on_time
    }

    /// Restore the on-time counter from persistent storage.
    pub fn set_on_time(&mut self, counter: OnTimeCounter) {
        self.on_time = counter;
    }

    // ------------------------------------------------------------------
    // Voltage

    /// Voltage setpoint, limits and monitored values.
    pub fn voltage(&self) -> &Value {
        &self.u
    }

    /// Clamp into `[min, limit]`, program the DAC and keep the power limit by
    /// balancing the current.
    pub fn set_voltage(&mut self, value: f32) {
        self.u_before_balancing = None;
        self.do_set_voltage(value);
        self.balance_current();
    }

    fn do_set_voltage(&mut self, value: f32) {
        self.u.set = self.u.clamp_to_limit(value);
        self.write_voltage_dac();
        self.predict_regulation();
    }

    /// Voltage as requested, before power balancing lowered it.
    pub fn u_set_unbalanced(&self) -> f32 {
        self.u_before_balancing.unwrap_or(self.u.set)
    }

    /// Voltage is lowered to keep the power limit.
    pub fn is_voltage_balanced(&self) -> bool {
        self.u_before_balancing.is_some()
    }

    /// Set the voltage limit, lowering the setpoint when above it.
    pub fn set_voltage_limit(&mut self, limit: f32) {
        self.u.limit = limit.max(self.u.min()).min(self.u.max());
        if let Some(before) = self.u_before_balancing.as_mut() {
            *before = before.min(self.u.limit);
        }
        if self.u.set > self.u.limit {
            self.do_set_voltage(self.u.limit);
        }
        self.rebalance();
    }

    /// Highest voltage limit allowed.
    pub fn voltage_max_limit(&self) -> f32 {
        self.u.max()
    }

    fn voltage_transform(&self) -> CalibrationTransform {
        match &self.voltage_cal {
            Some(cal) if self.cal_enabled => cal.transform,
            _ => CalibrationTransform::factory(self.params.u_max),
        }
    }

    fn write_voltage_dac(&mut self) {
        let code = self.voltage_transform().dac_code(self.u.set);
        self.hw.write_dac(DacTarget::Voltage, code);
    }

    // ------------------------------------------------------------------
    // Current

    /// Current setpoint, limits and monitored values.
    pub fn current(&self) -> &Value {
        &self.i
    }

    /// Clamp into `[min, limit]`, program the DAC and keep the power limit by
    /// balancing the voltage.
    pub fn set_current(&mut self, value: f32) {
        self.i_before_balancing = None;
        self.do_set_current(value);
        self.balance_voltage();
    }

    fn do_set_current(&mut self, value: f32) {
        self.i.set = self.i.clamp_to_limit(value);
        self.select_current_range();
        self.write_current_dac();
        self.predict_regulation();
    }

    /// Current as requested, before power balancing lowered it.
    pub fn i_set_unbalanced(&self) -> f32 {
        self.i_before_balancing.unwrap_or(self.i.set)
    }

    /// Current is lowered to keep the power limit.
    pub fn is_current_balanced(&self) -> bool {
        self.i_before_balancing.is_some()
    }

    /// Set the current limit, lowering the setpoint when above it.
    pub fn set_current_limit(&mut self, limit: f32) {
        self.i.limit = limit.max(self.i.min()).min(self.max_current_limit());
        if let Some(before) = self.i_before_balancing.as_mut() {
            *before = before.min(self.i.limit);
        }
        if self.i.set > self.i.limit {
            self.do_set_current(self.i.limit);
        }
        self.rebalance();
    }

    /// Highest current limit allowed right now.
    pub fn max_current_limit(&self) -> f32 {
        let max = if self.params.has_dual_current_range()
            && self.range_mode == CurrentRangeSelectionMode::AlwaysLow
        {
            self.params.i_low_range_max
        } else {
            self.i.max()
        };
        if self.is_max_current_limited() {
            max.min(ERR_MAX_CURRENT)
        } else {
            max
        }
    }

    /// Current is capped at [`ERR_MAX_CURRENT`].
    pub fn is_max_current_limited(&self) -> bool {
        self.max_current_limit_cause != MaxCurrentLimitCause::None
    }

    /// Why the current is capped.
    pub fn max_current_limit_cause(&self) -> MaxCurrentLimitCause {
        self.max_current_limit_cause
    }

    /// Cap the current at [`ERR_MAX_CURRENT`], e.g. on fan failure.
    pub fn limit_max_current(&mut self, cause: MaxCurrentLimitCause) {
        self.max_current_limit_cause = cause;
        if cause != MaxCurrentLimitCause::None {
            warn!("CH{}: max current limited ({:?})", self.index, cause);
            let max = self.max_current_limit();
            if self.i.limit > max {
                self.set_current_limit(max);
            }
        }
    }

    /// Remove the cap set by [`Channel::limit_max_current`]. The current limit is kept.
    pub fn unlimit_max_current(&mut self) {
        self.max_current_limit_cause = MaxCurrentLimitCause::None;
    }

    fn range_full_scale(&self, range: CurrentRange) -> f32 {
        match range {
            CurrentRange::High => self.params.i_max,
            CurrentRange::Low => self.params.i_low_range_max,
        }
    }

    fn current_transform(&self) -> CalibrationTransform {
        match &self.current_cal[self.range.index()] {
            Some(cal) if self.cal_enabled => cal.transform,
            _ => CalibrationTransform::factory(self.range_full_scale(self.range)),
        }
    }

    fn write_current_dac(&mut self) {
        let code = self.current_transform().dac_code(self.i.set);
        self.hw.write_dac(DacTarget::Current, code);
    }

    // ------------------------------------------------------------------
    // Power and balancing

    /// Power limit kept by balancing voltage against current.
    pub fn power_limit(&self) -> f32 {
        self.p_limit
    }

    /// Total power the channel is rated for.
    pub fn power_max_limit(&self) -> f32 {
        self.params.ptot
    }

    /// Set the power limit, clamped to the channel rating.
    pub fn set_power_limit(&mut self, limit: f32) {
        self.p_limit = limit.max(0.0).min(self.params.ptot);
        self.rebalance();
    }

    fn fits_power(&self, u: f32, i: f32) -> bool {
        u * i <= self.p_limit + POWER_TOLERANCE
    }

    // A balanced axis keeps its requested value in the shadow and is restored
    // as soon as the requested value fits the power limit again.
    fn balance_voltage(&mut self) {
        let wanted = self.u_set_unbalanced();
        if self.fits_power(wanted, self.i.set) {
            if let Some(before) = self.u_before_balancing.take() {
                debug!("CH{}: voltage restored to {}", self.index, before);
                self.do_set_voltage(before);
            }
        } else {
            if self.u_before_balancing.is_none() {
                self.u_before_balancing = Some(self.u.set);
            }
            let allowed = self.p_limit / self.i.set;
            debug!("CH{}: voltage balanced to {}", self.index, allowed);
            self.do_set_voltage(allowed);
        }
    }

    fn balance_current(&mut self) {
        let wanted = self.i_set_unbalanced();
        if self.fits_power(self.u.set, wanted) {
            if let Some(before) = self.i_before_balancing.take() {
                debug!("CH{}: current restored to {}", self.index, before);
                self.do_set_current(before);
            }
        } else {
            if self.i_before_balancing.is_none() {
                self.i_before_balancing = Some(self.i.set);
            }
            let allowed = self.p_limit / self.u.set;
            debug!("CH{}: current balanced to {}", self.index, allowed);
            self.do_set_current(allowed);
        }
    }

    fn rebalance(&mut self) {
        if self.u_before_balancing.is_some() {
            self.balance_voltage();
        } else {
            self.balance_current();
        }
    }

    // ------------------------------------------------------------------
    // Regulation

    /// Loop in control of the output.
    pub fn regulation_mode(&self) -> RegulationMode {
        self.regulation
    }

    /// Voltage loop in control.
    pub fn is_cv_mode(&self) -> bool {
        self.regulation == RegulationMode::Cv
    }

    /// Current loop in control.
    pub fn is_cc_mode(&self) -> bool {
        self.regulation == RegulationMode::Cc
    }

    /// Guess the regulation mode for new setpoints from the present load resistance.
    fn predict_regulation(&mut self) {
        if !self.is_output_enabled() {
            self.regulation = RegulationMode::Unregulated;
            return;
        }
        if !(self.u.is_measured() && self.i.is_measured()) {
            return;
        }
        let (u, i) = (self.u.mon(), self.i.mon());
        self.regulation = if i <= 0.0 {
            RegulationMode::Cv
        } else if u <= 0.0 {
            RegulationMode::Cc
        } else {
            let i_at_set_voltage = self.u.set * i / u;
            RegulationMode::from_conditions(
                i_at_set_voltage < self.i.set,
                i_at_set_voltage > self.i.set,
            )
        };
    }

    // ------------------------------------------------------------------
    // Protection

    /// Enable state, level and delay of every protection function.
    pub fn protection_config(&self) -> &ChannelProtectionConfig {
        &self.prot_conf
    }

    /// Replace the whole protection configuration, e.g. when loading a profile.
    pub fn set_protection_config(&mut self, config: ChannelProtectionConfig) {
        self.prot_conf = config;
    }

    /// Replace the configuration of one protection function.
    pub fn set_protection(&mut self, kind: ProtectionKind, config: ProtectionConfig) {
        *self.prot_conf.get_mut(kind) = config;
    }

    /// Switch one protection function on or off.
    pub fn set_protection_state(&mut self, kind: ProtectionKind, enabled: bool) {
        self.prot_conf.get_mut(kind).enabled = enabled;
    }

    /// Set the trip level of one protection function.
    pub fn set_protection_level(&mut self, kind: ProtectionKind, level: f32) {
        self.prot_conf.get_mut(kind).level = level;
    }

    /// Set the trip delay of one protection function, in seconds.
    pub fn set_protection_delay(&mut self, kind: ProtectionKind, delay: f32) {
        self.prot_conf.get_mut(kind).delay = delay;
    }

    /// Runtime state of one protection function.
    pub fn protection(&self, kind: ProtectionKind) -> &ProtectionValue {
        match kind {
            ProtectionKind::Ovp => &self.ovp,
            ProtectionKind::Ocp => &self.ocp,
            ProtectionKind::Opp => &self.opp,
            ProtectionKind::Otp => self.temperature.protection(),
        }
    }

    /// Any protection function tripped.
    pub fn is_tripped(&self) -> bool {
        self.tripped_protection().is_some()
    }

    /// First protection found tripped.
    pub fn tripped_protection(&self) -> Option<ProtectionKind> {
        ProtectionKind::iter().find(|kind| self.protection(*kind).is_tripped())
    }

    /// Heatsink temperature and OTP state.
    pub fn temperature(&self) -> &TemperatureSensor {
        &self.temperature
    }

    /// New reading of the heatsink sensor, evaluated on the next tick.
    pub fn event_temperature(&mut self, celsius: f32) {
        self.temperature.update(celsius);
    }

    fn protection_check(&mut self) {
        let now = self.now;
        let conf = self.prot_conf;
        let output_on = self.is_output_enabled();

        let ovp = output_on && conf.ovp.enabled && self.u.is_measured() && self.u.mon() > conf.ovp.level;
        if self.ovp.evaluate(ovp, conf.ovp.delay_duration(), now) {
            self.protection_enter(ProtectionKind::Ovp);
        }

        let ocp = output_on && conf.ocp.enabled && self.is_cc_mode();
        if self.ocp.evaluate(ocp, conf.ocp.delay_duration(), now) {
            self.protection_enter(ProtectionKind::Ocp);
        }

        let opp = output_on
            && conf.opp.enabled
            && self.u.is_measured()
            && self.i.is_measured()
            && self.u.mon() * self.i.mon() > conf.opp.level;
        if self.opp.evaluate(opp, conf.opp.delay_duration(), now) {
            self.protection_enter(ProtectionKind::Opp);
        }

        if self.temperature.check(&conf.otp, now) {
            self.protection_enter(ProtectionKind::Otp);
        }
    }

    fn protection_enter(&mut self, kind: ProtectionKind) {
        let name: &'static str = kind.into();
        warn!("CH{}: {} tripped", self.index, name);
        self.force_output_off();
        self.event(Event::ProtectionTripped {
            channel: self.index,
            kind,
        });
    }

    /// Clear OVP, OCP and OPP, and OTP when `clear_otp` is set. The output stays off.
    pub fn clear_protection(&mut self, clear_otp: bool) {
        self.ovp.clear();
        self.ocp.clear();
        self.opp.clear();
        if clear_otp {
            self.temperature.state.clear();
        }
    }

    /// Clear the runtime state and switch every protection function off.
    pub fn disable_protection(&mut self) {
        self.clear_protection(true);
        for kind in ProtectionKind::iter() {
            self.prot_conf.get_mut(kind).enabled = false;
        }
    }

    // ------------------------------------------------------------------
    // Remote sensing, remote programming, low ripple

    /// Voltage is sensed at the load.
    pub fn is_remote_sensing_enabled(&self) -> bool {
        self.io.remote_sense()
    }

    /// Switch remote sensing of the output voltage.
    pub fn remote_sensing_enable(&mut self, enable: bool) {
        if enable != self.io.remote_sense() {
            self.io.set_remote_sense(enable);
            self.write_io();
            debug!("CH{}: remote sensing {}", self.index, enable);
        }
    }

    /// Setpoints come from the analog programming input.
    pub fn is_remote_programming_enabled(&self) -> bool {
        self.io.remote_programming()
    }

    /// Switch remote programming, fails on boards without it.
    pub fn remote_programming_enable(&mut self, enable: bool) -> Result<()> {
        if !self.params.features.remote_programming() {
            return if enable { Err(Error::NotSupported) } else { Ok(()) };
        }
        if enable != self.io.remote_programming() {
            self.io.set_remote_programming(enable);
            self.write_io();
            debug!("CH{}: remote programming {}", self.index, enable);
        }
        Ok(())
    }

    /// Pre-regulator bypassed.
    pub fn is_low_ripple_enabled(&self) -> bool {
        self.io.low_ripple()
    }

    /// Low ripple mode follows the operating point.
    pub fn is_low_ripple_auto_enabled(&self) -> bool {
        self.lripple_auto
    }

    /// Can the pre-regulator be bypassed at the present operating point?
    pub fn is_low_ripple_allowed(&self) -> bool {
        let settled = match self.output {
            Output::Enabled { since } => elapsed(since, self.now) >= LOW_RIPPLE_SETTLE_TIME,
            _ => false,
        };
        let p = &self.params;
        settled
            && p.features.low_ripple()
            && self.i.mon() <= p.soa_preg_curr
            && (p.soa_vin - self.u.mon()) * self.i.mon() <= p.soa_postreg_ptot
    }

    /// Bypass the pre-regulator. Only allowed while [`Channel::is_low_ripple_allowed`].
    pub fn low_ripple_enable(&mut self, enable: bool) -> Result<()> {
        if !self.params.features.low_ripple() {
            return if enable { Err(Error::NotSupported) } else { Ok(()) };
        }
        if enable && !self.is_low_ripple_allowed() {
            return Err(Error::LowRippleNotAllowed);
        }
        self.do_low_ripple_enable(enable);
        Ok(())
    }

    /// Let the channel switch low ripple mode by itself.
    pub fn low_ripple_auto_enable(&mut self, enable: bool) -> Result<()> {
        if enable && !self.params.features.low_ripple() {
            return Err(Error::NotSupported);
        }
        self.lripple_auto = enable;
        Ok(())
    }

    fn do_low_ripple_enable(&mut self, enable: bool) {
        if enable != self.io.low_ripple() {
            self.io.set_low_ripple(enable);
            self.write_io();
            debug!("CH{}: low ripple {}", self.index, enable);
        }
    }

    fn low_ripple_check(&mut self) {
        let allowed = self.is_low_ripple_allowed();
        if self.io.low_ripple() && !allowed {
            self.do_low_ripple_enable(false);
            if !self.lripple_auto {
                self.event(Event::LowRippleDisabled {
                    channel: self.index,
                });
            }
        } else if self.lripple_auto && allowed && !self.io.low_ripple() {
            self.do_low_ripple_enable(true);
        }
    }

    pub(crate) fn low_ripple_off(&mut self) {
        self.do_low_ripple_enable(false);
    }

    /// Switch remote sensing, remote programming and low ripple off.
    pub(crate) fn disable_remote_modes(&mut self) {
        self.io.set_remote_sense(false);
        self.io.set_remote_programming(false);
        self.io.set_low_ripple(false);
        self.lripple_auto = false;
        self.write_io();
    }

    // ------------------------------------------------------------------
    // Current range

    /// Current range in use.
    pub fn current_range(&self) -> CurrentRange {
        self.range
    }

    /// How the current range is chosen.
    pub fn current_range_selection_mode(&self) -> CurrentRangeSelectionMode {
        self.range_mode
    }

    /// Choose how the current range is selected. The current limit follows the range.
    pub fn set_current_range_selection_mode(&mut self, mode: CurrentRangeSelectionMode) {
        self.range_mode = mode;
        let max = self.max_current_limit();
        if self.i.limit > max {
            self.set_current_limit(max);
        }
        self.select_current_range();
    }

    /// Current range follows the measured current.
    pub fn is_auto_select_current_range_enabled(&self) -> bool {
        self.auto_range
    }

    /// Switch the current range from the measured current.
    pub fn enable_auto_select_current_range(&mut self, enable: bool) {
        self.auto_range = enable;
        self.select_current_range();
    }

    /// Board has a low range and the selection mode allows it.
    pub fn is_current_low_range_allowed(&self) -> bool {
        self.params.has_dual_current_range() && self.range_mode != CurrentRangeSelectionMode::AlwaysHigh
    }

    fn desired_current_range(&self) -> CurrentRange {
        if !self.params.has_dual_current_range() {
            return CurrentRange::High;
        }
        match self.range_mode {
            CurrentRangeSelectionMode::AlwaysHigh => CurrentRange::High,
            CurrentRangeSelectionMode::AlwaysLow => CurrentRange::Low,
            CurrentRangeSelectionMode::UseBoth if self.auto_range => self.range,
            CurrentRangeSelectionMode::UseBoth if self.i.set <= self.params.i_low_range_max => {
                CurrentRange::Low
            }
            CurrentRangeSelectionMode::UseBoth => CurrentRange::High,
        }
    }

    fn select_current_range(&mut self) {
        let range = self.desired_current_range();
        if range != self.range {
            self.do_set_current_range(range);
        }
    }

    fn do_set_current_range(&mut self, range: CurrentRange) {
        self.range = range;
        self.io.set_current_range_low(range == CurrentRange::Low);
        self.write_io();
        self.write_current_dac();
        self.i.reset_mon_values();
        self.range_switched_at = self.history.position();
        debug!("CH{}: current range {:?}", self.index, range);
        self.event(Event::CurrentRangeChanged {
            channel: self.index,
            range,
        });
    }

    fn auto_select_current_range(&mut self) {
        if !self.auto_range
            || !self.params.has_dual_current_range()
            || self.range_mode != CurrentRangeSelectionMode::UseBoth
            || !self.is_output_enabled()
        {
            return;
        }
        let fresh = self.history.position().wrapping_sub(self.range_switched_at);
        if (fresh as usize) < AUTO_RANGE_WINDOW {
            return;
        }
        let low_max = self.params.i_low_range_max;
        let next = match self.range {
            CurrentRange::High => {
                let all_low = self
                    .history
                    .recent_currents(AUTO_RANGE_WINDOW)
                    .all(|i| i < low_max * AUTO_RANGE_DOWN_RATIO);
                all_low.then_some(CurrentRange::Low)
            }
            CurrentRange::Low => {
                let near_full_scale = self
                    .history
                    .recent_currents(1)
                    .any(|i| i >= low_max * AUTO_RANGE_UP_RATIO);
                near_full_scale.then_some(CurrentRange::High)
            }
        };
        if let Some(range) = next {
            self.do_set_current_range(range);
        }
    }

    // ------------------------------------------------------------------
    // Trigger

    /// Settings for the trigger and list engine.
    pub fn trigger(&self) -> &TriggerSettings {
        &self.trigger
    }

    /// Mutable trigger settings.
    pub fn trigger_mut(&mut self) -> &mut TriggerSettings {
        &mut self.trigger
    }

    /// Fixed modes, output on when triggered, output off when a list stops.
    pub(crate) fn reset_trigger(&mut self) {
        self.trigger.voltage_mode = TriggerMode::Fixed;
        self.trigger.current_mode = TriggerMode::Fixed;
        self.trigger.output_state = true;
        self.trigger.on_list_stop = TriggerOnListStop::OutputOff;
    }

    // ------------------------------------------------------------------
    // Calibration

    /// Load tables handed over by the persistence layer. On a bad table all
    /// calibration is dropped and the factory mapping is used.
    pub fn load_calibration(&mut self, config: &CalibrationConfig) -> Result<()> {
        match load_axes(config) {
            Ok((voltage, current)) => {
                self.voltage_cal = voltage;
                self.current_cal = current;
                self.cal_date = config.date.clone();
                self.cal_remark = config.remark.clone();
                self.cal_enabled = self.is_calibration_exists();
                self.calibration_changed();
                Ok(())
            }
            Err(err) => {
                warn!("CH{}: calibration rejected, {}", self.index, err);
                self.voltage_cal = None;
                self.current_cal = [None; 2];
                self.cal_date.clear();
                self.cal_remark.clear();
                self.cal_enabled = false;
                self.calibration_changed();
                Err(err.into())
            }
        }
    }

    /// Snapshot for the persistence layer.
    pub fn calibration_config(&self) -> CalibrationConfig {
        CalibrationConfig {
            voltage: self.voltage_cal.map(|cal| cal.table),
            current: self.current_cal.map(|cal| cal.map(|cal| cal.table)),
            date: self.cal_date.clone(),
            remark: self.cal_remark.clone(),
        }
    }

    /// Set the date and remark stored with the calibration.
    pub fn set_calibration_info(&mut self, date: &str, remark: &str) -> Result<()> {
        let mut new_date = heapless::String::new();
        new_date.push_str(date).map_err(|_| Error::OutOfRange)?;
        let mut new_remark = heapless::String::new();
        new_remark.push_str(remark).map_err(|_| Error::OutOfRange)?;
        self.cal_date = new_date;
        self.cal_remark = new_remark;
        Ok(())
    }

    /// At least one axis has a calibration table.
    pub fn is_calibration_exists(&self) -> bool {
        self.voltage_cal.is_some() || self.current_cal.iter().any(Option::is_some)
    }

    /// Calibration tables are used for the conversions.
    pub fn is_calibration_enabled(&self) -> bool {
        self.cal_enabled
    }

    /// Use the calibration tables, or go back to the factory mapping.
    pub fn calibration_enable(&mut self, enable: bool) -> Result<()> {
        if enable && !self.is_calibration_exists() {
            return Err(CalibrationError::NotCalibrated.into());
        }
        if enable != self.cal_enabled {
            self.cal_enabled = enable;
            self.calibration_changed();
        }
        Ok(())
    }

    /// Calibration of the voltage axis.
    pub fn voltage_calibration(&self) -> Option<&CalibratedAxis> {
        self.voltage_cal.as_ref()
    }

    /// Calibration of one current range.
    pub fn current_calibration(&self, range: CurrentRange) -> Option<&CalibratedAxis> {
        self.current_cal[range.index()].as_ref()
    }

    fn calibration_changed(&mut self) {
        self.u.reset_mon_values();
        self.i.reset_mon_values();
        self.write_voltage_dac();
        self.write_current_dac();
    }
}

impl<H: ChannelHardware> CalibrationAccess for Channel<H> {
    fn calibration_levels(&self, axis: CalibrationAxis) -> [f32; 3] {
        match axis {
            CalibrationAxis::Voltage => self.params.u_cal_val,
            CalibrationAxis::Current(CurrentRange::High) => self.params.i_cal_val,
            CalibrationAxis::Current(CurrentRange::Low) => {
                let scale = self.params.i_low_range_max / self.params.i_max;
                self.params.i_cal_val.map(|level| level * scale)
            }
        }
    }

    fn factory_transform(&self, axis: CalibrationAxis) -> CalibrationTransform {
        match axis {
            CalibrationAxis::Voltage => CalibrationTransform::factory(self.params.u_max),
            CalibrationAxis::Current(range) => CalibrationTransform::factory(self.range_full_scale(range)),
        }
    }

    fn write_calibration_dac(&mut self, axis: CalibrationAxis, code: u16) {
        match axis {
            CalibrationAxis::Voltage => {
                self.hw.write_dac(DacTarget::Voltage, code);
                self.u.reset_mon_values();
            }
            CalibrationAxis::Current(range) => {
                if range != self.range {
                    self.do_set_current_range(range);
                }
                self.hw.write_dac(DacTarget::Current, code);
                self.i.reset_mon_values();
            }
        }
    }

    fn calibration_adc_average(&self, axis: CalibrationAxis) -> Option<f32> {
        match axis {
            CalibrationAxis::Voltage => self.u.adc_average(),
            CalibrationAxis::Current(range) if range == self.range => self.i.adc_average(),
            CalibrationAxis::Current(_) => None,
        }
    }

    fn apply_calibration(&mut self, axis: CalibrationAxis, table: CalibrationTable) -> Result<()> {
        let cal = CalibratedAxis::new(table)?;
        match axis {
            CalibrationAxis::Voltage => self.voltage_cal = Some(cal),
            CalibrationAxis::Current(range) => self.current_cal[range.index()] = Some(cal),
        }
        info!("CH{}: {:?} calibration applied", self.index, axis);
        self.cal_enabled = true;
        self.calibration_changed();
        Ok(())
    }
}

fn voltage_value(params: &ChannelParams) -> Value {
    Value::new(params.u_min, params.u_def, params.u_max, params.u_def_step)
}

fn current_value(params: &ChannelParams) -> Value {
    Value::new(params.i_min, params.i_def, params.i_max, params.i_def_step)
}

type LoadedAxes = (Option<CalibratedAxis>, [Option<CalibratedAxis>; 2]);

fn load_axes(config: &CalibrationConfig) -> core::result::Result<LoadedAxes, CalibrationError> {
    let voltage = config.voltage.map(CalibratedAxis::new).transpose()?;
    let high = config.current[CurrentRange::High.index()]
        .map(CalibratedAxis::new)
        .transpose()?;
    let low = config.current[CurrentRange::Low.index()]
        .map(CalibratedAxis::new)
        .transpose()?;
    Ok((voltage, [high, low]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        board::{ADC_MAX, BoardRevision},
        calibration::{CalibrationLevel, CalibrationPoint, Calibrator},
        mock_hw::MockHardware,
    };

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(ms * 1_000)
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    fn channel(revision: BoardRevision) -> Channel<MockHardware> {
        let mut ch = Channel::new(1, revision.params(), MockHardware::new());
        ch.init().unwrap();
        ch
    }

    fn code(value: f32, full_scale: f32) -> i16 {
        (value / full_scale * ADC_MAX as f32 + 0.5) as i16
    }

    /// Queue one voltage and current sample, encoded with the factory mapping.
    fn post(ch: &mut Channel<MockHardware>, u: f32, i: f32) {
        let i_full_scale = match ch.current_range() {
            CurrentRange::High => ch.params().i_max,
            CurrentRange::Low => ch.params().i_low_range_max,
        };
        let u_code = code(u, ch.params().u_max);
        ch.post_adc_data(AdcSelector::UMon, u_code).unwrap();
        ch.post_adc_data(AdcSelector::IMon, code(i, i_full_scale)).unwrap();
    }

    fn assert_ordered(value: &Value) {
        assert!(value.min() <= value.set());
        assert!(value.set() <= value.limit());
        assert!(value.limit() <= value.max());
    }

    #[test]
    fn test_init_writes_idle_state() {
        let ch = channel(BoardRevision::R3B4);
        assert!(ch.is_ok());
        assert_eq!(ch.test_result(), TestResult::Passed);
        let io = ch.hardware().last_io();
        assert!(io.down_programmer());
        assert!(!io.output_enable());
        assert_eq!(ch.hardware().voltage_dac, Some(0));
        assert_eq!(ch.hardware().adc_started, Some(AdcSelector::UMon));
    }

    #[test]
    fn test_failed_self_test_until_retest() {
        let mut ch = Channel::new(2, BoardRevision::R3B4.params(), MockHardware::failing(HardwareFault::Adc));
        assert_eq!(ch.init(), Err(Error::Hardware(HardwareFault::Adc)));
        assert!(!ch.is_ok());
        assert_eq!(ch.output_enable(true), Err(Error::ChannelNotOk(2)));
        assert_eq!(
            ch.pop_event(),
            Some(Event::ChannelFault {
                channel: 2,
                fault: HardwareFault::Adc
            })
        );

        ch.hardware_mut().self_test_fault = None;
        assert!(ch.test().is_ok());
        assert!(ch.is_ok());
        assert!(ch.output_enable(true).is_ok());
    }

    #[test]
    fn test_setpoints_stay_inside_bounds() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_voltage(50.0);
        assert_eq!(ch.voltage().set(), 40.0);
        ch.set_voltage_limit(20.0);
        assert_eq!(ch.voltage().set(), 20.0);
        ch.set_voltage(-5.0);
        assert_eq!(ch.voltage().set(), 0.0);
        ch.set_voltage_limit(100.0);
        assert_eq!(ch.voltage().limit(), 40.0);
        ch.set_current_limit(10.0);
        assert_eq!(ch.current().limit(), 5.0);
        ch.set_current(4.0);
        ch.set_current_limit(1.0);
        assert_eq!(ch.current().set(), 1.0);
        assert_ordered(ch.voltage());
        assert_ordered(ch.current());
    }

    #[test]
    fn test_output_sequence_with_down_programmer() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.output_enable(true).unwrap();
        let io = ch.hardware().last_io();
        assert!(io.output_enable());
        assert!(io.down_programmer());
        assert_eq!(ch.output_state(), OutputState::Enabling);

        ch.tick(at(50));
        assert_eq!(ch.output_state(), OutputState::Enabling);
        assert!(ch.hardware().last_io().down_programmer());

        ch.tick(at(100));
        assert_eq!(ch.output_state(), OutputState::Enabled);
        assert!(!ch.hardware().last_io().down_programmer());

        ch.output_enable(false).unwrap();
        let io = ch.hardware().last_io();
        assert!(!io.output_enable());
        assert!(io.down_programmer());
        assert_eq!(ch.output_state(), OutputState::Disabled);

        // Idempotent, nothing written again.
        let writes = ch.hardware().io_writes;
        ch.output_enable(false).unwrap();
        assert_eq!(ch.hardware().io_writes, writes);
    }

    #[test]
    fn test_disable_cancels_down_programmer_timer() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.output_enable(true).unwrap();
        ch.tick(at(50));
        ch.output_enable(false).unwrap();
        let writes = ch.hardware().io_writes;
        ch.tick(at(150));
        assert_eq!(ch.hardware().io_writes, writes);
        assert!(ch.hardware().last_io().down_programmer());
    }

    #[test]
    fn test_ovp_trip_disables_output_and_clear_keeps_it_off() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_protection(ProtectionKind::Ovp, ProtectionConfig::new(true, 10.0, 0.005));
        ch.output_enable(true).unwrap();

        post(&mut ch, 12.0, 0.1);
        ch.tick(at(200));
        assert!(ch.protection(ProtectionKind::Ovp).is_alarmed());
        ch.tick(at(203));
        assert!(ch.is_output_enabled());
        ch.tick(at(206));
        assert!(!ch.is_output_enabled());
        assert!(ch.protection(ProtectionKind::Ovp).is_tripped());
        assert_eq!(ch.output_state(), OutputState::Tripped);
        assert_eq!(
            ch.pop_event(),
            Some(Event::ProtectionTripped {
                channel: 1,
                kind: ProtectionKind::Ovp
            })
        );
        assert_eq!(
            ch.output_enable(true),
            Err(Error::ProtectionTripped(ProtectionKind::Ovp))
        );

        ch.clear_protection(true);
        assert!(!ch.is_tripped());
        assert!(!ch.is_output_enabled());
        assert_eq!(ch.output_state(), OutputState::Disabled);
        assert!(ch.output_enable(true).is_ok());
    }

    #[test]
    fn test_ovp_alarm_clears_below_level() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_protection(ProtectionKind::Ovp, ProtectionConfig::new(true, 10.0, 0.005));
        ch.output_enable(true).unwrap();
        post(&mut ch, 12.0, 0.1);
        ch.tick(at(200));
        assert!(ch.protection(ProtectionKind::Ovp).is_alarmed());

        for _ in 0..crate::value::NUM_ADC_AVERAGING_VALUES {
            post(&mut ch, 5.0, 0.1);
        }
        ch.tick(at(202));
        assert!(!ch.protection(ProtectionKind::Ovp).is_alarmed());
        ch.tick(at(300));
        assert!(ch.is_output_enabled());
    }

    #[test]
    fn test_ocp_trips_while_current_loop_in_control() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_protection_state(ProtectionKind::Ocp, true);
        ch.output_enable(true).unwrap();
        ch.event_gpio(IoInputs::new().with_power_good(true).with_cc_active(true));
        assert!(ch.is_cc_mode());

        ch.tick(at(200));
        ch.tick(at(210));
        assert!(ch.is_output_enabled());
        ch.tick(at(225));
        assert!(ch.protection(ProtectionKind::Ocp).is_tripped());
        assert!(!ch.is_output_enabled());
        assert_eq!(ch.regulation_mode(), RegulationMode::Unregulated);
    }

    #[test]
    fn test_opp_uses_monitored_power() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_protection(ProtectionKind::Opp, ProtectionConfig::new(true, 50.0, 1.0));
        ch.output_enable(true).unwrap();
        post(&mut ch, 20.0, 3.0);
        ch.tick(at(200));
        ch.tick(at(1_199));
        assert!(ch.is_output_enabled());
        ch.tick(at(1_200));
        assert!(ch.protection(ProtectionKind::Opp).is_tripped());
    }

    #[test]
    fn test_otp_needs_explicit_clear() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.event_temperature(80.0);
        ch.tick(at(0));
        ch.tick(at(10_000));
        assert_eq!(ch.tripped_protection(), Some(ProtectionKind::Otp));

        ch.clear_protection(false);
        assert!(ch.protection(ProtectionKind::Otp).is_tripped());
        ch.clear_protection(true);
        assert!(!ch.is_tripped());
    }

    #[test]
    fn test_disable_protection() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.event_temperature(90.0);
        ch.tick(at(0));
        ch.tick(at(20_000));
        assert!(ch.is_tripped());
        ch.disable_protection();
        assert!(!ch.is_tripped());
        for kind in ProtectionKind::iter() {
            assert!(!ch.protection_config().get(kind).enabled);
        }
        ch.tick(at(40_000));
        assert!(!ch.is_tripped());
    }

    #[test]
    fn test_current_change_balances_voltage() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_power_limit(50.0);
        ch.set_voltage(20.0);
        ch.set_current(4.0);
        assert!(close(ch.voltage().set(), 12.5));
        assert!(ch.is_voltage_balanced());
        assert_eq!(ch.u_set_unbalanced(), 20.0);

        ch.set_current(2.0);
        assert_eq!(ch.voltage().set(), 20.0);
        assert!(!ch.is_voltage_balanced());
        assert_eq!(ch.u_set_unbalanced(), 20.0);
    }

    #[test]
    fn test_voltage_change_balances_current() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_power_limit(50.0);
        ch.set_current(2.0);
        ch.set_voltage(30.0);
        assert!(close(ch.current().set(), 50.0 / 30.0));
        assert_eq!(ch.i_set_unbalanced(), 2.0);

        // Raising the power limit gives the requested current back.
        ch.set_power_limit(155.0);
        assert_eq!(ch.current().set(), 2.0);
        assert!(!ch.is_current_balanced());
        assert_ordered(ch.current());
    }

    #[test]
    fn test_low_ripple_needs_settled_output_inside_soa() {
        let mut ch = channel(BoardRevision::R3B4);
        assert_eq!(ch.low_ripple_enable(true), Err(Error::LowRippleNotAllowed));

        ch.output_enable(true).unwrap();
        ch.tick(at(100));
        post(&mut ch, 40.0, 0.5);
        ch.tick(at(300));
        assert!(!ch.is_low_ripple_allowed());
        ch.tick(at(700));
        assert!(ch.is_low_ripple_allowed());
        ch.low_ripple_enable(true).unwrap();
        assert!(ch.hardware().last_io().low_ripple());

        for _ in 0..crate::value::NUM_ADC_AVERAGING_VALUES {
            post(&mut ch, 40.0, 1.9);
        }
        ch.tick(at(800));
        assert!(!ch.is_low_ripple_enabled());
        assert_eq!(ch.pop_event(), Some(Event::LowRippleDisabled { channel: 1 }));
    }

    #[test]
    fn test_low_ripple_auto() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.low_ripple_auto_enable(true).unwrap();
        ch.output_enable(true).unwrap();
        ch.tick(at(100));
        post(&mut ch, 40.0, 0.5);
        ch.tick(at(700));
        assert!(ch.is_low_ripple_enabled());

        ch.output_enable(false).unwrap();
        assert!(!ch.hardware().last_io().low_ripple());
        assert!(ch.is_low_ripple_auto_enabled());
    }

    #[test]
    fn test_missing_features_are_reported() {
        let features = Features::new().with_voltage(true).with_current(true).with_output_enable(true);
        let params = BoardRevision::R3B4.params().with_features(features);
        let mut ch = Channel::new(1, params, MockHardware::new());
        ch.init().unwrap();
        assert_eq!(ch.low_ripple_enable(true), Err(Error::NotSupported));
        assert_eq!(ch.low_ripple_auto_enable(true), Err(Error::NotSupported));
        assert_eq!(ch.remote_programming_enable(true), Err(Error::NotSupported));
        assert!(ch.remote_programming_enable(false).is_ok());
        assert!(!ch.hardware().last_io().down_programmer());

        let mut r5 = channel(BoardRevision::R5B12);
        r5.remote_programming_enable(true).unwrap();
        assert!(r5.hardware().last_io().remote_programming());
        r5.remote_sensing_enable(true);
        assert!(r5.is_remote_sensing_enabled());
    }

    #[test]
    fn test_current_range_follows_setpoint() {
        let mut ch = channel(BoardRevision::R5B12);
        assert_eq!(ch.current_range(), CurrentRange::Low);
        assert!(ch.hardware().last_io().current_range_low());

        ch.set_current(2.0);
        assert_eq!(ch.current_range(), CurrentRange::High);
        assert!(!ch.hardware().last_io().current_range_low());
        assert_eq!(
            ch.pop_event(),
            Some(Event::CurrentRangeChanged {
                channel: 1,
                range: CurrentRange::High
            })
        );

        ch.set_current(0.3);
        assert_eq!(ch.current_range(), CurrentRange::Low);

        ch.set_current_range_selection_mode(CurrentRangeSelectionMode::AlwaysHigh);
        assert_eq!(ch.current_range(), CurrentRange::High);
        assert!(!ch.is_current_low_range_allowed());

        ch.set_current_range_selection_mode(CurrentRangeSelectionMode::AlwaysLow);
        assert_eq!(ch.current_range(), CurrentRange::Low);
        assert_eq!(ch.max_current_limit(), 0.5);
        assert_eq!(ch.current().limit(), 0.5);
        ch.set_current(2.0);
        assert_eq!(ch.current().set(), 0.5);
    }

    #[test]
    fn test_single_range_board_stays_high() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_current(0.1);
        assert_eq!(ch.current_range(), CurrentRange::High);
        assert!(!ch.is_current_low_range_allowed());
    }

    #[test]
    fn test_auto_range_hysteresis() {
        let mut ch = channel(BoardRevision::R5B12);
        ch.set_current(3.0);
        ch.enable_auto_select_current_range(true);
        ch.output_enable(true).unwrap();
        ch.tick(at(200));

        for _ in 0..AUTO_RANGE_WINDOW {
            post(&mut ch, 5.0, 0.2);
        }
        ch.tick(at(300));
        assert_eq!(ch.current_range(), CurrentRange::Low);

        for _ in 0..AUTO_RANGE_WINDOW {
            post(&mut ch, 5.0, 0.495);
        }
        ch.tick(at(400));
        assert_eq!(ch.current_range(), CurrentRange::High);
    }

    #[test]
    fn test_max_current_limit() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.set_current(4.0);
        ch.limit_max_current(MaxCurrentLimitCause::Fan);
        assert!(ch.is_max_current_limited());
        assert_eq!(ch.max_current_limit(), ERR_MAX_CURRENT);
        assert_eq!(ch.current().limit(), ERR_MAX_CURRENT);
        assert_eq!(ch.current().set(), ERR_MAX_CURRENT);

        ch.unlimit_max_current();
        assert_eq!(ch.max_current_limit(), 5.0);
        assert_eq!(ch.current().limit(), ERR_MAX_CURRENT);
    }

    #[test]
    fn test_power_fault_from_gpio() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.output_enable(true).unwrap();
        ch.event_gpio(IoInputs::new());
        assert!(!ch.is_output_enabled());
        assert!(!ch.is_ok());
        assert_eq!(ch.test_result(), TestResult::Failed(HardwareFault::PowerGood));
        assert_eq!(
            ch.pop_event(),
            Some(Event::ChannelFault {
                channel: 1,
                fault: HardwareFault::PowerGood
            })
        );

        ch.event_gpio(IoInputs::new().with_power_good(true));
        assert!(!ch.is_ok());
        ch.test().unwrap();
        assert!(ch.is_ok());
    }

    #[test]
    fn test_gpio_regulation_bits_are_exclusive() {
        let mut ch = channel(BoardRevision::R5B12);
        ch.output_enable(true).unwrap();
        let inputs = IoInputs::new().with_power_good(true);
        ch.event_gpio(inputs.with_cv_active(true));
        assert!(ch.is_cv_mode());
        ch.event_gpio(inputs.with_cv_active(true).with_cc_active(true));
        assert_eq!(ch.regulation_mode(), RegulationMode::Unregulated);
        ch.event_gpio(inputs.with_remote_polarity_reversed(true));
        assert!(ch.is_remote_polarity_reversed());
    }

    #[test]
    fn test_history_and_mon_dac_readback() {
        let mut ch = channel(BoardRevision::R3B4);
        post(&mut ch, 10.0, 1.0);
        ch.tick(at(5));
        ch.adc_read_mon_dac();
        post(&mut ch, 10.0, 1.0);
        // Readback of both DACs follows the regular pair.
        ch.post_adc_data(AdcSelector::UMonDac, code(9.0, 40.0)).unwrap();
        ch.post_adc_data(AdcSelector::IMonDac, code(0.9, 5.0)).unwrap();
        ch.tick(at(10));

        assert_eq!(ch.history().position(), 2);
        assert!(close(ch.history().u_mon(1).unwrap(), 10.0));
        assert!(close(ch.voltage().mon_dac(), 9.0));
        assert!(close(ch.current().mon_dac(), 0.9));
        assert!(close(ch.current().mon(), 1.0));
        assert_eq!(ch.adc_selector(), AdcSelector::UMon);
        assert_eq!(ch.hardware().adc_started, Some(AdcSelector::UMon));
    }

    #[test]
    fn test_full_inbox_hands_the_sample_back() {
        let mut ch = channel(BoardRevision::R3B4);
        for n in 0..ADC_INBOX_SIZE {
            ch.post_adc_data(AdcSelector::UMon, n as i16).unwrap();
        }
        assert_eq!(
            ch.post_adc_data(AdcSelector::IMon, 7),
            Err((AdcSelector::IMon, 7))
        );
    }

    #[test]
    fn test_lost_sample_keeps_axes_apart() {
        let mut ch = channel(BoardRevision::R3B4);
        for _ in 0..ADC_INBOX_SIZE / 2 {
            post(&mut ch, 10.0, 1.0);
        }
        let u_code = code(10.0, 40.0);
        assert_eq!(
            ch.post_adc_data(AdcSelector::UMon, u_code),
            Err((AdcSelector::UMon, u_code))
        );
        ch.tick(at(5));

        // The driver goes on with the current conversion of the lost pair.
        ch.post_adc_data(AdcSelector::IMon, code(1.0, 5.0)).unwrap();
        for _ in 0..3 {
            post(&mut ch, 10.0, 1.0);
        }
        ch.tick(at(10));

        assert!(close(ch.voltage().mon_last(), 10.0));
        assert!(close(ch.current().mon_last(), 1.0));
        assert!(close(ch.voltage().mon(), 10.0));
        assert!(close(ch.current().mon(), 1.0));
    }

    fn voltage_table() -> CalibrationTable {
        CalibrationTable {
            min: CalibrationPoint::new(1000.0, 0.5, 500.0),
            mid: CalibrationPoint::new(30000.0, 18.0, 15000.0),
            max: CalibrationPoint::new(60000.0, 36.0, 30000.0),
        }
    }

    #[test]
    fn test_load_calibration() {
        let mut ch = channel(BoardRevision::R3B4);
        let config = CalibrationConfig {
            voltage: Some(voltage_table()),
            ..CalibrationConfig::default()
        };
        ch.load_calibration(&config).unwrap();
        assert!(ch.is_calibration_enabled());
        ch.set_voltage(18.0);
        let expected = voltage_table().transform().unwrap().dac_code(18.0);
        assert_eq!(ch.hardware().voltage_dac, Some(expected));

        ch.calibration_enable(false).unwrap();
        assert_eq!(
            ch.hardware().voltage_dac,
            Some(CalibrationTransform::factory(40.0).dac_code(18.0))
        );

        ch.set_calibration_info("20261016", "bench").unwrap();
        let saved = ch.calibration_config();
        assert_eq!(saved.voltage, Some(voltage_table()));
        assert_eq!(saved.date.as_str(), "20261016");
        assert!(ch.set_calibration_info("202610160", "").is_err());
    }

    #[test]
    fn test_degenerate_calibration_falls_back_to_factory() {
        let mut ch = channel(BoardRevision::R3B4);
        let mut good = CalibrationConfig {
            voltage: Some(voltage_table()),
            ..CalibrationConfig::default()
        };
        good.date.push_str("20261016").unwrap();
        good.remark.push_str("bench").unwrap();
        ch.load_calibration(&good).unwrap();

        let mut table = voltage_table();
        table.max.val = table.min.val;
        let config = CalibrationConfig {
            voltage: Some(table),
            ..good.clone()
        };
        assert_eq!(
            ch.load_calibration(&config),
            Err(Error::Calibration(CalibrationError::DegenerateValue))
        );
        assert!(!ch.is_calibration_exists());
        assert_eq!(ch.calibration_config(), CalibrationConfig::default());
        assert!(!ch.is_calibration_enabled());
        assert_eq!(
            ch.calibration_enable(true),
            Err(Error::Calibration(CalibrationError::NotCalibrated))
        );

        ch.set_voltage(18.0);
        assert_eq!(
            ch.hardware().voltage_dac,
            Some(CalibrationTransform::factory(40.0).dac_code(18.0))
        );
    }

    #[test]
    fn test_calibrator_procedure() {
        let mut ch = channel(BoardRevision::R3B4);
        let mut calibrator = Calibrator::new(CalibrationAxis::Voltage);
        assert_eq!(
            calibrator.record(&ch, CalibrationLevel::Min, 0.15),
            Err(CalibrationError::MissingPoint)
        );

        for (n, (level, adc)) in CalibrationLevel::iter().zip([120_i16, 16_400, 31_100]).enumerate() {
            let nominal = calibrator.select_level(&mut ch, level);
            let factory = CalibrationTransform::factory(40.0);
            assert_eq!(ch.hardware().voltage_dac, Some(factory.dac_code(nominal)));
            ch.post_adc_data(AdcSelector::UMon, adc).unwrap();
            ch.post_adc_data(AdcSelector::IMon, 0).unwrap();
            ch.tick(at(10 * n as u64));
            calibrator.record(&ch, level, nominal * 1.01).unwrap();
        }

        let table = calibrator.save(&mut ch).unwrap();
        assert_eq!(table.min.adc, 120.0);
        assert_eq!(table.max.adc, 31_100.0);
        assert!(ch.is_calibration_enabled());
        assert_eq!(ch.voltage_calibration().map(|cal| cal.table), Some(table));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut ch = channel(BoardRevision::R3B4);
        let defaults = ChannelProtectionConfig::defaults(ch.params());
        ch.set_voltage(10.0);
        ch.set_protection_state(ProtectionKind::Ovp, true);
        ch.trigger_mut().voltage_mode = TriggerMode::List;
        ch.output_enable(true).unwrap();

        ch.reset();
        assert!(!ch.is_output_enabled());
        assert_eq!(ch.voltage().set(), ch.params().u_def);
        assert_eq!(*ch.protection_config(), defaults);
        assert_eq!(ch.trigger().voltage_mode, TriggerMode::Fixed);
        assert_eq!(ch.power_limit(), ch.power_max_limit());
    }

    #[test]
    fn test_on_time_and_output_save_restore() {
        let mut ch = channel(BoardRevision::R3B4);
        ch.output_enable(true).unwrap();
        ch.tick(at(1_000));
        assert_eq!(ch.on_time().last(), Duration::millis(1_000));

        ch.save_and_disable_output();
        assert!(!ch.is_output_enabled());
        assert_eq!(ch.on_time().total(), Duration::millis(1_000));
        ch.restore_output();
        assert!(ch.is_output_enabled());
        // Only restored once.
        ch.output_enable(false).unwrap();
        ch.restore_output();
        assert!(!ch.is_output_enabled());
    }
}
