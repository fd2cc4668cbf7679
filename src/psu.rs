use embedded_hal::delay::DelayNs;
use heapless::{Deque, Vec};
use log::warn;

use crate::{
    board::{CH_MAX, ChannelParams},
    channel::Channel,
    coupling::SystemState,
    error::{Error, Result},
    event::{Event, push_event},
    hal::{Backplane, ChannelHardware},
    types::Instant,
};

/// Capacity of the device event queue.
pub const EVENT_QUEUE_SIZE: usize = 32;

/// Zero based position of a channel in the [`Psu`], obtained with [`Psu::channel_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    /// Zero based position.
    pub fn index(self) -> usize {
        self.0
    }
}

/// The instrument: channels, the coupling backplane and the device wide state.
///
/// Channel level operations that have to respect the coupling of channel 1
/// and 2 are routed through the methods in [`crate::dispatcher`]. A channel can
/// also be reached directly with [`Psu::channel_mut`] when the coupling does not
/// matter (tests, calibration, drivers feeding ADC data).
pub struct Psu<H: ChannelHardware, B: Backplane, D: DelayNs> {
    pub(crate) channels: Vec<Channel<H>, CH_MAX>,
    pub(crate) state: SystemState,
    pub(crate) backplane: B,
    pub(crate) delay: D,
    events: Deque<Event, EVENT_QUEUE_SIZE>,
}

impl<H: ChannelHardware, B: Backplane, D: DelayNs> Psu<H, B, D> {
    /// Create an instrument without channels.
    pub fn new(backplane: B, delay: D) -> Self {
        Self {
            channels: Vec::new(),
            state: SystemState::default(),
            backplane,
            delay,
            events: Deque::new(),
        }
    }

    /// Add the next channel. Channels are numbered from 1 in the order they are added.
    pub fn add_channel(&mut self, params: ChannelParams, hardware: H) -> Result<ChannelId> {
        let n = self.channels.len();
        let channel = Channel::new(n as u8 + 1, params, hardware);
        self.channels
            .push(channel)
            .map_err(|_| Error::InvalidChannel(n))?;
        Ok(ChannelId(n))
    }

    /// Initialise every channel. All channels are tried, the first failure is returned.
    pub fn init(&mut self) -> Result<()> {
        let mut result = Ok(());
        for channel in self.channels.iter_mut() {
            if let Err(err) = channel.init() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.drain_channel_events();
        result
    }

    /// Number of channels added.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Id of the channel at zero based `index`.
    pub fn channel_id(&self, index: usize) -> Result<ChannelId> {
        if index < self.channels.len() {
            Ok(ChannelId(index))
        } else {
            Err(Error::InvalidChannel(index))
        }
    }

    /// Physical channel, bypassing the coupling.
    pub fn channel(&self, id: ChannelId) -> &Channel<H> {
        &self.channels[id.0]
    }

    /// Mutable physical channel, bypassing the coupling.
    pub fn channel_mut(&mut self, id: ChannelId) -> &mut Channel<H> {
        &mut self.channels[id.0]
    }

    /// Every physical channel in order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel<H>> {
        self.channels.iter()
    }

    /// Coupling and device wide protection settings.
    pub fn system_state(&self) -> &SystemState {
        &self.state
    }

    /// A trip on any channel switches every output off.
    pub fn set_output_protection_couple(&mut self, enable: bool) {
        self.state.output_protection_couple = enable;
    }

    /// A trip queues [`Event::ShutdownRequested`].
    pub fn set_shutdown_when_protection_tripped(&mut self, enable: bool) {
        self.state.shutdown_when_protection_tripped = enable;
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        push_event(&mut self.events, event);
    }

    /// Oldest event not yet read.
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn drain_channel_events(&mut self) {
        for channel in self.channels.iter_mut() {
            while let Some(event) = channel.pop_event() {
                push_event(&mut self.events, event);
            }
        }
    }

    /// Advance every channel, then apply the device wide reactions to new trips.
    pub fn tick(&mut self, now: Instant) {
        let mut tripped = [false; CH_MAX];
        for (n, channel) in self.channels.iter_mut().enumerate() {
            let was_tripped = channel.is_tripped();
            channel.tick(now);
            tripped[n] = !was_tripped && channel.is_tripped();
        }
        self.drain_channel_events();

        if !tripped.contains(&true) {
            return;
        }
        if self.state.is_coupled_or_tracked() && (tripped[0] || tripped[1]) {
            for channel in self.channels.iter_mut().take(2) {
                channel.force_output_off();
            }
        }
        if self.state.output_protection_couple {
            warn!("protection tripped, all outputs off");
            for channel in self.channels.iter_mut() {
                channel.force_output_off();
            }
        }
        if self.state.shutdown_when_protection_tripped {
            self.push_event(Event::ShutdownRequested);
        }
    }

    /// Remember which outputs are on and switch them all off.
    pub fn save_and_disable_outputs(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.save_and_disable_output();
        }
    }

    /// Switch back on the outputs saved by [`Psu::save_and_disable_outputs`].
    pub fn restore_outputs(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.restore_output();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        board::BoardRevision,
        coupling::CouplingMode,
        mock_hw::{MockBackplane, MockDelay, MockHardware},
        types::ProtectionKind,
    };

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(ms * 1_000)
    }

    fn psu(channels: usize) -> Psu<MockHardware, MockBackplane, MockDelay> {
        let mut psu = Psu::new(MockBackplane::default(), MockDelay::default());
        for _ in 0..channels {
            psu.add_channel(BoardRevision::R3B4.params(), MockHardware::new())
                .unwrap();
        }
        psu.init().unwrap();
        psu
    }

    #[test]
    fn test_channels_are_numbered_from_one() {
        let psu = psu(3);
        assert_eq!(psu.channel_count(), 3);
        let id = psu.channel_id(2).unwrap();
        assert_eq!(id.index(), 2);
        assert_eq!(psu.channel(id).index(), 3);
        assert_eq!(psu.channel_id(3), Err(Error::InvalidChannel(3)));
    }

    #[test]
    fn test_channel_capacity() {
        let mut psu = psu(CH_MAX);
        assert_eq!(
            psu.add_channel(BoardRevision::R3B4.params(), MockHardware::new()),
            Err(Error::InvalidChannel(CH_MAX))
        );
    }

    #[test]
    fn test_protection_couple_disables_every_output() {
        let mut psu = psu(3);
        psu.set_output_protection_couple(true);
        psu.set_shutdown_when_protection_tripped(true);
        for n in 0..3 {
            psu.channel_mut(ChannelId(n)).output_enable(true).unwrap();
        }
        psu.channel_mut(ChannelId(2)).event_temperature(95.0);
        psu.tick(at(0));
        psu.tick(at(10_000));

        assert!(psu.channels().all(|ch| !ch.is_output_enabled()));
        assert_eq!(
            psu.pop_event(),
            Some(Event::ProtectionTripped {
                channel: 3,
                kind: ProtectionKind::Otp
            })
        );
        assert_eq!(psu.pop_event(), Some(Event::ShutdownRequested));
        assert_eq!(psu.pop_event(), None);
    }

    #[test]
    fn test_independent_trip_stays_local() {
        let mut psu = psu(2);
        for n in 0..2 {
            psu.channel_mut(ChannelId(n)).output_enable(true).unwrap();
        }
        psu.channel_mut(ChannelId(0)).event_temperature(95.0);
        psu.tick(at(0));
        psu.tick(at(10_000));
        assert!(!psu.channel(ChannelId(0)).is_output_enabled());
        assert!(psu.channel(ChannelId(1)).is_output_enabled());
    }

    #[test]
    fn test_tracked_trip_disables_both() {
        let mut psu = psu(2);
        psu.set_coupling_mode(CouplingMode::Tracked).unwrap();
        for n in 0..2 {
            psu.channel_mut(ChannelId(n)).output_enable(true).unwrap();
        }
        psu.channel_mut(ChannelId(1)).event_temperature(95.0);
        psu.tick(at(0));
        psu.tick(at(10_000));
        assert!(!psu.channel(ChannelId(0)).is_output_enabled());
        assert!(!psu.channel(ChannelId(1)).is_output_enabled());
    }

    #[test]
    fn test_save_and_restore_outputs() {
        let mut psu = psu(2);
        psu.channel_mut(ChannelId(1)).output_enable(true).unwrap();
        psu.save_and_disable_outputs();
        assert!(psu.channels().all(|ch| !ch.is_output_enabled()));
        psu.restore_outputs();
        assert!(!psu.channel(ChannelId(0)).is_output_enabled());
        assert!(psu.channel(ChannelId(1)).is_output_enabled());
    }
}
