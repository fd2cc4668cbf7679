//! Notifications pushed by the core for the outer layers (UI, SCPI, event log).

use crate::{
    coupling::CouplingMode,
    error::HardwareFault,
    types::{CurrentRange, ProtectionKind},
};

/// Channels are identified by their one based index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ProtectionTripped { channel: u8, kind: ProtectionKind },
    /// Coupling of channel 1 and 2 changed.
    CouplingChanged(CouplingMode),
    /// Low ripple mode had to be turned off by the channel itself.
    LowRippleDisabled { channel: u8 },
    CurrentRangeChanged { channel: u8, range: CurrentRange },
    ChannelFault { channel: u8, fault: HardwareFault },
    /// A protection tripped and the instrument is configured to power down.
    ShutdownRequested,
}

/// Push to a bounded queue, dropping the oldest entry when full.
pub(crate) fn push_event<const N: usize>(queue: &mut heapless::Deque<Event, N>, event: Event) {
    if queue.is_full() {
        queue.pop_front();
    }
    // Cannot fail, there is room now.
    let _ = queue.push_back(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_the_oldest() {
        let mut queue: heapless::Deque<Event, 2> = heapless::Deque::new();
        push_event(&mut queue, Event::ShutdownRequested);
        push_event(&mut queue, Event::LowRippleDisabled { channel: 0 });
        push_event(&mut queue, Event::LowRippleDisabled { channel: 1 });
        assert_eq!(queue.pop_front(), Some(Event::LowRippleDisabled { channel: 0 }));
        assert_eq!(queue.pop_front(), Some(Event::LowRippleDisabled { channel: 1 }));
        assert_eq!(queue.pop_front(), None);
    }
}
