//! Ring of past voltage and current samples, addressed by an ever increasing position.

/// Number of sample pairs kept per channel.
pub const CHANNEL_HISTORY_SIZE: usize = 128;

pub struct History {
    u: [f32; CHANNEL_HISTORY_SIZE],
    i: [f32; CHANNEL_HISTORY_SIZE],
    /// Position the next sample will be written to.
    position: u32,
}

impl Default for History {
    fn default() -> Self {
        Self {
            u: [0.0; CHANNEL_HISTORY_SIZE],
            i: [0.0; CHANNEL_HISTORY_SIZE],
            position: 0,
        }
    }
}

impl History {
    pub fn push(&mut self, u: f32, i: f32) {
        let slot = self.position as usize % CHANNEL_HISTORY_SIZE;
        self.u[slot] = u;
        self.i[slot] = i;
        self.position = self.position.wrapping_add(1);
    }

    /// Position of the next sample, also the count of samples written since the last reset.
    pub fn position(&self) -> u32 {
        self.position
    }

    fn slot(&self, position: u32) -> Option<usize> {
        let age = self.position.checked_sub(position)?;
        if age == 0 || age as usize > CHANNEL_HISTORY_SIZE {
            return None;
        }
        Some(position as usize % CHANNEL_HISTORY_SIZE)
    }

    /// Voltage sample at `position`, `None` when not written yet or overwritten.
    pub fn u_mon(&self, position: u32) -> Option<f32> {
        self.slot(position).map(|slot| self.u[slot])
    }

    /// Current sample at `position`, `None` when not written yet or overwritten.
    pub fn i_mon(&self, position: u32) -> Option<f32> {
        self.slot(position).map(|slot| self.i[slot])
    }

    /// The last `count` current samples, newest first.
    pub fn recent_currents(&self, count: usize) -> impl Iterator<Item = f32> + '_ {
        let available = (self.position as usize).min(CHANNEL_HISTORY_SIZE);
        (1..=count.min(available)).map(move |age| {
            let position = self.position - age as u32;
            self.i[position as usize % CHANNEL_HISTORY_SIZE]
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_address_recent_samples() {
        let mut history = History::default();
        assert_eq!(history.u_mon(0), None);
        history.push(1.0, 0.1);
        history.push(2.0, 0.2);
        assert_eq!(history.position(), 2);
        assert_eq!(history.u_mon(0), Some(1.0));
        assert_eq!(history.i_mon(1), Some(0.2));
        assert_eq!(history.u_mon(2), None);
    }

    #[test]
    fn overwritten_samples_are_gone() {
        let mut history = History::default();
        for n in 0..(CHANNEL_HISTORY_SIZE as u32 + 10) {
            history.push(n as f32, 0.0);
        }
        assert_eq!(history.u_mon(9), None);
        assert_eq!(history.u_mon(10), Some(10.0));
        let last = history.position() - 1;
        assert_eq!(history.u_mon(last), Some(last as f32));
    }

    #[test]
    fn recent_currents_newest_first() {
        let mut history = History::default();
        for n in 0..5 {
            history.push(0.0, n as f32);
        }
        let mut recent = history.recent_currents(3);
        assert_eq!(recent.next(), Some(4.0));
        assert_eq!(recent.next(), Some(3.0));
        assert_eq!(recent.next(), Some(2.0));
        assert_eq!(recent.next(), None);
        drop(recent);
        assert_eq!(history.recent_currents(10).count(), 5);

        history.reset();
        assert_eq!(history.position(), 0);
        assert_eq!(history.recent_currents(3).count(), 0);
    }
}
