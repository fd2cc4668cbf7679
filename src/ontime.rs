//! Accumulated output on-time of a channel.

use crate::types::{Duration, Instant, elapsed};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnTimeCounter {
    /// Sum of all finished sessions.
    finished: Duration,
    /// Length of the running (or last) session.
    last: Duration,
    started: Option<Instant>,
}

impl Default for OnTimeCounter {
    fn default() -> Self {
        Self {
            finished: Duration::from_ticks(0),
            last: Duration::from_ticks(0),
            started: None,
        }
    }
}

impl OnTimeCounter {
    /// Counter that continues from a total restored from storage.
    pub fn with_total(total: Duration) -> Self {
        Self {
            finished: total,
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn start(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
            self.last = Duration::from_ticks(0);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        if let Some(started) = self.started {
            self.last = elapsed(started, now);
        }
    }

    pub fn stop(&mut self, now: Instant) {
        if self.started.is_some() {
            self.tick(now);
            self.finished = self.finished + self.last;
            self.started = None;
        }
    }

    /// Length of the running session, or of the last one once stopped.
    pub fn last(&self) -> Duration {
        self.last
    }

    pub fn total(&self) -> Duration {
        if self.is_running() {
            self.finished + self.last
        } else {
            self.finished
        }
    }
}
