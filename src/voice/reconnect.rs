use std::time::Duration;

use tokio::time::Instant;

/// Single pending reconnect, tagged with the session generation that
/// scheduled it.
#[derive(Debug)]
pub struct ReconnectTimer {
    delay: Duration,
    pending: Option<(u64, Instant)>,
}

impl ReconnectTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    /// Arm the timer unless one is already pending. Returns whether a new
    /// reconnect was scheduled.
    pub fn schedule(&mut self, generation: u64, now: Instant) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some((generation, now + self.delay));
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn due(&self) -> Option<Instant> {
        self.pending.map(|(_, due)| due)
    }

    /// Consume the pending reconnect. Returns true only if it belongs to
    /// `generation`; a reconnect from an older session is discarded.
    pub fn take_if_current(&mut self, generation: u64) -> bool {
        match self.pending.take() {
            Some((scheduled, _)) if scheduled == generation => true,
            Some((scheduled, _)) => {
                log::info!(
                    "Discarding reconnect from stale session (generation {} != {})",
                    scheduled,
                    generation
                );
                false
            }
            None => false,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}
