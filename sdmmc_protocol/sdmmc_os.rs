//! Small OS-service layer: monotonic deadlines and the polling sleep used
//! by bounded register waits.

use std::thread;
use std::time::{Duration, Instant};

/// Wall-clock bound for a polling loop. All register polls in this stack
/// are bounded by elapsed monotonic time rather than an iteration count so
/// the bound holds regardless of execution speed.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Deadline {
        Deadline {
            end: Instant::now() + timeout,
        }
    }

    pub fn after_ms(ms: u64) -> Deadline {
        Deadline::after(Duration::from_millis(ms))
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }

    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

/// Back-off between poll iterations.
pub fn poll_wait(interval: Duration) {
    thread::sleep(interval);
}

/// Short poll interval used while watching a status bit.
pub const POLL_INTERVAL: Duration = Duration::from_micros(100);
