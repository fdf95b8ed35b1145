//! Debounce timer.

use crate::Millis;

/// Single-shot countdown that requires a condition to persist.
///
/// Armed when the condition starts, disarmed if it ends before expiry,
/// and fires exactly once otherwise.
#[derive(Clone, Debug)]
pub struct DebounceTimer {
    duration: Millis,
    deadline: Option<Millis>,
}

impl DebounceTimer {
    /// Creates a disarmed timer.
    pub const fn new(duration: Millis) -> Self {
        Self { duration, deadline: None }
    }

    /// Arms the timer unless it is already running.
    ///
    /// Returns whether the timer was started.
    pub fn arm(&mut self, now: Millis) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + self.duration);
        true
    }

    /// Disarms the timer, returns whether it was running.
    pub fn disarm(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true once when the deadline has passed.
    pub fn poll(&mut self, now: Millis) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once() {
        let mut t = DebounceTimer::new(10_000);
        assert!(t.arm(1_000));
        assert!(!t.arm(2_000));
        assert!(!t.poll(10_999));
        assert!(t.poll(11_000));
        assert!(!t.poll(12_000));
        assert!(!t.is_armed());
    }

    #[test]
    fn disarm_before_expiry() {
        let mut t = DebounceTimer::new(10_000);
        t.arm(0);
        assert!(t.disarm());
        assert!(!t.disarm());
        assert!(!t.poll(20_000));
    }
}
