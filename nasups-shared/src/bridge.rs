//! Interrupt to task bridge.
//!
//! Interrupt handlers only post a [`TaskCmd`] into a bounded
//! single-producer/single-consumer queue; the dispatch task interprets it.

use heapless::spsc::{Producer, Queue};

use crate::Millis;

/// Work item posted from interrupt context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskCmd {
    /// I2C slave needs service.
    I2c,
    /// Falling edge on the start button.
    StartPressed,
    /// Falling edge on the stop button.
    StopPressed,
}

/// Queue of work items, holds 16 entries.
pub type CmdQueue = Queue<TaskCmd, 17>;

/// Posts a work item, dropping it when the queue is full.
pub fn post<const N: usize>(producer: &mut Producer<'_, TaskCmd, N>, cmd: TaskCmd) -> bool {
    producer.enqueue(cmd).is_ok()
}

/// Start button lockout after an accepted press.
pub const START_LOCKOUT_MS: Millis = 1_000;

/// Stop button lockout after an accepted press.
pub const STOP_LOCKOUT_MS: Millis = 4_000;

/// Delay after which a press is confirmed by the pin level.
pub const CONFIRM_MS: Millis = 200;

/// Delay after confirmation at which the stop button is checked for a forced stop.
pub const HOLD_CHECK_MS: Millis = 2_000;

/// Interval of the lockout reset.
pub const LOCKOUT_RESET_MS: Millis = 3_600_000;

/// Ignores repeated events within a period.
#[derive(Clone, Debug)]
pub struct Lockout {
    period: Millis,
    last: Option<Millis>,
}

impl Lockout {
    pub const fn new(period: Millis) -> Self {
        Self { period, last: None }
    }

    /// Accepts the event only once more than the lockout period has passed.
    pub fn accept(&mut self, now: Millis) -> bool {
        match self.last {
            Some(last) if now.saturating_sub(last) <= self.period => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Lockouts of both buttons.
#[derive(Clone, Debug)]
pub struct Buttons {
    start: Lockout,
    stop: Lockout,
    next_reset: Millis,
}

impl Default for Buttons {
    fn default() -> Self {
        Self::new()
    }
}

impl Buttons {
    pub const fn new() -> Self {
        Self { start: Lockout::new(START_LOCKOUT_MS), stop: Lockout::new(STOP_LOCKOUT_MS), next_reset: LOCKOUT_RESET_MS }
    }

    /// Whether a button press should be confirmed.
    pub fn accept(&mut self, cmd: TaskCmd, now: Millis) -> bool {
        if now >= self.next_reset {
            self.start.reset();
            self.stop.reset();
            self.next_reset = now + LOCKOUT_RESET_MS;
        }
        match cmd {
            TaskCmd::StartPressed => self.start.accept(now),
            TaskCmd::StopPressed => self.stop.accept(now),
            TaskCmd::I2c => false,
        }
    }
}

/// Result of the stop button hold check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopKind {
    /// Button still held: switch off without asking the host.
    Forced,
    /// Button released: ask the host to shut down.
    Graceful,
}

impl StopKind {
    /// Classifies the stop request from the button level at the hold check.
    pub fn from_held(held: bool) -> Self {
        if held {
            Self::Forced
        } else {
            Self::Graceful
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops() {
        let mut queue = CmdQueue::new();
        let (mut tx, mut rx) = queue.split();
        for _ in 0..16 {
            assert!(post(&mut tx, TaskCmd::I2c));
        }
        assert!(!post(&mut tx, TaskCmd::StopPressed));
        assert_eq!(rx.dequeue(), Some(TaskCmd::I2c));
        assert!(post(&mut tx, TaskCmd::StartPressed));
        let mut last = None;
        while let Some(cmd) = rx.dequeue() {
            last = Some(cmd);
        }
        assert_eq!(last, Some(TaskCmd::StartPressed));
    }

    #[test]
    fn lockout_periods() {
        let mut b = Buttons::new();
        assert!(b.accept(TaskCmd::StartPressed, 100));
        assert!(!b.accept(TaskCmd::StartPressed, 1_099));
        assert!(!b.accept(TaskCmd::StartPressed, 1_100));
        assert!(b.accept(TaskCmd::StartPressed, 1_101));

        assert!(b.accept(TaskCmd::StopPressed, 100));
        assert!(!b.accept(TaskCmd::StopPressed, 4_000));
        assert!(!b.accept(TaskCmd::StopPressed, 4_100));
        assert!(b.accept(TaskCmd::StopPressed, 4_101));
        assert!(!b.accept(TaskCmd::I2c, 10_000));
    }

    #[test]
    fn hourly_reset() {
        let mut b = Buttons::new();
        assert!(b.accept(TaskCmd::StopPressed, LOCKOUT_RESET_MS - 1));
        assert!(b.accept(TaskCmd::StopPressed, LOCKOUT_RESET_MS));
    }

    #[test]
    fn stop_kind() {
        assert_eq!(StopKind::from_held(true), StopKind::Forced);
        assert_eq!(StopKind::from_held(false), StopKind::Graceful);
    }
}
