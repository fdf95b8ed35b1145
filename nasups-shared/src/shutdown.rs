//! Shutdown coordination with the host.
//!
//! The coordinator walks `Idle → NotifyHost → WaitForHostReady → CutPower`
//! for a low battery and takes the unconditional path to `CutPower` when
//! the critical timer fires. Host readiness arrives as commands, the host's
//! acknowledgement is its read of the alert register.

use crate::{
    token::{AlertState, ShutdownReason},
    Millis,
};

/// Time the host has to read the alert after a critical notification.
pub const ACK_WAIT_MS: Millis = 2_000;

/// Time granted to a host that is shutting down.
pub const SHUTDOWN_WAIT_MS: Millis = 30_000;

/// Coordination phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Idle,
    /// Host has been notified and is expected to read the alert.
    NotifyHost {
        critical: bool,
        /// End of the acknowledgement wait of the critical path.
        ack_deadline: Option<Millis>,
        acked: bool,
    },
    /// Host is shutting down and will report ready.
    WaitForHostReady {
        critical: bool,
        /// Power is cut at this time even without a ready command.
        until: Option<Millis>,
    },
    /// Power is to be cut.
    CutPower,
}

/// What the controller knows about the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Host {
    /// Host-on input is high.
    pub powered: bool,
    /// Protected output is switched on.
    pub output_on: bool,
    /// Host declared itself mid-shutdown.
    pub in_shutdown: bool,
}

/// Action requested by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Nothing,
    /// Run the power off sequence.
    CutPower,
    /// Acknowledge with a beep.
    Beep,
}

/// Shutdown coordinator.
#[derive(Clone, Debug)]
pub struct Coordinator {
    phase: Phase,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub const fn new() -> Self {
        Self { phase: Phase::Idle }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the unconditional path is running.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.phase,
            Phase::NotifyHost { critical: true, .. } | Phase::WaitForHostReady { critical: true, .. } | Phase::CutPower
        )
    }

    fn cut(&mut self) -> Outcome {
        self.phase = Phase::CutPower;
        Outcome::CutPower
    }

    /// Critical timer fired.
    pub fn on_critical(&mut self, now: Millis, host: Host, alerts: &mut AlertState) -> Outcome {
        if self.is_critical() {
            return Outcome::Nothing;
        }

        if !host.powered || !host.output_on {
            self.cut()
        } else if host.in_shutdown {
            self.phase = Phase::WaitForHostReady { critical: true, until: Some(now + SHUTDOWN_WAIT_MS) };
            Outcome::Nothing
        } else {
            alerts.set_shutdown(ShutdownReason::Now);
            alerts.notify();
            self.phase = Phase::NotifyHost { critical: true, ack_deadline: Some(now + ACK_WAIT_MS), acked: false };
            Outcome::Nothing
        }
    }

    /// Low battery timer fired.
    pub fn on_low(&mut self, host: Host, alerts: &mut AlertState) -> Outcome {
        if self.is_critical() {
            return Outcome::Nothing;
        }

        if !host.powered || !host.output_on {
            self.cut()
        } else if alerts.shutdown() == ShutdownReason::None {
            alerts.set_shutdown(ShutdownReason::LowBattery);
            self.phase = Phase::NotifyHost { critical: false, ack_deadline: None, acked: false };
            Outcome::Nothing
        } else {
            Outcome::Nothing
        }
    }

    /// Host read the alert register.
    pub fn on_acknowledge(&mut self) {
        match self.phase {
            Phase::NotifyHost { critical: true, ack_deadline, .. } => {
                self.phase = Phase::NotifyHost { critical: true, ack_deadline, acked: true };
            }
            Phase::NotifyHost { critical: false, .. } => {
                self.phase = Phase::WaitForHostReady { critical: false, until: None };
            }
            _ => (),
        }
    }

    /// Advances the wait phases.
    pub fn poll(&mut self, now: Millis) -> Outcome {
        match self.phase {
            Phase::NotifyHost { ack_deadline: Some(deadline), acked, .. } if now >= deadline => {
                if acked {
                    self.phase = Phase::WaitForHostReady { critical: true, until: Some(now + SHUTDOWN_WAIT_MS) };
                    Outcome::Nothing
                } else {
                    self.cut()
                }
            }
            Phase::WaitForHostReady { until: Some(until), .. } if now >= until => self.cut(),
            _ => Outcome::Nothing,
        }
    }

    /// Host reported ready for power cut.
    ///
    /// The caller switches the output off in any case.
    pub fn on_ready(&mut self, power_off: bool, alerts: &mut AlertState) -> Outcome {
        let cut = power_off || alerts.shutdown() == ShutdownReason::LowBattery || self.is_critical();
        alerts.set_shutdown(ShutdownReason::None);
        if cut {
            self.cut()
        } else {
            self.phase = Phase::Idle;
            Outcome::Beep
        }
    }

    /// Battery voltage is above the low level again.
    ///
    /// Withdraws a pending low battery shutdown request.
    pub fn on_battery_recovered(&mut self, alerts: &mut AlertState) -> bool {
        if alerts.shutdown() != ShutdownReason::LowBattery || self.is_critical() {
            return false;
        }
        alerts.set_shutdown(ShutdownReason::None);
        self.phase = Phase::Idle;
        true
    }

    /// Power could not be cut because mains is present.
    pub fn on_power_off_failed(&mut self) {
        self.phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{BatteryPresence, PowerSource};

    const HOST_UP: Host = Host { powered: true, output_on: true, in_shutdown: false };

    fn alerts() -> AlertState {
        AlertState::new(PowerSource::Off, BatteryPresence::On)
    }

    #[test]
    fn critical_without_ack_cuts_once() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        assert_eq!(c.on_critical(10_000, HOST_UP, &mut a), Outcome::Nothing);
        assert_eq!(a.shutdown(), ShutdownReason::Now);
        assert!(a.take_edge());
        assert_eq!(c.poll(11_000), Outcome::Nothing);
        assert_eq!(c.poll(12_000), Outcome::CutPower);
        assert_eq!(c.poll(13_000), Outcome::Nothing);
        assert_eq!(c.on_critical(20_000, HOST_UP, &mut a), Outcome::Nothing);
        assert_eq!(c.phase(), Phase::CutPower);
    }

    #[test]
    fn critical_with_ack_waits_for_shutdown() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        c.on_critical(0, HOST_UP, &mut a);
        c.on_acknowledge();
        assert_eq!(c.poll(ACK_WAIT_MS), Outcome::Nothing);
        assert_eq!(c.phase(), Phase::WaitForHostReady { critical: true, until: Some(32_000) });
        assert_eq!(c.poll(31_999), Outcome::Nothing);
        assert_eq!(c.poll(32_000), Outcome::CutPower);
    }

    #[test]
    fn critical_with_unpowered_host_cuts_immediately() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        let host = Host { powered: false, ..HOST_UP };
        assert_eq!(c.on_critical(0, host, &mut a), Outcome::CutPower);
        let host = Host { output_on: false, ..HOST_UP };
        let mut c = Coordinator::new();
        assert_eq!(c.on_critical(0, host, &mut a), Outcome::CutPower);
    }

    #[test]
    fn critical_with_host_in_shutdown_waits() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        let host = Host { in_shutdown: true, ..HOST_UP };
        assert_eq!(c.on_critical(5_000, host, &mut a), Outcome::Nothing);
        assert_eq!(a.shutdown(), ShutdownReason::None);
        assert_eq!(c.poll(35_000), Outcome::CutPower);
    }

    #[test]
    fn low_battery_negotiation() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        assert_eq!(c.on_low(HOST_UP, &mut a), Outcome::Nothing);
        assert_eq!(a.shutdown(), ShutdownReason::LowBattery);
        assert!(matches!(c.phase(), Phase::NotifyHost { critical: false, .. }));
        a.acknowledge();
        c.on_acknowledge();
        assert_eq!(c.phase(), Phase::WaitForHostReady { critical: false, until: None });
        assert_eq!(a.shutdown(), ShutdownReason::LowBattery);
        assert_eq!(c.poll(1_000_000), Outcome::Nothing);

        assert_eq!(c.on_ready(false, &mut a), Outcome::CutPower);
        assert_eq!(a.shutdown(), ShutdownReason::None);
    }

    #[test]
    fn low_battery_escalates_to_critical() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        c.on_low(HOST_UP, &mut a);
        c.on_acknowledge();
        c.on_critical(40_000, HOST_UP, &mut a);
        assert_eq!(a.shutdown(), ShutdownReason::Now);
        assert!(c.is_critical());
        assert_eq!(c.poll(42_000), Outcome::CutPower);
    }

    #[test]
    fn low_after_critical_is_ignored() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        c.on_critical(0, HOST_UP, &mut a);
        assert_eq!(c.on_low(HOST_UP, &mut a), Outcome::Nothing);
        assert_eq!(a.shutdown(), ShutdownReason::Now);
        assert!(c.is_critical());
    }

    #[test]
    fn ready_without_request_only_beeps() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        assert_eq!(c.on_ready(false, &mut a), Outcome::Beep);
        assert_eq!(c.on_ready(true, &mut a), Outcome::CutPower);
    }

    #[test]
    fn ready_during_critical_cuts() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        c.on_critical(0, HOST_UP, &mut a);
        c.on_acknowledge();
        c.poll(ACK_WAIT_MS);
        assert_eq!(c.on_ready(false, &mut a), Outcome::CutPower);
    }

    #[test]
    fn recovery_withdraws_low_request() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        c.on_low(HOST_UP, &mut a);
        a.acknowledge();
        assert!(c.on_battery_recovered(&mut a));
        assert_eq!(a.shutdown(), ShutdownReason::None);
        assert!(a.is_pending());
        assert_eq!(c.phase(), Phase::Idle);
        assert!(!c.on_battery_recovered(&mut a));
    }

    #[test]
    fn failed_power_off_returns_to_idle() {
        let mut c = Coordinator::new();
        let mut a = alerts();
        c.on_critical(0, Host { powered: false, ..HOST_UP }, &mut a);
        c.on_power_off_failed();
        assert_eq!(c.phase(), Phase::Idle);
    }
}
