//! Watchdog management.

use rp2040_hal::{fugit::MicrosDurationU32, Watchdog};
use systick_monotonic::ExtU64;

use crate::{app::monotonics, Duration, Instant};

/// Watchdog manager.
///
/// Pets the hardware watchdog as long as the power monitor keeps running.
pub struct Watchman {
    dog: Watchdog,
    last_checkin: Instant,
}

impl Watchman {
    /// Hardware watchdog period.
    const PERIOD_SECS: u32 = 3;

    /// Starts the hardware watchdog.
    pub fn new(mut dog: Watchdog) -> Self {
        dog.start(MicrosDurationU32::secs(Self::PERIOD_SECS));
        dog.feed();

        Self { dog, last_checkin: monotonics::now() }
    }

    /// Necessary watchdog pet interval.
    pub fn pet_interval() -> Duration {
        1u64.secs()
    }

    /// Longest time the monitor may stay silent.
    fn checkin_timeout() -> Duration {
        10u64.secs()
    }

    /// Monitor reports that it is alive.
    pub fn checkin(&mut self) {
        self.last_checkin = monotonics::now();
    }

    /// Pets the hardware watchdog, if the monitor is alive.
    ///
    /// Returns whether petting was possible.
    pub fn pet_hardware_watchdog(&mut self) -> bool {
        match monotonics::now().checked_duration_since(self.last_checkin) {
            Some(elapsed) if elapsed <= Self::checkin_timeout() => {
                defmt::trace!("petting hardware watchdog");
                self.dog.feed();
                true
            }
            _ if option_env!("DISABLE_WATCHDOG").is_some() => {
                defmt::warn!("petting hardware watchdog because watchdog is disabled");
                self.dog.feed();
                true
            }
            _ => {
                defmt::error!("monitor stalled, cannot pet hardware watchdog");
                false
            }
        }
    }
}
