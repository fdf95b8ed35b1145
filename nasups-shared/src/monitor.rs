//! Power and battery monitor.
//!
//! Classifies the averaged ADC readings with hysteresis and runs the
//! debounce timers that escalate a discharged battery into a shutdown.
//! The monitor only reports [events](Event); acting on them is up to the
//! [controller](crate::controller).

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::{
    average::Average,
    config::{BatteryCfg, SUPPLY_OFF_LEVEL_MV},
    reg::MAIN_LEN,
    timer::DebounceTimer,
    token::{BatteryPresence, Overvoltage, PowerSource},
    Millis,
};

/// Number of samples averaged per channel.
pub const AVERAGE_WINDOW: usize = 6;

/// Overvoltage hysteresis in mV.
pub const OVERVOLTAGE_HYSTERESIS_MV: u16 = 10;

/// Charge-full hysteresis in mA.
pub const FLOAT_HYSTERESIS_MA: u16 = 2;

/// Time the battery must stay at or below the critical level.
pub const CRITICAL_DELAY_MS: Millis = 10_000;

/// Time the battery must stay at or below the low level.
pub const LOW_DELAY_MS: Millis = 20_000;

/// Monitor tick period.
pub const TICK_MS: Millis = 1_000;

/// One set of converted readings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    /// Battery voltage in mV.
    pub vbat: u16,
    /// Supply voltage in mV.
    pub vps: u16,
    /// System voltage in mV.
    pub vsys: u16,
    /// Charge current in mA.
    pub ichg: u16,
}

/// Debounce timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timer {
    Critical,
    Low,
}

/// State change detected by a monitor tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    PowerSource(PowerSource),
    Battery(BatteryPresence),
    Overvoltage(Overvoltage),
    ChargeFull(bool),
    Armed(Timer),
    Disarmed(Timer),
    Fired(Timer),
}

/// Events of one tick.
pub type Events = Vec<Event, 16>;

/// Status LED color.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Led {
    Green,
    Orange,
    Red,
}

/// Power and battery monitor.
pub struct Monitor {
    vbat: Average<AVERAGE_WINDOW>,
    vps: Average<AVERAGE_WINDOW>,
    vsys: Average<AVERAGE_WINDOW>,
    ichg: Average<AVERAGE_WINDOW>,
    avg: Sample,
    power: PowerSource,
    battery: BatteryPresence,
    overvoltage: Overvoltage,
    full: bool,
    critical: DebounceTimer,
    low: DebounceTimer,
}

fn power_of(sample: &Sample) -> PowerSource {
    if sample.vps > SUPPLY_OFF_LEVEL_MV {
        PowerSource::On
    } else {
        PowerSource::Off
    }
}

fn battery_of(sample: &Sample, cfg: &BatteryCfg) -> BatteryPresence {
    if sample.vbat > cfg.disconnected {
        BatteryPresence::On
    } else {
        BatteryPresence::Off
    }
}

impl Monitor {
    /// Creates the monitor classified from the first sample.
    pub fn new(first: Sample, cfg: &BatteryCfg) -> Self {
        let mut this = Self {
            vbat: Average::new(),
            vps: Average::new(),
            vsys: Average::new(),
            ichg: Average::new(),
            avg: first,
            power: power_of(&first),
            battery: battery_of(&first, cfg),
            overvoltage: Overvoltage::Clear,
            full: first.ichg <= cfg.float_current.saturating_sub(FLOAT_HYSTERESIS_MA),
            critical: DebounceTimer::new(CRITICAL_DELAY_MS),
            low: DebounceTimer::new(LOW_DELAY_MS),
        };
        if first.vbat >= cfg.overvoltage.saturating_add(OVERVOLTAGE_HYSTERESIS_MV) {
            this.overvoltage = Overvoltage::Set;
        }
        this.add(first);
        this
    }

    fn add(&mut self, sample: Sample) {
        self.avg = Sample {
            vbat: self.vbat.add(sample.vbat),
            vps: self.vps.add(sample.vps),
            vsys: self.vsys.add(sample.vsys),
            ichg: self.ichg.add(sample.ichg),
        };
    }

    /// Processes one sample taken at `now`.
    pub fn tick(&mut self, now: Millis, sample: Sample, cfg: &BatteryCfg) -> Events {
        let mut events = Events::new();
        let mut push = |event| {
            let _ = events.push(event);
        };

        // Presence follows the instantaneous reading and restarts the filters.
        let power = power_of(&sample);
        if power != self.power {
            self.power = power;
            self.vps.reset();
            self.vbat.reset();
            self.ichg.reset();
            push(Event::PowerSource(power));
        }
        let battery = battery_of(&sample, cfg);
        let battery_changed = battery != self.battery;
        if battery_changed {
            self.battery = battery;
            self.vbat.reset();
            self.ichg.reset();
            push(Event::Battery(battery));
        }

        self.add(sample);
        let Sample { vbat, ichg, .. } = self.avg;

        match self.overvoltage {
            Overvoltage::Clear if vbat >= cfg.overvoltage.saturating_add(OVERVOLTAGE_HYSTERESIS_MV) => {
                self.overvoltage = Overvoltage::Set;
                push(Event::Overvoltage(Overvoltage::Set));
            }
            Overvoltage::Set if vbat <= cfg.overvoltage.saturating_sub(OVERVOLTAGE_HYSTERESIS_MV) => {
                self.overvoltage = Overvoltage::Clear;
                push(Event::Overvoltage(Overvoltage::Clear));
            }
            _ => (),
        }

        if self.full && ichg >= cfg.float_current.saturating_add(FLOAT_HYSTERESIS_MA) {
            self.full = false;
            push(Event::ChargeFull(false));
        } else if !self.full && ichg <= cfg.float_current.saturating_sub(FLOAT_HYSTERESIS_MA) {
            self.full = true;
            push(Event::ChargeFull(true));
        }

        // Critical first, so it wins when both expire in the same tick.
        if self.critical.poll(now) {
            push(Event::Fired(Timer::Critical));
        }
        if self.low.poll(now) {
            push(Event::Fired(Timer::Low));
        }

        let present = battery == BatteryPresence::On;
        if (!present || vbat > cfg.critical) && self.critical.disarm() {
            push(Event::Disarmed(Timer::Critical));
        }
        if (!present || vbat > cfg.low) && self.low.disarm() {
            push(Event::Disarmed(Timer::Low));
        }

        if present && !battery_changed {
            if vbat <= cfg.critical && self.critical.arm(now) {
                push(Event::Armed(Timer::Critical));
            }
            if vbat <= cfg.low && self.low.arm(now) {
                push(Event::Armed(Timer::Low));
            }
        }

        events
    }

    /// Averaged readings.
    pub fn averages(&self) -> Sample {
        self.avg
    }

    pub fn power(&self) -> PowerSource {
        self.power
    }

    pub fn battery(&self) -> BatteryPresence {
        self.battery
    }

    pub fn overvoltage(&self) -> Overvoltage {
        self.overvoltage
    }

    /// Whether the battery is fully charged.
    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        match timer {
            Timer::Critical => self.critical.is_armed(),
            Timer::Low => self.low.is_armed(),
        }
    }

    /// Status LED color for the current state.
    pub fn led(&self, cfg: &BatteryCfg) -> Led {
        let Sample { vbat, ichg, .. } = self.avg;
        if self.power == PowerSource::On && vbat > cfg.low && self.full {
            Led::Green
        } else if vbat <= cfg.low || ichg >= cfg.bulk_current || self.overvoltage == Overvoltage::Set {
            Led::Red
        } else {
            Led::Orange
        }
    }
}

/// Main status register value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MainStatus {
    pub vbat: u16,
    pub vps: u16,
    pub vsys: u16,
    pub ichg: u16,
    pub fan_rpm: u16,
    /// Fan duty in percent.
    pub fan_duty: u8,
    /// Board temperature in 0.01 °C.
    pub temperature: i16,
}

impl MainStatus {
    pub fn encode(&self) -> [u8; MAIN_LEN] {
        let mut buf = [0; MAIN_LEN];
        LittleEndian::write_u16_into(&[self.vbat, self.vps, self.vsys, self.ichg, self.fan_rpm], &mut buf[..10]);
        buf[10] = self.fan_duty;
        LittleEndian::write_i16(&mut buf[11..], self.temperature);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != MAIN_LEN {
            return None;
        }
        let mut v = [0; 5];
        LittleEndian::read_u16_into(&buf[..10], &mut v);
        Some(Self {
            vbat: v[0],
            vps: v[1],
            vsys: v[2],
            ichg: v[3],
            fan_rpm: v[4],
            fan_duty: buf[10],
            temperature: LittleEndian::read_i16(&buf[11..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINS: u16 = 19_000;

    fn sample(vbat: u16, vps: u16) -> Sample {
        Sample { vbat, vps, vsys: 5_000, ichg: 50 }
    }

    /// Feeds one sample per second starting at `*t`.
    fn run(mon: &mut Monitor, t: &mut Millis, s: Sample, secs: u32) -> std::vec::Vec<(Millis, Event)> {
        let cfg = BatteryCfg::default();
        let mut out = std::vec::Vec::new();
        for _ in 0..secs {
            *t += TICK_MS;
            out.extend(mon.tick(*t, s, &cfg).into_iter().map(|e| (*t, e)));
        }
        out
    }

    fn has(events: &[(Millis, Event)], event: Event) -> bool {
        events.iter().any(|(_, e)| *e == event)
    }

    #[test]
    fn no_transition_at_boot() {
        let cfg = BatteryCfg::default();
        let mut mon = Monitor::new(sample(12_800, MAINS), &cfg);
        assert_eq!(mon.power(), PowerSource::On);
        assert_eq!(mon.battery(), BatteryPresence::On);
        assert!(mon.tick(TICK_MS, sample(12_800, MAINS), &cfg).is_empty());
    }

    #[test]
    fn power_loss_reseeds_filters() {
        let cfg = BatteryCfg::default();
        let mut mon = Monitor::new(sample(12_800, MAINS), &cfg);
        let events = mon.tick(TICK_MS, sample(12_400, 12_300), &cfg);
        assert_eq!(events.as_slice(), &[Event::PowerSource(PowerSource::Off)]);
        assert_eq!(mon.averages().vps, 12_300);
        assert_eq!(mon.averages().vbat, 12_400);
    }

    #[test]
    fn battery_disconnect_disarms_and_blocks_arming() {
        let cfg = BatteryCfg::default();
        let mut t = 0;
        let mut mon = Monitor::new(sample(11_000, 0), &cfg);
        let events = run(&mut mon, &mut t, sample(11_000, 0), 1);
        assert!(has(&events, Event::Armed(Timer::Critical)));

        let events = run(&mut mon, &mut t, sample(1_000, 0), 1);
        assert!(has(&events, Event::Battery(BatteryPresence::Off)));
        assert!(has(&events, Event::Disarmed(Timer::Critical)));
        assert!(has(&events, Event::Disarmed(Timer::Low)));

        // Reconnected below critical: no arming in the same tick.
        let events = run(&mut mon, &mut t, sample(11_000, 0), 1);
        assert_eq!(events, [(t, Event::Battery(BatteryPresence::On))]);
        let events = run(&mut mon, &mut t, sample(11_000, 0), 1);
        assert!(has(&events, Event::Armed(Timer::Critical)));
    }

    #[test]
    fn overvoltage_dead_band() {
        let cfg = BatteryCfg::default();
        let mut t = 0;
        let mut mon = Monitor::new(sample(13_000, MAINS), &cfg);
        let events = run(&mut mon, &mut t, sample(13_910, MAINS), 10);
        assert!(has(&events, Event::Overvoltage(Overvoltage::Set)));

        for v in [13_905, 13_891, 13_900, 13_909] {
            let events = run(&mut mon, &mut t, sample(v, MAINS), 10);
            assert!(events.is_empty(), "{v}: {events:?}");
            assert_eq!(mon.overvoltage(), Overvoltage::Set);
        }

        let events = run(&mut mon, &mut t, sample(13_890, MAINS), 10);
        assert!(has(&events, Event::Overvoltage(Overvoltage::Clear)));
    }

    #[test]
    fn charge_full_hysteresis() {
        let cfg = BatteryCfg::default();
        let mut t = 0;
        let mut mon = Monitor::new(Sample { ichg: 500, ..sample(13_000, MAINS) }, &cfg);
        assert!(!mon.is_full());
        let events = run(&mut mon, &mut t, Sample { ichg: 8, ..sample(13_000, MAINS) }, 10);
        assert!(has(&events, Event::ChargeFull(true)));
        let events = run(&mut mon, &mut t, Sample { ichg: 11, ..sample(13_000, MAINS) }, 10);
        assert!(events.is_empty());
        let events = run(&mut mon, &mut t, Sample { ichg: 12, ..sample(13_000, MAINS) }, 10);
        assert!(has(&events, Event::ChargeFull(false)));
    }

    #[test]
    fn critical_dip_shorter_than_delay_does_not_fire() {
        let cfg = BatteryCfg::default();
        let mut t = 0;
        let mut mon = Monitor::new(sample(11_000, 0), &cfg);
        let mut events = run(&mut mon, &mut t, sample(11_000, 0), 1);
        let armed_at = t;
        assert!(has(&events, Event::Armed(Timer::Critical)));

        events.extend(run(&mut mon, &mut t, sample(11_000, 0), 8));
        assert_eq!(t, armed_at + 8_000);
        // One sample this high lifts the average above critical.
        events.extend(run(&mut mon, &mut t, sample(15_000, 0), 1));
        assert_eq!(t, armed_at + 9_000);
        assert!(has(&events, Event::Disarmed(Timer::Critical)));

        events.extend(run(&mut mon, &mut t, sample(12_500, 0), 30));
        assert!(!has(&events, Event::Fired(Timer::Critical)));
        assert!(!mon.is_armed(Timer::Critical));
    }

    #[test]
    fn sustained_critical_fires_once_per_arming() {
        let cfg = BatteryCfg::default();
        let mut t = 0;
        let mut mon = Monitor::new(sample(11_000, 0), &cfg);
        let events = run(&mut mon, &mut t, sample(11_000, 0), 10);
        assert!(!has(&events, Event::Fired(Timer::Critical)));
        let events = run(&mut mon, &mut t, sample(11_000, 0), 1);
        let fired: std::vec::Vec<_> =
            events.iter().filter(|(_, e)| *e == Event::Fired(Timer::Critical)).collect();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, 11_000);
    }

    #[test]
    fn critical_wins_same_tick() {
        let cfg = BatteryCfg::default();
        let mut t = 0;
        let mut mon = Monitor::new(sample(11_700, 0), &cfg);
        let events = run(&mut mon, &mut t, sample(11_700, 0), 1);
        assert!(has(&events, Event::Armed(Timer::Low)));
        assert!(!mon.is_armed(Timer::Critical));

        run(&mut mon, &mut t, sample(11_700, 0), 9);
        let events = run(&mut mon, &mut t, sample(10_000, 0), 1);
        assert!(has(&events, Event::Armed(Timer::Critical)));

        let events = run(&mut mon, &mut t, sample(10_000, 0), 10);
        let fired: std::vec::Vec<_> =
            events.iter().filter(|(_, e)| matches!(e, Event::Fired(_))).map(|(t, e)| (*t, *e)).collect();
        assert_eq!(fired, [(21_000, Event::Fired(Timer::Critical)), (21_000, Event::Fired(Timer::Low))]);
    }

    #[test]
    fn led_colors() {
        let cfg = BatteryCfg::default();
        let full = Sample { ichg: 0, ..sample(13_000, MAINS) };
        assert_eq!(Monitor::new(full, &cfg).led(&cfg), Led::Green);
        assert_eq!(Monitor::new(sample(11_500, MAINS), &cfg).led(&cfg), Led::Red);
        assert_eq!(Monitor::new(Sample { ichg: 1_000, ..full }, &cfg).led(&cfg), Led::Red);
        assert_eq!(Monitor::new(sample(12_500, 0), &cfg).led(&cfg), Led::Orange);
    }

    #[test]
    fn main_status_layout() {
        let status = MainStatus { vbat: 12_800, temperature: -150, fan_duty: 35, ..Default::default() };
        let buf = status.encode();
        assert_eq!(&buf[..2], &12_800u16.to_le_bytes());
        assert_eq!(buf[10], 35);
        assert_eq!(&buf[11..], &(-150i16).to_le_bytes());
        assert_eq!(MainStatus::decode(&buf), Some(status));
    }
}
