//! Wall clock set by the host.

use byteorder::{ByteOrder, LittleEndian};

use crate::{reg::RTC_LEN, Millis};

/// Length of a packed timestamp.
pub const STAMP_LEN: usize = 10;

/// Calendar date and time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    /// Day of week, 0 is Sunday.
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    /// Decodes the set-clock register value.
    pub fn unpack(buf: &[u8]) -> Option<Self> {
        if buf.len() != RTC_LEN {
            return None;
        }
        let dt = Self {
            year: LittleEndian::read_u16(buf),
            month: buf[2],
            day: buf[3],
            weekday: buf[4],
            hour: buf[5],
            minute: buf[6],
            second: buf[7],
        };
        dt.is_valid().then_some(dt)
    }

    /// Set-clock register value.
    pub fn pack(&self) -> [u8; RTC_LEN] {
        let mut buf = [0; RTC_LEN];
        LittleEndian::write_u16(&mut buf, self.year);
        buf[2..8].copy_from_slice(&[self.month, self.day, self.weekday, self.hour, self.minute, self.second]);
        buf
    }

    fn is_valid(&self) -> bool {
        (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && self.weekday < 7
            && self.hour < 24
            && self.minute < 60
            && self.second < 60
    }

    /// Minute of the day.
    pub fn minute_of_day(&self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }

    /// Minutes since 1970-01-01 00:00.
    pub fn epoch_minutes(&self) -> i64 {
        let days = days_from_civil(i64::from(self.year), self.month.into(), self.day.into());
        days * 1440 + i64::from(self.minute_of_day())
    }

    /// Date and time at the start of the given minute since the epoch.
    pub fn from_epoch_minutes(minutes: i64) -> Self {
        let days = minutes.div_euclid(1440);
        let minute_of_day = minutes.rem_euclid(1440);
        let (year, month, day) = civil_from_days(days);
        Self {
            year: year as u16,
            month: month as u8,
            day: day as u8,
            weekday: (days + 4).rem_euclid(7) as u8,
            hour: (minute_of_day / 60) as u8,
            minute: (minute_of_day % 60) as u8,
            second: 0,
        }
    }

    /// Packed timestamp with minute resolution.
    pub fn stamp(&self) -> [u8; STAMP_LEN] {
        let mut buf = [0; STAMP_LEN];
        LittleEndian::write_u16_into(
            &[self.year, self.month.into(), self.day.into(), self.hour.into(), self.minute.into()],
            &mut buf,
        );
        buf
    }

    /// Decodes a packed timestamp.
    pub fn from_stamp(buf: &[u8]) -> Option<Self> {
        if buf.len() != STAMP_LEN {
            return None;
        }
        let mut v = [0; 5];
        LittleEndian::read_u16_into(buf, &mut v);
        let narrow = |x: u16| u8::try_from(x).ok();
        let mut dt = Self {
            year: v[0],
            month: narrow(v[1])?,
            day: narrow(v[2])?,
            weekday: 0,
            hour: narrow(v[3])?,
            minute: narrow(v[4])?,
            second: 0,
        };
        if !dt.is_valid() {
            return None;
        }
        dt.weekday = Self::from_epoch_minutes(dt.epoch_minutes()).weekday;
        Some(dt)
    }
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Wall clock running from the monotonic timer once synchronized.
#[derive(Clone, Copy, Debug, Default)]
pub struct Clock {
    sync: Option<(DateTime, Millis)>,
}

impl Clock {
    pub const fn new() -> Self {
        Self { sync: None }
    }

    /// Sets the clock. Returns whether this is the first synchronization.
    pub fn set(&mut self, dt: DateTime, now: Millis) -> bool {
        self.sync.replace((dt, now)).is_none()
    }

    pub fn is_synced(&self) -> bool {
        self.sync.is_some()
    }

    /// Current date and time at minute resolution.
    pub fn now(&self, now: Millis) -> Option<DateTime> {
        let (base, at) = self.sync?;
        let elapsed_s = now.saturating_sub(at) / 1000 + u64::from(base.second);
        let minutes = base.epoch_minutes() + (elapsed_s / 60) as i64;
        let mut dt = DateTime::from_epoch_minutes(minutes);
        dt.second = (elapsed_s % 60) as u8;
        Some(dt)
    }

    /// Current minute of the day.
    pub fn minute_of_day(&self, now: Millis) -> Option<u16> {
        self.now(now).map(|dt| dt.minute_of_day())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(year: u16, month: u8, day: u8, hour: u8, minute: u8) -> DateTime {
        let mut dt = DateTime { year, month, day, weekday: 0, hour, minute, second: 0 };
        dt.weekday = DateTime::from_epoch_minutes(dt.epoch_minutes()).weekday;
        dt
    }

    #[test]
    fn epoch() {
        assert_eq!(dt(1970, 1, 1, 0, 0).epoch_minutes(), 0);
        assert_eq!(dt(1970, 1, 2, 0, 1).epoch_minutes(), 1441);
        // Thursday
        assert_eq!(DateTime::from_epoch_minutes(0).weekday, 4);
        // Leap day.
        let leap = dt(2024, 2, 29, 23, 59);
        assert_eq!(DateTime::from_epoch_minutes(leap.epoch_minutes()), leap);
        assert_eq!(dt(2024, 3, 1, 0, 0).epoch_minutes() - leap.epoch_minutes(), 1);
    }

    #[test]
    fn register_value() {
        let buf = [0xe8, 0x07, 10, 18, 0, 14, 5, 30, 0];
        let dt = DateTime::unpack(&buf).unwrap();
        assert_eq!(dt.year, 2024);
        assert_eq!(dt.minute_of_day(), 14 * 60 + 5);
        assert_eq!(dt.pack(), buf);
        assert_eq!(DateTime::unpack(&[0xe8, 0x07, 13, 1, 0, 0, 0, 0, 0]), None);
        assert_eq!(DateTime::unpack(&buf[..8]), None);
    }

    #[test]
    fn stamp() {
        let d = dt(2024, 10, 18, 14, 5);
        let stamp = d.stamp();
        assert_eq!(&stamp[..2], &2024u16.to_le_bytes());
        assert_eq!(&stamp[8..], &5u16.to_le_bytes());
        assert_eq!(DateTime::from_stamp(&stamp), Some(d));
        assert_eq!(DateTime::from_stamp(&[0xff; STAMP_LEN]), None);
    }

    #[test]
    fn clock_runs_after_sync() {
        let mut clock = Clock::new();
        assert_eq!(clock.minute_of_day(1000), None);
        let mut start = dt(2024, 12, 31, 23, 59);
        start.second = 30;
        assert!(clock.set(start, 1000));
        assert_eq!(clock.minute_of_day(1000), Some(23 * 60 + 59));
        let later = clock.now(1000 + 31_000).unwrap();
        assert_eq!((later.year, later.month, later.day, later.minute_of_day()), (2025, 1, 1, 0));
        assert_eq!(later.second, 1);
        assert!(!clock.set(start, 2000));
    }
}
