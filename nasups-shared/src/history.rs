//! Telemetry history.
//!
//! Two channels of one sample per minute over 24 hours, kept in the wire
//! layout used by the bulk transfer: channel 1, channel 2, cursor.

use byteorder::{ByteOrder, LittleEndian};

use crate::{clock::DateTime, Millis};

/// Samples per channel.
pub const CAPACITY: usize = 1440;

/// Bytes per channel.
pub const CHANNEL_LEN: usize = CAPACITY * 2;

/// Length of the buffer including the cursor.
pub const BUFFER_LEN: usize = 2 * CHANNEL_LEN + 2;

/// Sampling period.
pub const SAMPLE_PERIOD_MS: Millis = 60_000;

/// History error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Snapshot is too old or from the future.
    Stale,
    /// Buffer length or cursor is invalid.
    Corrupt,
}

/// Circular two-channel history.
#[derive(Clone)]
pub struct History {
    buf: [u8; BUFFER_LEN],
    /// Byte offset of the next write within a channel.
    cursor: usize,
    /// Samples recorded since creation, saturating at capacity.
    live: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    /// Creates an empty history.
    pub const fn new() -> Self {
        Self { buf: [0; BUFFER_LEN], cursor: 0, live: 0 }
    }

    /// Loads a buffer in wire layout.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() != BUFFER_LEN {
            return Err(Error::Corrupt);
        }
        let cursor = LittleEndian::read_u16(&data[2 * CHANNEL_LEN..]) as usize;
        if cursor % 2 != 0 || cursor >= CHANNEL_LEN {
            return Err(Error::Corrupt);
        }
        let mut buf = [0; BUFFER_LEN];
        buf.copy_from_slice(data);
        Ok(Self { buf, cursor, live: 0 })
    }

    /// Buffer in wire layout.
    pub fn as_bytes(&self) -> &[u8; BUFFER_LEN] {
        &self.buf
    }

    /// Byte offset of the next write.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of samples recorded since boot.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Appends a sample, overwriting the oldest one.
    pub fn push(&mut self, ch1: u16, ch2: u16) {
        LittleEndian::write_u16(&mut self.buf[self.cursor..], ch1);
        LittleEndian::write_u16(&mut self.buf[CHANNEL_LEN + self.cursor..], ch2);
        self.cursor = (self.cursor + 2) % CHANNEL_LEN;
        LittleEndian::write_u16(&mut self.buf[2 * CHANNEL_LEN..], self.cursor as u16);
        self.live = (self.live + 1).min(CAPACITY);
    }

    /// Sample `age` positions before the newest, which has age 0.
    pub fn get(&self, age: usize) -> Option<(u16, u16)> {
        if age >= CAPACITY {
            return None;
        }
        let pos = (self.cursor + CHANNEL_LEN - 2 * (age + 1)) % CHANNEL_LEN;
        Some((LittleEndian::read_u16(&self.buf[pos..]), LittleEndian::read_u16(&self.buf[CHANNEL_LEN + pos..])))
    }

    /// All samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        (0..CAPACITY).rev().filter_map(|age| self.get(age))
    }

    /// Rebuilds the history from a snapshot taken at `stamp`.
    ///
    /// The gap between the snapshot and the samples recorded since boot is
    /// filled with the newest snapshot value.
    pub fn restore(&mut self, snapshot: &[u8], stamp: DateTime, now: DateTime) -> Result<(), Error> {
        let elapsed = now.epoch_minutes() - stamp.epoch_minutes();
        if !(0..CAPACITY as i64).contains(&elapsed) {
            return Err(Error::Stale);
        }

        let mut restored = Self::from_bytes(snapshot)?;
        let (ch1, ch2) = restored.get(0).unwrap_or_default();
        for _ in 0..(elapsed as usize).saturating_sub(self.live) {
            restored.push(ch1, ch2);
        }
        for age in (0..self.live).rev() {
            if let Some((ch1, ch2)) = self.get(age) {
                restored.push(ch1, ch2);
            }
        }
        restored.live = self.live;

        *self = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u8, minute: u8) -> DateTime {
        DateTime { year: 2024, month: 10, day: 18, weekday: 5, hour, minute, second: 0 }
    }

    #[test]
    fn cursor_stays_in_range() {
        let mut h = History::new();
        for i in 0..3 * CAPACITY + 7 {
            h.push(i as u16, 0);
            assert!(h.cursor() < CHANNEL_LEN);
            assert_eq!(h.cursor() % 2, 0);
            assert_eq!(LittleEndian::read_u16(&h.as_bytes()[2 * CHANNEL_LEN..]) as usize, h.cursor());
        }
    }

    #[test]
    fn full_lap_overwrites_oldest() {
        let mut h = History::new();
        for i in 0..CAPACITY as u16 {
            h.push(i, 1000 + i);
        }
        assert_eq!(h.iter().next(), Some((0, 1000)));
        h.push(5000, 6000);
        assert_eq!(h.iter().next(), Some((1, 1001)));
        assert_eq!(h.get(0), Some((5000, 6000)));
        assert_eq!(h.iter().count(), CAPACITY);
    }

    #[test]
    fn wire_layout() {
        let mut h = History::new();
        h.push(0x1234, 0xabcd);
        let buf = h.as_bytes();
        assert_eq!(buf.len(), 5762);
        assert_eq!(&buf[0..2], &[0x34, 0x12]);
        assert_eq!(&buf[CHANNEL_LEN..CHANNEL_LEN + 2], &[0xcd, 0xab]);
        assert_eq!(&buf[5760..], &[2, 0]);
    }

    #[test]
    fn restore_pads_gap() {
        let mut old = History::new();
        for v in 1..=10 {
            old.push(v, v * 10);
        }
        let snapshot = *old.as_bytes();

        let mut h = History::new();
        h.push(100, 1000);
        h.push(101, 1010);
        h.restore(&snapshot, at(12, 0), at(12, 5)).unwrap();

        let tail: Vec<_> = (0..7).rev().map(|age| h.get(age).unwrap()).collect();
        assert_eq!(tail, [(9, 90), (10, 100), (10, 100), (10, 100), (10, 100), (100, 1000), (101, 1010)]);
        assert_eq!(h.live(), 2);
    }

    #[test]
    fn restore_rejects_stale_snapshot() {
        let snapshot = *History::new().as_bytes();
        let mut h = History::new();
        assert_eq!(h.restore(&snapshot, at(12, 0), at(11, 59)), Err(Error::Stale));
        let next_day = DateTime { day: 19, ..at(12, 0) };
        assert_eq!(h.restore(&snapshot, at(12, 0), next_day), Err(Error::Stale));
        assert!(h.restore(&snapshot, at(12, 1), next_day).is_ok());
    }

    #[test]
    fn corrupt_cursor() {
        let mut snapshot = *History::new().as_bytes();
        snapshot[5760] = 3;
        assert!(History::from_bytes(&snapshot).is_err());
        snapshot[5760..].copy_from_slice(&2880u16.to_le_bytes());
        assert!(History::from_bytes(&snapshot).is_err());
        assert!(History::from_bytes(&snapshot[..100]).is_err());
    }
}
