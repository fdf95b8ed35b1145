//! Runtime settings pushed by the host.

use byteorder::{ByteOrder, LittleEndian};

use crate::reg::{BAT_CFG_LEN, BAT_LOW_LEN, FAN_CFG_LEN, SILENT_CFG_LEN};

/// Supply voltage in mV at or below which mains power is considered off.
pub const SUPPLY_OFF_LEVEL_MV: u16 = 13_000;

/// Settings error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Register value has wrong length.
    Length { expected: usize, got: usize },
    /// Values are inconsistent.
    Invalid,
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), Error> {
    if buf.len() == expected {
        Ok(())
    } else {
        Err(Error::Length { expected, got: buf.len() })
    }
}

/// Battery thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryCfg {
    /// Overvoltage warning level in mV.
    pub overvoltage: u16,
    /// Level in mV at which output is restored after a low battery power off.
    pub autostart: u16,
    /// Low battery level in mV, the host is asked to shut down.
    pub low: u16,
    /// Critical level in mV, power is cut unconditionally.
    pub critical: u16,
    /// Level in mV below which the battery is considered disconnected.
    pub disconnected: u16,
    /// Minimum charge current in mA of the bulk charging stage.
    pub bulk_current: u16,
    /// Maximum charge current in mA of a fully charged battery.
    pub float_current: u16,
}

impl Default for BatteryCfg {
    fn default() -> Self {
        Self {
            overvoltage: 13_900,
            autostart: 12_500,
            low: 11_800,
            critical: 11_500,
            disconnected: 5_000,
            bulk_current: 900,
            float_current: 10,
        }
    }
}

impl BatteryCfg {
    /// Register value of the battery configuration.
    pub fn encode(&self) -> [u8; BAT_CFG_LEN] {
        let mut buf = [0; BAT_CFG_LEN];
        LittleEndian::write_u16_into(
            &[
                self.overvoltage,
                self.autostart,
                self.critical,
                self.disconnected,
                self.bulk_current,
                self.float_current,
                self.low,
            ],
            &mut buf,
        );
        buf
    }

    /// Decodes the register value of the battery configuration.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        check_len(buf, BAT_CFG_LEN)?;
        let mut v = [0; BAT_CFG_LEN / 2];
        LittleEndian::read_u16_into(buf, &mut v);
        Ok(Self {
            overvoltage: v[0],
            autostart: v[1],
            critical: v[2],
            disconnected: v[3],
            bulk_current: v[4],
            float_current: v[5],
            low: v[6],
        })
    }

    /// Checks the ordering of the thresholds.
    pub fn validate(&self) -> Result<(), Error> {
        let ordered = self.disconnected < self.critical
            && self.critical <= self.low
            && self.low < self.overvoltage
            && self.float_current <= self.bulk_current;
        if ordered {
            Ok(())
        } else {
            Err(Error::Invalid)
        }
    }
}

/// Fan control table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FanCfg {
    /// Duty follows temperature, otherwise fixed duty is used.
    pub auto: bool,
    /// Temperature in 0.01 °C at which low duty applies.
    pub low_temp: u16,
    /// Temperature in 0.01 °C at which high duty applies.
    pub high_temp: u16,
    /// Duty in percent at low temperature.
    pub low_duty: u16,
    /// Duty in percent at high temperature.
    pub high_duty: u16,
    /// Duty in percent when not in auto mode.
    pub fixed_duty: u16,
}

impl Default for FanCfg {
    fn default() -> Self {
        Self { auto: true, low_temp: 3150, high_temp: 3350, low_duty: 20, high_duty: 100, fixed_duty: 35 }
    }
}

impl FanCfg {
    pub fn encode(&self) -> [u8; FAN_CFG_LEN] {
        let mut buf = [0; FAN_CFG_LEN];
        buf[0] = self.auto.into();
        LittleEndian::write_u16_into(
            &[self.low_temp, self.high_temp, self.low_duty, self.high_duty, self.fixed_duty],
            &mut buf[1..],
        );
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        check_len(buf, FAN_CFG_LEN)?;
        let mut v = [0; 5];
        LittleEndian::read_u16_into(&buf[1..], &mut v);
        let cfg = Self {
            auto: buf[0] != 0,
            low_temp: v[0],
            high_temp: v[1],
            low_duty: v[2],
            high_duty: v[3],
            fixed_duty: v[4],
        };
        let valid = cfg.low_temp < cfg.high_temp
            && cfg.low_duty <= cfg.high_duty
            && cfg.high_duty <= 100
            && cfg.fixed_duty <= 100;
        if valid {
            Ok(cfg)
        } else {
            Err(Error::Invalid)
        }
    }

    /// Fan duty in percent at temperature `temp` in 0.01 °C.
    ///
    /// In auto mode the fan is off up to the low temperature and the duty is
    /// rounded to 5 % steps on the ramp.
    pub fn duty(&self, temp: i16) -> u16 {
        if !self.auto {
            return self.fixed_duty;
        }
        let (t, lo, hi) = (i32::from(temp), i32::from(self.low_temp), i32::from(self.high_temp));
        if t <= lo {
            0
        } else if t >= hi {
            self.high_duty
        } else {
            let span = i32::from(self.high_duty) - i32::from(self.low_duty);
            let duty = i32::from(self.low_duty) + (t - lo) * span / (hi - lo);
            ((duty + 2) / 5 * 5) as u16
        }
    }
}

/// Silent mode window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SilentCfg {
    pub enabled: bool,
    pub start_hour: u16,
    pub start_minute: u16,
    pub stop_hour: u16,
    pub stop_minute: u16,
    /// Maximum fan duty in percent during silent mode.
    pub max_fan_duty: u16,
}

impl Default for SilentCfg {
    fn default() -> Self {
        Self { enabled: true, start_hour: 22, start_minute: 30, stop_hour: 8, stop_minute: 0, max_fan_duty: 40 }
    }
}

impl SilentCfg {
    pub fn encode(&self) -> [u8; SILENT_CFG_LEN] {
        let mut buf = [0; SILENT_CFG_LEN];
        buf[0] = self.enabled.into();
        LittleEndian::write_u16_into(
            &[self.start_hour, self.start_minute, self.stop_hour, self.stop_minute, self.max_fan_duty],
            &mut buf[1..],
        );
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        check_len(buf, SILENT_CFG_LEN)?;
        let mut v = [0; 5];
        LittleEndian::read_u16_into(&buf[1..], &mut v);
        let cfg = Self {
            enabled: buf[0] != 0,
            start_hour: v[0],
            start_minute: v[1],
            stop_hour: v[2],
            stop_minute: v[3],
            max_fan_duty: v[4],
        };
        let valid = cfg.start_hour < 24
            && cfg.stop_hour < 24
            && cfg.start_minute < 60
            && cfg.stop_minute < 60
            && cfg.max_fan_duty <= 100;
        if valid {
            Ok(cfg)
        } else {
            Err(Error::Invalid)
        }
    }

    /// Whether sounds may play at the given minute of the day.
    ///
    /// Without a synchronized clock sounds are always enabled.
    pub fn sound_enabled(&self, minute_of_day: Option<u16>) -> bool {
        let Some(now) = minute_of_day.filter(|_| self.enabled) else { return true };
        let start = self.start_hour * 60 + self.start_minute;
        let stop = self.stop_hour * 60 + self.stop_minute;
        if start < stop {
            now < start || now > stop
        } else {
            now < start && now > stop
        }
    }
}

/// All runtime settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Settings {
    pub battery: BatteryCfg,
    pub fan: FanCfg,
    pub silent: SilentCfg,
}

impl Settings {
    /// Size of the stored representation.
    pub const STORED_LEN: usize = BAT_CFG_LEN + FAN_CFG_LEN + SILENT_CFG_LEN;

    /// Applies the battery configuration register.
    ///
    /// Returns whether the settings changed.
    pub fn apply_battery(&mut self, buf: &[u8]) -> Result<bool, Error> {
        let battery = BatteryCfg::decode(buf)?;
        battery.validate()?;
        Ok(Self::replace(&mut self.battery, battery))
    }

    /// Applies the low battery level register.
    pub fn apply_battery_low(&mut self, buf: &[u8]) -> Result<bool, Error> {
        check_len(buf, BAT_LOW_LEN)?;
        let battery = BatteryCfg { low: LittleEndian::read_u16(buf), ..self.battery };
        battery.validate()?;
        Ok(Self::replace(&mut self.battery, battery))
    }

    /// Applies the fan configuration register.
    pub fn apply_fan(&mut self, buf: &[u8]) -> Result<bool, Error> {
        let fan = FanCfg::decode(buf)?;
        Ok(Self::replace(&mut self.fan, fan))
    }

    /// Applies the silent mode configuration register.
    pub fn apply_silent(&mut self, buf: &[u8]) -> Result<bool, Error> {
        let silent = SilentCfg::decode(buf)?;
        Ok(Self::replace(&mut self.silent, silent))
    }

    fn replace<T: PartialEq>(current: &mut T, new: T) -> bool {
        if *current == new {
            false
        } else {
            *current = new;
            true
        }
    }

    /// Stored representation.
    pub fn encode(&self) -> [u8; Self::STORED_LEN] {
        let mut buf = [0; Self::STORED_LEN];
        let (bat, rest) = buf.split_at_mut(BAT_CFG_LEN);
        let (fan, silent) = rest.split_at_mut(FAN_CFG_LEN);
        bat.copy_from_slice(&self.battery.encode());
        fan.copy_from_slice(&self.fan.encode());
        silent.copy_from_slice(&self.silent.encode());
        buf
    }

    /// Restores settings from their stored representation.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        check_len(buf, Self::STORED_LEN)?;
        let battery = BatteryCfg::decode(&buf[..BAT_CFG_LEN])?;
        battery.validate()?;
        Ok(Self {
            battery,
            fan: FanCfg::decode(&buf[BAT_CFG_LEN..BAT_CFG_LEN + FAN_CFG_LEN])?,
            silent: SilentCfg::decode(&buf[BAT_CFG_LEN + FAN_CFG_LEN..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_register_layout() {
        let cfg = BatteryCfg::default();
        let buf = cfg.encode();
        assert_eq!(&buf[0..2], &13_900u16.to_le_bytes());
        assert_eq!(&buf[4..6], &11_500u16.to_le_bytes());
        assert_eq!(&buf[12..14], &11_800u16.to_le_bytes());
        assert_eq!(BatteryCfg::decode(&buf), Ok(cfg));
    }

    #[test]
    fn same_config_twice_is_no_change() {
        let mut settings = Settings::default();
        let battery = BatteryCfg { critical: 11_400, ..Default::default() }.encode();
        assert_eq!(settings.apply_battery(&battery), Ok(true));
        assert_eq!(settings.apply_battery(&battery), Ok(false));

        let fan = FanCfg { auto: false, ..Default::default() }.encode();
        assert_eq!(settings.apply_fan(&fan), Ok(true));
        assert_eq!(settings.apply_fan(&fan), Ok(false));

        let silent = SilentCfg::default().encode();
        assert_eq!(settings.apply_silent(&silent), Ok(false));

        assert_eq!(settings.apply_battery_low(&11_900u16.to_le_bytes()), Ok(true));
        assert_eq!(settings.apply_battery_low(&11_900u16.to_le_bytes()), Ok(false));
        assert_eq!(settings.battery.low, 11_900);
    }

    #[test]
    fn battery_config_always_carries_low_level() {
        let mut settings = Settings::default();
        let buf = BatteryCfg { low: 12_000, ..Default::default() }.encode();
        assert_eq!(settings.apply_battery(&buf), Ok(true));
        assert_eq!(settings.battery.low, 12_000);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut settings = Settings::default();
        let buf = BatteryCfg { critical: 12_000, low: 11_800, ..Default::default() }.encode();
        assert_eq!(settings.apply_battery(&buf), Err(Error::Invalid));
        assert_eq!(settings.apply_battery(&buf[..12]), Err(Error::Length { expected: 14, got: 12 }));
        assert_eq!(settings.apply_battery_low(&4_000u16.to_le_bytes()), Err(Error::Invalid));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn silent_window_across_midnight() {
        let silent = SilentCfg::default();
        assert!(!silent.sound_enabled(Some(23 * 60)));
        assert!(!silent.sound_enabled(Some(7 * 60)));
        assert!(silent.sound_enabled(Some(12 * 60)));
        assert!(silent.sound_enabled(None));

        let disabled = SilentCfg { enabled: false, ..silent };
        assert!(disabled.sound_enabled(Some(23 * 60)));
    }

    #[test]
    fn silent_window_within_day() {
        let silent = SilentCfg { start_hour: 12, start_minute: 0, stop_hour: 14, ..Default::default() };
        assert!(!silent.sound_enabled(Some(13 * 60)));
        assert!(silent.sound_enabled(Some(15 * 60)));
    }

    #[test]
    fn fan_duty_ramp() {
        let fan = FanCfg::default();
        assert_eq!(fan.duty(3000), 0);
        assert_eq!(fan.duty(3150), 0);
        assert_eq!(fan.duty(3250), 60);
        assert_eq!(fan.duty(3160), 25);
        assert_eq!(fan.duty(3400), 100);
        assert_eq!(FanCfg { auto: false, ..fan }.duty(5000), 35);
    }

    #[test]
    fn stored_settings() {
        let settings = Settings { fan: FanCfg { fixed_duty: 50, ..Default::default() }, ..Default::default() };
        assert_eq!(Settings::decode(&settings.encode()), Ok(settings));
    }
}
