//! TMP275 board temperature sensor driver.

use core::marker::PhantomData;
use defmt::Format;
use embedded_hal::blocking::i2c;

/// Temperature register.
const REG_TEMP: u8 = 0x00;

/// Configuration register.
const REG_CONF: u8 = 0x01;

/// Configuration: 12-bit resolution, 2 consecutive faults for alert.
const CONF_12_BIT: u8 = 0b0111_0000;

/// TMP275 error.
#[derive(Clone, Copy, Format, PartialEq, Eq)]
pub enum Error {
    /// I2C communication error.
    I2c,
}

/// TMP275 instance.
pub struct Tmp275<I2C> {
    addr: u8,
    _i2c: PhantomData<I2C>,
}

impl<I2C> Tmp275<I2C>
where
    I2C: i2c::Write<i2c::SevenBitAddress> + i2c::WriteRead<i2c::SevenBitAddress>,
{
    /// Configures the sensor at `addr` for 12-bit conversion.
    pub fn new(i2c: &mut I2C, addr: u8) -> Result<Self, Error> {
        i2c.write(addr, &[REG_CONF, CONF_12_BIT]).map_err(|_| Error::I2c)?;
        defmt::info!("TMP275 at 0x{:x} configured", addr);
        Ok(Self { addr, _i2c: PhantomData })
    }

    /// Reads the temperature in 0.01 °C.
    pub fn temperature(&self, i2c: &mut I2C) -> Result<i16, Error> {
        let mut buf = [0; 2];
        i2c.write_read(self.addr, &[REG_TEMP], &mut buf).map_err(|_| Error::I2c)?;
        Ok(centi_celsius(buf))
    }
}

/// Converts the 12-bit left-aligned register value, 0.0625 °C per count.
fn centi_celsius(raw: [u8; 2]) -> i16 {
    let counts = i16::from_be_bytes(raw) >> 4;
    (counts as i32 * 625 / 100) as i16
}
