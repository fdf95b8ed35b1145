//! Linux I2C device access.

use i2cdev::{
    core::{I2CDevice, I2CMessage, I2CTransfer},
    linux::{LinuxI2CDevice, LinuxI2CError, LinuxI2CMessage},
};

use nasups_shared::bulk;

/// Controller on an I2C bus.
pub struct I2cDev {
    dev: LinuxI2CDevice,
}

impl I2cDev {
    /// Opens `/dev/i2c-<bus>` for the device at `addr`.
    pub fn open(bus: u32, addr: u16) -> Result<Self, LinuxI2CError> {
        let path = format!("/dev/i2c-{bus}");
        let dev = LinuxI2CDevice::new(&path, addr)?;
        log::debug!("opened {path} for device 0x{addr:02x}");
        Ok(Self { dev })
    }

    /// Writes `data` in one transaction.
    pub fn write(&mut self, data: &[u8]) -> Result<(), LinuxI2CError> {
        log::trace!("write {data:02x?}");
        self.dev.write(data)
    }

    /// Writes `data` and reads `buf.len()` bytes after a repeated start.
    pub fn write_read(&mut self, data: &[u8], buf: &mut [u8]) -> Result<(), LinuxI2CError> {
        let mut msgs = [LinuxI2CMessage::write(data), LinuxI2CMessage::read(buf)];
        self.dev.transfer(&mut msgs)?;
        log::trace!("write {data:02x?} read {buf:02x?}");
        Ok(())
    }

    /// Reads a register.
    pub fn read_reg(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), LinuxI2CError> {
        self.write_read(&[reg], buf)
    }

    /// Writes a register.
    pub fn write_reg(&mut self, reg: u8, value: &[u8]) -> Result<(), LinuxI2CError> {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.push(reg);
        data.extend_from_slice(value);
        self.write(&data)
    }
}

impl bulk::Link for I2cDev {
    type Error = LinuxI2CError;

    fn exchange(&mut self, signal: u8, block: &mut [u8]) -> Result<(), Self::Error> {
        self.write_read(&[signal], block)
    }

    fn signal(&mut self, signal: u8) -> Result<(), Self::Error> {
        self.write(&[signal])
    }
}
