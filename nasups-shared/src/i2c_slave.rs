//! I2C slave transport engine.
//!
//! Emulates an addressable register device on the slave side of the bus,
//! driving the DesignWare I2C block through its raw registers. All waits
//! are bounded; a timeout aborts only the operation in flight.

use embedded_hal::blocking::delay::DelayUs;
use heapless::Vec;

use crate::{crc8::crc8, hw::RegisterBlock};

/// Register offsets and bits of the DesignWare I2C block.
pub mod regs {
    pub const IC_CON: u32 = 0x00;
    pub const IC_SAR: u32 = 0x08;
    pub const IC_DATA_CMD: u32 = 0x10;
    pub const IC_INTR_MASK: u32 = 0x30;
    pub const IC_RAW_INTR_STAT: u32 = 0x34;
    pub const IC_RX_TL: u32 = 0x38;
    pub const IC_CLR_RD_REQ: u32 = 0x50;
    pub const IC_CLR_TX_ABRT: u32 = 0x54;
    pub const IC_ENABLE: u32 = 0x6c;
    pub const IC_STATUS: u32 = 0x70;

    pub const CON_MASTER_MODE: u32 = 1 << 0;
    pub const CON_RESTART_EN: u32 = 1 << 5;
    pub const CON_SLAVE_DISABLE: u32 = 1 << 6;

    pub const INTR_RX_FULL: u32 = 1 << 2;
    pub const INTR_RD_REQ: u32 = 1 << 5;

    pub const ENABLE: u32 = 1 << 0;

    pub const STATUS_TFNF: u32 = 1 << 1;
    pub const STATUS_TFE: u32 = 1 << 2;
    pub const STATUS_RFNE: u32 = 1 << 3;

    /// Depth of the receive and transmit FIFOs.
    pub const FIFO_DEPTH: usize = 16;
}

use regs::*;

/// Maximum data bytes of a checksummed chunk.
pub const MAX_CHUNK: usize = 31;

/// Maximum bytes of a single block.
pub const MAX_BLOCK: usize = 32;

/// Timeout waiting for space in the transmit FIFO.
pub const SEND_TIMEOUT_US: u32 = 5_000;

/// Default timeout waiting for a received byte.
pub const READ_TIMEOUT_US: u32 = 5_000;

/// Poll interval while waiting for the transmit FIFO.
const SEND_POLL_US: u32 = 10;

/// Poll interval while waiting for received data.
const READ_POLL_US: u32 = 100;

/// Time given to the master to clock out a filler byte.
const FILLER_WAIT_US: u32 = 2_000;

/// Maximum filler bytes answered to a single read request.
const FILLER_ATTEMPTS: u32 = 16;

/// I2C slave transport error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The bus master did not act within the wait bound.
    Timeout,
}

/// I2C slave on raw peripheral registers.
pub struct I2cSlave<R, D> {
    regs: R,
    delay: D,
}

impl<R, D> I2cSlave<R, D>
where
    R: RegisterBlock,
    D: DelayUs<u32>,
{
    /// Creates the transport engine. Call [`init`](Self::init) before use.
    pub fn new(regs: R, delay: D) -> Self {
        Self { regs, delay }
    }

    /// Releases register block and delay.
    pub fn free(self) -> (R, D) {
        (self.regs, self.delay)
    }

    /// Accesses the register block.
    pub fn regs(&mut self) -> &mut R {
        &mut self.regs
    }

    /// Configures the block as 7-bit slave at `addr` and enables it.
    pub fn init(&mut self, addr: u8) {
        self.regs.clear_bits(IC_ENABLE, ENABLE);
        self.regs.clear_bits(IC_CON, CON_MASTER_MODE | CON_SLAVE_DISABLE);
        self.regs.set_bits(IC_CON, CON_RESTART_EN);
        self.regs.write32(IC_SAR, addr as u32);
        self.regs.write32(IC_RX_TL, 0);
        self.regs.write32(IC_INTR_MASK, INTR_RX_FULL | INTR_RD_REQ);
        self.regs.set_bits(IC_ENABLE, ENABLE);
    }

    /// Disables the block and returns it to master mode.
    pub fn deinit(&mut self) {
        self.regs.write32(IC_INTR_MASK, 0);
        self.regs.clear_bits(IC_ENABLE, ENABLE);
        self.regs.set_bits(IC_CON, CON_MASTER_MODE | CON_SLAVE_DISABLE);
    }

    /// Enables or masks the receive and read request interrupts.
    pub fn listen(&mut self, enabled: bool) {
        self.regs.write32(IC_INTR_MASK, if enabled { INTR_RX_FULL | INTR_RD_REQ } else { 0 });
    }

    fn status(&mut self) -> u32 {
        self.regs.read32(IC_STATUS)
    }

    fn clear_read_request(&mut self) {
        self.regs.read32(IC_CLR_RD_REQ);
    }

    fn clear_tx_abort(&mut self) {
        self.regs.read32(IC_CLR_TX_ABRT);
    }

    /// Whether the master waits for a byte.
    pub fn read_request_pending(&mut self) -> bool {
        self.regs.read32(IC_RAW_INTR_STAT) & INTR_RD_REQ != 0
    }

    /// Answers a pending read request with filler bytes until the master
    /// stops requesting.
    pub fn send_none(&mut self) -> Result<(), Error> {
        for _ in 0..FILLER_ATTEMPTS {
            self.clear_tx_abort();
            self.clear_read_request();
            self.regs.write32(IC_DATA_CMD, 0);
            self.delay.delay_us(FILLER_WAIT_US);
            if !self.read_request_pending() {
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }

    /// Waits until the transmit FIFO is empty.
    pub fn wait_to_send(&mut self, timeout_us: u32) -> Result<(), Error> {
        let mut waited = 0;
        loop {
            if self.status() & STATUS_TFE != 0 {
                return Ok(());
            }
            if waited >= timeout_us {
                return Err(Error::Timeout);
            }
            self.delay.delay_us(SEND_POLL_US);
            waited += SEND_POLL_US;
        }
    }

    /// Sends `count` bytes of `buf` starting at `offset`, clipped to the end
    /// of `buf`.
    ///
    /// With `with_crc` at most [`MAX_CHUNK`] bytes are sent followed by their
    /// CRC-8, otherwise at most [`MAX_BLOCK`] bytes. Returns the number of
    /// data bytes sent; an empty range sends nothing.
    pub fn send_block(&mut self, buf: &[u8], offset: usize, count: usize, with_crc: bool) -> Result<usize, Error> {
        self.clear_tx_abort();
        self.clear_read_request();

        let count = count.min(if with_crc { MAX_CHUNK } else { MAX_BLOCK });
        let stop = offset.saturating_add(count).min(buf.len());
        if stop <= offset {
            return Ok(0);
        }

        let data = &buf[offset..stop];
        let crc = with_crc.then(|| crc8(data));
        for (i, byte) in data.iter().copied().chain(crc).enumerate() {
            if i % FIFO_DEPTH == 0 {
                self.wait_to_send(SEND_TIMEOUT_US)?;
            }
            self.regs.write32(IC_DATA_CMD, byte as u32);
        }

        Ok(data.len())
    }

    /// Waits until the receive FIFO holds data.
    pub fn data_available(&mut self, timeout_us: u32) -> bool {
        let mut waited = 0;
        loop {
            if self.status() & STATUS_RFNE != 0 {
                return true;
            }
            if waited >= timeout_us {
                return false;
            }
            self.delay.delay_us(READ_POLL_US);
            waited += READ_POLL_US;
        }
    }

    /// Reads one byte written by the master.
    pub fn read_byte(&mut self, timeout_us: u32) -> Option<u8> {
        self.data_available(timeout_us).then(|| self.regs.read32(IC_DATA_CMD) as u8)
    }

    /// Reads up to `n` bytes, each awaited with `timeout_us`.
    ///
    /// The result is short if the master stopped writing.
    pub fn read_block<const N: usize>(&mut self, n: usize, timeout_us: u32) -> Vec<u8, N> {
        let mut block = Vec::new();
        while block.len() < n.min(N) {
            match self.read_byte(timeout_us) {
                Some(byte) => {
                    let _ = block.push(byte);
                }
                None => break,
            }
        }
        block
    }

    /// Discards all bytes in the receive FIFO.
    pub fn flush_rx(&mut self) -> usize {
        let mut n = 0;
        while self.status() & STATUS_RFNE != 0 && n < FIFO_DEPTH {
            self.regs.read32(IC_DATA_CMD);
            n += 1;
        }
        n
    }
}
