//! Hardware register access.

/// Access to a block of 32-bit memory-mapped peripheral registers.
///
/// Offsets are relative to the base address of the block. Reads take
/// `&mut self` because some registers clear state when read.
pub trait RegisterBlock {
    /// Reads the register at `offset`.
    fn read32(&mut self, offset: u32) -> u32;

    /// Writes the register at `offset`.
    fn write32(&mut self, offset: u32, value: u32);

    /// Sets the bits of `mask` in the register at `offset`.
    fn set_bits(&mut self, offset: u32, mask: u32) {
        let value = self.read32(offset);
        self.write32(offset, value | mask);
    }

    /// Clears the bits of `mask` in the register at `offset`.
    fn clear_bits(&mut self, offset: u32, mask: u32) {
        let value = self.read32(offset);
        self.write32(offset, value & !mask);
    }
}

/// Simulated I2C slave peripheral for tests.
#[cfg(test)]
pub mod sim {
    use std::{boxed::Box, collections::VecDeque, vec::Vec};

    use super::RegisterBlock;
    use crate::i2c_slave::regs::*;

    /// Bus state as seen by the simulated I2C master.
    #[derive(Default)]
    pub struct Bus {
        /// Bytes written by the master and not yet read by the slave.
        pub rx: VecDeque<u8>,
        /// Bytes received by the master.
        pub sent: Vec<u8>,
        /// Bytes in transmit FIFO not yet clocked out.
        pub tx: Vec<u8>,
        /// Master waits for data.
        pub rd_req: bool,
        /// Master stopped clocking out data.
        pub tx_stalled: bool,
        /// Bytes written while the transmit FIFO was full.
        pub tx_overflow: usize,
        /// Master keeps requesting data after the request was cleared.
        pub sticky_rd_req: bool,
    }

    impl Bus {
        /// Master writes bytes.
        pub fn write(&mut self, data: &[u8]) {
            self.rx.extend(data.iter().copied());
        }

        /// Takes all bytes received by the master.
        pub fn take_sent(&mut self) -> Vec<u8> {
            core::mem::take(&mut self.sent)
        }
    }

    type Host = Box<dyn FnMut(&mut Bus)>;

    /// Simulated DesignWare I2C block in slave mode.
    pub struct SimI2c {
        pub bus: Bus,
        con: u32,
        sar: u32,
        enable: u32,
        intr_mask: u32,
        rx_tl: u32,
        host: Option<Host>,
    }

    impl Default for SimI2c {
        fn default() -> Self {
            Self { bus: Bus::default(), con: 0x65, sar: 0x55, enable: 0, intr_mask: 0, rx_tl: 0, host: None }
        }
    }

    impl SimI2c {
        /// Creates a simulation whose master reacts whenever the slave finds
        /// its receive FIFO empty.
        pub fn with_host(host: impl FnMut(&mut Bus) + 'static) -> Self {
            Self { host: Some(Box::new(host)), ..Default::default() }
        }

        pub fn slave_addr(&self) -> u32 {
            self.sar
        }

        pub fn is_enabled(&self) -> bool {
            self.enable & ENABLE != 0
        }

        pub fn is_slave(&self) -> bool {
            self.con & (CON_MASTER_MODE | CON_SLAVE_DISABLE) == 0
        }

        pub fn intr_mask(&self) -> u32 {
            self.intr_mask
        }

        fn run_host(&mut self) {
            if self.bus.rx.is_empty() {
                if let Some(mut host) = self.host.take() {
                    host(&mut self.bus);
                    self.host = Some(host);
                }
            }
        }
    }

    impl RegisterBlock for SimI2c {
        fn read32(&mut self, offset: u32) -> u32 {
            match offset {
                IC_CON => self.con,
                IC_SAR => self.sar,
                IC_DATA_CMD => self.bus.rx.pop_front().map(u32::from).unwrap_or_default(),
                IC_INTR_MASK => self.intr_mask,
                IC_RAW_INTR_STAT => {
                    let mut stat = 0;
                    if self.bus.rd_req {
                        stat |= INTR_RD_REQ;
                    }
                    if !self.bus.rx.is_empty() {
                        stat |= INTR_RX_FULL;
                    }
                    stat
                }
                IC_RX_TL => self.rx_tl,
                IC_CLR_RD_REQ => {
                    self.bus.rd_req = self.bus.sticky_rd_req;
                    0
                }
                IC_CLR_TX_ABRT => 0,
                IC_ENABLE => self.enable,
                IC_STATUS => {
                    self.run_host();
                    let mut status = 0;
                    if self.bus.tx.is_empty() {
                        status |= STATUS_TFE;
                    }
                    if self.bus.tx.len() < FIFO_DEPTH {
                        status |= STATUS_TFNF;
                    }
                    if !self.bus.rx.is_empty() {
                        status |= STATUS_RFNE;
                    }
                    status
                }
                _ => 0,
            }
        }

        fn write32(&mut self, offset: u32, value: u32) {
            match offset {
                IC_CON => self.con = value,
                IC_SAR => self.sar = value,
                IC_DATA_CMD => {
                    if !self.bus.tx_stalled {
                        self.bus.sent.push(value as u8);
                    } else if self.bus.tx.len() >= FIFO_DEPTH {
                        self.bus.tx_overflow += 1;
                    } else {
                        self.bus.tx.push(value as u8);
                    }
                }
                IC_INTR_MASK => self.intr_mask = value,
                IC_RX_TL => self.rx_tl = value,
                IC_ENABLE => self.enable = value,
                _ => (),
            }
        }
    }

    /// Delay that only counts the requested time.
    #[derive(Default)]
    pub struct SimDelay {
        pub elapsed_us: u64,
    }

    impl embedded_hal::blocking::delay::DelayUs<u32> for SimDelay {
        fn delay_us(&mut self, us: u32) {
            self.elapsed_us += us as u64;
        }
    }
}
