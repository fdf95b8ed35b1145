//! Memory-mapped register access.

use core::ptr;

use nasups_shared::hw::RegisterBlock;

/// Offset of the atomic bit set alias of an RP2040 peripheral.
const SET_ALIAS: u32 = 0x2000;

/// Offset of the atomic bit clear alias of an RP2040 peripheral.
const CLR_ALIAS: u32 = 0x3000;

/// Register block of an RP2040 peripheral at a fixed base address.
///
/// Bit modifications use the atomic set and clear aliases, so they are
/// safe against concurrent access from interrupt handlers.
pub struct Mmio {
    base: u32,
}

impl Mmio {
    /// Accesses the registers at `base`.
    ///
    /// # Safety
    /// `base` must be the base address of a peripheral register block that
    /// is not concurrently owned by a HAL driver.
    pub const unsafe fn new(base: u32) -> Self {
        Self { base }
    }

    fn addr(&self, offset: u32) -> *mut u32 {
        (self.base + offset) as *mut u32
    }
}

impl RegisterBlock for Mmio {
    fn read32(&mut self, offset: u32) -> u32 {
        unsafe { ptr::read_volatile(self.addr(offset)) }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        unsafe { ptr::write_volatile(self.addr(offset), value) }
    }

    fn set_bits(&mut self, offset: u32, mask: u32) {
        unsafe { ptr::write_volatile(self.addr(offset + SET_ALIAS), mask) }
    }

    fn clear_bits(&mut self, offset: u32, mask: u32) {
        unsafe { ptr::write_volatile(self.addr(offset + CLR_ALIAS), mask) }
    }
}
