//! Data stored in flash memory.
//!
//! Each record occupies its own sectors at the end of flash and consists of
//! a header with magic, tag, payload length and CRC32 followed by the payload.
//! A record with wrong magic, tag or checksum reads as absent.

use byteorder::{ByteOrder, LittleEndian};
use core::{slice, sync::atomic};
use crc32fast::Hasher;
use rp2040_hal::rom_data;

use nasups_shared::{
    clock::{DateTime, STAMP_LEN},
    config::Settings,
    controller::HistoryKind,
    history::{History, BUFFER_LEN},
};

/// Start of flash in the address space.
const XIP_BASE: u32 = 0x1000_0000;

/// Flash size.
const FLASH_SIZE: u32 = 2 * 1024 * 1024;

/// Erase unit.
const SECTOR: u32 = 4096;

/// Program unit.
const PAGE: usize = 256;

/// 4 KiB sector erase command.
const SECTOR_ERASE_CMD: u8 = 0x20;

/// Record magic.
const MAGIC: u32 = 0x5350_554e;

/// Record header: magic, tag, reserved, length, CRC32.
const HEADER_LEN: usize = 12;

/// Flash region holding a record.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
enum Region {
    Settings,
    Autostart,
    BatteryHistory,
    ThermalHistory,
}

impl Region {
    fn offset(self) -> u32 {
        match self {
            Self::Settings => FLASH_SIZE - SECTOR,
            Self::Autostart => FLASH_SIZE - 2 * SECTOR,
            Self::BatteryHistory => FLASH_SIZE - 4 * SECTOR,
            Self::ThermalHistory => FLASH_SIZE - 6 * SECTOR,
        }
    }

    fn len(self) -> u32 {
        match self {
            Self::Settings | Self::Autostart => SECTOR,
            Self::BatteryHistory | Self::ThermalHistory => 2 * SECTOR,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Settings => 1,
            Self::Autostart => 2,
            Self::BatteryHistory => 3,
            Self::ThermalHistory => 4,
        }
    }

    fn history(kind: HistoryKind) -> Self {
        match kind {
            HistoryKind::Battery => Self::BatteryHistory,
            HistoryKind::Thermal => Self::ThermalHistory,
        }
    }
}

/// Boot ROM flash functions.
///
/// Looked up before XIP is disabled, since the lookup reads from flash.
struct Rom {
    connect: unsafe extern "C" fn(),
    exit_xip: unsafe extern "C" fn(),
    erase: unsafe extern "C" fn(u32, usize, u32, u8),
    program: unsafe extern "C" fn(u32, *const u8, usize),
    flush: unsafe extern "C" fn(),
    enter_xip: unsafe extern "C" fn(),
}

impl Rom {
    fn lookup() -> Self {
        Self {
            connect: rom_data::connect_internal_flash::ptr(),
            exit_xip: rom_data::flash_exit_xip::ptr(),
            erase: rom_data::flash_range_erase::ptr(),
            program: rom_data::flash_range_program::ptr(),
            flush: rom_data::flash_flush_cache::ptr(),
            enter_xip: rom_data::flash_enter_cmd_xip::ptr(),
        }
    }
}

/// Erases or programs flash while XIP is disabled.
///
/// Runs from RAM and calls only boot ROM functions.
#[inline(never)]
#[link_section = ".data.ram_func"]
unsafe fn flash_op(rom: &Rom, offset: u32, erase_len: u32, data: *const u8, len: usize) {
    atomic::compiler_fence(atomic::Ordering::SeqCst);
    (rom.connect)();
    (rom.exit_xip)();
    if erase_len > 0 {
        (rom.erase)(offset, erase_len as usize, SECTOR, SECTOR_ERASE_CMD);
    }
    if len > 0 {
        (rom.program)(offset, data, len);
    }
    (rom.flush)();
    (rom.enter_xip)();
    atomic::compiler_fence(atomic::Ordering::SeqCst);
}

/// Persistent storage in the reserved flash area.
pub struct Storage {
    _private: (),
}

impl Storage {
    /// Takes the reserved flash area.
    ///
    /// # Safety
    /// Only one instance may exist and the second core must not execute
    /// from flash.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn erase(&mut self, region: Region) {
        let rom = Rom::lookup();
        cortex_m::interrupt::free(|_| unsafe {
            flash_op(&rom, region.offset(), region.len(), core::ptr::null(), 0);
        });
    }

    fn program_page(&mut self, offset: u32, page: &[u8; PAGE]) {
        let rom = Rom::lookup();
        cortex_m::interrupt::free(|_| unsafe {
            flash_op(&rom, offset, 0, page.as_ptr(), PAGE);
        });
    }

    fn contents(region: Region) -> &'static [u8] {
        unsafe { slice::from_raw_parts((XIP_BASE + region.offset()) as *const u8, region.len() as usize) }
    }

    /// Payload of a valid record.
    fn read(&self, region: Region) -> Option<&'static [u8]> {
        let (header, rest) = Self::contents(region).split_at(HEADER_LEN);
        if LittleEndian::read_u32(&header[0..4]) != MAGIC || header[4] != region.tag() {
            return None;
        }

        let len = LittleEndian::read_u16(&header[6..8]) as usize;
        let payload = rest.get(..len)?;
        if crc32fast::hash(payload) != LittleEndian::read_u32(&header[8..12]) {
            defmt::warn!("flash record {} is corrupted", region);
            return None;
        }
        Some(payload)
    }

    /// Writes a record with the concatenation of `parts` as payload.
    fn write(&mut self, region: Region, parts: &[&[u8]]) {
        let len: usize = parts.iter().map(|part| part.len()).sum();
        defmt::assert!(HEADER_LEN + len <= region.len() as usize, "record too large for its region");

        let mut hasher = Hasher::new();
        for part in parts {
            hasher.update(part);
        }

        let mut header = [0; HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], MAGIC);
        header[4] = region.tag();
        LittleEndian::write_u16(&mut header[6..8], len as u16);
        LittleEndian::write_u32(&mut header[8..12], hasher.finalize());

        self.erase(region);

        let mut page = [0xff; PAGE];
        let mut fill = 0;
        let mut offset = region.offset();
        for &byte in header.iter().chain(parts.iter().flat_map(|part| part.iter())) {
            page[fill] = byte;
            fill += 1;
            if fill == PAGE {
                self.program_page(offset, &page);
                offset += PAGE as u32;
                page = [0xff; PAGE];
                fill = 0;
            }
        }
        if fill > 0 {
            self.program_page(offset, &page);
        }

        defmt::debug!("wrote flash record {} with {} bytes", region, len);
    }

    /// Removes a record, if present.
    fn clear(&mut self, region: Region) {
        if Self::contents(region)[..HEADER_LEN].iter().any(|&b| b != 0xff) {
            self.erase(region);
            defmt::debug!("erased flash record {}", region);
        }
    }

    /// Loads stored settings.
    pub fn load_settings(&self) -> Option<Settings> {
        let payload = self.read(Region::Settings)?;
        match Settings::decode(payload) {
            Ok(settings) => Some(settings),
            Err(err) => {
                defmt::warn!("stored settings are invalid: {}", err);
                None
            }
        }
    }

    /// Stores settings.
    pub fn save_settings(&mut self, settings: &Settings) {
        self.write(Region::Settings, &[&settings.encode()]);
    }

    /// Reads and clears the stored autostart flag.
    pub fn take_autostart(&mut self) -> bool {
        let autostart = matches!(self.read(Region::Autostart), Some([1]));
        self.clear(Region::Autostart);
        autostart
    }

    /// Stores the autostart flag for the next boot.
    pub fn save_autostart(&mut self) {
        self.write(Region::Autostart, &[&[1]]);
    }

    /// Loads a history snapshot and its timestamp.
    pub fn load_snapshot(&self, kind: HistoryKind) -> Option<(&'static [u8], DateTime)> {
        let payload = self.read(Region::history(kind))?;
        if payload.len() != BUFFER_LEN + STAMP_LEN {
            return None;
        }
        let (data, stamp) = payload.split_at(BUFFER_LEN);
        Some((data, DateTime::from_stamp(stamp)?))
    }

    /// Stores a history snapshot taken at `stamp`.
    pub fn save_snapshot(&mut self, kind: HistoryKind, history: &History, stamp: DateTime) {
        self.write(Region::history(kind), &[history.as_bytes(), &stamp.stamp()]);
    }

    /// Removes a history snapshot.
    pub fn erase_snapshot(&mut self, kind: HistoryKind) {
        self.clear(Region::history(kind));
    }
}
