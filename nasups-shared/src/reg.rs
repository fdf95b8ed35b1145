//! Register definitions.
//!
//! Register addresses and bulk transfer signals are wire constants shared
//! with the host and must not be renumbered.

/// Command (write).
///
/// 4-byte command token, optionally followed by parameters.
pub const CMD: u8 = 0xbd;

/// Set clock (write, 9 bytes).
///
/// Packed date and time, marks the controller clock as synchronized.
pub const RTC: u8 = 0x1c;

/// Alert state (read, 16 bytes).
///
/// Reading acknowledges the pending alert and drops the alert line.
pub const ALERT: u8 = 0x7a;

/// Main status (read, 13 bytes).
pub const MAIN: u8 = 0xe4;

/// Fan configuration (write, 11 bytes).
pub const FAN_CFG: u8 = 0x58;

/// Silent mode configuration (write, 11 bytes).
pub const SILENT_CFG: u8 = 0x9b;

/// Battery configuration (write, 14 bytes).
pub const BAT_CFG: u8 = 0xd2;

/// Low battery level in mV (write, u16).
pub const BAT_LOW: u8 = 0xd3;

/// Host shutdown state (write, u8).
///
/// 1 means the host is running normally, 2 means it is shutting down.
pub const SHD_STATE: u8 = 0xa6;

/// Length of main status register.
pub const MAIN_LEN: usize = 13;

/// Length of alert register.
pub const ALERT_LEN: usize = 16;

/// Length of fan configuration register.
pub const FAN_CFG_LEN: usize = 11;

/// Length of silent mode configuration register.
pub const SILENT_CFG_LEN: usize = 11;

/// Length of battery configuration register.
pub const BAT_CFG_LEN: usize = 14;

/// Length of low battery level register.
pub const BAT_LOW_LEN: usize = 2;

/// Length of set clock register.
pub const RTC_LEN: usize = 9;

/// Host shutdown state: running normally.
pub const SHD_STATE_IDLE: u8 = 1;

/// Host shutdown state: shutting down.
pub const SHD_STATE_BUSY: u8 = 2;

/// Bulk transfer handshake signals sent by the host.
pub mod signal {
    /// Advance to the next chunk.
    pub const CONTINUE: u8 = 0xcc;
    /// Resend the current chunk.
    pub const RETRY: u8 = 0x33;
    /// End the transfer.
    pub const STOP: u8 = 0x69;
}
