//
// nasups - battery backup controller for storage servers
// Copyright (C) 2024 The nasups developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//

//! nasups shared code.
//!
//! Hardware-independent logic of the UPS controller: the I2C slave transport
//! engine, bulk transfer protocol, power monitor, shutdown coordination and
//! the telemetry history. The firmware binds it to the RP2040 peripherals,
//! the host tool uses the wire formats and the bulk receiver.

#![cfg_attr(not(test), no_std)]

pub mod average;
pub mod bridge;
pub mod bulk;
pub mod clock;
pub mod config;
pub mod controller;
pub mod crc8;
pub mod history;
pub mod hw;
pub mod i2c_slave;
pub mod monitor;
pub mod reg;
pub mod shutdown;
pub mod sound;
pub mod timer;
pub mod token;

/// I2C slave address of the controller.
pub const I2C_ADDR: u8 = 0x41;

/// Point in monotonic time in milliseconds.
pub type Millis = u64;
