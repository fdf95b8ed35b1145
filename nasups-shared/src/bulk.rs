//! Bulk transfer protocol.
//!
//! Buffers larger than a single bus transaction are sent in chunks of
//! [`CHUNK`] data bytes followed by their CRC-8. The host paces the
//! transfer with single-byte signals: `continue` advances to the next
//! chunk, `retry` resends the current one and `stop` ends the session.
//! The sender never gives up on its own; the host bounds its retries.

use embedded_hal::blocking::delay::DelayUs;

use crate::{
    crc8,
    hw::RegisterBlock,
    i2c_slave::{self, I2cSlave, MAX_CHUNK},
    reg::signal,
};

/// Data bytes per chunk.
pub const CHUNK: usize = MAX_CHUNK;

/// Timeout waiting for the next signal from the host.
pub const SIGNAL_TIMEOUT_US: u32 = 50_000;

/// Consecutive invalid chunks after which the receiver gives up.
pub const MAX_RETRIES: u32 = 10;

/// Bulk transfer error on the sending side.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// No signal received from host.
    Timeout,
    /// Host sent a byte that is not a signal.
    Protocol(u8),
    /// Sending a chunk failed.
    I2c(i2c_slave::Error),
}

impl From<i2c_slave::Error> for Error {
    fn from(err: i2c_slave::Error) -> Self {
        Self::I2c(err)
    }
}

/// Next action of the sender.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// Send the chunk starting at this offset.
    Send(usize),
    /// Transfer finished.
    Done,
}

/// Sending side of a bulk transfer.
#[derive(Clone, Debug)]
pub struct Session {
    pos: usize,
    len: usize,
}

impl Session {
    /// Starts a session for a buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { pos: 0, len }
    }

    /// Offset of the current chunk.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Processes a signal from the host.
    pub fn on_signal(&mut self, sig: u8) -> Result<Step, Error> {
        match sig {
            signal::CONTINUE => {
                self.pos += CHUNK;
                if self.pos >= self.len {
                    self.pos = 0;
                }
                Ok(Step::Send(self.pos))
            }
            signal::RETRY => Ok(Step::Send(self.pos)),
            signal::STOP => Ok(Step::Done),
            other => Err(Error::Protocol(other)),
        }
    }
}

/// Statistics of a finished transfer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stats {
    /// Chunks sent including repetitions.
    pub chunks: u32,
    /// Chunks sent again on request of the host.
    pub retries: u32,
}

/// Sends `buf` to the host until it signals stop.
pub fn send<R, D>(slave: &mut I2cSlave<R, D>, buf: &[u8]) -> Result<Stats, Error>
where
    R: RegisterBlock,
    D: DelayUs<u32>,
{
    let mut session = Session::new(buf.len());
    let mut stats = Stats::default();

    loop {
        let sig = slave.read_byte(SIGNAL_TIMEOUT_US).ok_or(Error::Timeout)?;
        if sig == signal::RETRY && stats.chunks > 0 {
            stats.retries += 1;
        }
        match session.on_signal(sig)? {
            Step::Send(pos) => {
                slave.send_block(buf, pos, CHUNK, true)?;
                stats.chunks += 1;
            }
            Step::Done => return Ok(stats),
        }
    }
}

/// Result of a received block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Progress {
    /// Chunk accepted, more chunks follow.
    More,
    /// Chunk rejected, it will be requested again.
    Retry,
    /// All chunks received.
    Done,
}

/// Receiving side of a bulk transfer.
#[derive(Clone, Debug)]
pub struct Receiver {
    len: usize,
    pos: usize,
    remaining: usize,
    signal: u8,
    in_row: u32,
    errors: u32,
}

/// The host gave up after too many consecutive invalid chunks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetriesExceeded {
    /// Offset of the chunk that could not be received.
    pub pos: usize,
}

impl Receiver {
    /// Starts receiving a buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { len, pos: 0, remaining: Self::chunk_count(len), signal: signal::RETRY, in_row: 0, errors: 0 }
    }

    /// Number of chunks of a buffer of `len` bytes.
    pub fn chunk_count(len: usize) -> usize {
        len.div_ceil(CHUNK)
    }

    /// Whether all chunks were received.
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Signal to send with the next block request.
    pub fn signal(&self) -> u8 {
        self.signal
    }

    /// Length of the next block including CRC.
    pub fn block_len(&self) -> usize {
        self.len.saturating_sub(self.pos).min(CHUNK) + 1
    }

    /// Total invalid chunks so far.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Processes a block and stores its data into `buf`.
    pub fn on_block(&mut self, block: &[u8], buf: &mut [u8]) -> Result<Progress, RetriesExceeded> {
        if block.len() == self.block_len() && crc8::is_valid(block) {
            let data = &block[..block.len() - 1];
            buf[self.pos..self.pos + data.len()].copy_from_slice(data);
            self.pos += CHUNK;
            self.remaining -= 1;
            self.in_row = 0;
            self.signal = signal::CONTINUE;
            Ok(if self.is_done() { Progress::Done } else { Progress::More })
        } else {
            self.signal = signal::RETRY;
            self.errors += 1;
            self.in_row += 1;
            if self.in_row >= MAX_RETRIES {
                Err(RetriesExceeded { pos: self.pos })
            } else {
                Ok(Progress::Retry)
            }
        }
    }
}

/// Bus access of the bulk transfer receiver.
pub trait Link {
    /// Link error.
    type Error;

    /// Writes `signal` and reads `block.len()` bytes in one transaction.
    fn exchange(&mut self, signal: u8, block: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes a single signal byte.
    fn signal(&mut self, signal: u8) -> Result<(), Self::Error>;
}

/// Bulk transfer error on the receiving side.
#[derive(Debug)]
pub enum ReceiveError<E> {
    /// Bus error.
    Link(E),
    /// Chunk could not be received.
    RetriesExceeded(RetriesExceeded),
}

/// Receives a buffer after the command requesting it was sent.
///
/// The stop signal is always sent at the end. Returns the number of
/// invalid chunks that were retried.
pub fn receive<L: Link>(link: &mut L, buf: &mut [u8]) -> Result<u32, ReceiveError<L::Error>> {
    let mut rx = Receiver::new(buf.len());
    let mut block = [0; CHUNK + 1];

    let res = loop {
        if rx.is_done() {
            break Ok(rx.errors());
        }

        let n = rx.block_len();
        if let Err(err) = link.exchange(rx.signal(), &mut block[..n]) {
            break Err(ReceiveError::Link(err));
        }
        if let Err(err) = rx.on_block(&block[..n], buf) {
            break Err(ReceiveError::RetriesExceeded(err));
        }
    };

    link.signal(signal::STOP).map_err(ReceiveError::Link)?;
    res
}
