//! Command and alert state tokens.
//!
//! Commands and alert states are exchanged as opaque 4-byte tokens instead
//! of small integers. The tables are versioned by [`TOKEN_TABLE_VERSION`];
//! changing any value breaks compatibility with deployed hosts.

use heapless::Vec;

/// Version of the token tables.
pub const TOKEN_TABLE_VERSION: u8 = 1;

/// A 4-byte token.
pub type Token = [u8; 4];

/// Command tokens (host to controller).
pub mod cmd {
    use super::Token;

    /// Cut power now, no restart.
    pub const POWER_OFF: Token = [0xb1, 0x83, 0x6a, 0x4d];
    /// Host is ready for power cut, followed by u16 restart delay in seconds.
    pub const RESTART_READY: Token = [0x83, 0xb1, 0xc7, 0xa6];
    /// Host is ready for power cut, no restart.
    pub const SHUTDOWN_READY: Token = [0xb1, 0x83, 0x6a, 0xc7];
    /// Send battery history by bulk transfer.
    pub const READ_BATTERY: Token = [0xa6, 0x3d, 0x81, 0xf7];
    /// Send thermal history by bulk transfer.
    pub const READ_THERMAL: Token = [0x52, 0xe9, 0x4b, 0x83];
}

/// Alert state tokens (controller to host).
pub mod state {
    use super::Token;

    /// Nothing to report.
    pub const NONE: Token = [0x01, 0x01, 0x01, 0x01];
    /// Host must shut down now.
    pub const SHD_NOW: Token = [0x57, 0xdf, 0x48, 0x9b];
    /// Host should shut down because the battery is low.
    pub const SHD_LOW: Token = [0x84, 0x75, 0xb9, 0xfd];
    /// Mains supply present.
    pub const POWER_ON: Token = [0x72, 0xc4, 0x9a, 0x31];
    /// Mains supply lost.
    pub const POWER_OFF: Token = [0xa9, 0x27, 0x13, 0x4c];
    /// Battery connected.
    pub const BAT_ON: Token = [0x6e, 0x24, 0xa5, 0xd3];
    /// Battery disconnected.
    pub const BAT_OFF: Token = [0x5a, 0xe6, 0x3d, 0x42];
    /// Battery overvoltage.
    pub const BAT_OVER: Token = [0x41, 0xf8, 0xa5, 0x27];
}

/// Minimum restart delay in seconds.
pub const MIN_RESTART_DELAY: u16 = 10;

/// Host command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Unconditional power cut.
    PowerOff,
    /// Host is ready for power cut and wants to be restarted.
    RestartReady {
        /// Restart delay in seconds.
        delay: u16,
    },
    /// Host is ready for power cut.
    ShutdownReady,
    /// Bulk transfer of battery history.
    ReadBatteryHistory,
    /// Bulk transfer of thermal history.
    ReadThermalHistory,
}

impl Command {
    /// Parses a command from its token and parameter bytes.
    ///
    /// Returns `None` for unknown tokens. A restart request without delay
    /// uses the minimum delay.
    pub fn parse(token: &[u8], params: &[u8]) -> Option<Self> {
        let token: Token = token.try_into().ok()?;
        match token {
            cmd::POWER_OFF => Some(Self::PowerOff),
            cmd::RESTART_READY => {
                let delay = match params {
                    [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
                    _ => MIN_RESTART_DELAY,
                };
                Some(Self::RestartReady { delay })
            }
            cmd::SHUTDOWN_READY => Some(Self::ShutdownReady),
            cmd::READ_BATTERY => Some(Self::ReadBatteryHistory),
            cmd::READ_THERMAL => Some(Self::ReadThermalHistory),
            _ => None,
        }
    }

    /// Whether the token is followed by parameter bytes.
    pub fn has_params(token: &[u8]) -> bool {
        token == cmd::RESTART_READY
    }

    /// Token of the command.
    pub fn token(&self) -> Token {
        match self {
            Self::PowerOff => cmd::POWER_OFF,
            Self::RestartReady { .. } => cmd::RESTART_READY,
            Self::ShutdownReady => cmd::SHUTDOWN_READY,
            Self::ReadBatteryHistory => cmd::READ_BATTERY,
            Self::ReadThermalHistory => cmd::READ_THERMAL,
        }
    }

    /// Wire encoding of the command including parameters.
    pub fn encode(&self) -> Vec<u8, 6> {
        let mut buf = Vec::new();
        let _ = buf.extend_from_slice(&self.token());
        if let Self::RestartReady { delay } = self {
            let _ = buf.extend_from_slice(&delay.to_le_bytes());
        }
        buf
    }
}

/// Reason the host is asked to shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ShutdownReason {
    /// No shutdown requested.
    None,
    /// Immediate shutdown (critical battery or stop button).
    Now,
    /// Graceful shutdown because the battery is low.
    LowBattery,
}

/// Mains power source state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSource {
    On,
    Off,
}

/// Battery presence state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BatteryPresence {
    On,
    Off,
}

/// Battery overvoltage state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Overvoltage {
    Set,
    Clear,
}

impl ShutdownReason {
    pub const fn token(self) -> Token {
        match self {
            Self::None => state::NONE,
            Self::Now => state::SHD_NOW,
            Self::LowBattery => state::SHD_LOW,
        }
    }

    pub fn from_token(token: Token) -> Option<Self> {
        match token {
            state::NONE => Some(Self::None),
            state::SHD_NOW => Some(Self::Now),
            state::SHD_LOW => Some(Self::LowBattery),
            _ => None,
        }
    }
}

impl PowerSource {
    pub const fn token(self) -> Token {
        match self {
            Self::On => state::POWER_ON,
            Self::Off => state::POWER_OFF,
        }
    }

    pub fn from_token(token: Token) -> Option<Self> {
        match token {
            state::POWER_ON => Some(Self::On),
            state::POWER_OFF => Some(Self::Off),
            _ => None,
        }
    }
}

impl BatteryPresence {
    pub const fn token(self) -> Token {
        match self {
            Self::On => state::BAT_ON,
            Self::Off => state::BAT_OFF,
        }
    }

    pub fn from_token(token: Token) -> Option<Self> {
        match token {
            state::BAT_ON => Some(Self::On),
            state::BAT_OFF => Some(Self::Off),
            _ => None,
        }
    }
}

impl Overvoltage {
    /// Token of the state. A cleared overvoltage reads as [`state::NONE`].
    pub const fn token(self) -> Token {
        match self {
            Self::Set => state::BAT_OVER,
            Self::Clear => state::NONE,
        }
    }

    pub fn from_token(token: Token) -> Option<Self> {
        match token {
            state::BAT_OVER => Some(Self::Set),
            state::NONE => Some(Self::Clear),
            _ => None,
        }
    }
}

/// Alert state registers.
///
/// Any field change raises an edge for the alert line and keeps the alert
/// pending until the host reads the alert register.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlertState {
    shutdown: ShutdownReason,
    power: PowerSource,
    battery: BatteryPresence,
    overvoltage: Overvoltage,
    pending: bool,
    edge: bool,
}

impl AlertState {
    /// Creates the alert state without pending notification.
    pub fn new(power: PowerSource, battery: BatteryPresence) -> Self {
        Self {
            shutdown: ShutdownReason::None,
            power,
            battery,
            overvoltage: Overvoltage::Clear,
            pending: false,
            edge: false,
        }
    }

    fn changed(&mut self) {
        self.pending = true;
        self.edge = true;
    }

    pub fn shutdown(&self) -> ShutdownReason {
        self.shutdown
    }

    pub fn power(&self) -> PowerSource {
        self.power
    }

    pub fn battery(&self) -> BatteryPresence {
        self.battery
    }

    pub fn overvoltage(&self) -> Overvoltage {
        self.overvoltage
    }

    /// Sets the shutdown reason, returns whether it changed.
    pub fn set_shutdown(&mut self, reason: ShutdownReason) -> bool {
        let changed = self.shutdown != reason;
        if changed {
            self.shutdown = reason;
            self.changed();
        }
        changed
    }

    /// Sets the power source state, returns whether it changed.
    pub fn set_power(&mut self, power: PowerSource) -> bool {
        let changed = self.power != power;
        if changed {
            self.power = power;
            self.changed();
        }
        changed
    }

    /// Sets the battery presence state, returns whether it changed.
    pub fn set_battery(&mut self, battery: BatteryPresence) -> bool {
        let changed = self.battery != battery;
        if changed {
            self.battery = battery;
            self.changed();
        }
        changed
    }

    /// Sets the overvoltage state, returns whether it changed.
    pub fn set_overvoltage(&mut self, overvoltage: Overvoltage) -> bool {
        let changed = self.overvoltage != overvoltage;
        if changed {
            self.overvoltage = overvoltage;
            self.changed();
        }
        changed
    }

    /// Requests a notification pulse without a field change.
    pub fn notify(&mut self) {
        self.changed();
    }

    /// Whether an alert is waiting to be read by the host.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Takes the edge raised by a change since the last call.
    pub fn take_edge(&mut self) -> bool {
        core::mem::take(&mut self.edge)
    }

    /// Host has read the alert register.
    ///
    /// Clears the pending notification, field values are kept.
    pub fn acknowledge(&mut self) {
        self.pending = false;
        self.edge = false;
    }

    /// Register value: shutdown, power, battery and overvoltage tokens.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0; 16];
        buf[0..4].copy_from_slice(&self.shutdown.token());
        buf[4..8].copy_from_slice(&self.power.token());
        buf[8..12].copy_from_slice(&self.battery.token());
        buf[12..16].copy_from_slice(&self.overvoltage.token());
        buf
    }

    /// Decodes a register value read from the controller.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let token = |n: usize| -> Option<Token> { buf.get(n * 4..n * 4 + 4)?.try_into().ok() };
        Some(Self {
            shutdown: ShutdownReason::from_token(token(0)?)?,
            power: PowerSource::from_token(token(1)?)?,
            battery: BatteryPresence::from_token(token(2)?)?,
            overvoltage: Overvoltage::from_token(token(3)?)?,
            pending: false,
            edge: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(Command::parse(&cmd::POWER_OFF, &[]), Some(Command::PowerOff));
        assert_eq!(Command::parse(&cmd::SHUTDOWN_READY, &[]), Some(Command::ShutdownReady));
        assert_eq!(Command::parse(&cmd::RESTART_READY, &[30, 0]), Some(Command::RestartReady { delay: 30 }));
        assert_eq!(Command::parse(&cmd::RESTART_READY, &[]), Some(Command::RestartReady { delay: 10 }));
        assert_eq!(Command::parse(&cmd::READ_THERMAL, &[]), Some(Command::ReadThermalHistory));
    }

    #[test]
    fn unknown_token_is_ignored() {
        assert_eq!(Command::parse(&[0xb1, 0x83, 0x6a, 0x4e], &[]), None);
        assert_eq!(Command::parse(&[1, 2, 3, 4], &[]), None);
        assert_eq!(Command::parse(&[0xb1, 0x83], &[]), None);
    }

    #[test]
    fn restart_encoding() {
        let cmd = Command::RestartReady { delay: 0x1234 };
        assert_eq!(&cmd.encode()[..], &[0x83, 0xb1, 0xc7, 0xa6, 0x34, 0x12]);
    }

    #[test]
    fn alert_register_layout() {
        let mut alerts = AlertState::new(PowerSource::On, BatteryPresence::On);
        alerts.set_shutdown(ShutdownReason::LowBattery);
        alerts.set_overvoltage(Overvoltage::Set);

        let buf = alerts.encode();
        assert_eq!(&buf[0..4], &state::SHD_LOW);
        assert_eq!(&buf[4..8], &state::POWER_ON);
        assert_eq!(&buf[8..12], &state::BAT_ON);
        assert_eq!(&buf[12..16], &state::BAT_OVER);

        let decoded = AlertState::decode(&buf).unwrap();
        assert_eq!(decoded.shutdown(), ShutdownReason::LowBattery);
        assert_eq!(decoded.overvoltage(), Overvoltage::Set);
    }

    #[test]
    fn acknowledge_keeps_values() {
        let mut alerts = AlertState::new(PowerSource::On, BatteryPresence::On);
        assert!(!alerts.is_pending());

        assert!(alerts.set_power(PowerSource::Off));
        assert!(!alerts.set_power(PowerSource::Off));
        assert!(alerts.is_pending());
        assert!(alerts.take_edge());
        assert!(!alerts.take_edge());

        alerts.acknowledge();
        assert!(!alerts.is_pending());
        assert_eq!(alerts.power(), PowerSource::Off);
    }
}
