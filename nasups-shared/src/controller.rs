//! Controller context.
//!
//! Owns all controller state and applies monitor ticks, timer ticks, button
//! presses and register accesses to it. Every entry point returns
//! [`Effects`] that the firmware applies to the hardware.

use embedded_hal::blocking::delay::DelayUs;
use heapless::Vec;

use crate::{
    bridge::{Buttons, StopKind, TaskCmd},
    clock::{Clock, DateTime},
    config::{self, Settings, SUPPLY_OFF_LEVEL_MV},
    history::{self, History, SAMPLE_PERIOD_MS},
    hw::RegisterBlock,
    i2c_slave::{I2cSlave, MAX_BLOCK, READ_TIMEOUT_US},
    monitor::{Event, Events, Led, MainStatus, Monitor, Sample, Timer},
    reg,
    shutdown::{Coordinator, Host, Outcome},
    sound::{Advance, Melody, Player, Request, Step},
    token::{AlertState, BatteryPresence, Command, PowerSource, ShutdownReason, MIN_RESTART_DELAY},
    Millis,
};

/// Per-byte timeout of configuration writes.
pub const CONFIG_BYTE_TIMEOUT_US: u32 = 50_000;

/// Register service error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Register address is not mapped.
    UnknownRegister(u8),
    /// Command token is not known.
    UnknownCommand,
    /// Payload of a register write was short.
    Payload { reg: u8, got: usize },
    /// Configuration was rejected.
    Config(config::Error),
    /// Date and time are invalid.
    Clock,
}

impl From<config::Error> for Error {
    fn from(err: config::Error) -> Self {
        Self::Config(err)
    }
}

/// Register access by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Access {
    Command(Command),
    Read(u8),
    Write { reg: u8, data: Vec<u8, 16> },
}

fn payload_len(reg: u8) -> Option<usize> {
    match reg {
        reg::FAN_CFG => Some(reg::FAN_CFG_LEN),
        reg::SILENT_CFG => Some(reg::SILENT_CFG_LEN),
        reg::BAT_CFG => Some(reg::BAT_CFG_LEN),
        reg::BAT_LOW => Some(reg::BAT_LOW_LEN),
        reg::RTC => Some(reg::RTC_LEN),
        reg::SHD_STATE => Some(1),
        _ => None,
    }
}

/// Receives the next register access from the bus.
///
/// Returns `None` when the master has not written a register address.
pub fn receive<R, D>(slave: &mut I2cSlave<R, D>) -> Option<Result<Access, Error>>
where
    R: RegisterBlock,
    D: DelayUs<u32>,
{
    let reg = slave.read_byte(READ_TIMEOUT_US)?;
    let access = match reg {
        reg::CMD => {
            let token: Vec<u8, 4> = slave.read_block(4, READ_TIMEOUT_US);
            if token.len() < 4 {
                return Some(Err(Error::Payload { reg, got: token.len() }));
            }
            let params: Vec<u8, 2> =
                if Command::has_params(&token) { slave.read_block(2, READ_TIMEOUT_US) } else { Vec::new() };
            match Command::parse(&token, &params) {
                Some(cmd) => Access::Command(cmd),
                None => return Some(Err(Error::UnknownCommand)),
            }
        }
        reg::MAIN | reg::ALERT => Access::Read(reg),
        _ => {
            let Some(len) = payload_len(reg) else { return Some(Err(Error::UnknownRegister(reg))) };
            let timeout = match reg {
                reg::RTC | reg::SHD_STATE => READ_TIMEOUT_US,
                _ => CONFIG_BYTE_TIMEOUT_US,
            };
            let data: Vec<u8, 16> = slave.read_block(len, timeout);
            if data.len() < len {
                return Some(Err(Error::Payload { reg, got: data.len() }));
            }
            Access::Write { reg, data }
        }
    };
    Some(Ok(access))
}

/// Telemetry history buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HistoryKind {
    /// Battery voltage and charge current.
    Battery,
    /// Temperature and fan duty.
    Thermal,
}

/// Levels of the controller's digital inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Inputs {
    /// Host-on line is high.
    pub host_powered: bool,
    /// Auto switch selects automatic output restore.
    pub auto_enabled: bool,
}

/// Hardware effects requested by the controller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Effects {
    /// Monitor events of this tick.
    pub events: Events,
    /// Switch the protected output.
    pub output: Option<bool>,
    /// Sound playback started with this step.
    pub sound: Option<Step>,
    /// Raise (`true`) or drop (`false`) the alert line.
    pub alert: Option<bool>,
    /// Status LED color.
    pub led: Option<Led>,
    /// Run the power off sequence.
    pub power_off: bool,
    /// Settings changed and must be saved.
    pub settings_changed: bool,
    /// Clock was set for the first time, stored histories can be restored.
    pub restore_history: bool,
    /// Register value to send to the host.
    pub reply: Option<Vec<u8, MAX_BLOCK>>,
    /// Bulk transfer to perform.
    pub bulk: Option<HistoryKind>,
    /// Schedule the stop button hold check.
    pub hold_check: bool,
    /// New fan duty in percent.
    pub fan_duty: Option<u8>,
}

/// Refusal to cut power while mains is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MainsPresent;

/// Accepted power off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerOff {
    /// Timestamp for the history snapshot, `None` without synchronized clock.
    pub stamp: Option<DateTime>,
    /// Countdown playback started with this step.
    pub sound: Option<Step>,
}

/// Thermal readings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Thermal {
    /// Board temperature in 0.01 °C.
    pub temperature: i16,
    pub fan_rpm: u16,
    pub fan_duty: u8,
}

/// Controller context.
pub struct Controller {
    settings: Settings,
    monitor: Monitor,
    coordinator: Coordinator,
    alerts: AlertState,
    clock: Clock,
    player: Player,
    buttons: Buttons,
    battery_history: History,
    thermal_history: History,
    last_sample: Sample,
    inputs: Inputs,
    thermal: Thermal,
    output_on: bool,
    host_in_shutdown: bool,
    start_when_ready: bool,
    restart_countdown: u16,
    sound_enabled: bool,
    next_history: Millis,
}

impl Controller {
    /// Creates the controller from stored settings and the first sample.
    ///
    /// `autostart` is the flag stored by the last power off.
    pub fn new(settings: Settings, first: Sample, inputs: Inputs, autostart: bool, now: Millis) -> Self {
        let monitor = Monitor::new(first, &settings.battery);
        let alerts = AlertState::new(monitor.power(), monitor.battery());
        Self {
            settings,
            monitor,
            coordinator: Coordinator::new(),
            alerts,
            clock: Clock::new(),
            player: Player::new(),
            buttons: Buttons::new(),
            battery_history: History::new(),
            thermal_history: History::new(),
            last_sample: first,
            inputs,
            thermal: Thermal::default(),
            output_on: false,
            host_in_shutdown: false,
            start_when_ready: autostart,
            restart_countdown: 0,
            sound_enabled: true,
            next_history: now + SAMPLE_PERIOD_MS,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn alerts(&self) -> &AlertState {
        &self.alerts
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn is_output_on(&self) -> bool {
        self.output_on
    }

    /// Seconds until the output is restored after a restart request.
    pub fn restart_countdown(&self) -> u16 {
        self.restart_countdown
    }

    /// Whether the output will be restored once the battery is charged.
    pub fn start_when_ready(&self) -> bool {
        self.start_when_ready
    }

    pub fn is_clock_synced(&self) -> bool {
        self.clock.is_synced()
    }

    pub fn history(&self, kind: HistoryKind) -> &History {
        match kind {
            HistoryKind::Battery => &self.battery_history,
            HistoryKind::Thermal => &self.thermal_history,
        }
    }

    /// Main status register value.
    pub fn main_status(&self) -> MainStatus {
        let avg = self.monitor.averages();
        MainStatus {
            vbat: avg.vbat,
            vps: avg.vps,
            vsys: avg.vsys,
            ichg: avg.ichg,
            fan_rpm: self.thermal.fan_rpm,
            fan_duty: self.thermal.fan_duty,
            temperature: self.thermal.temperature,
        }
    }

    fn host(&self) -> Host {
        Host { powered: self.inputs.host_powered, output_on: self.output_on, in_shutdown: self.host_in_shutdown }
    }

    fn battery_good(&self) -> bool {
        self.monitor.averages().vbat > self.settings.battery.low
    }

    fn set_output(&mut self, on: bool, fx: &mut Effects) {
        self.output_on = on;
        fx.output = Some(on);
    }

    fn play(&mut self, melody: Melody, fx: &mut Effects) {
        if let Request::Started(step) = self.player.request(melody, !self.sound_enabled) {
            fx.sound = Some(step);
        }
    }

    fn apply_outcome(&mut self, outcome: Outcome, fx: &mut Effects) {
        match outcome {
            Outcome::CutPower => fx.power_off = true,
            Outcome::Beep => self.play(Melody::Beep, fx),
            Outcome::Nothing => (),
        }
    }

    /// Signals alert changes to the host.
    ///
    /// Every change produces a new pulse, even while an earlier one is
    /// unread. The line stays low while the host is unpowered.
    fn finish(&mut self, mut fx: Effects) -> Effects {
        if self.alerts.take_edge() && self.inputs.host_powered {
            fx.alert = Some(true);
        }
        fx
    }

    /// Processes one monitor sample.
    pub fn tick(&mut self, now: Millis, sample: Sample, inputs: Inputs) -> Effects {
        self.last_sample = sample;
        let host_lost = self.inputs.host_powered && !inputs.host_powered;
        self.inputs = inputs;
        let mut fx = Effects { events: self.monitor.tick(now, sample, &self.settings.battery), ..Default::default() };
        if host_lost {
            fx.alert = Some(false);
        }

        let events = fx.events.clone();
        for event in &events {
            match *event {
                Event::PowerSource(power) => {
                    self.alerts.set_power(power);
                    let melody = if power == PowerSource::On { Melody::Beep } else { Melody::LostPower };
                    self.play(melody, &mut fx);
                }
                Event::Battery(battery) => {
                    self.alerts.set_battery(battery);
                    let melody = if battery == BatteryPresence::On { Melody::Beep } else { Melody::LostBattery };
                    self.play(melody, &mut fx);
                }
                Event::Overvoltage(ov) => {
                    self.alerts.set_overvoltage(ov);
                }
                _ => (),
            }
        }

        if self.start_when_ready
            && self.inputs.auto_enabled
            && self.monitor.averages().vbat >= self.settings.battery.autostart
        {
            self.start_when_ready = false;
            self.set_output(true, &mut fx);
        }

        if self.battery_good() {
            self.coordinator.on_battery_recovered(&mut self.alerts);
        }

        for event in &events {
            let host = self.host();
            let outcome = match event {
                Event::Fired(Timer::Critical) => self.coordinator.on_critical(now, host, &mut self.alerts),
                Event::Fired(Timer::Low) => self.coordinator.on_low(host, &mut self.alerts),
                _ => Outcome::Nothing,
            };
            self.apply_outcome(outcome, &mut fx);
        }

        let outcome = self.coordinator.poll(now);
        self.apply_outcome(outcome, &mut fx);

        if !self.player.owns_led() {
            fx.led = Some(self.monitor.led(&self.settings.battery));
        }

        self.finish(fx)
    }

    /// Once-per-second housekeeping: restart countdown, history sampling and silent mode.
    pub fn tick_second(&mut self, now: Millis) -> Effects {
        let mut fx = Effects::default();

        if self.restart_countdown > 0 {
            self.restart_countdown -= 1;
            if self.restart_countdown == 0 {
                if self.battery_good() {
                    self.set_output(true, &mut fx);
                    self.play(Melody::Beep, &mut fx);
                } else {
                    self.play(Melody::Error, &mut fx);
                }
            }
        }

        if now >= self.next_history {
            self.next_history = now + SAMPLE_PERIOD_MS;
            let avg = self.monitor.averages();
            self.battery_history.push(avg.vbat, avg.ichg);
            self.thermal_history.push(self.thermal.temperature as u16, self.thermal.fan_duty.into());
            self.update_sound_enabled(now);
        }

        self.finish(fx)
    }

    fn update_sound_enabled(&mut self, now: Millis) {
        self.sound_enabled = self.settings.silent.sound_enabled(self.clock.minute_of_day(now));
    }

    /// Whether sounds are currently allowed.
    pub fn sound_enabled(&self) -> bool {
        self.sound_enabled
    }

    /// Updates the thermal readings and returns the new fan duty if it changed.
    pub fn update_thermal(&mut self, temperature: i16, fan_rpm: u16) -> Option<u8> {
        self.thermal.temperature = temperature;
        self.thermal.fan_rpm = fan_rpm;
        let mut duty = self.settings.fan.duty(temperature);
        if !self.sound_enabled {
            duty = duty.min(self.settings.silent.max_fan_duty);
        }
        let duty = duty.min(100) as u8;
        (duty != self.thermal.fan_duty).then(|| {
            self.thermal.fan_duty = duty;
            duty
        })
    }

    /// Whether a press on a button should be confirmed.
    pub fn accept_button(&mut self, cmd: TaskCmd, now: Millis) -> bool {
        self.buttons.accept(cmd, now)
    }

    /// Start button confirmation with its level after the confirm delay.
    pub fn on_start_confirmed(&mut self, pressed: bool) -> Effects {
        let mut fx = Effects::default();
        if !pressed {
            return fx;
        }
        if self.battery_good() {
            self.set_output(true, &mut fx);
            self.play(Melody::Beep, &mut fx);
            self.alerts.set_shutdown(ShutdownReason::None);
            self.start_when_ready = false;
        } else {
            self.play(Melody::Error, &mut fx);
        }
        self.finish(fx)
    }

    /// Stop button confirmation with its level after the confirm delay.
    pub fn on_stop_confirmed(&mut self, pressed: bool) -> Effects {
        let mut fx = Effects::default();
        if pressed {
            self.play(Melody::Beep, &mut fx);
            fx.hold_check = true;
        }
        fx
    }

    /// Stop button hold check.
    pub fn on_stop_hold(&mut self, kind: StopKind, host_powered: bool) -> Effects {
        let mut fx = Effects::default();
        self.inputs.host_powered = host_powered;
        match kind {
            StopKind::Forced => self.set_output(false, &mut fx),
            StopKind::Graceful if !host_powered => self.set_output(false, &mut fx),
            StopKind::Graceful => {
                self.alerts.set_shutdown(ShutdownReason::Now);
                self.alerts.notify();
            }
        }
        self.play(Melody::Beep, &mut fx);
        self.start_when_ready = false;
        self.finish(fx)
    }

    /// Handles a register access by the host.
    pub fn handle(&mut self, access: Access, now: Millis) -> Result<Effects, Error> {
        let mut fx = Effects::default();
        match access {
            Access::Command(cmd) => self.command(cmd, &mut fx),
            Access::Read(reg::MAIN) => {
                fx.reply = Vec::from_slice(&self.main_status().encode()).ok();
            }
            Access::Read(reg::ALERT) => {
                fx.reply = Vec::from_slice(&self.alerts.encode()).ok();
                self.alerts.acknowledge();
                self.coordinator.on_acknowledge();
                fx.alert = Some(false);
                return Ok(fx);
            }
            Access::Read(reg) => return Err(Error::UnknownRegister(reg)),
            Access::Write { reg, data } => self.write(reg, &data, now, &mut fx)?,
        }
        Ok(self.finish(fx))
    }

    fn command(&mut self, cmd: Command, fx: &mut Effects) {
        match cmd {
            Command::PowerOff | Command::ShutdownReady | Command::RestartReady { .. } => {
                self.set_output(false, fx);
                self.host_in_shutdown = false;
                let outcome = self.coordinator.on_ready(cmd == Command::PowerOff, &mut self.alerts);
                self.apply_outcome(outcome, fx);
                if let Command::RestartReady { delay } = cmd {
                    self.restart_countdown = delay.max(MIN_RESTART_DELAY);
                }
            }
            Command::ReadBatteryHistory => fx.bulk = Some(HistoryKind::Battery),
            Command::ReadThermalHistory => fx.bulk = Some(HistoryKind::Thermal),
        }
    }

    fn write(&mut self, reg: u8, data: &[u8], now: Millis, fx: &mut Effects) -> Result<(), Error> {
        match reg {
            reg::FAN_CFG => fx.settings_changed = self.settings.apply_fan(data)?,
            reg::SILENT_CFG => {
                fx.settings_changed = self.settings.apply_silent(data)?;
                self.update_sound_enabled(now);
            }
            reg::BAT_CFG => fx.settings_changed = self.settings.apply_battery(data)?,
            reg::BAT_LOW => fx.settings_changed = self.settings.apply_battery_low(data)?,
            reg::RTC => {
                let dt = DateTime::unpack(data).ok_or(Error::Clock)?;
                fx.restore_history = self.clock.set(dt, now);
                self.update_sound_enabled(now);
            }
            reg::SHD_STATE => match data.first() {
                Some(&reg::SHD_STATE_IDLE) => self.host_in_shutdown = false,
                Some(&reg::SHD_STATE_BUSY) => self.host_in_shutdown = true,
                _ => (),
            },
            _ => return Err(Error::UnknownRegister(reg)),
        }
        Ok(())
    }

    /// Rebuilds a history from its stored snapshot.
    pub fn restore_history(
        &mut self, kind: HistoryKind, snapshot: &[u8], stamp: DateTime, now: Millis,
    ) -> Result<(), history::Error> {
        let now = self.clock.now(now).ok_or(history::Error::Stale)?;
        match kind {
            HistoryKind::Battery => self.battery_history.restore(snapshot, stamp, now),
            HistoryKind::Thermal => self.thermal_history.restore(snapshot, stamp, now),
        }
    }

    /// Whether mains is absent so that cutting power switches the controller off.
    pub fn can_power_off(&self) -> bool {
        self.last_sample.vps <= SUPPLY_OFF_LEVEL_MV
    }

    /// Starts the power off sequence.
    pub fn begin_power_off(&mut self, now: Millis) -> Result<PowerOff, MainsPresent> {
        if !self.can_power_off() {
            self.coordinator.on_power_off_failed();
            return Err(MainsPresent);
        }
        let sound = match self.player.request(Melody::Countdown, !self.sound_enabled) {
            Request::Started(step) => Some(step),
            _ => None,
        };
        Ok(PowerOff { stamp: self.clock.now(now), sound })
    }

    /// Completes the power off sequence after the countdown.
    ///
    /// Mains may have returned during the countdown, in which case the
    /// coordinator returns to idle.
    pub fn finish_power_off(&mut self) -> Result<(), MainsPresent> {
        if !self.can_power_off() {
            self.coordinator.on_power_off_failed();
            return Err(MainsPresent);
        }
        Ok(())
    }

    /// Plays the start-up greeting.
    pub fn welcome(&mut self) -> Effects {
        let mut fx = Effects::default();
        self.play(Melody::Welcome, &mut fx);
        fx
    }

    /// Advances sound playback after the current step elapsed.
    pub fn advance_sound(&mut self) -> Advance {
        self.player.advance()
    }
}
