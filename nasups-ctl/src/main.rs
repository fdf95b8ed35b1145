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

//! NAS UPS controller host tool.

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, Timelike};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Target;
use log::LevelFilter;
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    thread::sleep,
    time::{Duration, Instant},
};

use nasups_shared::{
    bulk::{self, ReceiveError},
    clock::DateTime,
    config::{BatteryCfg, FanCfg, SilentCfg},
    history::{History, BUFFER_LEN, CAPACITY},
    monitor::MainStatus,
    reg,
    token::{AlertState, Command, MIN_RESTART_DELAY},
    I2C_ADDR,
};

use crate::i2c::I2cDev;

mod i2c;
mod syslog;

static STOP: AtomicBool = AtomicBool::new(false);

/// NAS UPS controller tool.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Opts {
    /// Log level.
    #[arg(short, long, default_value_t = LevelFilter::Info)]
    level: LevelFilter,
    /// I2C bus number.
    #[arg(short, long, env = "NASUPS_I2C_BUS", default_value_t = 1)]
    bus: u32,
    /// I2C address of the controller.
    #[arg(short, long, default_value_t = I2C_ADDR as u16, value_parser = parse_addr)]
    addr: u16,
    /// Log to syslog instead of standard error.
    #[arg(long)]
    syslog: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show voltages, charge current, temperature and fan.
    Status,
    /// Show alert states and acknowledge the alert.
    Alerts,
    /// Poll alerts and log every change.
    Watch {
        /// Poll interval in seconds.
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
    },
    /// Download a telemetry history.
    History {
        kind: HistoryKind,
        /// Write the raw buffer to this file instead of printing CSV.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Set the controller clock from local time.
    SetClock,
    /// Report whether the host is shutting down.
    ShutdownState { state: ShutdownState },
    /// Host is ready for power cut.
    ShutdownReady,
    /// Host is ready for power cut and wants to be restarted.
    RestartReady {
        /// Restart delay in seconds.
        #[arg(short, long, default_value_t = MIN_RESTART_DELAY)]
        delay: u16,
    },
    /// Cut power unconditionally.
    PowerOff,
    /// Set the low battery level.
    BatteryLow {
        /// Level in mV.
        mv: u16,
    },
    /// Set the battery thresholds.
    BatteryConfig {
        /// Overvoltage warning level in mV.
        #[arg(long, default_value_t = BatteryCfg::default().overvoltage)]
        overvoltage: u16,
        /// Output restore level in mV.
        #[arg(long, default_value_t = BatteryCfg::default().autostart)]
        autostart: u16,
        /// Low battery level in mV.
        #[arg(long, default_value_t = BatteryCfg::default().low)]
        low: u16,
        /// Critical level in mV.
        #[arg(long, default_value_t = BatteryCfg::default().critical)]
        critical: u16,
        /// Disconnected level in mV.
        #[arg(long, default_value_t = BatteryCfg::default().disconnected)]
        disconnected: u16,
        /// Minimum bulk charge current in mA.
        #[arg(long, default_value_t = BatteryCfg::default().bulk_current)]
        bulk_current: u16,
        /// Maximum float charge current in mA.
        #[arg(long, default_value_t = BatteryCfg::default().float_current)]
        float_current: u16,
    },
    /// Set the fan control table.
    FanConfig {
        /// Run at fixed duty in percent instead of following temperature.
        #[arg(long)]
        fixed: Option<u16>,
        /// Temperature in °C at which low duty applies.
        #[arg(long, default_value_t = centi_to_celsius(FanCfg::default().low_temp))]
        low_temp: f32,
        /// Temperature in °C at which high duty applies.
        #[arg(long, default_value_t = centi_to_celsius(FanCfg::default().high_temp))]
        high_temp: f32,
        /// Duty in percent at low temperature.
        #[arg(long, default_value_t = FanCfg::default().low_duty)]
        low_duty: u16,
        /// Duty in percent at high temperature.
        #[arg(long, default_value_t = FanCfg::default().high_duty)]
        high_duty: u16,
    },
    /// Set the silent mode window.
    SilentConfig {
        /// Disable silent mode.
        #[arg(long)]
        disable: bool,
        /// Start of the window as HH:MM.
        #[arg(long, default_value = "22:30", value_parser = parse_hhmm)]
        start: (u16, u16),
        /// End of the window as HH:MM.
        #[arg(long, default_value = "08:00", value_parser = parse_hhmm)]
        stop: (u16, u16),
        /// Maximum fan duty in percent during silent mode.
        #[arg(long, default_value_t = SilentCfg::default().max_fan_duty)]
        max_fan_duty: u16,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HistoryKind {
    /// Battery voltage in mV and charge current in mA.
    Battery,
    /// Temperature in 0.01 °C and fan duty in percent.
    Thermal,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ShutdownState {
    Busy,
    Idle,
}

fn parse_addr(s: &str) -> Result<u16> {
    let addr = match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    if addr > 0x7f {
        bail!("address must be 7 bits");
    }
    Ok(addr)
}

fn parse_hhmm(s: &str) -> Result<(u16, u16)> {
    let (h, m) = s.split_once(':').context("expected HH:MM")?;
    let (h, m): (u16, u16) = (h.parse()?, m.parse()?);
    if h >= 24 || m >= 60 {
        bail!("time out of range");
    }
    Ok((h, m))
}

fn centi_to_celsius(v: u16) -> f32 {
    v as f32 / 100.
}

fn celsius_to_centi(v: f32) -> Result<u16> {
    let centi = (v * 100.).round();
    if !(0. ..=u16::MAX as f32).contains(&centi) {
        bail!("temperature {v} °C out of range");
    }
    Ok(centi as u16)
}

/// Converts a calendar time to the controller clock format.
fn date_time(t: &(impl Datelike + Timelike)) -> Result<DateTime> {
    Ok(DateTime {
        year: t.year().try_into().context("year out of range")?,
        month: t.month() as u8,
        day: t.day() as u8,
        weekday: t.weekday().num_days_from_sunday() as u8,
        hour: t.hour() as u8,
        minute: t.minute() as u8,
        second: t.second() as u8,
    })
}

/// Current local time.
fn local_time() -> Result<DateTime> {
    date_time(&Local::now())
}

fn read_status(dev: &mut I2cDev) -> Result<MainStatus> {
    let mut buf = [0; reg::MAIN_LEN];
    dev.read_reg(reg::MAIN, &mut buf).context("cannot read main status")?;
    MainStatus::decode(&buf).context("invalid main status")
}

fn read_alerts(dev: &mut I2cDev) -> Result<AlertState> {
    let mut buf = [0; reg::ALERT_LEN];
    dev.read_reg(reg::ALERT, &mut buf).context("cannot read alerts")?;
    AlertState::decode(&buf).with_context(|| format!("unknown alert tokens {buf:02x?}"))
}

fn command(dev: &mut I2cDev, cmd: Command) -> Result<()> {
    log::debug!("sending command {cmd:?}");
    dev.write_reg(reg::CMD, &cmd.encode()).with_context(|| format!("cannot send command {cmd:?}"))
}

fn download(dev: &mut I2cDev, kind: HistoryKind) -> Result<Vec<u8>> {
    let cmd = match kind {
        HistoryKind::Battery => Command::ReadBatteryHistory,
        HistoryKind::Thermal => Command::ReadThermalHistory,
    };
    command(dev, cmd)?;

    let start = Instant::now();
    let mut buf = vec![0; BUFFER_LEN];
    match bulk::receive(dev, &mut buf) {
        Ok(retries) => {
            log::info!("received {kind:?} history in {} ms with {retries} retries", start.elapsed().as_millis());
            Ok(buf)
        }
        Err(ReceiveError::Link(err)) => Err(err).context("history transfer failed"),
        Err(ReceiveError::RetriesExceeded(err)) => {
            bail!("history transfer failed: chunk at {} could not be received", err.pos)
        }
    }
}

/// Writes the history as CSV with minute offset relative to the newest sample.
fn write_csv(out: &mut impl Write, history: &History, kind: HistoryKind) -> io::Result<()> {
    match kind {
        HistoryKind::Battery => writeln!(out, "minute,vbat_mv,ichg_ma")?,
        HistoryKind::Thermal => writeln!(out, "minute,temperature_c,fan_duty")?,
    }
    for (i, (ch1, ch2)) in history.iter().enumerate() {
        let minute = i as i64 - (CAPACITY as i64 - 1);
        match kind {
            HistoryKind::Battery => writeln!(out, "{minute},{ch1},{ch2}")?,
            HistoryKind::Thermal => writeln!(out, "{minute},{:.2},{ch2}", ch1 as i16 as f32 / 100.)?,
        }
    }
    Ok(())
}

fn print_alerts(alerts: &AlertState) {
    println!("shutdown:    {:?}", alerts.shutdown());
    println!("power:       {:?}", alerts.power());
    println!("battery:     {:?}", alerts.battery());
    println!("overvoltage: {:?}", alerts.overvoltage());
}

fn watch(dev: &mut I2cDev, interval: Duration) -> Result<()> {
    let mut last: Option<AlertState> = None;
    while !STOP.load(Ordering::SeqCst) {
        match read_alerts(dev) {
            Ok(alerts) => {
                let prev = last.as_ref();
                if prev.map(|p| p.shutdown()) != Some(alerts.shutdown()) {
                    log::warn!("shutdown request: {:?}", alerts.shutdown());
                }
                if prev.map(|p| p.power()) != Some(alerts.power()) {
                    log::info!("mains power: {:?}", alerts.power());
                }
                if prev.map(|p| p.battery()) != Some(alerts.battery()) {
                    log::info!("battery: {:?}", alerts.battery());
                }
                if prev.map(|p| p.overvoltage()) != Some(alerts.overvoltage()) {
                    log::info!("battery overvoltage: {:?}", alerts.overvoltage());
                }
                last = Some(alerts);
            }
            Err(err) => log::warn!("{err:#}"),
        }

        let until = Instant::now() + interval;
        while !STOP.load(Ordering::SeqCst) && Instant::now() < until {
            sleep(Duration::from_millis(100));
        }
    }
    Ok(())
}

fn perform(opts: &Opts) -> Result<()> {
    let mut dev = I2cDev::open(opts.bus, opts.addr)
        .with_context(|| format!("cannot open controller at 0x{:02x} on I2C bus {}", opts.addr, opts.bus))?;

    match &opts.cmd {
        Cmd::Status => {
            let s = read_status(&mut dev)?;
            println!("battery:     {} mV", s.vbat);
            println!("supply:      {} mV", s.vps);
            println!("system:      {} mV", s.vsys);
            println!("charge:      {} mA", s.ichg);
            println!("temperature: {:.2} °C", s.temperature as f32 / 100.);
            println!("fan:         {} rpm at {}%", s.fan_rpm, s.fan_duty);
        }
        Cmd::Alerts => print_alerts(&read_alerts(&mut dev)?),
        Cmd::Watch { interval } => watch(&mut dev, Duration::from_secs((*interval).max(1)))?,
        Cmd::History { kind, output } => {
            let buf = download(&mut dev, *kind)?;
            match output {
                Some(path) => {
                    fs::write(path, &buf).with_context(|| format!("cannot write {}", path.display()))?
                }
                None => {
                    let history = History::from_bytes(&buf).map_err(|err| anyhow::anyhow!("{err:?}"))?;
                    write_csv(&mut io::stdout().lock(), &history, *kind)?;
                }
            }
        }
        Cmd::SetClock => {
            let now = local_time()?;
            log::info!(
                "setting clock to {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                now.year,
                now.month,
                now.day,
                now.hour,
                now.minute,
                now.second
            );
            dev.write_reg(reg::RTC, &now.pack()).context("cannot set clock")?;
        }
        Cmd::ShutdownState { state } => {
            let value = match state {
                ShutdownState::Busy => reg::SHD_STATE_BUSY,
                ShutdownState::Idle => reg::SHD_STATE_IDLE,
            };
            dev.write_reg(reg::SHD_STATE, &[value]).context("cannot set shutdown state")?;
        }
        Cmd::ShutdownReady => command(&mut dev, Command::ShutdownReady)?,
        Cmd::RestartReady { delay } => command(&mut dev, Command::RestartReady { delay: *delay })?,
        Cmd::PowerOff => command(&mut dev, Command::PowerOff)?,
        Cmd::BatteryLow { mv } => {
            dev.write_reg(reg::BAT_LOW, &mv.to_le_bytes()).context("cannot set low battery level")?
        }
        Cmd::BatteryConfig { overvoltage, autostart, low, critical, disconnected, bulk_current, float_current } => {
            let cfg = BatteryCfg {
                overvoltage: *overvoltage,
                autostart: *autostart,
                low: *low,
                critical: *critical,
                disconnected: *disconnected,
                bulk_current: *bulk_current,
                float_current: *float_current,
            };
            if let Err(err) = cfg.validate() {
                bail!("invalid battery configuration: {err:?}");
            }
            dev.write_reg(reg::BAT_CFG, &cfg.encode()).context("cannot set battery configuration")?;
        }
        Cmd::FanConfig { fixed, low_temp, high_temp, low_duty, high_duty } => {
            let cfg = FanCfg {
                auto: fixed.is_none(),
                low_temp: celsius_to_centi(*low_temp)?,
                high_temp: celsius_to_centi(*high_temp)?,
                low_duty: *low_duty,
                high_duty: *high_duty,
                fixed_duty: fixed.unwrap_or(FanCfg::default().fixed_duty),
            };
            FanCfg::decode(&cfg.encode()).map_err(|err| anyhow::anyhow!("invalid fan configuration: {err:?}"))?;
            dev.write_reg(reg::FAN_CFG, &cfg.encode()).context("cannot set fan configuration")?;
        }
        Cmd::SilentConfig { disable, start, stop, max_fan_duty } => {
            let cfg = SilentCfg {
                enabled: !disable,
                start_hour: start.0,
                start_minute: start.1,
                stop_hour: stop.0,
                stop_minute: stop.1,
                max_fan_duty: *max_fan_duty,
            };
            SilentCfg::decode(&cfg.encode())
                .map_err(|err| anyhow::anyhow!("invalid silent mode configuration: {err:?}"))?;
            dev.write_reg(reg::SILENT_CFG, &cfg.encode()).context("cannot set silent mode configuration")?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    // Initialize logger.
    if opts.syslog {
        log::set_boxed_logger(Box::new(syslog::Syslog::new(c"nasups-ctl")))?;
        log::set_max_level(opts.level);
    } else {
        env_logger::builder().target(Target::Stderr).filter_level(opts.level).init();
    }

    if matches!(opts.cmd, Cmd::Watch { .. }) {
        ctrlc::set_handler(|| STOP.store(true, Ordering::SeqCst))?;
    }

    let res = perform(&opts);
    if let Err(err) = &res {
        log::error!("{err:#}");
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses() {
        assert_eq!(parse_addr("0x41").unwrap(), 0x41);
        assert_eq!(parse_addr("65").unwrap(), 0x41);
        assert!(parse_addr("0x80").is_err());
    }

    #[test]
    fn silent_window_times() {
        assert_eq!(parse_hhmm("22:30").unwrap(), (22, 30));
        assert_eq!(parse_hhmm("08:00").unwrap(), (8, 0));
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("0800").is_err());
    }

    #[test]
    fn thermal_csv_is_signed() {
        let mut history = History::new();
        history.push((-550i16) as u16, 20);
        history.push(3175, 35);

        let mut out = Vec::new();
        write_csv(&mut out, &history, HistoryKind::Thermal).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), CAPACITY + 1);
        assert_eq!(lines[CAPACITY - 1], "-1,-5.50,20");
        assert_eq!(lines[CAPACITY], "0,31.75,35");
    }

    #[test]
    fn missing_bus_is_an_error() {
        assert!(I2cDev::open(9_999, I2C_ADDR.into()).is_err());
    }

    #[test]
    fn clock_from_calendar_time() {
        let t = chrono::NaiveDate::from_ymd_opt(2024, 3, 10).unwrap().and_hms_opt(22, 30, 5).unwrap();
        let dt = date_time(&t).unwrap();
        assert_eq!(
            dt,
            DateTime { year: 2024, month: 3, day: 10, weekday: 0, hour: 22, minute: 30, second: 5 }
        );
    }

    #[test]
    fn default_fan_temperatures_round_trip() {
        let low = FanCfg::default().low_temp;
        assert_eq!(celsius_to_centi(centi_to_celsius(low)).unwrap(), low);
        assert!(celsius_to_centi(-1.).is_err());
    }
}
