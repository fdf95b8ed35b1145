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

//! NAS UPS controller firmware.

#![no_std]
#![no_main]

mod adc;
mod board;
mod flash;
mod mmio;
mod tmp275;
mod watchman;

#[cfg(feature = "defmt-rtt")]
use defmt_rtt as _;
use panic_probe as _;

use defmt::unwrap;
use heapless::spsc::{Consumer, Producer};
use rp2040_hal::{
    adc::{Adc, AdcPin},
    clocks::init_clocks_and_plls,
    fugit::RateExtU32,
    gpio::{bank0, FunctionI2C, Pin, Pins, PullUp},
    pac,
    pwm::Slices,
    Clock, Sio, Watchdog, I2C,
};
use systick_monotonic::*;

use nasups_shared::{
    bridge::{self, CmdQueue, StopKind, TaskCmd, CONFIRM_MS, HOLD_CHECK_MS},
    bulk,
    controller::{self, Controller, Effects, HistoryKind, Inputs, MainsPresent},
    history::BUFFER_LEN,
    hw::RegisterBlock,
    i2c_slave::{regs::IC_INTR_MASK, I2cSlave},
    monitor::{Event, TICK_MS},
    shutdown::Phase,
    sound::{Advance, Melody, Step},
    Millis, I2C_ADDR,
};

use crate::{
    adc::PowerAdc,
    board::{Board, Delay, Outputs, Panel, PanelIrq},
    flash::Storage,
    mmio::Mmio,
    tmp275::Tmp275,
    watchman::Watchman,
};

/// Second stage bootloader for the W25Q080 flash.
#[link_section = ".boot2"]
#[used]
pub static BOOT2_FIRMWARE: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;

/// Firmware version.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

/// Base address of the I2C block the host talks to.
const I2C0_BASE: u32 = 0x4004_4000;

/// Delay between the last settings change and saving them to flash.
const SETTINGS_SAVE_DELAY_SECS: u64 = 300;

/// Instant in time.
pub type Instant = systick_monotonic::fugit::Instant<u64, 1, 100>;

/// Time duration.
pub type Duration = systick_monotonic::fugit::Duration<u64, 1, 100>;

/// Host bus slave.
type HostSlave = I2cSlave<Mmio, Delay>;

/// Auxiliary bus with the temperature sensor.
type AuxI2c =
    I2C<pac::I2C1, (Pin<bank0::Gpio18, FunctionI2C, PullUp>, Pin<bank0::Gpio19, FunctionI2C, PullUp>)>;

/// Milliseconds since boot.
fn now_ms() -> Millis {
    app::monotonics::now().duration_since_epoch().to_millis()
}

#[rtic::app(device = rp2040_hal::pac, peripherals = true, dispatchers = [SW0_IRQ, SW1_IRQ, SW2_IRQ])]
mod app {
    use super::*;

    /// System timer.
    #[monotonic(binds = SysTick, default = true)]
    type MyMono = Systick<100>;

    /// Shared resources.
    #[shared]
    struct Shared {
        /// Controller state.
        ctrl: Controller,
        /// Board outputs.
        board: Board,
        /// Board inputs.
        panel: Panel,
        /// Producer side of the interrupt work queue.
        producer: Producer<'static, TaskCmd, 17>,
        /// Watchdog manager.
        watchman: Watchman,
        /// Flash storage.
        storage: Storage,
    }

    /// Exclusive resources.
    #[local]
    struct Local {
        /// Consumer side of the interrupt work queue.
        consumer: Consumer<'static, TaskCmd, 17>,
        /// I2C slave serving the host.
        slave: HostSlave,
        /// Second handle on the slave registers for masking its interrupt.
        irq_regs: Mmio,
        /// Analog inputs.
        power_adc: PowerAdc,
        /// Auxiliary I2C bus.
        aux_i2c: AuxI2c,
        /// Temperature sensor, if it responded.
        tmp275: Option<Tmp275<AuxI2c>>,
    }

    /// Initialization (entry point).
    #[init(local = [queue: CmdQueue = CmdQueue::new()])]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        defmt::info!("nasups version {}", VERSION);

        let mut pac = cx.device;
        let mut dog = Watchdog::new(pac.WATCHDOG);
        let clocks = unwrap!(init_clocks_and_plls(
            board::XTAL_FREQ_HZ,
            pac.XOSC,
            pac.CLOCKS,
            pac.PLL_SYS,
            pac.PLL_USB,
            &mut pac.RESETS,
            &mut dog,
        )
        .ok());
        let mono = Systick::new(cx.core.SYST, board::SYS_CLOCK_HZ);

        let sio = Sio::new(pac.SIO);
        let pins = Pins::new(pac.IO_BANK0, pac.PADS_BANK0, sio.gpio_bank0, &mut pac.RESETS);

        // Outputs and PWM.
        let slices = Slices::new(pac.PWM, &mut pac.RESETS);
        let mut buzz = slices.pwm4;
        buzz.channel_b.output_to(pins.gpio9);
        let mut fan = slices.pwm0;
        fan.channel_b.output_to(pins.gpio1);
        let outputs = Outputs {
            out_sw: pins.gpio16.into_push_pull_output().into_dyn_pin(),
            bat_sw: pins.gpio17.into_push_pull_output().into_dyn_pin(),
            pwr_off: pins.gpio21.into_push_pull_output().into_dyn_pin(),
            nas_alert: pins.gpio3.into_push_pull_output().into_dyn_pin(),
            grn_led: pins.gpio14.into_push_pull_output().into_dyn_pin(),
            red_led: pins.gpio15.into_push_pull_output().into_dyn_pin(),
            brd_led: pins.gpio25.into_push_pull_output().into_dyn_pin(),
        };
        let mut board = Board::new(outputs, buzz, fan);

        // Inputs.
        let panel = Panel::new(
            pins.gpio2.into_pull_down_input().into_dyn_pin(),
            pins.gpio6.into_pull_up_input().into_dyn_pin(),
            pins.gpio7.into_pull_up_input().into_dyn_pin(),
            pins.gpio8.into_pull_up_input().into_dyn_pin(),
            pins.gpio0.into_pull_up_input().into_dyn_pin(),
        );

        // Host bus on I2C0, driven through raw registers.
        let _sda: Pin<_, FunctionI2C, PullUp> = pins.gpio4.reconfigure();
        let _scl: Pin<_, FunctionI2C, PullUp> = pins.gpio5.reconfigure();
        pac.RESETS.reset.modify(|_, w| w.i2c0().clear_bit());
        while pac.RESETS.reset_done.read().i2c0().bit_is_clear() {}
        let mut slave = I2cSlave::new(unsafe { Mmio::new(I2C0_BASE) }, Delay);
        slave.init(I2C_ADDR);
        let irq_regs = unsafe { Mmio::new(I2C0_BASE) };
        defmt::info!("I2C slave listening at 0x{:02x}", I2C_ADDR);

        // Auxiliary bus.
        let mut aux_i2c = I2C::i2c1(
            pac.I2C1,
            pins.gpio18.reconfigure(),
            pins.gpio19.reconfigure(),
            board::AUX_I2C_HZ.Hz(),
            &mut pac.RESETS,
            clocks.system_clock.freq(),
        );
        let tmp275 = match Tmp275::new(&mut aux_i2c, board::TMP275_ADDR) {
            Ok(tmp275) => Some(tmp275),
            Err(err) => {
                defmt::warn!("TMP275 not available: {}", err);
                None
            }
        };

        // Analog inputs.
        let mut power_adc = PowerAdc::new(
            Adc::new(pac.ADC, &mut pac.RESETS),
            AdcPin::new(pins.gpio26.into_floating_input()),
            AdcPin::new(pins.gpio27.into_floating_input()),
            AdcPin::new(pins.gpio28.into_floating_input()),
            AdcPin::new(pins.gpio29.into_floating_input()),
        );

        // Stored state.
        let mut storage = unsafe { Storage::new() };
        let settings = storage.load_settings().unwrap_or_else(|| {
            defmt::info!("using default settings");
            Default::default()
        });
        let autostart = storage.take_autostart();
        if autostart {
            defmt::info!("autostart requested by last power off");
        }

        let first = power_adc.sample();
        defmt::info!("first sample: {}", first);
        let inputs = Inputs { host_powered: panel.host_powered(), auto_enabled: panel.auto_enabled() };
        let mut ctrl = Controller::new(settings, first, inputs, autostart, 0);
        let welcome = ctrl.welcome();
        apply(&welcome, &mut board);

        let (producer, consumer) = cx.local.queue.split();

        let watchman = Watchman::new(dog);
        unwrap!(watchdog_petter::spawn());
        unwrap!(monitor::spawn_after(TICK_MS.millis()));
        unwrap!(second::spawn_after(1u64.secs()));

        defmt::info!("init done");
        (
            Shared { ctrl, board, panel, producer, watchman, storage },
            Local { consumer, slave, irq_regs, power_adc, aux_i2c, tmp275 },
            init::Monotonics(mono),
        )
    }

    /// Idle task.
    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        loop {
            // Sleep and wait for interrupt.
            rtic::export::wfi()
        }
    }

    /// Pets the hardware watchdog.
    #[task(shared = [watchman], priority = 2)]
    fn watchdog_petter(mut cx: watchdog_petter::Context) {
        cx.shared.watchman.lock(|watchman| watchman.pet_hardware_watchdog());
        unwrap!(watchdog_petter::spawn_after(Watchman::pet_interval()));
    }

    /// Power monitor tick.
    #[task(shared = [ctrl, board, panel, watchman], local = [power_adc, phase: Phase = Phase::Idle], priority = 1)]
    fn monitor(cx: monitor::Context) {
        let sample = cx.local.power_adc.sample();
        let mut panel = cx.shared.panel;
        let inputs = panel.lock(|panel| Inputs { host_powered: panel.host_powered(), auto_enabled: panel.auto_enabled() });

        let mut ctrl = cx.shared.ctrl;
        let (fx, phase) = ctrl.lock(|ctrl| (ctrl.tick(now_ms(), sample, inputs), ctrl.coordinator().phase()));
        if phase != *cx.local.phase {
            defmt::info!("shutdown coordination: {} -> {}", *cx.local.phase, phase);
            *cx.local.phase = phase;
        }

        let mut board = cx.shared.board;
        board.lock(|board| apply(&fx, board));

        let mut watchman = cx.shared.watchman;
        watchman.lock(|watchman| watchman.checkin());
        unwrap!(monitor::spawn_after(TICK_MS.millis()));
    }

    /// Once-per-second housekeeping and thermal control.
    #[task(shared = [ctrl, board, panel], local = [aux_i2c, tmp275], priority = 1)]
    fn second(cx: second::Context) {
        let second::SharedResources { mut ctrl, mut board, mut panel } = cx.shared;
        let second::LocalResources { aux_i2c, tmp275 } = cx.local;

        let fx = ctrl.lock(|ctrl| ctrl.tick_second(now_ms()));
        board.lock(|board| apply(&fx, board));

        let fan_rpm = panel.lock(|panel| panel.take_fan_rpm(1_000));
        let temperature = match tmp275.as_ref().map(|tmp275| tmp275.temperature(aux_i2c)) {
            Some(Ok(temperature)) => Some(temperature),
            Some(Err(err)) => {
                defmt::warn!("cannot read temperature: {}", err);
                None
            }
            None => None,
        };
        let duty = ctrl.lock(|ctrl| {
            let temperature = temperature.unwrap_or_else(|| ctrl.main_status().temperature);
            ctrl.update_thermal(temperature, fan_rpm)
        });
        board.lock(|board| {
            if let Some(duty) = duty {
                defmt::info!("fan duty {}%", duty);
                board.set_fan_duty(duty);
            }
            board.heartbeat();
        });

        unwrap!(second::spawn_after(1u64.secs()));
    }

    /// GPIO interrupt of buttons and fan tachometer.
    #[task(binds = IO_IRQ_BANK0, shared = [panel, producer], priority = 3)]
    fn io_irq_bank0(cx: io_irq_bank0::Context) {
        let io_irq_bank0::SharedResources { mut panel, mut producer } = cx.shared;
        while let Some(irq) = panel.lock(|panel| panel.take_irq()) {
            let cmd = match irq {
                PanelIrq::StartPressed => TaskCmd::StartPressed,
                PanelIrq::StopPressed => TaskCmd::StopPressed,
                PanelIrq::FanPulse => continue,
            };
            if producer.lock(|producer| bridge::post(producer, cmd)) {
                let _ = dispatch::spawn();
            } else {
                defmt::warn!("work queue full, dropping {}", cmd);
            }
        }
    }

    /// Host bus interrupt.
    ///
    /// Masks itself until the register service has drained the FIFO.
    #[task(binds = I2C0_IRQ, shared = [producer], local = [irq_regs], priority = 3)]
    fn i2c0_irq(mut cx: i2c0_irq::Context) {
        cx.local.irq_regs.write32(IC_INTR_MASK, 0);
        if cx.shared.producer.lock(|producer| bridge::post(producer, TaskCmd::I2c)) {
            let _ = dispatch::spawn();
        } else if i2c_service::spawn().is_err() {
            defmt::trace!("I2C service already pending");
        }
    }

    /// Interprets work items posted by interrupt handlers.
    #[task(shared = [ctrl], local = [consumer], priority = 2)]
    fn dispatch(mut cx: dispatch::Context) {
        while let Some(cmd) = cx.local.consumer.dequeue() {
            match cmd {
                TaskCmd::I2c => {
                    if i2c_service::spawn().is_err() {
                        defmt::trace!("I2C service already pending");
                    }
                }
                TaskCmd::StartPressed | TaskCmd::StopPressed => {
                    if cx.shared.ctrl.lock(|ctrl| ctrl.accept_button(cmd, now_ms())) {
                        defmt::debug!("{} accepted", cmd);
                        if button_confirm::spawn_after(CONFIRM_MS.millis(), cmd).is_err() {
                            defmt::warn!("cannot schedule confirmation of {}", cmd);
                        }
                    }
                }
            }
        }
    }

    /// Confirms a button press by the pin level.
    #[task(shared = [ctrl, board, panel], capacity = 2, priority = 1)]
    fn button_confirm(cx: button_confirm::Context, cmd: TaskCmd) {
        let button_confirm::SharedResources { mut ctrl, mut board, mut panel } = cx.shared;
        let fx = match cmd {
            TaskCmd::StartPressed => {
                let pressed = panel.lock(|panel| panel.start_pressed());
                defmt::info!("start button {}", if pressed { "confirmed" } else { "bounced" });
                ctrl.lock(|ctrl| ctrl.on_start_confirmed(pressed))
            }
            TaskCmd::StopPressed => {
                let pressed = panel.lock(|panel| panel.stop_pressed());
                defmt::info!("stop button {}", if pressed { "confirmed" } else { "bounced" });
                ctrl.lock(|ctrl| ctrl.on_stop_confirmed(pressed))
            }
            TaskCmd::I2c => return,
        };
        board.lock(|board| apply(&fx, board));
    }

    /// Checks whether the stop button is still held.
    #[task(shared = [ctrl, board, panel], priority = 1)]
    fn stop_hold(cx: stop_hold::Context) {
        let stop_hold::SharedResources { mut ctrl, mut board, mut panel } = cx.shared;
        let (held, host_powered) = panel.lock(|panel| (panel.stop_pressed(), panel.host_powered()));
        let kind = StopKind::from_held(held);
        defmt::info!("stop requested: {}", kind);
        let fx = ctrl.lock(|ctrl| ctrl.on_stop_hold(kind, host_powered));
        board.lock(|board| apply(&fx, board));
    }

    /// Serves register accesses of the host until the receive FIFO is drained.
    #[task(
        shared = [ctrl, board],
        local = [slave, bulk_buf: [u8; BUFFER_LEN] = [0; BUFFER_LEN], save: Option<save_settings::SpawnHandle> = None],
        priority = 1,
    )]
    fn i2c_service(cx: i2c_service::Context) {
        let i2c_service::SharedResources { mut ctrl, mut board } = cx.shared;
        let i2c_service::LocalResources { slave, bulk_buf, save } = cx.local;

        while let Some(res) = controller::receive(slave) {
            match res.and_then(|access| {
                defmt::debug!("register access {}", access);
                ctrl.lock(|ctrl| ctrl.handle(access, now_ms()))
            }) {
                Ok(fx) => {
                    if let Some(reply) = &fx.reply {
                        if let Err(err) = slave.send_block(reply, 0, reply.len(), false) {
                            defmt::warn!("register reply failed: {}", err);
                        }
                    }

                    if let Some(kind) = fx.bulk {
                        ctrl.lock(|ctrl| bulk_buf.copy_from_slice(ctrl.history(kind).as_bytes()));
                        match bulk::send(slave, &bulk_buf[..]) {
                            Ok(stats) => defmt::info!(
                                "sent {} history in {} chunks with {} retries",
                                kind,
                                stats.chunks,
                                stats.retries
                            ),
                            Err(err) => defmt::warn!("{} history transfer failed: {}", kind, err),
                        }
                    }

                    if fx.settings_changed {
                        defmt::info!("settings changed, saving in {} s", SETTINGS_SAVE_DELAY_SECS);
                        let delay = SETTINGS_SAVE_DELAY_SECS.secs();
                        *save = match save.take().map(|handle| handle.reschedule_after(delay)) {
                            Some(Ok(handle)) => Some(handle),
                            _ => save_settings::spawn_after(delay).ok(),
                        };
                    }

                    board.lock(|board| apply(&fx, board));
                }
                Err(err) => defmt::warn!("register access failed: {}", err),
            }

            answer_read_request(slave);
        }

        answer_read_request(slave);
        slave.listen(true);
    }

    /// Saves the settings to flash.
    #[task(shared = [ctrl, storage], priority = 1)]
    fn save_settings(cx: save_settings::Context) {
        let save_settings::SharedResources { mut ctrl, mut storage } = cx.shared;
        let settings = ctrl.lock(|ctrl| *ctrl.settings());
        storage.lock(|storage| storage.save_settings(&settings));
        defmt::info!("settings saved");
    }

    /// Restores the histories from their snapshots after the clock was set.
    #[task(shared = [ctrl, storage], priority = 1)]
    fn restore_history(cx: restore_history::Context) {
        let restore_history::SharedResources { ctrl, storage } = cx.shared;
        (ctrl, storage).lock(|ctrl, storage| {
            for kind in [HistoryKind::Battery, HistoryKind::Thermal] {
                match storage.load_snapshot(kind) {
                    Some((snapshot, stamp)) => match ctrl.restore_history(kind, snapshot, stamp, now_ms()) {
                        Ok(()) => defmt::info!("restored {} history from {}", kind, stamp),
                        Err(err) => defmt::info!("{} history snapshot discarded: {}", kind, err),
                    },
                    None => defmt::debug!("no {} history snapshot", kind),
                }
                storage.erase_snapshot(kind);
            }
        });
    }

    /// Starts the power off sequence.
    #[task(shared = [ctrl, board, storage], priority = 1)]
    fn power_off(cx: power_off::Context) {
        let power_off::SharedResources { mut ctrl, mut board, storage } = cx.shared;

        let off = match ctrl.lock(|ctrl| ctrl.begin_power_off(now_ms())) {
            Ok(off) => off,
            Err(MainsPresent) => {
                defmt::warn!("power off failed: mains present");
                return;
            }
        };
        defmt::info!("powering off");

        (&mut ctrl, storage).lock(|ctrl, storage| {
            for kind in [HistoryKind::Battery, HistoryKind::Thermal] {
                match off.stamp {
                    Some(stamp) => storage.save_snapshot(kind, ctrl.history(kind), stamp),
                    None => storage.erase_snapshot(kind),
                }
            }
        });
        if off.stamp.is_none() {
            defmt::info!("clock not set, history not saved");
        }

        match off.sound {
            Some(step) => board.lock(|board| play(&step, board)),
            None => defmt::info!("countdown queued"),
        }
    }

    /// Advances sound playback.
    #[task(shared = [ctrl, board], priority = 1)]
    fn buzzer(cx: buzzer::Context) {
        let buzzer::SharedResources { mut ctrl, mut board } = cx.shared;
        loop {
            match ctrl.lock(|ctrl| ctrl.advance_sound()) {
                Advance::Step(step) => {
                    board.lock(|board| play(&step, board));
                    break;
                }
                Advance::Finished(melody) => {
                    board.lock(|board| board.set_tone(None));
                    defmt::trace!("{} finished", melody);
                    if melody == Melody::Countdown && power_cut::spawn().is_err() {
                        defmt::error!("cannot cut power");
                    }
                }
                Advance::Idle => break,
            }
        }
    }

    /// Cuts power after the countdown.
    #[task(shared = [ctrl, board, storage], priority = 1)]
    fn power_cut(cx: power_cut::Context) {
        let power_cut::SharedResources { mut ctrl, mut board, mut storage } = cx.shared;

        if ctrl.lock(|ctrl| ctrl.finish_power_off()).is_err() {
            defmt::warn!("power off failed: mains returned");
            return;
        }

        storage.lock(|storage| storage.save_autostart());
        defmt::info!("cutting power");
        board.lock(|board| {
            board.set_output(false);
            board.set_battery_switch(false);
            board.latch_power_off();
        });
    }

    /// Outputs a sound step and schedules the next one.
    fn play(step: &Step, board: &mut Board) {
        board.play(step);
        if buzzer::spawn_after((step.ms as u64).millis()).is_err() {
            defmt::warn!("sound already playing");
        }
    }

    /// Applies controller effects to the board and schedules follow-up tasks.
    fn apply(fx: &Effects, board: &mut Board) {
        for event in &fx.events {
            match event {
                Event::Armed(timer) => defmt::info!("{} timer armed", timer),
                Event::Disarmed(timer) => defmt::info!("{} timer disarmed", timer),
                Event::Fired(timer) => defmt::warn!("{} timer fired", timer),
                event => defmt::info!("{}", event),
            }
        }

        if let Some(on) = fx.output {
            defmt::info!("output {}", if on { "on" } else { "off" });
            board.set_output(on);
        }
        if let Some(alert) = fx.alert {
            defmt::debug!("alert line {}", alert);
            board.set_alert(alert);
        }
        if let Some(led) = fx.led {
            board.set_led(Some(led));
        }
        if let Some(duty) = fx.fan_duty {
            board.set_fan_duty(duty);
        }
        if let Some(step) = &fx.sound {
            play(step, board);
        }

        if fx.power_off && power_off::spawn().is_err() {
            defmt::warn!("power off already in progress");
        }
        if fx.restore_history && restore_history::spawn().is_err() {
            defmt::warn!("history restore already pending");
        }
        if fx.hold_check && stop_hold::spawn_after(HOLD_CHECK_MS.millis()).is_err() {
            defmt::warn!("stop hold check already pending");
        }
    }

    /// Answers a read request that no register reply consumed.
    fn answer_read_request(slave: &mut HostSlave) {
        if slave.read_request_pending() {
            if let Err(err) = slave.send_none() {
                defmt::warn!("cannot answer read request: {}", err);
            }
        }
    }
}
