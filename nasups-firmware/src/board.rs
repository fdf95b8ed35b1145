//! Board wiring.

use core::convert::Infallible;

use embedded_hal::{
    blocking::delay::DelayUs,
    digital::v2::{InputPin, OutputPin, PinState},
    PwmPin,
};
use rp2040_hal::{
    gpio::{DynPinId, FunctionSioInput, FunctionSioOutput, Interrupt as PinInterrupt, Pin, PullDown, PullUp},
    pwm::{FreeRunning, Pwm0, Pwm4, Slice},
};

use nasups_shared::{
    monitor::Led,
    sound::{LedCmd, Step, Tone},
};

/// Crystal frequency.
pub const XTAL_FREQ_HZ: u32 = 12_000_000;

/// System clock after PLL setup.
pub const SYS_CLOCK_HZ: u32 = 125_000_000;

/// I2C address of the TMP275 temperature sensor on the auxiliary bus.
pub const TMP275_ADDR: u8 = 0x4f;

/// Auxiliary bus frequency.
pub const AUX_I2C_HZ: u32 = 100_000;

/// Buzzer PWM clock divider.
const BUZZ_DIV: u8 = 40;

/// Fan PWM frequency.
const FAN_PWM_HZ: u32 = 25_000;

/// Tachometer pulses per fan revolution.
const FAN_PULSES_PER_REV: u32 = 2;

/// Low time of the alert line before a repeated rising edge.
const ALERT_GAP_US: u32 = 10_000;

/// Busy-wait delay at the system clock.
///
/// The system timer is taken by the monotonic.
#[derive(Clone, Copy, Default)]
pub struct Delay;

impl DelayUs<u32> for Delay {
    fn delay_us(&mut self, us: u32) {
        cortex_m::asm::delay(us.saturating_mul(SYS_CLOCK_HZ / 1_000_000));
    }
}

/// Digital output.
pub type Output = Pin<DynPinId, FunctionSioOutput, PullDown>;

/// Digital input with pull-up.
pub type Input = Pin<DynPinId, FunctionSioInput, PullUp>;

/// Digital input with pull-down.
pub type InputPd = Pin<DynPinId, FunctionSioInput, PullDown>;

fn set(pin: &mut Output, high: bool) {
    let _ = pin.set_state(PinState::from(high));
}

fn is_high<P: InputPin<Error = Infallible>>(pin: &P) -> bool {
    pin.is_high().unwrap_or_default()
}

/// Digital outputs.
pub struct Outputs {
    /// Protected output switch, GPIO 16.
    pub out_sw: Output,
    /// Battery switch, GPIO 17.
    pub bat_sw: Output,
    /// Power off latch, GPIO 21.
    pub pwr_off: Output,
    /// Alert line to host, GPIO 3.
    pub nas_alert: Output,
    /// GPIO 14.
    pub grn_led: Output,
    /// GPIO 15.
    pub red_led: Output,
    /// On-board LED, GPIO 25.
    pub brd_led: Output,
}

/// Board outputs.
pub struct Board {
    out: Outputs,
    /// Buzzer PWM, channel B on GPIO 9.
    buzz: Slice<Pwm4, FreeRunning>,
    /// Fan PWM, channel B on GPIO 1.
    fan: Slice<Pwm0, FreeRunning>,
    heartbeat: bool,
    alert: bool,
}

impl Board {
    /// Sets up PWM slices and brings all outputs into their idle state.
    pub fn new(out: Outputs, mut buzz: Slice<Pwm4, FreeRunning>, mut fan: Slice<Pwm0, FreeRunning>) -> Self {
        buzz.set_div_int(BUZZ_DIV);
        buzz.channel_b.set_duty(0);
        buzz.enable();

        fan.set_div_int(1);
        fan.set_top((SYS_CLOCK_HZ / FAN_PWM_HZ - 1) as u16);
        fan.channel_b.set_duty(0);
        fan.enable();

        let mut board = Self { out, buzz, fan, heartbeat: false, alert: false };
        board.set_output(false);
        board.set_battery_switch(true);
        board.set_alert(false);
        board.set_led(Some(Led::Orange));
        board
    }

    /// Switches the protected output.
    pub fn set_output(&mut self, on: bool) {
        set(&mut self.out.out_sw, on);
    }

    /// Connects or disconnects the battery.
    pub fn set_battery_switch(&mut self, on: bool) {
        set(&mut self.out.bat_sw, on);
    }

    /// Asserts the power off latch.
    ///
    /// Without mains this removes power from the controller.
    pub fn latch_power_off(&mut self) {
        set(&mut self.out.pwr_off, true);
    }

    /// Drives the alert line to the host.
    ///
    /// Raising a line that is already high drops it briefly, so that the
    /// host sees a rising edge for every alert.
    pub fn set_alert(&mut self, on: bool) {
        if on && self.alert {
            set(&mut self.out.nas_alert, false);
            Delay.delay_us(ALERT_GAP_US);
        }
        set(&mut self.out.nas_alert, on);
        self.alert = on;
    }

    /// Shows a status color, `None` turns the LED off.
    pub fn set_led(&mut self, led: Option<Led>) {
        let (green, red) = match led {
            Some(Led::Green) => (true, false),
            Some(Led::Orange) => (true, true),
            Some(Led::Red) => (false, true),
            None => (false, false),
        };
        set(&mut self.out.grn_led, green);
        set(&mut self.out.red_led, red);
    }

    /// Plays a tone, `None` silences the buzzer.
    pub fn set_tone(&mut self, tone: Option<Tone>) {
        match tone {
            Some(Tone { freq, duty }) if freq > 0 => {
                let top = SYS_CLOCK_HZ / BUZZ_DIV as u32 / freq as u32 - 1;
                let top = top.min(u16::MAX as u32 - 1);
                self.buzz.set_top(top as u16);
                self.buzz.channel_b.set_duty(((top + 1) * duty.min(1000) as u32 / 1000) as u16);
            }
            _ => self.buzz.channel_b.set_duty(0),
        }
    }

    /// Outputs a sequence step.
    pub fn play(&mut self, step: &Step) {
        self.set_tone(step.tone);
        match step.led {
            LedCmd::Keep => (),
            LedCmd::Off => self.set_led(None),
            LedCmd::Show(led) => self.set_led(Some(led)),
        }
    }

    /// Sets the fan duty cycle in percent.
    pub fn set_fan_duty(&mut self, percent: u8) {
        let top = self.fan.get_top() as u32 + 1;
        self.fan.channel_b.set_duty((top * percent.min(100) as u32 / 100) as u16);
    }

    /// Toggles the on-board LED.
    pub fn heartbeat(&mut self) {
        self.heartbeat = !self.heartbeat;
        set(&mut self.out.brd_led, self.heartbeat);
    }
}

/// Board inputs.
pub struct Panel {
    /// Host power sense on GPIO 2, high when the host is powered.
    pub nas_on: InputPd,
    /// Auto switch on GPIO 6, low selects automatic output restore.
    pub b_auto: Input,
    /// Start button on GPIO 7, low when pressed.
    pub b_start: Input,
    /// Stop button on GPIO 8, low when pressed.
    pub b_stop: Input,
    /// Fan tachometer on GPIO 0.
    pub fan_rpm: Input,
    fan_pulses: u32,
}

/// Interrupt source of the GPIO bank.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum PanelIrq {
    StartPressed,
    StopPressed,
    FanPulse,
}

impl Panel {
    /// Enables falling edge interrupts of buttons and tachometer.
    pub fn new(nas_on: InputPd, b_auto: Input, b_start: Input, b_stop: Input, fan_rpm: Input) -> Self {
        b_start.set_interrupt_enabled(PinInterrupt::EdgeLow, true);
        b_stop.set_interrupt_enabled(PinInterrupt::EdgeLow, true);
        fan_rpm.set_interrupt_enabled(PinInterrupt::EdgeLow, true);
        Self { nas_on, b_auto, b_start, b_stop, fan_rpm, fan_pulses: 0 }
    }

    pub fn host_powered(&self) -> bool {
        is_high(&self.nas_on)
    }

    pub fn auto_enabled(&self) -> bool {
        !is_high(&self.b_auto)
    }

    pub fn start_pressed(&self) -> bool {
        !is_high(&self.b_start)
    }

    pub fn stop_pressed(&self) -> bool {
        !is_high(&self.b_stop)
    }

    /// Takes and clears the pending GPIO interrupt with the highest priority.
    pub fn take_irq(&mut self) -> Option<PanelIrq> {
        if self.b_start.interrupt_status(PinInterrupt::EdgeLow) {
            self.b_start.clear_interrupt(PinInterrupt::EdgeLow);
            Some(PanelIrq::StartPressed)
        } else if self.b_stop.interrupt_status(PinInterrupt::EdgeLow) {
            self.b_stop.clear_interrupt(PinInterrupt::EdgeLow);
            Some(PanelIrq::StopPressed)
        } else if self.fan_rpm.interrupt_status(PinInterrupt::EdgeLow) {
            self.fan_rpm.clear_interrupt(PinInterrupt::EdgeLow);
            self.fan_pulses = self.fan_pulses.wrapping_add(1);
            Some(PanelIrq::FanPulse)
        } else {
            None
        }
    }

    /// Fan speed in RPM from the pulses counted during `period_ms`.
    pub fn take_fan_rpm(&mut self, period_ms: u32) -> u16 {
        let pulses = core::mem::take(&mut self.fan_pulses);
        let rpm = pulses * 60_000 / FAN_PULSES_PER_REV / period_ms.max(1);
        rpm.min(u16::MAX as u32) as u16
    }
}
