//! Analog measurements.

use embedded_hal::adc::OneShot;
use rp2040_hal::{
    adc::{Adc, AdcPin},
    gpio::{bank0, FunctionSioInput, Pin, PullNone},
};

use nasups_shared::monitor::Sample;

/// Full scale of the 12-bit converter.
const FULL_SCALE: u32 = 4096;

/// Reference voltage in mV.
const VREF_MV: u32 = 3000;

/// Zero offset of the converter in counts.
const OFFSET: u32 = 19;

/// Output offset of the current sense amplifier in 1/1000 counts.
const OPA_OFFSET_MILLI: u32 = 29 * FULL_SCALE * 1000 / VREF_MV;

/// Current drawn by other loads on the charger in mA.
const CHARGER_OTHER_MA: u32 = 20;

/// Battery voltage divider in 1/1000.
const VBAT_DIVIDER: u32 = 6850;

/// Supply voltage divider in 1/1000.
const VPS_DIVIDER: u32 = 6840;

/// System voltage divider in 1/1000.
const VSYS_DIVIDER: u32 = 3000;

fn scale(counts: u32, divider: u32) -> u16 {
    (counts * divider * (VREF_MV / 1000) / FULL_SCALE).min(u16::MAX as u32) as u16
}

/// Battery voltage in mV.
pub fn battery_mv(raw: u16) -> u16 {
    scale((raw as u32).saturating_sub(OFFSET), VBAT_DIVIDER)
}

/// Supply voltage in mV.
pub fn supply_mv(raw: u16) -> u16 {
    scale((raw as u32).saturating_sub(OFFSET), VPS_DIVIDER)
}

/// System voltage in mV.
pub fn system_mv(raw: u16) -> u16 {
    scale(raw as u32, VSYS_DIVIDER)
}

/// Charge current in mA.
///
/// The sense amplifier outputs 1 mV per 1.1 mA.
pub fn charge_ma(raw: u16) -> u16 {
    let counts_milli = (raw as u32 * 1000).saturating_sub(OFFSET * 1000 + OPA_OFFSET_MILLI);
    let mv_milli = counts_milli * (VREF_MV / 8) / (FULL_SCALE / 8);
    (mv_milli * 11 / 10 / 1000).saturating_sub(CHARGER_OTHER_MA).min(u16::MAX as u32) as u16
}

type AnalogPin<I> = AdcPin<Pin<I, FunctionSioInput, PullNone>>;

/// Analog inputs of the power path.
pub struct PowerAdc {
    adc: Adc,
    vbat: AnalogPin<bank0::Gpio26>,
    vps: AnalogPin<bank0::Gpio27>,
    ichg: AnalogPin<bank0::Gpio28>,
    vsys: AnalogPin<bank0::Gpio29>,
}

impl PowerAdc {
    pub fn new(
        adc: Adc, vbat: AnalogPin<bank0::Gpio26>, vps: AnalogPin<bank0::Gpio27>, ichg: AnalogPin<bank0::Gpio28>,
        vsys: AnalogPin<bank0::Gpio29>,
    ) -> Self {
        Self { adc, vbat, vps, ichg, vsys }
    }

    fn read<P>(adc: &mut Adc, pin: &mut P) -> u16
    where
        Adc: OneShot<Adc, u16, P>,
    {
        match nb::block!(adc.read(pin)) {
            Ok(raw) => raw,
            Err(_) => {
                defmt::warn!("ADC conversion failed");
                0
            }
        }
    }

    /// Samples all channels.
    pub fn sample(&mut self) -> Sample {
        let vbat = Self::read(&mut self.adc, &mut self.vbat);
        let vps = Self::read(&mut self.adc, &mut self.vps);
        let ichg = Self::read(&mut self.adc, &mut self.ichg);
        let vsys = Self::read(&mut self.adc, &mut self.vsys);
        defmt::trace!("ADC raw: vbat={} vps={} ichg={} vsys={}", vbat, vps, ichg, vsys);

        Sample { vbat: battery_mv(vbat), vps: supply_mv(vps), vsys: system_mv(vsys), ichg: charge_ma(ichg) }
    }
}
