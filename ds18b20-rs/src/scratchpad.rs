use crate::{ConfigurationRegister, Resolution};
use fixed::types::I12F4;
use owp_onewire::OneWireCrc;

/// Raw temperature register format, signed with four fractional bits.
pub type Temperature = I12F4;

/// Size of the scratchpad, CRC included.
pub const SCRATCHPAD_LEN: usize = 9;
/// Readings at or above this value are discarded.
pub const MAX_TEMPERATURE: f64 = 125.0;
/// Readings at or below this value are discarded.
pub const MIN_TEMPERATURE: f64 = -55.0;

pub(crate) const OFFSET_TEMPERATURE_LSB: usize = 0;
pub(crate) const OFFSET_TEMPERATURE_MSB: usize = 1;
pub(crate) const OFFSET_TH: usize = 2;
pub(crate) const OFFSET_TL: usize = 3;
pub(crate) const OFFSET_CONFIGURATION: usize = 4;
pub(crate) const OFFSET_CRC: usize = 8;

/// Converts the two temperature bytes to °C.
///
/// # Returns
/// `None` when the value lies outside the sensor's open range (-55 °C, +125 °C).
pub fn decode_temperature(lsb: u8, msb: u8) -> Option<f64> {
    let t: f64 = Temperature::from_le_bytes([lsb, msb]).to_num();
    if t >= MAX_TEMPERATURE || t <= MIN_TEMPERATURE {
        return None;
    }
    Some(t)
}

/// A full copy of the DS18B20 scratchpad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scratchpad([u8; SCRATCHPAD_LEN]);

impl Scratchpad {
    /// Wraps nine bytes read from the device if their CRC validates.
    pub fn validated(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; SCRATCHPAD_LEN] = bytes.try_into().ok()?;
        OneWireCrc::validate(&bytes).then_some(Self(bytes))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; SCRATCHPAD_LEN] {
        &self.0
    }

    /// Last converted temperature, `None` outside the valid range.
    pub fn temperature(&self) -> Option<f64> {
        decode_temperature(
            self.0[OFFSET_TEMPERATURE_LSB],
            self.0[OFFSET_TEMPERATURE_MSB],
        )
    }

    /// Tₕ alarm register.
    pub fn high_alarm(&self) -> u8 {
        self.0[OFFSET_TH]
    }

    /// Tₗ alarm register.
    pub fn low_alarm(&self) -> u8 {
        self.0[OFFSET_TL]
    }

    /// Configuration register.
    pub fn configuration(&self) -> ConfigurationRegister {
        ConfigurationRegister::from_bits(self.0[OFFSET_CONFIGURATION])
    }

    /// Resolution selected by the configuration register.
    pub fn resolution(&self) -> Resolution {
        self.configuration().resolution()
    }

    /// Mirrors a Write Scratchpad of Tₕ, Tₗ and configuration, keeping the CRC consistent.
    pub(crate) fn set_registers(&mut self, th: u8, tl: u8, config: ConfigurationRegister) {
        self.0[OFFSET_TH] = th;
        self.0[OFFSET_TL] = tl;
        self.0[OFFSET_CONFIGURATION] = config.into_bits();
        self.0[OFFSET_CRC] = owp_onewire::crc8(&self.0[..OFFSET_CRC]);
    }
}
