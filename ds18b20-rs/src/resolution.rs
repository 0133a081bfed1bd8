use bitfield_struct::bitfield;
use core::{fmt, time::Duration};

/// Conversion time at 12-bit resolution.
pub const MAX_CONVERSION_TIME: Duration = Duration::from_millis(750);

/// Temperature readout resolution.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Resolution {
    /// 0.5 °C steps.
    Bits9 = 9,
    /// 0.25 °C steps.
    Bits10 = 10,
    /// 0.125 °C steps.
    Bits11 = 11,
    /// 0.0625 °C steps, the power-on default.
    #[default]
    Bits12 = 12,
}

/// Configuration register bits 5-6 per resolution.
const REGISTER_BITS: [(u8, Resolution); 4] = [
    (0b00, Resolution::Bits9),
    (0b01, Resolution::Bits10),
    (0b10, Resolution::Bits11),
    (0b11, Resolution::Bits12),
];

/// How much faster than a 12-bit conversion each resolution completes.
const SPEED_FACTOR: [(Resolution, u32); 4] = [
    (Resolution::Bits9, 8),
    (Resolution::Bits10, 4),
    (Resolution::Bits11, 2),
    (Resolution::Bits12, 1),
];

impl Resolution {
    /// Decodes the two resolution bits of the configuration register.
    pub fn from_register_bits(bits: u8) -> Self {
        let bits = bits & 0b11;
        REGISTER_BITS
            .iter()
            .find(|(b, _)| *b == bits)
            .map_or(Self::Bits12, |&(_, r)| r)
    }

    /// The two resolution bits of the configuration register.
    pub fn register_bits(self) -> u8 {
        REGISTER_BITS
            .iter()
            .find(|(_, r)| *r == self)
            .map_or(0b11, |&(b, _)| b)
    }

    /// Conversion speed relative to 12-bit resolution.
    pub fn speed_factor(self) -> u32 {
        SPEED_FACTOR
            .iter()
            .find(|(r, _)| *r == self)
            .map_or(1, |&(_, f)| f)
    }

    /// Worst-case duration of one temperature conversion.
    pub fn conversion_time(self) -> Duration {
        MAX_CONVERSION_TIME / self.speed_factor()
    }

    /// Age after which a cached reading is considered stale.
    pub fn refresh_interval(self, operation_timeout: Duration) -> Duration {
        operation_timeout / self.speed_factor()
    }

    /// Number of significant bits.
    pub fn bits(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Resolution {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            9 => Ok(Self::Bits9),
            10 => Ok(Self::Bits10),
            11 => Ok(Self::Bits11),
            12 => Ok(Self::Bits12),
            _ => Err("resolution must be 9, 10, 11 or 12 bits"),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

#[bitfield(u8)]
/// # Configuration register
///
/// Byte 4 of the scratchpad. Bits 5 and 6 select the resolution; the lower five bits
/// read as 1 and bit 7 as 0.
pub struct ConfigurationRegister {
    #[bits(5, default = 0x1f)]
    reserved: u8,
    #[bits(2, default = 0b11)]
    resolution_bits: u8,
    #[bits(1)]
    __: u8,
}

impl ConfigurationRegister {
    /// Resolution selected by the register.
    pub fn resolution(&self) -> Resolution {
        Resolution::from_register_bits(self.resolution_bits())
    }

    /// Returns the register with `resolution` selected.
    pub fn with_resolution(self, resolution: Resolution) -> Self {
        self.with_resolution_bits(resolution.register_bits())
    }
}

impl From<Resolution> for ConfigurationRegister {
    fn from(resolution: Resolution) -> Self {
        Self::new().with_resolution(resolution)
    }
}
