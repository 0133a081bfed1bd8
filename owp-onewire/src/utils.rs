/// Reflected form of the 1-Wire polynomial x^8 + x^5 + x^4 + 1.
const CRC8_POLY: u8 = 0x8c;

#[cfg(feature = "crc-table")]
const CRC8_TABLE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = crc8_bitwise(0, i as u8);
        i += 1;
    }
    table
};

const fn crc8_bitwise(crc: u8, byte: u8) -> u8 {
    let mut crc = crc ^ byte;
    let mut bit = 0;
    while bit < 8 {
        if crc & 0x1 == 0x1 {
            crc = (crc >> 1) ^ CRC8_POLY;
        } else {
            crc >>= 1;
        }
        bit += 1;
    }
    crc
}

#[derive(Debug, Default)]
/// Calculate CRC-8 used in 1-Wire communications.
pub struct OneWireCrc(u8);

impl OneWireCrc {
    /// Get the current CRC value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Update the CRC with the incoming byte.
    #[cfg(feature = "crc-table")]
    pub fn update(&mut self, byte: u8) {
        self.0 = CRC8_TABLE[(self.0 ^ byte) as usize];
    }

    /// Update the CRC with the incoming byte.
    #[cfg(not(feature = "crc-table"))]
    pub fn update(&mut self, byte: u8) {
        self.0 = crc8_bitwise(self.0, byte);
    }

    /// Validate a sequence of bytes where the last byte is the 1-Wire CRC of
    /// the previous bytes.
    pub fn validate(sequence: &[u8]) -> bool {
        crc8(sequence) == 0x0
    }
}

/// Compute the 1-Wire CRC-8 of `data`, seed 0, bits processed LSB first.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = OneWireCrc::default();
    for &byte in data {
        crc.update(byte);
    }
    crc.value()
}

/// A ROM code is valid when the CRC over its eight little-endian bytes is zero.
pub fn rom_is_valid(rom: u64) -> bool {
    OneWireCrc::validate(&rom.to_le_bytes())
}
