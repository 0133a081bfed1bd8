//! Command constants for 1-Wire communication.

/// Command to search for devices on the 1-Wire bus
pub const ONEWIRE_SEARCH_CMD: u8 = 0xf0;

/// Command to search for devices in alarm state on the 1-Wire bus
pub const ONEWIRE_CONDITIONAL_SEARCH_CMD: u8 = 0xec;

/// Command to read the ROM code of the single device on the bus.
/// Results are garbage if more than one device answers.
pub const ONEWIRE_READ_ROM_CMD: u8 = 0x33;

/// Command to match a specific ROM address in 1-Wire communication
pub const ONEWIRE_MATCH_ROM_CMD: u8 = 0x55;

/// Command to skip ROM address in 1-Wire communication
pub const ONEWIRE_SKIP_ROM_CMD: u8 = 0xcc;

/// Number of bits in a ROM code.
pub const ONEWIRE_ROM_BITS: u8 = 64;

/// Upper bound on the number of devices a single enumeration will collect.
pub const ONEWIRE_MAX_DEVICES: usize = 255;
