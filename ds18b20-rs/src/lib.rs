#![deny(missing_docs)]

/*! # DS18B20
 *
 * Protocol layer for the DS18B20 digital thermometer on a passive UART 1-Wire bus.
 *
 * [`Ds18b20BusMaster`] issues the function commands (Convert T, scratchpad access, EEPROM
 * copy and recall, power supply query) to one device or to all of them. [`Ds18b20Device`]
 * keeps the configuration and last reading of one thermometer and refreshes it on demand.
 *
 * Scratchpad layout:
 *
 * | Byte | Content |
 * |------|---------|
 * | 0-1  | Temperature, signed, 1/16 °C |
 * | 2    | Tₕ alarm register |
 * | 3    | Tₗ alarm register |
 * | 4    | Configuration, bits 5-6 select the resolution |
 * | 5-7  | Reserved |
 * | 8    | CRC-8 of bytes 0-7 |
 */

mod device;
mod master;
mod resolution;
mod scratchpad;

pub use device::Ds18b20Device;
pub use master::{
    DS18B20_CONVERT_T, DS18B20_COPY_SCRATCHPAD, DS18B20_FAMILY_CODE, DS18B20_READ_POWER_SUPPLY,
    DS18B20_READ_SCRATCHPAD, DS18B20_RECALL_E2, DS18B20_WRITE_SCRATCHPAD, Ds18b20BusMaster,
    Target,
};
pub use resolution::{ConfigurationRegister, MAX_CONVERSION_TIME, Resolution};
pub use scratchpad::{
    MAX_TEMPERATURE, MIN_TEMPERATURE, SCRATCHPAD_LEN, Scratchpad, Temperature, decode_temperature,
};
