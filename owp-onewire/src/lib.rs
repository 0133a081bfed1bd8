#![no_std]
#![deny(missing_docs)]
//! # owp-onewire
//! A no-std implementation of the 1-Wire protocol layer for passive bus masters.
//!
//! The [BitLink] trait defines the primitive operations a bus master must provide: a reset slot
//! with presence detection and a single-bit transceive slot. Byte transmit/receive and bit-level
//! reads and writes are derived from those two.
//!
//! The crate also provides the search algorithm for discovering devices on the 1-Wire bus.
//! [SearchMap] decides one bit at a time which branch of the ROM address tree to descend, and
//! [scan_once] drives one full 64-bit scan over any [BitLink].
//!
//! ROM codes are handled as `u64` values in little-endian byte order:
//!
//! | Bit | Description |
//! |-----|-------------|
//! | 0-7 | Family code (e.g., 0x28 for DS18B20) |
//! | 8-55 | Serial number |
//! | 56-63 | CRC-8 (`0b1_0011_0001` poly) |

#[cfg(test)]
extern crate std;

mod bits;
mod consts;
mod error;
mod search;
mod traits;
mod utils;

pub use bits::{Bits, bytes_to_bits, with_bit};
pub use consts::*;
pub use error::OneWireError;
pub use search::{SearchFilter, SearchKind, SearchMap, scan_once};
pub use traits::BitLink;
pub use utils::{OneWireCrc, crc8, rom_is_valid};

/// Error type for 1-Wire operations.
pub type OneWireResult<T, E> = Result<T, OneWireError<E>>;
