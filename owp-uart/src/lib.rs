#![deny(missing_docs)]

/*! # owp-uart
 *
 * A 1-Wire bus master driving a passive UART adapter (TX and RX tied to the data line
 * through a diode or transistor). Each 1-Wire time slot is one UART byte:
 *
 * | Slot          | Baud    | Byte sent | Echo meaning                        |
 * |---------------|---------|-----------|-------------------------------------|
 * | Reset         | 9600    | `0xf0`    | anything but `0xf0` is a presence   |
 * | Write 0       | 115200  | `0x00`    | always `0x00`                       |
 * | Write 1, read | 115200  | `0xff`    | `0xff` if the line stayed high      |
 *
 * Every bus operation is an exclusive transaction: the port is opened, the bus reset, the
 * ROM and function commands clocked out on a blocking worker, and the port closed again.
 * Transactions honor an [`OpContext`] carrying a deadline and a [`CancelToken`].
 */

mod adapter;
mod bus;
mod context;
mod error;
mod pool;
mod port;
mod settings;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod transaction;

pub use adapter::{BitLinkAdapter, UartLink};
pub use bus::{BusMaster, SearchOptions};
pub use context::{CancelToken, OpContext};
pub use error::UartError;
pub use owp_onewire;
pub use owp_onewire::{OneWireError, SearchKind};
pub use pool::AdapterPool;
pub use port::{FramingMonitor, NativePort, OW_RESET_BAUD, OW_TRANSFER_BAUD, UartPort};
pub use settings::BusMasterSettings;
pub use transaction::{MAX_POLL_SLOTS, ReadState, Response};

/// Results of operations on a passive UART adapter.
pub type UartResult<T> = owp_onewire::OneWireResult<T, UartError>;
