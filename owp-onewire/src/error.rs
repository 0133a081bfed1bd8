use core::fmt;

/// One wire communication error type.
#[derive(Debug)]
pub enum OneWireError<E> {
    /// Encapsulates the error type from the underlying hardware.
    Other(E),
    /// Indicates that no device answered the reset slot with a presence pulse.
    NoDevicePresent,
    /// A UART framing error was observed since the last transaction; the bus wiring is suspect.
    BusIntegrity,
    /// The echo of a written bit did not match the bit itself; bit synchronization is lost.
    LinkSync,
    /// The operation ran past its deadline or was cancelled.
    Timeout,
    /// An argument was outside its accepted range.
    InvalidArgument(&'static str),
    /// Computed CRC of a ROM code or scratchpad is invalid.
    InvalidCrc,
    /// The bus master or adapter behind this handle has been shut down.
    Closed,
}

impl<E> From<E> for OneWireError<E> {
    fn from(other: E) -> Self {
        Self::Other(other)
    }
}

impl<E: fmt::Display> fmt::Display for OneWireError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(e) => write!(f, "bus error: {e}"),
            Self::NoDevicePresent => f.write_str("no presence pulse on the bus"),
            Self::BusIntegrity => f.write_str("UART framing error detected on the bus"),
            Self::LinkSync => f.write_str("written bit was not echoed back, link out of sync"),
            Self::Timeout => f.write_str("operation timed out"),
            Self::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Self::InvalidCrc => f.write_str("CRC mismatch"),
            Self::Closed => f.write_str("bus master is closed"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> core::error::Error for OneWireError<E> {}
