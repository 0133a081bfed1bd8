use std::fmt;

#[derive(Debug)]
/// Passive UART adapter hardware errors.
pub enum UartError {
    /// Serial port could not be opened or configured.
    Serial(serialport::Error),
    /// Read or write on the open port failed.
    Io(std::io::Error),
    /// A time slot was attempted while the port is closed.
    NotOpen,
}

impl From<serialport::Error> for UartError {
    fn from(value: serialport::Error) -> Self {
        Self::Serial(value)
    }
}

impl From<std::io::Error> for UartError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl fmt::Display for UartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(e) => write!(f, "serial port error: {e}"),
            Self::Io(e) => write!(f, "serial I/O error: {e}"),
            Self::NotOpen => f.write_str("serial port is not open"),
        }
    }
}

impl std::error::Error for UartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serial(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::NotOpen => None,
        }
    }
}
