//! Serial port seam between the 1-Wire link and the UART hardware.

use crate::UartError;
use log::warn;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::{
    io::{ErrorKind, Read, Write},
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

/// Baud rate of the reset/presence slot.
pub const OW_RESET_BAUD: u32 = 9600;

/// Baud rate of every bit time slot.
pub const OW_TRANSFER_BAUD: u32 = 115_200;

/// Records UART framing errors between bus transactions.
///
/// Only the most recent occurrence is kept; [`take`](FramingMonitor::take) consumes it.
#[derive(Debug, Clone, Default)]
pub struct FramingMonitor(Arc<Mutex<Option<SystemTime>>>);

impl FramingMonitor {
    /// Records a framing error observed now.
    pub fn report(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(SystemTime::now());
    }

    /// Returns and clears the time of the last framing error, if any occurred since the last call.
    pub fn take(&self) -> Option<SystemTime> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A UART able to emulate 1-Wire time slots, one byte per slot.
pub trait UartPort: Send + 'static {
    /// Name of the port, e.g. `/dev/ttyUSB0` or `COM3`.
    fn name(&self) -> &str;

    /// Opens the port at [`OW_TRANSFER_BAUD`], 8N1, no flow control.
    fn open(&mut self) -> Result<(), UartError>;

    /// Closes the port. Closing a closed port does nothing.
    fn close(&mut self);

    /// `true` while the port is open.
    fn is_open(&self) -> bool;

    /// Switches the baud rate of the open port.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), UartError>;

    /// Writes one byte and reads back the byte the line produced while it was sent.
    fn exchange(&mut self, byte: u8) -> Result<u8, UartError>;

    /// Hands the port the monitor it reports framing errors to.
    fn observe(&mut self, _monitor: FramingMonitor) {}
}

/// A hardware serial port driven through the `serialport` crate.
///
/// Framing errors reach the [`FramingMonitor`] only when the driver fails the read with
/// [`ErrorKind::InvalidData`]. With the default termios settings most drivers deliver a
/// framed-out byte as plain data instead, so the monitor rarely fires on real hardware. A line
/// shorted low is still caught by the adapter from the `0x00` reset echo.
pub struct NativePort {
    name: String,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    monitor: Option<FramingMonitor>,
}

impl NativePort {
    /// Creates a closed port handle for `name` with a 500 ms read timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::from_millis(500),
            port: None,
            monitor: None,
        }
    }

    /// Sets the read timeout applied when the port is opened.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, UartError> {
        self.port.as_mut().ok_or(UartError::NotOpen)
    }
}

impl UartPort for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), UartError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.name, OW_TRANSFER_BAUD)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        port.clear(ClearBuffer::All)?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), UartError> {
        self.port()?.set_baud_rate(baud)?;
        Ok(())
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, UartError> {
        let monitor = self.monitor.clone();
        let port = self.port()?;
        port.write_all(&[byte])?;
        let mut echo = [0u8; 1];
        match port.read_exact(&mut echo) {
            Ok(()) => Ok(echo[0]),
            Err(e) => {
                // the OS reports framing and parity faults on a read as invalid data
                if e.kind() == ErrorKind::InvalidData {
                    warn!("framing error on {}", self.name);
                    if let Some(monitor) = monitor {
                        monitor.report();
                    }
                }
                Err(e.into())
            }
        }
    }

    fn observe(&mut self, monitor: FramingMonitor) {
        self.monitor = Some(monitor);
    }
}
