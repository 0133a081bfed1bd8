use crate::{OneWireError, OneWireResult, bits::with_bit, bytes_to_bits};

/// Trait for a bit-level 1-Wire link.
///
/// A passive bus master has no protocol logic of its own; everything above a single time slot
/// is built here from [`reset`](BitLink::reset) and [`touch_bit`](BitLink::touch_bit).
pub trait BitLink {
    /// The error type returned by the operations of this trait.
    /// This type is used to indicate errors in the underlying hardware or communication.
    type BusError;

    /// Generates a reset slot and samples the presence pulse.
    ///
    /// # Returns
    /// `true` if at least one device answered with a presence pulse.
    ///
    /// # Errors
    /// This method returns an error if the underlying port fails.
    fn reset(&mut self) -> OneWireResult<bool, Self::BusError>;

    /// Generates one time slot carrying `bit` and returns the line level sampled during it.
    ///
    /// Writing a `1` leaves the line free for a slave to pull it low, so the sampled level
    /// doubles as a read. Writing a `0` always samples low.
    ///
    /// # Errors
    /// This method returns an error if the underlying port fails or the operation was cancelled.
    fn touch_bit(&mut self, bit: bool) -> OneWireResult<bool, Self::BusError>;

    /// Returns `true` when the caller asked to abandon the current transaction.
    fn should_stop(&self) -> bool {
        false
    }

    /// Reads a single bit from the 1-Wire bus.
    fn read_bit(&mut self) -> OneWireResult<bool, Self::BusError> {
        self.touch_bit(true)
    }

    /// Writes a single bit, verifying the echo.
    ///
    /// # Errors
    /// [`OneWireError::LinkSync`] if the sampled level differs from the written bit.
    fn write_bit(&mut self, bit: bool) -> OneWireResult<(), Self::BusError> {
        if self.touch_bit(bit)? != bit {
            return Err(OneWireError::LinkSync);
        }
        Ok(())
    }

    /// Writes `data` to the bus, LSB first per byte.
    ///
    /// # Errors
    /// [`OneWireError::Timeout`] if [`should_stop`](BitLink::should_stop) fires mid-way,
    /// [`OneWireError::LinkSync`] if any bit is not echoed back.
    fn transmit(&mut self, data: &[u8]) -> OneWireResult<(), Self::BusError> {
        for bit in bytes_to_bits(data) {
            if self.should_stop() {
                return Err(OneWireError::Timeout);
            }
            self.write_bit(bit)?;
        }
        Ok(())
    }

    /// Writes a byte to the 1-Wire bus.
    fn write_byte(&mut self, byte: u8) -> OneWireResult<(), Self::BusError> {
        self.transmit(&[byte])
    }

    /// Reads a byte from the 1-Wire bus, LSB first.
    fn read_byte(&mut self) -> OneWireResult<u8, Self::BusError> {
        let mut byte = 0;
        for offset in 0..8 {
            if self.should_stop() {
                return Err(OneWireError::Timeout);
            }
            byte = with_bit(byte, self.read_bit()?, offset);
        }
        Ok(byte)
    }

    /// Fills `buf` with bytes read from the bus.
    fn receive(&mut self, buf: &mut [u8]) -> OneWireResult<(), Self::BusError> {
        for b in buf.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }
}
