//! Response phase of a ROM-addressed function command.

use owp_onewire::{BitLink, OneWireError, OneWireResult, with_bit};

/// Upper bound on read slots spent waiting for a device to release the line
/// (about 1.4 s of slots at 115200 baud).
pub const MAX_POLL_SLOTS: usize = 16_384;

/// What the bus master reads back after a function command and its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Response {
    /// Nothing; the transaction ends after the payload.
    #[default]
    None,
    /// One read slot.
    Bit,
    /// `n` bytes, LSB first.
    Bytes(usize),
    /// Read slots until the line reads 1, used by commands that keep the line low while busy.
    UntilHigh,
}

/// Progress of the read phase, advanced one sampled bit at a time by the transaction loop.
#[derive(Debug, Clone)]
pub struct ReadState {
    remaining_bits: usize,
    collected: Vec<u8>,
    pos: usize,
    until_high: bool,
    released: bool,
}

impl ReadState {
    /// Prepares the read phase for `response`.
    pub fn new(response: Response) -> Self {
        let (remaining_bits, bytes, until_high) = match response {
            Response::None => (0, 0, false),
            Response::Bit => (1, 1, false),
            Response::Bytes(n) => (n * 8, n, false),
            Response::UntilHigh => (MAX_POLL_SLOTS, 0, true),
        };
        Self {
            remaining_bits,
            collected: vec![0; bytes],
            pos: 0,
            until_high,
            released: false,
        }
    }

    /// `true` when no further read slot is needed.
    pub fn is_done(&self) -> bool {
        self.remaining_bits == 0
    }

    /// Feeds one sampled bit.
    pub fn push(&mut self, bit: bool) {
        if self.is_done() {
            return;
        }
        self.remaining_bits -= 1;
        if self.until_high {
            if bit {
                self.released = true;
                self.remaining_bits = 0;
            }
            return;
        }
        let idx = self.pos / 8;
        self.collected[idx] = with_bit(self.collected[idx], bit, (self.pos % 8) as u8);
        self.pos += 1;
    }

    /// The bytes read; for [`Response::UntilHigh`] this is empty.
    pub fn into_bytes(self) -> Vec<u8> {
        self.collected
    }

    /// Drives read slots on `link` until the state is done.
    ///
    /// # Errors
    /// [`OneWireError::Timeout`] if the link asks to stop, or a polled device never releases
    /// the line within [`MAX_POLL_SLOTS`].
    pub fn drive<L: BitLink>(mut self, link: &mut L) -> OneWireResult<Vec<u8>, L::BusError> {
        while !self.is_done() {
            if link.should_stop() {
                return Err(OneWireError::Timeout);
            }
            let bit = link.read_bit()?;
            self.push(bit);
        }
        if self.until_high && !self.released {
            return Err(OneWireError::Timeout);
        }
        Ok(self.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_bytes_lsb_first() {
        let mut state = ReadState::new(Response::Bytes(2));
        for i in 0..16 {
            // 0x28 then 0x01
            let bits = [0u8, 0, 0, 1, 0, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
            assert!(!state.is_done());
            state.push(bits[i] == 1);
        }
        assert!(state.is_done());
        assert_eq!(state.into_bytes(), [0x28, 0x01]);
    }

    #[test]
    fn until_high_stops_at_first_one() {
        let mut state = ReadState::new(Response::UntilHigh);
        state.push(false);
        state.push(false);
        assert!(!state.is_done());
        state.push(true);
        assert!(state.is_done());
        assert!(state.into_bytes().is_empty());
    }

    #[test]
    fn none_needs_no_slots() {
        assert!(ReadState::new(Response::None).is_done());
        let mut bit = ReadState::new(Response::Bit);
        bit.push(true);
        bit.push(false);
        assert_eq!(bit.into_bytes(), [1]);
    }
}
