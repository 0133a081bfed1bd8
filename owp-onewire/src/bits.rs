//! LSB-first bit codec shared by the transmit path and ROM-code packing.

/// Iterator over the bits of a byte slice, least significant bit of each byte first.
///
/// Created by [`bytes_to_bits`].
#[derive(Debug, Clone)]
pub struct Bits<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Expands `data` into `8 * data.len()` logical bits, LSB first per byte, in input byte order.
pub fn bytes_to_bits(data: &[u8]) -> Bits<'_> {
    Bits { data, pos: 0 }
}

impl<'a> Bits<'a> {
    /// Stops the sequence early as soon as `stop` returns `true`.
    ///
    /// `stop` is consulted before every bit, so a cancellation flag checked here
    /// aborts a transmit between two time slots.
    pub fn until<F: FnMut() -> bool>(self, mut stop: F) -> impl Iterator<Item = bool> + 'a
    where
        F: 'a,
    {
        self.take_while(move |_| !stop())
    }
}

impl Iterator for Bits<'_> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (self.pos % 8)) & 1 == 1;
        self.pos += 1;
        Some(bit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.data.len() * 8 - self.pos;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Bits<'_> {}

/// Returns `byte` with bit `offset` set to `value`.
#[inline]
pub fn with_bit(byte: u8, value: bool, offset: u8) -> u8 {
    let mask = 1 << offset;
    if value { byte | mask } else { byte & !mask }
}
