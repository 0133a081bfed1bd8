use crate::{
    BitLink, ONEWIRE_CONDITIONAL_SEARCH_CMD, ONEWIRE_ROM_BITS, ONEWIRE_SEARCH_CMD, OneWireError,
    OneWireResult, bytes_to_bits,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Type of search performed by [`scan_once`].
pub enum SearchKind {
    /// Normal search
    #[default]
    Normal = ONEWIRE_SEARCH_CMD,
    /// Search only for devices with alarm
    Alarmed = ONEWIRE_CONDITIONAL_SEARCH_CMD,
}

/// Constraint on the leading bits of the ROM codes a search may complete.
///
/// Built from up to eight bytes in ROM order; one byte is a family-code filter,
/// eight bytes pin a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchFilter {
    bits: u64,
    len: u8,
}

impl SearchFilter {
    /// Creates a filter from the leading bytes of a ROM code. Bytes past the eighth are ignored.
    pub fn from_bytes(prefix: &[u8]) -> Self {
        let mut filter = Self::default();
        for bit in bytes_to_bits(prefix).take(ONEWIRE_ROM_BITS as usize) {
            filter.bits |= (bit as u64) << filter.len;
            filter.len += 1;
        }
        filter
    }

    /// Creates a filter matching only the family code `family`.
    pub fn family(family: u8) -> Self {
        Self::from_bytes(&[family])
    }

    /// Creates a filter matching exactly one ROM code.
    pub fn device(rom: u64) -> Self {
        Self::from_bytes(&rom.to_le_bytes())
    }

    /// Number of constrained bits.
    pub fn len(&self) -> u8 {
        self.len
    }

    /// `true` if the filter constrains nothing.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn conflicts(&self, bit_index: u8, bit: bool) -> bool {
        bit_index < self.len && ((self.bits >> bit_index) & 1 == 1) != bit
    }
}

/// Branch bookkeeping for the ROM search, carried across the scans of one enumeration.
///
/// During a scan the map records the deepest position where it chose the 0-branch of a
/// collision; [`commit`](SearchMap::commit) turns that into the collision the next scan resolves
/// by taking the 1-branch. This walks the address tree depth-first without storing it.
#[derive(Debug, Clone, Default)]
pub struct SearchMap {
    filter: SearchFilter,
    last_collision: Option<u8>,
    last_zero: Option<u8>,
    previous: u64,
    path: u64,
    scans: usize,
}

impl SearchMap {
    /// Creates a search map without a filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a search map that only completes ROM codes matching `filter`.
    pub fn with_filter(filter: SearchFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Bit position the next scan will resolve by taking the 1-branch, if any.
    pub fn last_collision(&self) -> Option<u8> {
        self.last_collision
    }

    /// Number of committed scans.
    pub fn scans(&self) -> usize {
        self.scans
    }

    /// `true` once a committed scan left no unexplored branch.
    pub fn is_exhausted(&self) -> bool {
        self.scans > 0 && self.last_collision.is_none()
    }

    /// Decides the direction bit at `bit_index` from the id bit and complement bit read from the bus.
    ///
    /// # Returns
    /// The bit to write back, or `None` if no device on this path can match (no responders,
    /// a filter conflict, or an index past the ROM), in which case the scan must stop.
    pub fn next_bit(&mut self, master: bool, complement: bool, bit_index: u8) -> Option<bool> {
        if bit_index >= ONEWIRE_ROM_BITS {
            return None;
        }
        let bit = match (master, complement) {
            (true, true) => return None,
            // every remaining device agrees
            (m, c) if m != c => m,
            _ => {
                let replay = self.last_collision.map(|c| bit_index.cmp(&c));
                match replay {
                    Some(core::cmp::Ordering::Equal) => true,
                    Some(core::cmp::Ordering::Less) => {
                        let bit = (self.previous >> bit_index) & 1 == 1;
                        if !bit {
                            self.last_zero = Some(bit_index);
                        }
                        bit
                    }
                    _ => {
                        self.last_zero = Some(bit_index);
                        false
                    }
                }
            }
        };
        if self.filter.conflicts(bit_index, bit) {
            return None;
        }
        self.path |= (bit as u64) << bit_index;
        Some(bit)
    }

    /// Closes the running scan, completed or aborted, and arms the map for the next one.
    pub fn commit(&mut self) {
        self.previous = self.path;
        self.last_collision = self.last_zero.take();
        self.path = 0;
        self.scans += 1;
    }
}

/// Runs one search scan over a link that has just been reset.
///
/// Issues the search command for `kind`, then for each of the 64 ROM bits reads the id bit and
/// its complement, lets `map` pick the direction, and writes it back so devices on the other
/// branch drop out. The map is committed whether or not the scan completes.
///
/// # Returns
/// `Some(rom)` after all 64 bits, `None` if the scan was aborted by the map.
///
/// # Errors
/// Any link error; [`OneWireError::Timeout`] if the link asks to stop mid-scan.
pub fn scan_once<L: BitLink>(
    link: &mut L,
    map: &mut SearchMap,
    kind: SearchKind,
) -> OneWireResult<Option<u64>, L::BusError> {
    let res = scan_bits(link, map, kind);
    map.commit();
    res
}

fn scan_bits<L: BitLink>(
    link: &mut L,
    map: &mut SearchMap,
    kind: SearchKind,
) -> OneWireResult<Option<u64>, L::BusError> {
    link.write_byte(kind as u8)?;
    let mut rom = 0u64;
    for bit_index in 0..ONEWIRE_ROM_BITS {
        if link.should_stop() {
            return Err(OneWireError::Timeout);
        }
        let id_bit = link.read_bit()?;
        let complement_bit = link.read_bit()?;
        let Some(dir) = map.next_bit(id_bit, complement_bit, bit_index) else {
            return Ok(None);
        };
        link.write_bit(dir)?;
        rom |= (dir as u64) << bit_index;
    }
    Ok(Some(rom))
}
