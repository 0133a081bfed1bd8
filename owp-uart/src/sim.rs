//! A simulated passive adapter with DS18B20-like slaves on the line.
//!
//! Echoes follow the real adapter: a reset byte comes back truncated when any slave is present,
//! a write-1 slot comes back corrupted when a slave pulls the line low, and a write-0 slot comes
//! back as written. Slaves implement the ROM commands and the DS18B20 function commands.

use crate::{FramingMonitor, OW_RESET_BAUD, OW_TRANSFER_BAUD, UartError, UartPort};
use owp_onewire::{
    ONEWIRE_CONDITIONAL_SEARCH_CMD, ONEWIRE_MATCH_ROM_CMD, ONEWIRE_READ_ROM_CMD,
    ONEWIRE_SEARCH_CMD, ONEWIRE_SKIP_ROM_CMD, crc8,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const PRESENCE_ECHO: u8 = 0xe0;
const PULLED_LOW_ECHO: u8 = 0xfe;

/// One simulated slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    /// ROM code.
    pub rom: u64,
    /// Volatile scratchpad, CRC kept current.
    pub scratchpad: [u8; 9],
    /// Non-volatile Th, Tl and configuration.
    pub eeprom: [u8; 3],
    /// Powered from the data line.
    pub parasite: bool,
    /// Answers the alarm search.
    pub alarm: bool,
    /// Raw temperature latched by the next Convert T.
    pub next_reading: i16,
}

impl SimDevice {
    /// A DS18B20 with the given 48-bit serial, power-on scratchpad (85 °C, 12-bit).
    pub fn ds18b20(serial: u64) -> Self {
        Self::with_family(0x28, serial)
    }

    /// A device of any family with a DS18B20-style scratchpad.
    pub fn with_family(family: u8, serial: u64) -> Self {
        let mut rom = [0u8; 8];
        rom[0] = family;
        rom[1..7].copy_from_slice(&serial.to_le_bytes()[..6]);
        rom[7] = crc8(&rom[..7]);
        let mut device = Self {
            rom: u64::from_le_bytes(rom),
            scratchpad: [0x50, 0x05, 0x4b, 0x46, 0x7f, 0xff, 0x0c, 0x10, 0x00],
            eeprom: [0x4b, 0x46, 0x7f],
            parasite: false,
            alarm: false,
            next_reading: 0x0191,
        };
        device.seal();
        device
    }

    /// Marks the device as parasite powered.
    pub fn parasite(mut self) -> Self {
        self.parasite = true;
        self
    }

    /// Sets the configuration register of scratchpad and EEPROM.
    pub fn with_config(mut self, config: u8) -> Self {
        self.scratchpad[4] = config;
        self.eeprom[2] = config;
        self.seal();
        self
    }

    /// Sets the raw reading latched by the next conversion.
    pub fn reading(mut self, raw: i16) -> Self {
        self.next_reading = raw;
        self
    }

    /// Puts the device in alarm state.
    pub fn alarmed(mut self) -> Self {
        self.alarm = true;
        self
    }

    fn seal(&mut self) {
        self.scratchpad[8] = crc8(&self.scratchpad[..8]);
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    RomCommand { bits: u8, byte: u8 },
    Search { bit: u8, step: u8, active: Vec<usize> },
    ReadRom { bit: u8 },
    MatchRom { bits: u8, rom: u64 },
    Function { selected: Vec<usize>, bits: u8, byte: u8 },
    Payload { selected: Vec<usize>, bits: u16, data: [u8; 3] },
    Stream { bits: Vec<bool>, pos: usize },
    Level(bool),
}

#[derive(Debug)]
struct SimState {
    devices: Vec<SimDevice>,
    open: bool,
    baud: u32,
    phase: Phase,
    presence: bool,
    desync: bool,
    shorted: bool,
    monitor: Option<FramingMonitor>,
    resets: usize,
    searches: usize,
    commands: Vec<u8>,
}

/// Handle to the simulated bus. Clones share the same line.
#[derive(Debug, Clone)]
pub struct SimBus {
    name: Arc<str>,
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    /// A bus named `name` with `devices` attached.
    pub fn new(name: &str, devices: Vec<SimDevice>) -> Self {
        let state = Arc::new(Mutex::new(SimState {
            devices,
            open: false,
            baud: OW_TRANSFER_BAUD,
            phase: Phase::Idle,
            presence: true,
            desync: false,
            shorted: false,
            monitor: None,
            resets: 0,
            searches: 0,
            commands: Vec::new(),
        }));
        Self {
            name: name.into(),
            state,
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When `false`, reset slots echo back unchanged even with devices attached.
    pub fn set_presence(&self, presence: bool) {
        self.state().presence = presence;
    }

    /// When `true`, every write-1 slot echoes as pulled low.
    pub fn set_desync(&self, desync: bool) {
        self.state().desync = desync;
    }

    /// When `true`, the line is held low: every slot, the reset included, echoes `0x00`.
    pub fn set_shorted(&self, shorted: bool) {
        self.state().shorted = shorted;
    }

    /// Reports a framing error to the adapter's monitor.
    pub fn inject_framing_error(&self) {
        if let Some(monitor) = self.state().monitor.clone() {
            monitor.report();
        }
    }

    /// Number of reset slots seen.
    pub fn reset_count(&self) -> usize {
        self.state().resets
    }

    /// Number of Search ROM / Alarm Search commands seen.
    pub fn search_count(&self) -> usize {
        self.state().searches
    }

    /// Number of times function command `cmd` was issued.
    pub fn command_count(&self, cmd: u8) -> usize {
        self.state().commands.iter().filter(|&&c| c == cmd).count()
    }

    /// `true` while the port is open.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.state().baud
    }

    /// Snapshot of the device with ROM `rom`.
    pub fn device(&self, rom: u64) -> Option<SimDevice> {
        self.state().devices.iter().find(|d| d.rom == rom).cloned()
    }

    /// Changes the raw reading the device with ROM `rom` latches on its next conversion.
    pub fn set_reading(&self, rom: u64, raw: i16) {
        if let Some(d) = self.state().devices.iter_mut().find(|d| d.rom == rom) {
            d.next_reading = raw;
        }
    }
}

impl SimState {
    fn all(&self) -> Vec<usize> {
        (0..self.devices.len()).collect()
    }

    /// Line level a read slot samples in the current phase; slaves pull low for a 0.
    fn read_level(&mut self) -> bool {
        match &mut self.phase {
            Phase::Search { bit, step, active } if *step < 2 => {
                let i = *bit;
                let want = *step == 0;
                // wired-AND: high only if every participant sends a 1
                active.iter().all(|&d| ((self.devices[d].rom >> i) & 1 == 1) == want)
            }
            Phase::ReadRom { bit } => {
                let i = *bit;
                *bit = bit.saturating_add(1);
                if i >= 64 {
                    return true;
                }
                self.devices.iter().all(|d| (d.rom >> i) & 1 == 1)
            }
            Phase::Stream { bits, pos } => {
                let level = bits.get(*pos).copied().unwrap_or(true);
                *pos += 1;
                level
            }
            Phase::Level(level) => *level,
            _ => true,
        }
    }

    /// Advances the state machine with the bit the master put on the line.
    fn clock(&mut self, bit: bool) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        self.phase = match phase {
            Phase::RomCommand { bits, byte } => {
                let byte = byte | ((bit as u8) << bits);
                if bits < 7 {
                    Phase::RomCommand { bits: bits + 1, byte }
                } else {
                    self.rom_command(byte)
                }
            }
            Phase::Search { bit: i, step, mut active } => match step {
                0 | 1 => Phase::Search { bit: i, step: step + 1, active },
                _ => {
                    active.retain(|&d| ((self.devices[d].rom >> i) & 1 == 1) == bit);
                    if i == 63 {
                        Phase::Idle
                    } else {
                        Phase::Search { bit: i + 1, step: 0, active }
                    }
                }
            },
            Phase::MatchRom { bits, rom } => {
                let rom = rom | ((bit as u64) << bits);
                if bits < 63 {
                    Phase::MatchRom { bits: bits + 1, rom }
                } else {
                    let selected = (0..self.devices.len())
                        .filter(|&d| self.devices[d].rom == rom)
                        .collect();
                    Phase::Function { selected, bits: 0, byte: 0 }
                }
            }
            Phase::Function { selected, bits, byte } => {
                let byte = byte | ((bit as u8) << bits);
                if bits < 7 {
                    Phase::Function { selected, bits: bits + 1, byte }
                } else {
                    self.function(selected, byte)
                }
            }
            Phase::Payload { selected, bits, mut data } => {
                let idx = (bits / 8) as usize;
                data[idx] |= (bit as u8) << (bits % 8);
                if bits < 23 {
                    Phase::Payload { selected, bits: bits + 1, data }
                } else {
                    for &d in &selected {
                        let dev = &mut self.devices[d];
                        dev.scratchpad[2..5].copy_from_slice(&data);
                        dev.seal();
                    }
                    Phase::Idle
                }
            }
            other => other,
        };
    }

    fn rom_command(&mut self, cmd: u8) -> Phase {
        match cmd {
            ONEWIRE_SEARCH_CMD | ONEWIRE_CONDITIONAL_SEARCH_CMD => {
                self.searches += 1;
                let alarm = cmd == ONEWIRE_CONDITIONAL_SEARCH_CMD;
                let active = (0..self.devices.len())
                    .filter(|&d| !alarm || self.devices[d].alarm)
                    .collect();
                Phase::Search { bit: 0, step: 0, active }
            }
            ONEWIRE_READ_ROM_CMD => Phase::ReadRom { bit: 0 },
            ONEWIRE_MATCH_ROM_CMD => Phase::MatchRom { bits: 0, rom: 0 },
            ONEWIRE_SKIP_ROM_CMD => Phase::Function {
                selected: self.all(),
                bits: 0,
                byte: 0,
            },
            _ => Phase::Idle,
        }
    }

    fn function(&mut self, selected: Vec<usize>, cmd: u8) -> Phase {
        self.commands.push(cmd);
        match cmd {
            // Convert T: conversion completes instantly
            0x44 => {
                for &d in &selected {
                    let dev = &mut self.devices[d];
                    dev.scratchpad[..2].copy_from_slice(&dev.next_reading.to_le_bytes());
                    dev.seal();
                }
                Phase::Level(true)
            }
            // Read Scratchpad
            0xbe => {
                let mut bits = vec![true; 72];
                for &d in &selected {
                    for (i, b) in bits.iter_mut().enumerate() {
                        *b &= (self.devices[d].scratchpad[i / 8] >> (i % 8)) & 1 == 1;
                    }
                }
                Phase::Stream { bits, pos: 0 }
            }
            // Write Scratchpad
            0x4e => Phase::Payload {
                selected,
                bits: 0,
                data: [0; 3],
            },
            // Copy Scratchpad
            0x48 => {
                for &d in &selected {
                    let dev = &mut self.devices[d];
                    dev.eeprom.copy_from_slice(&dev.scratchpad[2..5]);
                }
                Phase::Level(true)
            }
            // Recall E2
            0xb8 => {
                for &d in &selected {
                    let dev = &mut self.devices[d];
                    dev.scratchpad[2..5].copy_from_slice(&dev.eeprom);
                    dev.seal();
                }
                Phase::Level(true)
            }
            // Read Power Supply: parasite devices pull the slot low
            0xb4 => Phase::Level(selected.iter().all(|&d| !self.devices[d].parasite)),
            _ => Phase::Idle,
        }
    }
}

impl UartPort for SimBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), UartError> {
        let mut s = self.state();
        s.open = true;
        s.baud = OW_TRANSFER_BAUD;
        s.phase = Phase::Idle;
        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), UartError> {
        let mut s = self.state();
        if !s.open {
            return Err(UartError::NotOpen);
        }
        s.baud = baud;
        Ok(())
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, UartError> {
        let mut s = self.state();
        if !s.open {
            return Err(UartError::NotOpen);
        }
        if s.shorted {
            return Ok(0x00);
        }
        if s.baud == OW_RESET_BAUD {
            s.resets += 1;
            s.phase = Phase::RomCommand { bits: 0, byte: 0 };
            let present = s.presence && !s.devices.is_empty();
            return Ok(if present { PRESENCE_ECHO } else { byte });
        }
        let bit = byte != 0x00;
        let level = if bit { s.read_level() } else { false };
        s.clock(bit);
        Ok(match (bit, level && !s.desync) {
            (false, _) => 0x00,
            (true, true) => 0xff,
            (true, false) => PULLED_LOW_ECHO,
        })
    }

    fn observe(&mut self, monitor: FramingMonitor) {
        self.state().monitor = Some(monitor);
    }
}
