use crate::{
    AdapterPool, BitLinkAdapter, BusMasterSettings, OpContext, ReadState, Response, UartPort,
    UartResult,
};
use log::{debug, warn};
use owp_onewire::{
    BitLink, ONEWIRE_MATCH_ROM_CMD, ONEWIRE_MAX_DEVICES, ONEWIRE_READ_ROM_CMD,
    ONEWIRE_SKIP_ROM_CMD, OneWireError, OneWireResult, SearchFilter, SearchKind, SearchMap,
    rom_is_valid, scan_once,
};
use std::{sync::Arc, time::Duration};

/// Options of [`BusMaster::search_bus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Time budget of the whole enumeration; the settings' default when `None`.
    pub time_budget: Option<Duration>,
    /// Drop ROM codes whose CRC does not validate.
    pub check_crc: bool,
    /// Normal or alarm search.
    pub kind: SearchKind,
    /// Leading ROM bytes a device must match, e.g. `[0x28]` for a family.
    pub filter: Option<Vec<u8>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            time_budget: None,
            check_crc: true,
            kind: SearchKind::Normal,
            filter: None,
        }
    }
}

impl SearchOptions {
    /// Restricts the search to the ROM prefix `filter`.
    pub fn with_filter(mut self, filter: &[u8]) -> Self {
        self.filter = Some(filter.to_vec());
        self
    }

    /// Sets the time budget.
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// Sets the search kind.
    pub fn with_kind(mut self, kind: SearchKind) -> Self {
        self.kind = kind;
        self
    }

    /// Enables or disables the CRC check.
    pub fn with_crc_check(mut self, check_crc: bool) -> Self {
        self.check_crc = check_crc;
        self
    }
}

/// Generic 1-Wire ROM command layer over a passive adapter.
pub struct BusMaster<P> {
    adapter: Arc<BitLinkAdapter<P>>,
    settings: BusMasterSettings,
}

impl<P: UartPort> BusMaster<P> {
    /// A bus master on the pooled adapter for `settings.serial_port_name`.
    ///
    /// # Errors
    /// [`OneWireError::Closed`] if the pool was shut down.
    pub fn new(settings: BusMasterSettings, pool: &AdapterPool<P>) -> UartResult<Self> {
        let adapter = pool.get_or_create(&settings.serial_port_name)?;
        Ok(Self { adapter, settings })
    }

    /// A bus master on an existing adapter.
    pub fn with_adapter(settings: BusMasterSettings, adapter: Arc<BitLinkAdapter<P>>) -> Self {
        Self { adapter, settings }
    }

    /// The settings this bus master was created with.
    pub fn settings(&self) -> &BusMasterSettings {
        &self.settings
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Arc<BitLinkAdapter<P>> {
        &self.adapter
    }

    /// Enumerates the ROM codes of the devices on the bus.
    ///
    /// Runs one search scan per transaction until no unexplored branch remains,
    /// [`ONEWIRE_MAX_DEVICES`] codes were found or the time budget expires. A bus without
    /// presence pulse yields an empty list.
    ///
    /// Ending `ctx` also ends the search with the codes found so far.
    ///
    /// # Errors
    /// Link faults other than a missing presence pulse or a timeout.
    pub async fn search_bus(&self, ctx: &OpContext, options: SearchOptions) -> UartResult<Vec<u64>> {
        let budget = ctx.timeout(options.time_budget.unwrap_or(self.settings.search_time_limit));
        let filter = options
            .filter
            .as_deref()
            .map(SearchFilter::from_bytes)
            .unwrap_or_default();
        let kind = options.kind;
        let mut map = SearchMap::with_filter(filter);
        let mut found = Vec::new();
        while found.len() < ONEWIRE_MAX_DEVICES && !budget.is_done() {
            let res = self
                .adapter
                .run_exclusive(&budget, move |link| {
                    let rom = scan_once(link, &mut map, kind)?;
                    Ok((map, rom))
                })
                .await;
            match res {
                Ok((m, rom)) => {
                    map = m;
                    match rom {
                        // a line stuck low reads as the all-zero code, which passes the CRC
                        Some(0) => warn!("{}: ignoring all-zero ROM code", self.adapter.name()),
                        Some(rom) if !found.contains(&rom) => {
                            debug!("{}: found {rom:016x}", self.adapter.name());
                            found.push(rom);
                        }
                        _ => {}
                    }
                    if map.is_exhausted() {
                        break;
                    }
                }
                Err(OneWireError::NoDevicePresent) => break,
                Err(OneWireError::Timeout) => {
                    debug!("{}: search ended by deadline", self.adapter.name());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if options.check_crc {
            found.retain(|&rom| {
                let valid = rom_is_valid(rom);
                if !valid {
                    warn!("{}: dropping {rom:016x}, bad CRC", self.adapter.name());
                }
                valid
            });
        }
        Ok(found)
    }

    /// Runs a single scan pinned to `rom` to check the device answers.
    ///
    /// # Returns
    /// `Some(rom)` if the device completed the scan.
    pub async fn find_device(
        &self,
        ctx: &OpContext,
        rom: u64,
        kind: SearchKind,
    ) -> UartResult<Option<u64>> {
        self.adapter
            .run_exclusive(ctx, move |link| {
                let mut map = SearchMap::with_filter(SearchFilter::device(rom));
                scan_once(link, &mut map, kind)
            })
            .await
    }

    /// Reads the ROM code of the only device on the bus.
    ///
    /// # Returns
    /// `None` if `check_crc` is set and the code does not validate or is all zeros.
    pub async fn read_rom(&self, ctx: &OpContext, check_crc: bool) -> UartResult<Option<u64>> {
        let rom = self
            .adapter
            .run_exclusive(ctx, |link| {
                link.write_byte(ONEWIRE_READ_ROM_CMD)?;
                let mut buf = [0u8; 8];
                link.receive(&mut buf)?;
                Ok(u64::from_le_bytes(buf))
            })
            .await?;
        if check_crc && (rom == 0 || !rom_is_valid(rom)) {
            warn!("{}: read rom {rom:016x} has bad CRC", self.adapter.name());
            return Ok(None);
        }
        Ok(Some(rom))
    }

    /// Broadcasts function command `cmd` to every device, followed by `payload`, and reads
    /// `response`.
    pub async fn skip_rom(
        &self,
        ctx: &OpContext,
        cmd: u8,
        payload: &[u8],
        response: Response,
    ) -> UartResult<Vec<u8>> {
        self.function(ctx, None, cmd, payload, response).await
    }

    /// Addresses the device `rom`, sends function command `cmd` and `payload`, and reads
    /// `response`.
    pub async fn match_rom(
        &self,
        ctx: &OpContext,
        rom: u64,
        cmd: u8,
        payload: &[u8],
        response: Response,
    ) -> UartResult<Vec<u8>> {
        self.function(ctx, Some(rom), cmd, payload, response).await
    }

    async fn function(
        &self,
        ctx: &OpContext,
        rom: Option<u64>,
        cmd: u8,
        payload: &[u8],
        response: Response,
    ) -> UartResult<Vec<u8>> {
        let payload = payload.to_vec();
        self.adapter
            .run_exclusive(ctx, move |link| {
                address(link, rom)?;
                link.write_byte(cmd)?;
                if !payload.is_empty() {
                    link.transmit(&payload)?;
                }
                ReadState::new(response).drive(link)
            })
            .await
    }
}

fn address<L: BitLink>(link: &mut L, rom: Option<u64>) -> OneWireResult<(), L::BusError> {
    match rom {
        Some(rom) => {
            link.write_byte(ONEWIRE_MATCH_ROM_CMD)?;
            link.transmit(&rom.to_le_bytes())
        }
        None => link.write_byte(ONEWIRE_SKIP_ROM_CMD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimDevice};

    fn master(devices: Vec<SimDevice>) -> (BusMaster<SimBus>, SimBus) {
        let _ = env_logger::builder().is_test(true).try_init();
        let bus = SimBus::new("sim0", devices);
        let adapter = Arc::new(BitLinkAdapter::new(bus.clone()));
        (
            BusMaster::with_adapter(BusMasterSettings::new("sim0"), adapter),
            bus,
        )
    }

    fn sorted(mut v: Vec<u64>) -> Vec<u64> {
        v.sort_unstable();
        v
    }

    #[tokio::test]
    async fn search_finds_all_devices() {
        let devices: Vec<SimDevice> = (1..=5).map(SimDevice::ds18b20).collect();
        let roms: Vec<u64> = devices.iter().map(|d| d.rom).collect();
        let (master, bus) = master(devices);
        let found = master
            .search_bus(&OpContext::new(), SearchOptions::default())
            .await
            .expect("search");
        assert_eq!(sorted(found), sorted(roms));
        assert_eq!(bus.search_count(), 5);
        assert!(!bus.is_open());
    }

    #[tokio::test]
    async fn family_filter_skips_other_families() {
        let ours = [SimDevice::ds18b20(0x10), SimDevice::ds18b20(0x11)];
        let theirs = [
            SimDevice::with_family(0x10, 0x10),
            SimDevice::with_family(0x42, 0x11),
        ];
        let expected: Vec<u64> = ours.iter().map(|d| d.rom).collect();
        let (master, _bus) = master(ours.into_iter().chain(theirs).collect());
        let found = master
            .search_bus(&OpContext::new(), SearchOptions::default().with_filter(&[0x28]))
            .await
            .expect("search");
        assert_eq!(sorted(found), sorted(expected));
    }

    #[tokio::test]
    async fn two_sensors_need_two_scans() {
        let a = SimDevice::ds18b20(0xaa);
        let b = SimDevice::ds18b20(0xab);
        let (master, bus) = master(vec![a.clone(), b.clone()]);
        let found = master
            .search_bus(&OpContext::new(), SearchOptions::default().with_filter(&[0x28]))
            .await
            .expect("search");
        assert_eq!(sorted(found), sorted(vec![a.rom, b.rom]));
        assert_eq!(bus.search_count(), 2);
    }

    #[tokio::test]
    async fn collision_is_resolved_at_first_differing_bit() {
        // serials 0xaa and 0xab first differ at bit 0 of byte 1, ROM bit 8
        let a = SimDevice::ds18b20(0xaa);
        let b = SimDevice::ds18b20(0xab);
        let (master, _bus) = master(vec![a.clone(), b.clone()]);
        let map = SearchMap::with_filter(SearchFilter::family(0x28));
        let (map, first) = master
            .adapter()
            .run_exclusive(&OpContext::new(), move |link| {
                let mut map = map;
                let rom = scan_once(link, &mut map, SearchKind::Normal)?;
                Ok((map, rom))
            })
            .await
            .expect("first scan");
        assert_eq!(first, Some(a.rom));
        assert_eq!(map.last_collision(), Some(8));
        assert!(!map.is_exhausted());
        let (map, second) = master
            .adapter()
            .run_exclusive(&OpContext::new(), move |link| {
                let mut map = map;
                let rom = scan_once(link, &mut map, SearchKind::Normal)?;
                Ok((map, rom))
            })
            .await
            .expect("second scan");
        assert_eq!(second, Some(b.rom));
        assert_eq!(map.last_collision(), None);
        assert!(map.is_exhausted());
        assert_eq!(map.scans(), 2);
    }

    #[tokio::test]
    async fn all_zero_rom_is_not_a_device() {
        let (master, bus) = master(vec![SimDevice::with_family(0x00, 0)]);
        let found = master
            .search_bus(&OpContext::new(), SearchOptions::default())
            .await
            .expect("search");
        assert!(found.is_empty());
        assert_eq!(bus.search_count(), 1);
        let rom = master.read_rom(&OpContext::new(), true).await.expect("read rom");
        assert_eq!(rom, None);
        let rom = master.read_rom(&OpContext::new(), false).await.expect("read rom");
        assert_eq!(rom, Some(0));
    }

    #[tokio::test]
    async fn no_presence_yields_empty_search() {
        let (master, bus) = master(vec![SimDevice::ds18b20(1)]);
        bus.set_presence(false);
        let found = master
            .search_bus(&OpContext::new(), SearchOptions::default())
            .await
            .expect("search without presence is not a fault");
        assert!(found.is_empty());
        let res = master.read_rom(&OpContext::new(), true).await;
        assert!(matches!(res, Err(OneWireError::NoDevicePresent)));
        let res = master
            .skip_rom(&OpContext::new(), 0x44, &[], Response::None)
            .await;
        assert!(matches!(res, Err(OneWireError::NoDevicePresent)));
    }

    #[tokio::test]
    async fn alarm_search_only_returns_alarmed_devices() {
        let quiet = SimDevice::ds18b20(1);
        let loud = SimDevice::ds18b20(2).alarmed();
        let (master, _bus) = master(vec![quiet, loud.clone()]);
        let found = master
            .search_bus(
                &OpContext::new(),
                SearchOptions::default().with_kind(SearchKind::Alarmed),
            )
            .await
            .expect("alarm search");
        assert_eq!(found, [loud.rom]);
    }

    #[tokio::test]
    async fn read_rom_of_single_device() {
        let dev = SimDevice::ds18b20(0x1234);
        let (master, _bus) = master(vec![dev.clone()]);
        let rom = master.read_rom(&OpContext::new(), true).await.expect("read rom");
        assert_eq!(rom, Some(dev.rom));
    }

    #[tokio::test]
    async fn read_rom_with_two_devices_fails_crc() {
        // both answer at once, the wired-AND of two codes is not a valid code
        let (master, _bus) = master(vec![SimDevice::ds18b20(1), SimDevice::ds18b20(2)]);
        let rom = master.read_rom(&OpContext::new(), true).await.expect("read rom");
        assert_eq!(rom, None);
    }

    #[tokio::test]
    async fn match_rom_reads_addressed_scratchpad() {
        let a = SimDevice::ds18b20(1).with_config(0x1f);
        let b = SimDevice::ds18b20(2);
        let (master, _bus) = master(vec![a.clone(), b]);
        let scratch = master
            .match_rom(&OpContext::new(), a.rom, 0xbe, &[], Response::Bytes(9))
            .await
            .expect("read scratchpad");
        assert_eq!(scratch, a.scratchpad);
    }

    #[tokio::test]
    async fn find_device_confirms_presence() {
        let a = SimDevice::ds18b20(1);
        let b = SimDevice::ds18b20(2);
        let (master, _bus) = master(vec![a.clone(), b]);
        let ctx = OpContext::new();
        assert_eq!(
            master.find_device(&ctx, a.rom, SearchKind::Normal).await.unwrap(),
            Some(a.rom)
        );
        let absent = SimDevice::ds18b20(3).rom;
        assert_eq!(
            master.find_device(&ctx, absent, SearchKind::Normal).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn ended_caller_context_finds_nothing() {
        let (master, bus) = master(vec![SimDevice::ds18b20(1)]);
        let ctx = OpContext::with_timeout(Duration::ZERO);
        let found = master
            .search_bus(&ctx, SearchOptions::default())
            .await
            .expect("search");
        assert!(found.is_empty());
        assert_eq!(bus.reset_count(), 0);
    }
}
