use crate::{
    ConfigurationRegister, DS18B20_FAMILY_CODE, Ds18b20BusMaster, Resolution, SCRATCHPAD_LEN,
    Scratchpad, Target, decode_temperature,
};
use log::{debug, warn};
use owp_onewire::{OneWireError, rom_is_valid};
use owp_uart::{OpContext, UartPort, UartResult};
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct DeviceState {
    parasite: bool,
    scratchpad: Scratchpad,
    resolution: Resolution,
    last_measured: Option<f64>,
    measured_at: Option<Instant>,
}

/// A DS18B20 thermometer found on a bus.
///
/// Holds the device's configuration mirror and its last reading. The bus master is only
/// referenced weakly: once it is dropped, every bus operation fails with
/// [`OneWireError::Closed`].
pub struct Ds18b20Device<P> {
    rom: u64,
    master: Weak<Ds18b20BusMaster<P>>,
    operation_timeout: Duration,
    state: Mutex<DeviceState>,
    refreshing: AtomicBool,
}

/// Clears the single-flight flag when a refresh ends or is dropped.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<P: UartPort> Ds18b20Device<P> {
    /// A device handle for a ROM code found by a CRC-checked search.
    pub(crate) fn new(rom: u64, master: &Arc<Ds18b20BusMaster<P>>) -> Self {
        Self {
            rom,
            master: Arc::downgrade(master),
            operation_timeout: master.settings().operation_timeout,
            state: Mutex::new(DeviceState::default()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// A device handle for the known ROM code `rom`. Call
    /// [`initialize`](Ds18b20Device::initialize) before relying on its state.
    ///
    /// # Errors
    /// [`OneWireError::InvalidArgument`] if `rom` fails its CRC or is not a DS18B20 code.
    pub fn with_rom(rom: u64, master: &Arc<Ds18b20BusMaster<P>>) -> UartResult<Self> {
        if rom == 0 || !rom_is_valid(rom) {
            return Err(OneWireError::InvalidArgument("ROM code fails its CRC"));
        }
        if rom.to_le_bytes()[0] != DS18B20_FAMILY_CODE {
            return Err(OneWireError::InvalidArgument("not a DS18B20 ROM code"));
        }
        Ok(Self::new(rom, master))
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn master(&self) -> UartResult<Arc<Ds18b20BusMaster<P>>> {
        self.master.upgrade().ok_or(OneWireError::Closed)
    }

    fn target(&self) -> Target {
        Target::Rom(self.rom)
    }

    /// ROM code of the device.
    pub fn rom(&self) -> u64 {
        self.rom
    }

    /// `true` if the device draws power from the data line.
    pub fn parasite_power_mode(&self) -> bool {
        self.state().parasite
    }

    /// Current readout resolution.
    pub fn resolution(&self) -> Resolution {
        self.state().resolution
    }

    /// Tₕ alarm register.
    pub fn high_alarm(&self) -> u8 {
        self.state().scratchpad.high_alarm()
    }

    /// Tₗ alarm register.
    pub fn low_alarm(&self) -> u8 {
        self.state().scratchpad.low_alarm()
    }

    /// Mirror of the scratchpad as last read or written.
    pub fn scratchpad(&self) -> Scratchpad {
        self.state().scratchpad
    }

    /// Reads the scratchpad and power mode, and takes the stored temperature as the
    /// current reading.
    ///
    /// # Errors
    /// [`OneWireError::InvalidCrc`] if the scratchpad does not validate, any bus fault, and
    /// [`OneWireError::Closed`] once the bus master is gone.
    pub async fn initialize(&self, ctx: &OpContext) -> UartResult<()> {
        let master = self.master()?;
        let bytes = master
            .read_scratchpad(ctx, SCRATCHPAD_LEN, self.target())
            .await?;
        let scratchpad = Scratchpad::validated(&bytes).ok_or(OneWireError::InvalidCrc)?;
        let powered = master.read_power_supply(ctx, self.target()).await?;
        let mut state = self.state();
        state.parasite = !powered;
        state.resolution = scratchpad.resolution();
        state.last_measured = scratchpad.temperature();
        state.measured_at = Some(Instant::now());
        state.scratchpad = scratchpad;
        debug!(
            "{:016x}: {}, parasite {}",
            self.rom, state.resolution, state.parasite
        );
        Ok(())
    }

    /// The last reading, without touching the bus.
    pub fn try_get_cached(&self) -> Option<f64> {
        self.state().last_measured
    }

    /// Takes a new reading if the cached one is stale, and returns the cached value.
    ///
    /// The cache goes stale after the operation timeout divided by the resolution's speed
    /// factor. Only one refresh runs at a time; a concurrent call returns the cache as is.
    /// Faults are logged and turn the reading into `None`; they are not returned.
    pub async fn refresh(&self, ctx: &OpContext) -> Option<f64> {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return self.try_get_cached();
        }
        let _guard = RefreshGuard(&self.refreshing);
        let (parasite, resolution, stale) = {
            let state = self.state();
            let interval = state.resolution.refresh_interval(self.operation_timeout);
            let stale = state
                .measured_at
                .is_none_or(|at| at.elapsed() >= interval);
            (state.parasite, state.resolution, stale)
        };
        if !stale {
            return self.try_get_cached();
        }
        let ctx = ctx.timeout(self.operation_timeout);
        let reading = self.measure(&ctx, parasite, resolution).await;
        let mut state = self.state();
        match reading {
            Ok(t) => {
                state.last_measured = t;
                state.measured_at = Some(Instant::now());
            }
            Err(e) => {
                warn!("{:016x}: temperature read failed, {e}", self.rom);
                state.last_measured = None;
            }
        }
        state.last_measured
    }

    async fn measure(
        &self,
        ctx: &OpContext,
        parasite: bool,
        resolution: Resolution,
    ) -> UartResult<Option<f64>> {
        let master = self.master()?;
        master.convert_t(ctx, self.target(), parasite).await?;
        if parasite {
            // the line must stay idle while the device converts on parasite power
            ctx.sleep(resolution.conversion_time()).await?;
        }
        let bytes = master.read_scratchpad(ctx, 2, self.target()).await?;
        Ok(match bytes[..] {
            [lsb, msb, ..] => decode_temperature(lsb, msb),
            _ => None,
        })
    }

    /// Changes resolution and alarm registers in the scratchpad. `None` alarms keep their
    /// current value. Nothing is sent if the effective registers are unchanged.
    ///
    /// The change is volatile until [`save_configuration`](Ds18b20Device::save_configuration).
    pub async fn set_configuration(
        &self,
        ctx: &OpContext,
        resolution: Resolution,
        high: Option<u8>,
        low: Option<u8>,
    ) -> UartResult<()> {
        let (th, tl) = {
            let state = self.state();
            let th = high.unwrap_or(state.scratchpad.high_alarm());
            let tl = low.unwrap_or(state.scratchpad.low_alarm());
            if resolution == state.resolution
                && th == state.scratchpad.high_alarm()
                && tl == state.scratchpad.low_alarm()
            {
                return Ok(());
            }
            (th, tl)
        };
        let master = self.master()?;
        let config = ConfigurationRegister::from(resolution);
        let ctx = ctx.timeout(self.operation_timeout);
        master
            .write_scratchpad(&ctx, th, tl, config, self.target())
            .await?;
        let mut state = self.state();
        state.scratchpad.set_registers(th, tl, config);
        state.resolution = resolution;
        Ok(())
    }

    /// Stores the current configuration in the device's EEPROM.
    pub async fn save_configuration(&self, ctx: &OpContext) -> UartResult<()> {
        let master = self.master()?;
        let ctx = ctx.timeout(self.operation_timeout);
        master.copy_scratchpad(&ctx, self.target()).await
    }

    /// Reloads the configuration from EEPROM and initializes the device again.
    pub async fn reset_configuration(&self, ctx: &OpContext) -> UartResult<()> {
        let master = self.master()?;
        let ctx = ctx.timeout(self.operation_timeout);
        master.recall_e2(&ctx, self.target()).await?;
        self.initialize(&ctx).await
    }
}

impl<P> fmt::Display for Ds18b20Device<P> {
    /// Renders the cached state only; formatting never touches the bus.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        write!(f, "DS18B20 - {:016X} (", self.rom.swap_bytes())?;
        match state.last_measured {
            Some(t) if t > 0.0 => write!(f, "+{t}°C")?,
            Some(t) => write!(f, "{t}°C")?,
            None => f.write_str("--")?,
        }
        write!(
            f,
            "), Resolution {}, ParasitePowerMode-{}",
            state.resolution,
            if state.parasite { "yes" } else { "no" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DS18B20_CONVERT_T;
    use owp_onewire::SearchKind;
    use owp_uart::{
        BitLinkAdapter, BusMaster, BusMasterSettings,
        sim::{SimBus, SimDevice},
    };

    fn sim_master(
        devices: Vec<SimDevice>,
        settings: BusMasterSettings,
    ) -> (Arc<Ds18b20BusMaster<SimBus>>, SimBus) {
        let _ = env_logger::builder().is_test(true).try_init();
        let bus = SimBus::new("sim0", devices);
        let adapter = Arc::new(BitLinkAdapter::new(bus.clone()));
        (
            Ds18b20BusMaster::with_bus(BusMaster::with_adapter(settings, adapter)),
            bus,
        )
    }

    fn default_master(devices: Vec<SimDevice>) -> (Arc<Ds18b20BusMaster<SimBus>>, SimBus) {
        sim_master(devices, BusMasterSettings::new("sim0"))
    }

    #[tokio::test]
    async fn search_initializes_thermometers_only() {
        let a = SimDevice::ds18b20(1).with_config(0x3f);
        let b = SimDevice::ds18b20(2).parasite();
        let other = SimDevice::with_family(0x10, 3);
        let (master, _bus) = default_master(vec![a.clone(), b.clone(), other]);
        let mut devices = master
            .search_devices(&OpContext::new(), SearchKind::Normal)
            .await
            .expect("search");
        devices.sort_by_key(|d| d.rom());
        let found: Vec<u64> = devices.iter().map(|d| d.rom()).collect();
        let mut expected = vec![a.rom, b.rom];
        expected.sort_unstable();
        assert_eq!(found, expected);
        let dev_a = devices.iter().find(|d| d.rom() == a.rom).unwrap();
        let dev_b = devices.iter().find(|d| d.rom() == b.rom).unwrap();
        assert_eq!(dev_a.resolution(), Resolution::Bits10);
        assert!(!dev_a.parasite_power_mode());
        assert!(dev_b.parasite_power_mode());
        assert_eq!(dev_b.try_get_cached(), Some(85.0));
        assert_eq!(dev_a.high_alarm(), 0x4b);
        assert_eq!(dev_a.low_alarm(), 0x46);
    }

    #[tokio::test]
    async fn device_with_corrupt_scratchpad_is_left_out() {
        let good = SimDevice::ds18b20(1);
        let mut bad = SimDevice::ds18b20(2);
        bad.scratchpad[8] ^= 0xff;
        let (master, _bus) = default_master(vec![good.clone(), bad.clone()]);
        let devices = master
            .search_devices(&OpContext::new(), SearchKind::Normal)
            .await
            .expect("search");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].rom(), good.rom);

        let dev = Ds18b20Device::new(bad.rom, &master);
        let res = dev.initialize(&OpContext::new()).await;
        assert!(matches!(res, Err(OneWireError::InvalidCrc)));
    }

    #[tokio::test]
    async fn refresh_reads_new_temperature() {
        let dev = SimDevice::ds18b20(1).reading(0x0191);
        let (master, bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        assert_eq!(device.try_get_cached(), None);
        assert_eq!(device.refresh(&OpContext::new()).await, Some(25.0625));
        assert_eq!(device.try_get_cached(), Some(25.0625));
        // fresh cache, no new conversion
        bus.set_reading(dev.rom, -162);
        assert_eq!(device.refresh(&OpContext::new()).await, Some(25.0625));
        assert_eq!(bus.command_count(DS18B20_CONVERT_T), 1);
    }

    #[tokio::test]
    async fn refresh_of_parasite_device_waits_for_conversion() {
        let dev = SimDevice::ds18b20(1).parasite().reading(-162);
        let (master, _bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        device.initialize(&OpContext::new()).await.expect("init");
        assert!(device.parasite_power_mode());
        device
            .set_configuration(&OpContext::new(), Resolution::Bits9, None, None)
            .await
            .expect("configure");
        // 9-bit refresh interval is 250 ms
        tokio::time::sleep(Duration::from_millis(300)).await;
        let start = Instant::now();
        assert_eq!(device.refresh(&OpContext::new()).await, Some(-10.125));
        assert!(start.elapsed() >= Resolution::Bits9.conversion_time());
    }

    #[tokio::test]
    async fn out_of_range_readings_are_dropped() {
        let hot = SimDevice::ds18b20(1).reading(2008);
        let cold = SimDevice::ds18b20(2).reading(-888);
        let (master, _bus) = default_master(vec![hot.clone(), cold.clone()]);
        let hot = Ds18b20Device::new(hot.rom, &master);
        let cold = Ds18b20Device::new(cold.rom, &master);
        assert_eq!(hot.refresh(&OpContext::new()).await, None);
        assert_eq!(cold.refresh(&OpContext::new()).await, None);
    }

    #[tokio::test]
    async fn concurrent_refresh_converts_once() {
        let dev = SimDevice::ds18b20(1);
        let (master, bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        let ctx = OpContext::new();
        // hold the adapter so the first refresh parks on the lock with its flag set
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let adapter = master.bus().adapter().clone();
        let holder = tokio::spawn(async move {
            adapter
                .run_exclusive(&OpContext::new(), move |_| {
                    let _ = held_tx.send(());
                    let _ = release_rx.recv();
                    Ok(())
                })
                .await
        });
        held_rx.await.expect("adapter held");
        let mut first = std::pin::pin!(device.refresh(&ctx));
        std::future::poll_fn(|cx| {
            assert!(first.as_mut().poll(cx).is_pending());
            std::task::Poll::Ready(())
        })
        .await;
        let second = device.refresh(&ctx).await;
        release_tx.send(()).expect("holder waiting");
        let first = first.await;
        holder.await.expect("holder").expect("held transaction");
        assert_eq!(bus.command_count(DS18B20_CONVERT_T), 1);
        assert_eq!(first, Some(25.0625));
        // the second call saw the empty cache of a refresh in flight
        assert_eq!(second, None);
        assert_eq!(device.try_get_cached(), Some(25.0625));
    }

    #[tokio::test]
    async fn known_rom_is_checked() {
        let dev = SimDevice::ds18b20(1);
        let (master, _bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::with_rom(dev.rom, &master).expect("valid code");
        assert_eq!(device.rom(), dev.rom);
        for rom in [0, dev.rom ^ 0x100, SimDevice::with_family(0x10, 1).rom] {
            assert!(matches!(
                Ds18b20Device::with_rom(rom, &master),
                Err(OneWireError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn refresh_faults_degrade_to_none() {
        let dev = SimDevice::ds18b20(1);
        let (master, bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        bus.set_presence(false);
        assert_eq!(device.refresh(&OpContext::new()).await, None);
        bus.set_presence(true);
        assert_eq!(device.refresh(&OpContext::new()).await, Some(25.0625));
    }

    #[tokio::test]
    async fn unchanged_configuration_is_not_written() {
        let dev = SimDevice::ds18b20(1);
        let (master, bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        device.initialize(&OpContext::new()).await.expect("init");
        let ctx = OpContext::new();
        device
            .set_configuration(&ctx, Resolution::Bits12, None, Some(0x46))
            .await
            .unwrap();
        assert_eq!(bus.command_count(0x4e), 0);
        device
            .set_configuration(&ctx, Resolution::Bits11, Some(0x20), None)
            .await
            .unwrap();
        device
            .set_configuration(&ctx, Resolution::Bits11, Some(0x20), None)
            .await
            .unwrap();
        assert_eq!(bus.command_count(0x4e), 1);
        assert_eq!(device.resolution(), Resolution::Bits11);
        assert_eq!(device.high_alarm(), 0x20);
        assert_eq!(device.low_alarm(), 0x46);
        let sim = bus.device(dev.rom).unwrap();
        assert_eq!(&sim.scratchpad[2..5], [0x20, 0x46, 0x5f]);
    }

    #[tokio::test]
    async fn save_and_reset_configuration() {
        let dev = SimDevice::ds18b20(1);
        let (master, bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        let ctx = OpContext::new();
        device.initialize(&ctx).await.expect("init");
        device
            .set_configuration(&ctx, Resolution::Bits10, Some(0x30), Some(0x05))
            .await
            .unwrap();
        device.save_configuration(&ctx).await.unwrap();
        assert_eq!(bus.device(dev.rom).unwrap().eeprom, [0x30, 0x05, 0x3f]);

        device
            .set_configuration(&ctx, Resolution::Bits9, Some(0x10), None)
            .await
            .unwrap();
        device.reset_configuration(&ctx).await.unwrap();
        assert_eq!(device.resolution(), Resolution::Bits10);
        assert_eq!(device.high_alarm(), 0x30);
        assert_eq!(device.low_alarm(), 0x05);
    }

    #[tokio::test]
    async fn dropped_master_closes_device() {
        let dev = SimDevice::ds18b20(1);
        let (master, _bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        device.initialize(&OpContext::new()).await.expect("init");
        drop(master);
        let res = device.initialize(&OpContext::new()).await;
        assert!(matches!(res, Err(OneWireError::Closed)));
        let res = device.save_configuration(&OpContext::new()).await;
        assert!(matches!(res, Err(OneWireError::Closed)));
        // cached state survives
        assert_eq!(device.try_get_cached(), Some(85.0));
    }

    #[tokio::test]
    async fn display_uses_cached_state() {
        let dev = SimDevice::ds18b20(0x0605_0403_0201);
        let (master, _bus) = default_master(vec![dev.clone()]);
        let device = Ds18b20Device::new(dev.rom, &master);
        let crc = dev.rom.to_le_bytes()[7];
        assert_eq!(
            device.to_string(),
            format!("DS18B20 - 28010203040506{crc:02X} (--), Resolution 12-bit, ParasitePowerMode-no")
        );
        device.initialize(&OpContext::new()).await.expect("init");
        assert_eq!(
            device.to_string(),
            format!(
                "DS18B20 - 28010203040506{crc:02X} (+85°C), Resolution 12-bit, ParasitePowerMode-no"
            )
        );
    }

    #[tokio::test]
    async fn refresh_interval_follows_settings() {
        let dev = SimDevice::ds18b20(1);
        let settings = BusMasterSettings::new("sim0").with_operation_timeout(Duration::from_millis(200));
        let (master, bus) = sim_master(vec![dev.clone()], settings);
        let device = Ds18b20Device::new(dev.rom, &master);
        device.initialize(&OpContext::new()).await.expect("init");
        assert_eq!(device.refresh(&OpContext::new()).await, Some(85.0));
        assert_eq!(bus.command_count(DS18B20_CONVERT_T), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(device.refresh(&OpContext::new()).await, Some(25.0625));
        assert_eq!(bus.command_count(DS18B20_CONVERT_T), 1);
    }
}
