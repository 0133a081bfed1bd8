use crate::{ConfigurationRegister, Ds18b20Device, SCRATCHPAD_LEN};
use log::{debug, warn};
use owp_onewire::{OneWireError, SearchKind};
use owp_uart::{
    AdapterPool, BusMaster, BusMasterSettings, OpContext, Response, SearchOptions, UartPort,
    UartResult,
};
use std::sync::Arc;

/// Family code of the DS18B20.
pub const DS18B20_FAMILY_CODE: u8 = 0x28;

/// Starts a temperature conversion.
pub const DS18B20_CONVERT_T: u8 = 0x44;
/// Writes Tₕ, Tₗ and the configuration register.
pub const DS18B20_WRITE_SCRATCHPAD: u8 = 0x4e;
/// Reads the scratchpad, LSB of byte 0 first.
pub const DS18B20_READ_SCRATCHPAD: u8 = 0xbe;
/// Copies Tₕ, Tₗ and configuration to EEPROM.
pub const DS18B20_COPY_SCRATCHPAD: u8 = 0x48;
/// Reloads Tₕ, Tₗ and configuration from EEPROM.
pub const DS18B20_RECALL_E2: u8 = 0xb8;
/// Asks parasite powered devices to pull the next read slot low.
pub const DS18B20_READ_POWER_SUPPLY: u8 = 0xb4;

/// Devices a function command is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every device on the bus (Skip ROM).
    All,
    /// The device with this ROM code (Match ROM).
    Rom(u64),
}

/// DS18B20 function commands on top of a generic [`BusMaster`].
pub struct Ds18b20BusMaster<P> {
    bus: BusMaster<P>,
}

impl<P: UartPort> Ds18b20BusMaster<P> {
    /// Creates a DS18B20 bus master on the pooled adapter for the settings' port.
    ///
    /// # Errors
    /// [`OneWireError::Closed`] if the pool was shut down.
    pub fn new(settings: BusMasterSettings, pool: &AdapterPool<P>) -> UartResult<Arc<Self>> {
        Ok(Self::with_bus(BusMaster::new(settings, pool)?))
    }

    /// Wraps an existing bus master.
    pub fn with_bus(bus: BusMaster<P>) -> Arc<Self> {
        Arc::new(Self { bus })
    }

    /// The generic ROM command layer.
    pub fn bus(&self) -> &BusMaster<P> {
        &self.bus
    }

    /// Settings of the underlying bus master.
    pub fn settings(&self) -> &BusMasterSettings {
        self.bus.settings()
    }

    /// Finds the DS18B20 devices on the bus and initializes each of them.
    ///
    /// Every device gets its own initialization deadline of
    /// [`init_timeout`](BusMasterSettings::init_timeout). Devices that fail to initialize are
    /// logged and left out of the result.
    ///
    /// # Errors
    /// Bus faults of the search itself.
    pub async fn search_devices(
        self: &Arc<Self>,
        ctx: &OpContext,
        kind: SearchKind,
    ) -> UartResult<Vec<Ds18b20Device<P>>> {
        let options = SearchOptions::default()
            .with_filter(&[DS18B20_FAMILY_CODE])
            .with_kind(kind)
            .with_crc_check(true);
        let roms = self.bus.search_bus(ctx, options).await?;
        debug!("{}: {} DS18B20 found", self.bus.adapter().name(), roms.len());
        let mut devices = Vec::with_capacity(roms.len());
        for rom in roms {
            let device = Ds18b20Device::new(rom, self);
            let init = ctx.timeout(self.settings().init_timeout);
            match device.initialize(&init).await {
                Ok(()) => devices.push(device),
                Err(e) => warn!("{rom:016x}: initialization failed, {e}"),
            }
        }
        Ok(devices)
    }

    /// Starts a temperature conversion.
    ///
    /// A broadcast returns right after the command. An addressed, externally powered device
    /// is polled until it releases the line; a parasite powered one gets no read slots, as
    /// it draws its conversion current from the line.
    pub async fn convert_t(&self, ctx: &OpContext, target: Target, parasite: bool) -> UartResult<()> {
        let response = match target {
            Target::Rom(_) if !parasite => Response::UntilHigh,
            _ => Response::None,
        };
        self.command(ctx, target, DS18B20_CONVERT_T, &[], response)
            .await
            .map(drop)
    }

    /// Reads the first `count` bytes of the scratchpad.
    ///
    /// # Errors
    /// [`OneWireError::InvalidArgument`] if `count` is not in `1..=9`; the bus is not touched.
    pub async fn read_scratchpad(
        &self,
        ctx: &OpContext,
        count: usize,
        target: Target,
    ) -> UartResult<Vec<u8>> {
        if !(1..=SCRATCHPAD_LEN).contains(&count) {
            return Err(OneWireError::InvalidArgument(
                "scratchpad read must cover 1 to 9 bytes",
            ));
        }
        self.command(ctx, target, DS18B20_READ_SCRATCHPAD, &[], Response::Bytes(count))
            .await
    }

    /// Writes the alarm registers and the configuration register.
    pub async fn write_scratchpad(
        &self,
        ctx: &OpContext,
        th: u8,
        tl: u8,
        config: ConfigurationRegister,
        target: Target,
    ) -> UartResult<()> {
        let payload = [th, tl, config.into_bits()];
        self.command(ctx, target, DS18B20_WRITE_SCRATCHPAD, &payload, Response::None)
            .await
            .map(drop)
    }

    /// Stores the alarm and configuration registers in EEPROM.
    pub async fn copy_scratchpad(&self, ctx: &OpContext, target: Target) -> UartResult<()> {
        self.command(ctx, target, DS18B20_COPY_SCRATCHPAD, &[], Response::None)
            .await
            .map(drop)
    }

    /// Restores the alarm and configuration registers from EEPROM, waiting for completion.
    pub async fn recall_e2(&self, ctx: &OpContext, target: Target) -> UartResult<()> {
        self.command(ctx, target, DS18B20_RECALL_E2, &[], Response::UntilHigh)
            .await
            .map(drop)
    }

    /// # Returns
    /// `true` if every targeted device is externally powered.
    pub async fn read_power_supply(&self, ctx: &OpContext, target: Target) -> UartResult<bool> {
        let bit = self
            .command(ctx, target, DS18B20_READ_POWER_SUPPLY, &[], Response::Bit)
            .await?;
        Ok(bit.first().is_some_and(|b| b & 1 == 1))
    }

    async fn command(
        &self,
        ctx: &OpContext,
        target: Target,
        cmd: u8,
        payload: &[u8],
        response: Response,
    ) -> UartResult<Vec<u8>> {
        match target {
            Target::All => self.bus.skip_rom(ctx, cmd, payload, response).await,
            Target::Rom(rom) => self.bus.match_rom(ctx, rom, cmd, payload, response).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;
    use owp_uart::{
        BitLinkAdapter,
        sim::{SimBus, SimDevice},
    };

    fn sim_master(devices: Vec<SimDevice>) -> (Arc<Ds18b20BusMaster<SimBus>>, SimBus) {
        let _ = env_logger::builder().is_test(true).try_init();
        let bus = SimBus::new("sim0", devices);
        let adapter = Arc::new(BitLinkAdapter::new(bus.clone()));
        let master = BusMaster::with_adapter(BusMasterSettings::new("sim0"), adapter);
        (Ds18b20BusMaster::with_bus(master), bus)
    }

    #[tokio::test]
    async fn scratchpad_length_is_checked_before_the_bus() {
        let dev = SimDevice::ds18b20(1);
        let (master, bus) = sim_master(vec![dev.clone()]);
        let ctx = OpContext::new();
        for count in [0, 10] {
            let res = master.read_scratchpad(&ctx, count, Target::Rom(dev.rom)).await;
            assert!(matches!(res, Err(OneWireError::InvalidArgument(_))));
        }
        assert_eq!(bus.reset_count(), 0);
        let one = master.read_scratchpad(&ctx, 1, Target::Rom(dev.rom)).await.unwrap();
        assert_eq!(one, [dev.scratchpad[0]]);
        let all = master.read_scratchpad(&ctx, 9, Target::Rom(dev.rom)).await.unwrap();
        assert_eq!(all, dev.scratchpad);
    }

    #[tokio::test]
    async fn power_supply_tells_parasite_devices_apart() {
        let powered = SimDevice::ds18b20(1);
        let parasite = SimDevice::ds18b20(2).parasite();
        let (master, _bus) = sim_master(vec![powered.clone(), parasite.clone()]);
        let ctx = OpContext::new();
        assert!(master.read_power_supply(&ctx, Target::Rom(powered.rom)).await.unwrap());
        assert!(!master.read_power_supply(&ctx, Target::Rom(parasite.rom)).await.unwrap());
        assert!(!master.read_power_supply(&ctx, Target::All).await.unwrap());
    }

    #[tokio::test]
    async fn broadcast_conversion_reaches_every_device() {
        let a = SimDevice::ds18b20(1).reading(0x0191);
        let b = SimDevice::ds18b20(2).reading(-162);
        let (master, bus) = sim_master(vec![a.clone(), b.clone()]);
        let ctx = OpContext::new();
        master.convert_t(&ctx, Target::All, false).await.unwrap();
        assert_eq!(bus.command_count(DS18B20_CONVERT_T), 1);
        let t = master.read_scratchpad(&ctx, 2, Target::Rom(b.rom)).await.unwrap();
        assert_eq!(t, (-162i16).to_le_bytes());
        let t = master.read_scratchpad(&ctx, 2, Target::Rom(a.rom)).await.unwrap();
        assert_eq!(t, 0x0191i16.to_le_bytes());
    }

    #[tokio::test]
    async fn configuration_round_trips_through_eeprom() {
        let dev = SimDevice::ds18b20(1);
        let (master, bus) = sim_master(vec![dev.clone()]);
        let ctx = OpContext::new();
        let target = Target::Rom(dev.rom);
        let config = ConfigurationRegister::from(Resolution::Bits10);
        master.write_scratchpad(&ctx, 0x30, 0x05, config, target).await.unwrap();
        let pad = master.read_scratchpad(&ctx, 5, target).await.unwrap();
        assert_eq!(&pad[2..5], [0x30, 0x05, 0x3f]);
        master.copy_scratchpad(&ctx, target).await.unwrap();
        assert_eq!(bus.device(dev.rom).unwrap().eeprom, [0x30, 0x05, 0x3f]);

        master
            .write_scratchpad(&ctx, 0x7f, 0x00, Resolution::Bits9.into(), target)
            .await
            .unwrap();
        master.recall_e2(&ctx, target).await.unwrap();
        let pad = master.read_scratchpad(&ctx, 9, target).await.unwrap();
        assert_eq!(&pad[2..5], [0x30, 0x05, 0x3f]);
        assert!(owp_onewire::OneWireCrc::validate(&pad));
    }
}
