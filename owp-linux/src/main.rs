use clap::Parser;
use ds18b20::{Ds18b20BusMaster, Ds18b20Device, Resolution};
use log::{error, info, warn};
use owp_uart::{AdapterPool, BusMasterSettings, CancelToken, NativePort, OpContext, SearchKind};
use std::{
    io::{self, BufRead, Write},
    process::ExitCode,
    time::Duration,
};

/// Polls DS18B20 thermometers behind a passive UART 1-Wire adapter
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Serial port of the adapter (e.g., /dev/ttyUSB0); prompted for when missing
    #[arg(short, long, env = "OWP_PORT")]
    port: Option<String>,
    /// Polling period in seconds
    #[arg(short, long, default_value_t = 1)]
    interval: u64,
    /// Resolution applied to every device found (9, 10, 11 or 12)
    #[arg(short, long, value_parser = parse_resolution)]
    resolution: Option<Resolution>,
}

fn parse_resolution(value: &str) -> Result<Resolution, String> {
    let bits: u8 = value.parse().map_err(|e| format!("{e}"))?;
    Resolution::try_from(bits).map_err(str::to_owned)
}

/// Lists the serial ports and reads a port name from stdin.
fn prompt_port() -> Option<String> {
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => {
            println!("No serial ports found");
            return None;
        }
        Ok(ports) => {
            println!("Available serial ports:");
            for port in ports {
                println!("  {}", port.port_name);
            }
        }
        Err(e) => warn!("Failed to list serial ports: {e}"),
    }
    print!("Port name: ");
    io::stdout().flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    let name = line.trim();
    if name.is_empty() {
        println!("No port name given");
        return None;
    }
    Some(name.to_owned())
}

async fn configure(devices: &[Ds18b20Device<NativePort>], ctx: &OpContext, resolution: Resolution) {
    for device in devices {
        if let Err(e) = device.set_configuration(ctx, resolution, None, None).await {
            warn!("{device}: failed to set resolution, {e}");
        }
    }
}

async fn poll(devices: &[Ds18b20Device<NativePort>], ctx: &OpContext, interval: Duration) {
    while !ctx.is_done() {
        for device in devices {
            device.refresh(ctx).await;
            info!("{device}");
        }
        if ctx.sleep(interval).await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();
    // Parse command line arguments
    let args = Args::parse();
    let Some(port) = args.port.or_else(prompt_port) else {
        return ExitCode::FAILURE;
    };
    let pool = AdapterPool::native();
    let master = match Ds18b20BusMaster::new(BusMasterSettings::new(port), &pool) {
        Ok(master) => master,
        Err(e) => {
            error!("Failed to create bus master: {e}");
            return ExitCode::FAILURE;
        }
    };
    // Ctrl-C cancels everything in flight
    let token = CancelToken::new();
    let ctx = OpContext::with_token(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let code = match master.search_devices(&ctx, SearchKind::Normal).await {
        Ok(devices) => {
            info!("Found {} devices", devices.len());
            if let Some(resolution) = args.resolution {
                configure(&devices, &ctx, resolution).await;
            }
            poll(&devices, &ctx, Duration::from_secs(args.interval)).await;
            info!("Polling stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Device search failed: {e}");
            ExitCode::FAILURE
        }
    };
    pool.shutdown().await;
    code
}
