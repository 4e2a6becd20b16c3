//! SNI CLI - Talk to SNES devices from the command line.
//!
//! Usage:
//!   sni [--config FILE] <command>
//!
//! Examples:
//!   sni detect                                 # List devices every driver can see
//!   sni read ra://localhost:55355 7E0010 2     # Read two bytes of WRAM
//!   sni write mock:mock F50010 0102 --space pak
//!   sni put fxpakpro:/dev/ttyACM0 game.sfc /roms/game.sfc
//!   sni serve --downstream ra://localhost:55355

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use sni_core::{
    AddressSpace, AddressTuple, Config, Deadline, DeviceHandle, DeviceLocator, DriverRegistry,
    Drivers, MemoryReadRequest, MemoryWriteRequest,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-command deadline for device I/O.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// File transfers get longer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// SNES device interface CLI
#[derive(Parser, Debug)]
#[command(name = "sni")]
#[command(about = "Read, write and manage SNES devices")]
struct Args {
    /// Configuration file (TOML); SNI_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the available drivers
    Drivers,
    /// Detect devices
    Detect {
        /// Only ask this driver
        #[arg(long)]
        driver: Option<String>,
    },
    /// Read memory and print it as hex
    Read {
        uri: DeviceLocator,
        #[arg(value_parser = parse_hex_u32)]
        address: u32,
        size: usize,
        #[arg(long, value_enum, default_value_t = Space::Bus)]
        space: Space,
    },
    /// Write hex bytes to memory
    Write {
        uri: DeviceLocator,
        #[arg(value_parser = parse_hex_u32)]
        address: u32,
        #[arg(value_parser = parse_hex_bytes)]
        data: HexBytes,
        #[arg(long, value_enum, default_value_t = Space::Bus)]
        space: Space,
    },
    /// Reset the console
    Reset { uri: DeviceLocator },
    /// Reset to the cart menu
    Menu { uri: DeviceLocator },
    /// Pause or unpause emulation
    Pause {
        uri: DeviceLocator,
        #[arg(action = clap::ArgAction::Set)]
        paused: bool,
    },
    /// Toggle pause
    Toggle { uri: DeviceLocator },
    /// List a directory
    Ls { uri: DeviceLocator, path: String },
    Mkdir { uri: DeviceLocator, path: String },
    Rm { uri: DeviceLocator, path: String },
    /// Rename a file within its directory
    Mv {
        uri: DeviceLocator,
        path: String,
        new_name: String,
    },
    /// Upload a local file
    Put {
        uri: DeviceLocator,
        local: PathBuf,
        remote: String,
    },
    /// Download a remote file
    Get {
        uri: DeviceLocator,
        remote: String,
        local: PathBuf,
    },
    /// Boot a ROM from the device filesystem
    Boot { uri: DeviceLocator, path: String },
    /// Run every driver, including the listening ones, until Ctrl-C
    Serve {
        /// Device that connectorlib clients read and write
        #[arg(long)]
        downstream: Option<DeviceLocator>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Space {
    Bus,
    Pak,
    Raw,
}

impl From<Space> for AddressSpace {
    fn from(space: Space) -> Self {
        match space {
            Space::Bus => AddressSpace::SnesABus,
            Space::Pak => AddressSpace::FxPakPro,
            Space::Raw => AddressSpace::Raw,
        }
    }
}

/// Wrapper so clap does not treat `Vec<u8>` as a repeated argument.
#[derive(Clone, Debug)]
struct HexBytes(Vec<u8>);

fn strip_hex_prefix(s: &str) -> &str {
    s.trim_start_matches("0x")
        .trim_start_matches("0X")
        .trim_start_matches('$')
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    u32::from_str_radix(strip_hex_prefix(s), 16).map_err(|e| format!("bad address '{}': {}", s, e))
}

fn parse_hex_bytes(s: &str) -> Result<HexBytes, String> {
    let digits: String = strip_hex_prefix(s)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("'{}' contains characters that are not hex digits", s));
    }
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(format!("'{}' is not an even number of hex digits", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map(HexBytes)
        .map_err(|e| format!("bad hex '{}': {}", s, e))
}

fn hex_dump(address: u32, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:06x}: {}", address as usize + i * 16, bytes.join(" "));
    }
}

/// Run blocking device I/O off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, BoxError>
where
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn run_device_command(registry: &DriverRegistry, command: Command) -> Result<(), BoxError> {
    let deadline = Deadline::after(COMMAND_TIMEOUT);
    let device = |uri: &DeviceLocator| -> Result<DeviceHandle, BoxError> { Ok(registry.device(uri)?) };

    match command {
        Command::Read {
            uri,
            address,
            size,
            space,
        } => {
            let request = MemoryReadRequest::new(AddressTuple::new(address, space.into()), size);
            for rsp in device(&uri)?.multi_read(deadline, &[request])? {
                hex_dump(rsp.request_address.address, &rsp.data);
            }
        }
        Command::Write {
            uri,
            address,
            data,
            space,
        } => {
            let request = MemoryWriteRequest::new(AddressTuple::new(address, space.into()), data.0);
            for rsp in device(&uri)?.multi_write(deadline, &[request])? {
                println!(
                    "wrote {} bytes at {:06x} (device {:06x})",
                    rsp.size, rsp.request_address.address, rsp.device_address.address
                );
            }
        }
        Command::Reset { uri } => device(&uri)?.reset_system(deadline)?,
        Command::Menu { uri } => device(&uri)?.reset_to_menu(deadline)?,
        Command::Pause { uri, paused } => {
            let paused = device(&uri)?.pause_unpause(deadline, paused)?;
            println!("{}", if paused { "paused" } else { "running" });
        }
        Command::Toggle { uri } => device(&uri)?.pause_toggle(deadline)?,
        Command::Ls { uri, path } => {
            for entry in device(&uri)?.read_directory(deadline, &path)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Mkdir { uri, path } => device(&uri)?.make_directory(deadline, &path)?,
        Command::Rm { uri, path } => device(&uri)?.remove_file(deadline, &path)?,
        Command::Mv {
            uri,
            path,
            new_name,
        } => device(&uri)?.rename_file(deadline, &path, &new_name)?,
        Command::Put { uri, local, remote } => {
            let data = std::fs::read(&local)?;
            let size = u32::try_from(data.len())?;
            let mut report = |done: u32, total: u32| log::debug!("put {}/{}", done, total);
            let sent = device(&uri)?.put_file(
                Deadline::after(TRANSFER_TIMEOUT),
                &remote,
                size,
                &mut data.as_slice(),
                Some(&mut report),
            )?;
            println!("sent {} bytes to {}", sent, remote);
        }
        Command::Get { uri, remote, local } => {
            let mut file = std::fs::File::create(&local)?;
            let mut report = |done: u32, total: u32| log::debug!("get {}/{}", done, total);
            let size = device(&uri)?.get_file(
                Deadline::after(TRANSFER_TIMEOUT),
                &remote,
                &mut file,
                None,
                Some(&mut report),
            )?;
            println!("received {} bytes into {}", size, local.display());
        }
        Command::Boot { uri, path } => device(&uri)?.boot_file(deadline, &path)?,
        Command::Drivers | Command::Detect { .. } | Command::Serve { .. } => {}
    }
    Ok(())
}

fn detect(registry: &DriverRegistry, only: Option<&str>) -> Result<(), BoxError> {
    let mut found = vec![];
    for driver in registry.all_drivers() {
        if only.is_some_and(|name| name != driver.name()) {
            continue;
        }
        match driver.detect() {
            Ok(devices) => found.extend(devices),
            Err(e) => log::warn!("{}: detect failed: {}", driver.name(), e),
        }
    }
    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}

async fn serve(drivers: Drivers, registry: DriverRegistry, downstream: Option<DeviceLocator>) -> Result<(), BoxError> {
    if let Some(uri) = downstream {
        match drivers.connectorlib() {
            Some(connectorlib) => connectorlib.set_downstream_device(Some(registry.device(&uri)?))?,
            None => log::warn!("connectorlib is disabled; ignoring downstream {}", uri),
        }
    }
    log::info!("serving drivers: {}", drivers.names().join(", "));

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    blocking(move || {
        drivers.shutdown();
        Ok(())
    })
    .await
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = Config::load_with_env(args.config.as_deref())?;
    if !matches!(args.command, Command::Serve { .. }) {
        // one-shot commands must not take the listening ports of a running server
        config.luabridge.disable = true;
        config.connectorlib.disable = true;
    }

    let registry = DriverRegistry::new();
    let drivers = sni_core::init(&config, &registry)?;

    match args.command {
        Command::Drivers => {
            println!("{}", serde_json::to_string_pretty(&registry.driver_infos())?);
            drivers.shutdown();
        }
        Command::Detect { driver } => {
            blocking(move || {
                let result = detect(&registry, driver.as_deref());
                drivers.shutdown();
                result
            })
            .await?;
        }
        Command::Serve { downstream } => serve(drivers, registry, downstream).await?,
        command => {
            blocking(move || {
                let result = run_device_command(&registry, command);
                drivers.shutdown();
                result
            })
            .await?;
        }
    }

    Ok(())
}
