//! RetroArch network command client (UDP, one text command per datagram).

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::device::{Deadline, Device};
use crate::error::{SniError, SniResult};
use crate::mapping::lorom::{bus_to_pak, WRAM_SIZE, WRAM_START};
use crate::mapping::{check_span, AddressSpace};
use crate::memory::{MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest, MemoryWriteResponse};

/// Reply wait when the caller sets no deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest read sent in one command; bigger reads are split.
pub const MAX_READ_SIZE: usize = 1024;

/// First release whose READ_CORE_MEMORY speaks bus addresses.
const CORE_MEMORY_VERSION: RaVersion = RaVersion(1, 9, 0);

/// RetroArch release number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RaVersion(pub u32, pub u32, pub u32);

impl RaVersion {
    /// Parse `1.9.0`, tolerating suffixes such as `1.10.3-git`.
    pub fn parse(s: &str) -> SniResult<Self> {
        let s = s.trim();
        let mut parts = s.split('.').map(|p| {
            let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u32>().ok()
        });
        let mut next = || parts.next().flatten();
        match (next(), next(), next()) {
            (Some(major), Some(minor), patch) => Ok(Self(major, minor, patch.unwrap_or(0))),
            _ => Err(SniError::Protocol(format!("bad RetroArch version '{}'", s))),
        }
    }

    pub fn has_core_memory(&self) -> bool {
        *self >= CORE_MEMORY_VERSION
    }
}

impl fmt::Display for RaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Which memory commands a RetroArch instance understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryCommands {
    /// `READ_CORE_MEMORY` / `WRITE_CORE_MEMORY` on bus addresses.
    CoreMemory,
    /// `READ_CORE_RAM` / `WRITE_CORE_RAM` on WRAM offsets.
    CoreRam,
}

impl MemoryCommands {
    fn read(self) -> &'static str {
        match self {
            MemoryCommands::CoreMemory => "READ_CORE_MEMORY",
            MemoryCommands::CoreRam => "READ_CORE_RAM",
        }
    }

    fn write(self) -> &'static str {
        match self {
            MemoryCommands::CoreMemory => "WRITE_CORE_MEMORY",
            MemoryCommands::CoreRam => "WRITE_CORE_RAM",
        }
    }

    /// Address as the command expects it.
    fn address(self, bus: u32) -> SniResult<u32> {
        match self {
            MemoryCommands::CoreMemory => Ok(bus),
            MemoryCommands::CoreRam => {
                let pak = bus_to_pak(bus)?;
                if (WRAM_START..WRAM_START + WRAM_SIZE).contains(&pak) {
                    Ok(pak - WRAM_START)
                } else {
                    Err(SniError::UnmappedAddress(bus))
                }
            }
        }
    }
}

/// Connected UDP socket with a request/reply helper.
pub struct RaSocket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl RaSocket {
    /// Bind an ephemeral local port and connect it to `host`.
    pub fn connect(host: &str) -> SniResult<Self> {
        let peer = host
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SniError::NoDevice(host.to_string()))?;
        let local: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        Ok(Self { socket, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&self, command: &str) -> SniResult<()> {
        log::trace!("retroarch {} <- {}", self.peer, command);
        self.socket.send(format!("{}\n", command).as_bytes())?;
        Ok(())
    }

    /// Send `command` and wait for one reply datagram.
    pub fn request(&self, deadline: Deadline, command: &str) -> SniResult<String> {
        self.send(command)?;
        self.socket
            .set_read_timeout(Some(deadline.remaining_or(DEFAULT_TIMEOUT)?))?;
        let mut buf = vec![0u8; 65536];
        let n = self.socket.recv(&mut buf)?;
        let reply = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
        log::trace!("retroarch {} -> {}", self.peer, reply);
        Ok(reply)
    }

    /// Ask for the release number.
    pub fn version(&self, deadline: Deadline) -> SniResult<RaVersion> {
        RaVersion::parse(&self.request(deadline, "VERSION")?)
    }
}

/// Parse `<CMD> <hexaddr> <hexbyte>...` or `<CMD> <hexaddr> -1 <message>`.
fn parse_read_reply(reply: &str, command: &str, address: u32, size: usize) -> SniResult<Vec<u8>> {
    let mut tokens = reply.split_whitespace();
    if tokens.next() != Some(command) {
        return Err(SniError::Protocol(format!("unexpected reply '{}'", reply)));
    }
    let echoed = tokens
        .next()
        .and_then(|a| u32::from_str_radix(a, 16).ok())
        .ok_or_else(|| SniError::Protocol(format!("reply without address '{}'", reply)))?;
    if echoed != address {
        return Err(SniError::Protocol(format!(
            "reply for ${:06X}, expected ${:06X}",
            echoed, address
        )));
    }

    let rest: Vec<&str> = tokens.collect();
    if rest.first() == Some(&"-1") {
        return Err(SniError::Protocol(format!(
            "{} ${:06X} failed: {}",
            command,
            address,
            rest[1..].join(" ")
        )));
    }
    let data = rest
        .iter()
        .map(|b| u8::from_str_radix(b, 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| SniError::Protocol(format!("bad byte in reply '{}'", reply)))?;
    if data.len() != size {
        return Err(SniError::Protocol(format!(
            "asked for {} bytes at ${:06X}, got {}",
            size,
            address,
            data.len()
        )));
    }
    Ok(data)
}

/// Parse `<CMD> <hexaddr> <count>` or `<CMD> <hexaddr> -1 <message>`.
fn parse_write_reply(reply: &str, command: &str, address: u32) -> SniResult<usize> {
    let tokens: Vec<&str> = reply.split_whitespace().collect();
    match tokens.as_slice() {
        [cmd, addr, count, ..]
            if *cmd == command && u32::from_str_radix(addr, 16).ok() == Some(address) =>
        {
            count.parse::<i64>().ok().filter(|n| *n >= 0).map(|n| n as usize).ok_or_else(|| {
                SniError::Protocol(format!("{} ${:06X} failed: {}", command, address, reply))
            })
        }
        _ => Err(SniError::Protocol(format!("unexpected reply '{}'", reply))),
    }
}

fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A RetroArch instance reached over UDP.
///
/// UDP has no connection state, so a reply timeout is what marks the
/// instance gone.
pub struct RetroArchDevice {
    socket: Mutex<RaSocket>,
    version: RaVersion,
    commands: MemoryCommands,
    closed: AtomicBool,
}

impl RetroArchDevice {
    /// Connect and complete the version handshake.
    pub fn connect(host: &str, deadline: Deadline) -> SniResult<Self> {
        let socket = RaSocket::connect(host)?;
        let version = socket.version(deadline)?;
        let commands = if version.has_core_memory() {
            MemoryCommands::CoreMemory
        } else {
            MemoryCommands::CoreRam
        };
        log::info!(
            "retroarch: connected to {} (v{}, {})",
            socket.peer(),
            version,
            commands.read()
        );
        Ok(Self {
            socket: Mutex::new(socket),
            version,
            commands,
            closed: AtomicBool::new(false),
        })
    }

    pub fn version(&self) -> RaVersion {
        self.version
    }

    /// Run `f` with the socket, marking the device closed if it fails with
    /// a timeout or transport error.
    fn with_socket<T>(&self, f: impl FnOnce(&RaSocket) -> SniResult<T>) -> SniResult<T> {
        if self.is_closed() {
            return Err(SniError::Closed);
        }
        let socket = self.socket.lock().map_err(|_| SniError::LockPoisoned)?;
        let result = f(&socket);
        if let Err(e) = &result {
            if e.is_transport() || matches!(e, SniError::Timeout) {
                self.closed.store(true, Ordering::SeqCst);
            }
        }
        result
    }
}

impl Device for RetroArchDevice {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> SniResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn native_address_space(&self) -> AddressSpace {
        AddressSpace::SnesABus
    }

    fn client_name(&self) -> Option<String> {
        Some(format!("RetroArch v{}", self.version))
    }

    fn multi_read(
        &self,
        deadline: Deadline,
        reads: &[MemoryReadRequest],
    ) -> SniResult<Vec<MemoryReadResponse>> {
        let command = self.commands.read();
        self.with_socket(|socket| {
            let mut responses = Vec::with_capacity(reads.len());
            for read in reads {
                let base = read.address.address;
                check_span(base, read.size)?;
                let mut data = Vec::with_capacity(read.size);
                while data.len() < read.size {
                    let len = MAX_READ_SIZE.min(read.size - data.len());
                    let address = self.commands.address(base + data.len() as u32)?;
                    let reply = socket.request(
                        deadline,
                        &format!("{} {:06x} {}", command, address, len),
                    )?;
                    data.extend(parse_read_reply(&reply, command, address, len)?);
                }
                responses.push(MemoryReadResponse {
                    request_address: read.address,
                    device_address: read.address,
                    data,
                });
            }
            Ok(responses)
        })
    }

    fn multi_write(
        &self,
        deadline: Deadline,
        writes: &[MemoryWriteRequest],
    ) -> SniResult<Vec<MemoryWriteResponse>> {
        let command = self.commands.write();
        self.with_socket(|socket| {
            let mut responses = Vec::with_capacity(writes.len());
            for write in writes {
                check_span(write.address.address, write.data.len())?;
                let address = self.commands.address(write.address.address)?;
                let line = format!("{} {:06x} {}", command, address, hex_bytes(&write.data));
                let size = match self.commands {
                    MemoryCommands::CoreMemory => {
                        let reply = socket.request(deadline, &line)?;
                        parse_write_reply(&reply, command, address)?
                    }
                    // the legacy command never answers
                    MemoryCommands::CoreRam => {
                        socket.send(&line)?;
                        write.data.len()
                    }
                };
                responses.push(MemoryWriteResponse {
                    request_address: write.address,
                    device_address: write.address,
                    size,
                });
            }
            Ok(responses)
        })
    }

    fn reset_system(&self, _deadline: Deadline) -> SniResult<()> {
        self.with_socket(|socket| socket.send("RESET"))
    }

    fn pause_toggle(&self, _deadline: Deadline) -> SniResult<()> {
        self.with_socket(|socket| socket.send("PAUSE_TOGGLE"))
    }
}
