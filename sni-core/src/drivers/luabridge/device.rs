//! One connected Lua bridge script.
//!
//! Line protocol, server to script:
//! `Version`, `Read|<addr>|<size>`, `Write|<addr>|<b>|<b>...`, `Reset`,
//! `Pause`, `Unpause`. Only `Version` and `Read` are answered: the former
//! with `Version|<protocol>|<emulator>` and the latter with a JSON object
//! `{"data":[...]}`. Addresses are decimal bus addresses.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Deserialize;

use crate::container::WeakDeviceContainer;
use crate::device::{Deadline, Device};
use crate::error::{SniError, SniResult};
use crate::mapping::AddressSpace;
use crate::memory::{MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest, MemoryWriteResponse};

/// Reply wait when the caller sets no deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often an idle connection is checked for a hangup.
const WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct ReadReply {
    data: Vec<u8>,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn send(&mut self, line: &str) -> SniResult<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn receive(&mut self, deadline: Deadline) -> SniResult<String> {
        self.writer
            .set_read_timeout(Some(deadline.remaining_or(DEFAULT_TIMEOUT)?))?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(SniError::Closed);
        }
        Ok(line.trim_end().to_string())
    }

    /// Whether the script has closed its end. Never consumes input.
    fn peer_closed(&self) -> bool {
        if !self.reader.buffer().is_empty() || self.writer.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let closed = match self.writer.peek(&mut byte) {
            Ok(n) => n == 0,
            Err(e) => !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted),
        };
        let _ = self.writer.set_nonblocking(false);
        closed
    }
}

pub struct LuaBridgeDevice {
    key: String,
    client_name: String,
    protocol: u32,
    conn: Mutex<Connection>,
    closed: AtomicBool,
    container: WeakDeviceContainer,
}

impl LuaBridgeDevice {
    /// Ask a freshly connected script who it is.
    pub fn handshake(
        stream: TcpStream,
        key: String,
        container: WeakDeviceContainer,
        deadline: Deadline,
    ) -> SniResult<Self> {
        stream.set_nodelay(true)?;
        let mut conn = Connection {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        };
        conn.send("Version")?;
        let reply = conn.receive(deadline)?;
        let (protocol, client_name) = parse_version(&reply)?;
        log::info!("luabridge: {} connected ({}, protocol {})", key, client_name, protocol);

        Ok(Self {
            key,
            client_name,
            protocol,
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
            container,
        })
    }

    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    /// Close the device as soon as its script hangs up, even if nobody is
    /// using it. The watcher stops once the device is closed or dropped.
    pub fn watch(self: &Arc<Self>) -> io::Result<()> {
        let device = Arc::downgrade(self);
        thread::Builder::new()
            .name(format!("luabridge-watch-{}", self.key))
            .spawn(move || loop {
                thread::sleep(WATCH_INTERVAL);
                let Some(device) = device.upgrade() else {
                    return;
                };
                if device.is_closed() {
                    return;
                }
                if device.peer_hung_up() {
                    log::debug!("luabridge: {} hung up", device.key);
                    let _ = device.close();
                    return;
                }
            })?;
        Ok(())
    }

    /// Only looks while no exchange holds the connection.
    fn peer_hung_up(&self) -> bool {
        match self.conn.try_lock() {
            Ok(conn) => conn.peer_closed(),
            Err(_) => false,
        }
    }

    /// Run `f` on the connection; a failed exchange leaves the stream in an
    /// unknown state, so the device closes itself.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> SniResult<T>) -> SniResult<T> {
        if self.is_closed() {
            return Err(SniError::Closed);
        }
        let mut conn = self.conn.lock().map_err(|_| SniError::LockPoisoned)?;
        let result = f(&mut conn);
        drop(conn);
        if let Err(e) = &result {
            if e.is_transport() || matches!(e, SniError::Timeout) {
                log::info!("luabridge: {}: {}", self.key, e);
                let _ = self.close();
            }
        }
        result
    }
}

fn parse_version(reply: &str) -> SniResult<(u32, String)> {
    let mut parts = reply.split('|');
    if parts.next() != Some("Version") {
        return Err(SniError::Protocol(format!("expected Version reply, got '{}'", reply)));
    }
    let protocol = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| SniError::Protocol(format!("bad Version reply '{}'", reply)))?;
    let name = parts
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("Lua bridge");
    Ok((protocol, name.to_string()))
}

impl Device for LuaBridgeDevice {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut the socket down and drop out of the driver's container.
    fn close(&self) -> SniResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(conn) = self.conn.lock() {
            let _ = conn.writer.shutdown(Shutdown::Both);
        }
        self.container.delete_device_if_same(&self.key, self);
        log::info!("luabridge: {} disconnected", self.key);
        Ok(())
    }

    fn native_address_space(&self) -> AddressSpace {
        AddressSpace::SnesABus
    }

    fn client_name(&self) -> Option<String> {
        Some(self.client_name.clone())
    }

    fn multi_read(
        &self,
        deadline: Deadline,
        reads: &[MemoryReadRequest],
    ) -> SniResult<Vec<MemoryReadResponse>> {
        self.with_conn(|conn| {
            let mut responses = Vec::with_capacity(reads.len());
            for read in reads {
                conn.send(&format!("Read|{}|{}", read.address.address, read.size))?;
                let reply: ReadReply = serde_json::from_str(&conn.receive(deadline)?)?;
                if reply.data.len() != read.size {
                    return Err(SniError::Protocol(format!(
                        "asked for {} bytes at {}, got {}",
                        read.size,
                        read.address,
                        reply.data.len()
                    )));
                }
                responses.push(MemoryReadResponse {
                    request_address: read.address,
                    device_address: read.address,
                    data: reply.data,
                });
            }
            Ok(responses)
        })
    }

    fn multi_write(
        &self,
        _deadline: Deadline,
        writes: &[MemoryWriteRequest],
    ) -> SniResult<Vec<MemoryWriteResponse>> {
        self.with_conn(|conn| {
            let mut responses = Vec::with_capacity(writes.len());
            for write in writes {
                let mut line = format!("Write|{}", write.address.address);
                for b in &write.data {
                    line.push('|');
                    line.push_str(&b.to_string());
                }
                conn.send(&line)?;
                responses.push(MemoryWriteResponse {
                    request_address: write.address,
                    device_address: write.address,
                    size: write.data.len(),
                });
            }
            Ok(responses)
        })
    }

    fn reset_system(&self, _deadline: Deadline) -> SniResult<()> {
        self.with_conn(|conn| conn.send("Reset"))
    }

    fn pause_unpause(&self, _deadline: Deadline, paused: bool) -> SniResult<bool> {
        self.with_conn(|conn| conn.send(if paused { "Pause" } else { "Unpause" }))?;
        Ok(paused)
    }
}
