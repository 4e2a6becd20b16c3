//! In-process cart speaking the USBA protocol, for tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::protocol::{Opcode, Transport, BLOCK_SIZE, BLOCK_SIZE_64, HEADER_SIZE};
use crate::device::DirEntryKind;
use crate::drivers::mock::MemoryFilesystem;

pub const FIRMWARE_VERSION: u32 = 0x4400_0000;
pub const VERSION_STRING: &str = "1.11.0";

enum Pending {
    VPut { ranges: Vec<(u32, usize)>, len: usize },
    Put { path: String, size: usize },
}

pub struct CartState {
    pub memory: Vec<u8>,
    pub fs: MemoryFilesystem,
    pub commands: Vec<Opcode>,
    pub booted: Option<String>,
    /// Hang up after this many further commands.
    pub hangup_after: Option<usize>,
    /// Swallow commands without answering, like a serial device that
    /// is not a cart.
    pub silent: bool,
    timeout: Duration,
    input: Vec<u8>,
    output: VecDeque<u8>,
    pending: Option<Pending>,
}

#[derive(Clone)]
pub struct FakeCart {
    pub state: Arc<Mutex<CartState>>,
}

impl FakeCart {
    pub fn new(fs: MemoryFilesystem) -> Self {
        Self {
            state: Arc::new(Mutex::new(CartState {
                memory: vec![0; 0x100_0000],
                fs,
                commands: vec![],
                booted: None,
                hangup_after: None,
                silent: false,
                timeout: Duration::from_secs(5),
                input: vec![],
                output: VecDeque::new(),
                pending: None,
            })),
        }
    }

    pub fn commands(&self) -> Vec<Opcode> {
        self.state.lock().unwrap().commands.clone()
    }
}

fn c_string(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

fn pad(data: &mut Vec<u8>, block: usize) {
    data.resize(data.len().div_ceil(block) * block, 0);
}

fn response(error: bool, size: u32) -> [u8; HEADER_SIZE] {
    let mut rsp = [0u8; HEADER_SIZE];
    rsp[..4].copy_from_slice(b"USBA");
    rsp[4] = Opcode::Response as u8;
    rsp[5] = error as u8;
    rsp[252..256].copy_from_slice(&size.to_be_bytes());
    rsp
}

fn vector_ranges(h: &[u8]) -> Vec<(u32, usize)> {
    (0..8)
        .map(|i| &h[32 + i * 4..36 + i * 4])
        .take_while(|t| t[0] != 0)
        .map(|t| (u32::from_be_bytes([0, t[1], t[2], t[3]]), t[0] as usize))
        .collect()
}

/// LS blocks: type byte then NUL-terminated name, `2` moves to the next
/// block, `0xFF` ends the listing.
fn listing(entries: &[(u8, String)]) -> Vec<u8> {
    let mut out = vec![];
    let mut block = vec![];
    for (kind, name) in entries {
        if block.len() + name.len() + 3 > BLOCK_SIZE {
            block.push(2);
            pad(&mut block, BLOCK_SIZE);
            out.append(&mut block);
        }
        block.push(*kind);
        block.extend_from_slice(name.as_bytes());
        block.push(0);
    }
    block.push(0xFF);
    pad(&mut block, BLOCK_SIZE);
    out.append(&mut block);
    out
}

impl CartState {
    fn respond(&mut self, bytes: &[u8]) {
        self.output.extend(bytes.iter().copied());
    }

    fn command(&mut self, h: &[u8]) {
        let Some(op) = Opcode::from_u8(h[4]) else {
            self.respond(&response(true, 0));
            return;
        };
        self.commands.push(op);
        let path = c_string(&h[256..]);
        match op {
            Opcode::Info => {
                let mut rsp = response(false, 0);
                rsp[16..24].copy_from_slice(b"m3nu.bin");
                rsp[256..260].copy_from_slice(&FIRMWARE_VERSION.to_be_bytes());
                rsp[260..260 + VERSION_STRING.len()].copy_from_slice(VERSION_STRING.as_bytes());
                self.respond(&rsp);
            }
            Opcode::VGet => {
                let mut data = vec![];
                for (address, len) in vector_ranges(h) {
                    let at = address as usize;
                    data.extend_from_slice(&self.memory[at..at + len]);
                }
                pad(&mut data, BLOCK_SIZE_64);
                self.respond(&data);
            }
            Opcode::VPut => {
                let ranges = vector_ranges(h);
                let total: usize = ranges.iter().map(|r| r.1).sum();
                let len = total.div_ceil(BLOCK_SIZE_64) * BLOCK_SIZE_64;
                self.pending = Some(Pending::VPut { ranges, len });
            }
            Opcode::Ls => match self.fs.read_directory(&path) {
                Ok(entries) => {
                    let mut all = vec![(0, ".".to_string()), (0, "..".to_string())];
                    all.extend(entries.into_iter().map(|e| {
                        let kind = if e.kind == DirEntryKind::Directory { 0 } else { 1 };
                        (kind, e.name)
                    }));
                    self.respond(&response(false, 0));
                    self.respond(&listing(&all));
                }
                Err(_) => self.respond(&response(true, 0)),
            },
            Opcode::Mkdir => {
                let ok = self.fs.make_directory(&path).is_ok();
                self.respond(&response(!ok, 0));
            }
            Opcode::Rm => {
                let ok = self.fs.remove(&path).is_ok();
                self.respond(&response(!ok, 0));
            }
            Opcode::Mv => {
                let ok = self.fs.rename(&path, &c_string(&h[8..252])).is_ok();
                self.respond(&response(!ok, 0));
            }
            Opcode::Boot => {
                let ok = self.fs.exists(&path);
                if ok {
                    self.booted = Some(path);
                }
                self.respond(&response(!ok, 0));
            }
            Opcode::Get => match self.fs.read_file(&path).map(<[u8]>::to_vec) {
                Ok(mut data) => {
                    self.respond(&response(false, data.len() as u32));
                    pad(&mut data, BLOCK_SIZE);
                    self.respond(&data);
                }
                Err(_) => self.respond(&response(true, 0)),
            },
            Opcode::Put => {
                let size = u32::from_be_bytes([h[252], h[253], h[254], h[255]]) as usize;
                self.respond(&response(false, 0));
                self.pending = Some(Pending::Put { path, size });
            }
            // NORESP commands
            Opcode::Reset | Opcode::MenuReset => {}
            _ => self.respond(&response(true, 0)),
        }
    }

    fn process(&mut self) {
        loop {
            match self.pending.take() {
                None => {
                    if self.input.len() < HEADER_SIZE {
                        return;
                    }
                    let h: Vec<u8> = self.input.drain(..HEADER_SIZE).collect();
                    if let Some(n) = self.hangup_after.as_mut() {
                        if *n == 0 {
                            return;
                        }
                        *n -= 1;
                    }
                    self.command(&h);
                }
                Some(Pending::VPut { ranges, len }) => {
                    if self.input.len() < len {
                        self.pending = Some(Pending::VPut { ranges, len });
                        return;
                    }
                    let data: Vec<u8> = self.input.drain(..len).collect();
                    let mut at = 0;
                    for (address, n) in ranges {
                        let dst = address as usize;
                        self.memory[dst..dst + n].copy_from_slice(&data[at..at + n]);
                        at += n;
                    }
                }
                Some(Pending::Put { path, size }) => {
                    let len = size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                    if self.input.len() < len {
                        self.pending = Some(Pending::Put { path, size });
                        return;
                    }
                    let mut data: Vec<u8> = self.input.drain(..len).collect();
                    data.truncate(size);
                    // the real cart has no reply channel left for this
                    let _ = self.fs.write_file(&path, data);
                }
            }
        }
    }
}

impl Write for FakeCart {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.hangup_after == Some(0) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "cart unplugged"));
        }
        if !state.silent {
            state.input.extend_from_slice(buf);
            state.process();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FakeCart {
    /// An empty reply queue reads as end of stream, or as a timeout once
    /// the cart has gone silent.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.silent && state.output.is_empty() {
            let timeout = state.timeout;
            drop(state);
            thread::sleep(timeout);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
        }
        let n = buf.len().min(state.output.len());
        for (dst, src) in buf.iter_mut().zip(state.output.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Transport for FakeCart {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.state.lock().unwrap().timeout = timeout;
        Ok(())
    }
}

#[test]
fn test_listing_continues_across_blocks() {
    let names: Vec<(u8, String)> = (0..20).map(|i| (1, format!("{:040}", i))).collect();
    let blocks = listing(&names);
    assert_eq!(blocks.len(), 2 * BLOCK_SIZE);
    assert!(blocks[..BLOCK_SIZE].contains(&2));
}
