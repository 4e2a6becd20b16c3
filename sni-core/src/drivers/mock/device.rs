//! Simulated SNES: a flat memory image, a frame clock and a filesystem.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::filesystem::MemoryFilesystem;
use crate::device::{Deadline, DirEntry, Device, ProgressReport, SizeReceived};
use crate::error::{SniError, SniResult};
use crate::mapping::lorom::{ROM_END, WRAM_SIZE, WRAM_START};
use crate::mapping::{AddressSpace, AddressTuple};
use crate::memory::{MemoryReadRequest, MemoryReadResponse, MemoryWriteRequest, MemoryWriteResponse};
use crate::task::CancelToken;

/// Size of the pak-space memory image.
pub const MEMORY_SIZE: usize = 0x100_0000;

/// One NTSC frame: 89,341.5 master cycles at 5,369,317.5 Hz.
pub const FRAME: Duration = Duration::from_nanos(16_639_265);

/// WRAM byte bumped once per frame (the game's frame counter).
pub const FRAME_COUNTER: usize = 0x1A;

/// Simulated round trip per batch.
const LATENCY: Duration = Duration::from_millis(1);

/// Transfer chunk size for file streaming.
const CHUNK: usize = 512;

struct MockState {
    memory: Vec<u8>,
    paused: bool,
    booted: Option<String>,
}

impl MockState {
    fn wram_mut(&mut self) -> &mut [u8] {
        let start = WRAM_START as usize;
        &mut self.memory[start..start + WRAM_SIZE as usize]
    }
}

/// Shared card storage; outlives any one connection.
pub type SharedFilesystem = Arc<Mutex<MemoryFilesystem>>;

pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    fs: SharedFilesystem,
    closed: AtomicBool,
    cancel: CancelToken,
    clock: Mutex<Option<JoinHandle<()>>>,
}

impl MockDevice {
    /// Power on with zeroed memory and start the frame clock.
    pub fn open(fs: SharedFilesystem) -> SniResult<Self> {
        let state = Arc::new(Mutex::new(MockState {
            memory: vec![0; MEMORY_SIZE],
            paused: false,
            booted: None,
        }));
        let cancel = CancelToken::new();

        let clock = {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("mock-frame-clock".to_string())
                .spawn(move || {
                    while !cancel.wait(FRAME) {
                        let Ok(mut s) = state.lock() else { break };
                        if !s.paused {
                            let counter = &mut s.wram_mut()[FRAME_COUNTER];
                            *counter = counter.wrapping_add(1);
                        }
                    }
                })?
        };

        Ok(Self {
            state,
            fs,
            closed: AtomicBool::new(false),
            cancel,
            clock: Mutex::new(Some(clock)),
        })
    }

    /// Path of the last booted file, if any.
    pub fn booted_file(&self) -> Option<String> {
        self.state.lock().ok()?.booted.clone()
    }

    fn lock(&self) -> SniResult<std::sync::MutexGuard<'_, MockState>> {
        if self.is_closed() {
            return Err(SniError::Closed);
        }
        self.state.lock().map_err(|_| SniError::LockPoisoned)
    }

    fn lock_fs(&self) -> SniResult<std::sync::MutexGuard<'_, MemoryFilesystem>> {
        if self.is_closed() {
            return Err(SniError::Closed);
        }
        self.fs.lock().map_err(|_| SniError::LockPoisoned)
    }

    fn simulate_latency(&self, deadline: Deadline) -> SniResult<()> {
        thread::sleep(deadline.remaining_or(LATENCY)?);
        deadline.check()
    }
}

fn span(address: AddressTuple, len: usize) -> SniResult<std::ops::Range<usize>> {
    let start = address.address as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= MEMORY_SIZE)
        .ok_or(SniError::UnmappedAddress(address.address))?;
    Ok(start..end)
}

impl Device for MockDevice {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> SniResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let clock = self.clock.lock().ok().and_then(|mut c| c.take());
        if let Some(clock) = clock {
            let _ = clock.join();
        }
        Ok(())
    }

    fn native_address_space(&self) -> AddressSpace {
        AddressSpace::FxPakPro
    }

    fn client_name(&self) -> Option<String> {
        Some("Mock".to_string())
    }

    fn multi_read(
        &self,
        deadline: Deadline,
        reads: &[MemoryReadRequest],
    ) -> SniResult<Vec<MemoryReadResponse>> {
        self.simulate_latency(deadline)?;
        let state = self.lock()?;
        reads
            .iter()
            .map(|read| {
                let range = span(read.address, read.size)?;
                Ok(MemoryReadResponse {
                    request_address: read.address,
                    device_address: read.address,
                    data: state.memory[range].to_vec(),
                })
            })
            .collect()
    }

    fn multi_write(
        &self,
        deadline: Deadline,
        writes: &[MemoryWriteRequest],
    ) -> SniResult<Vec<MemoryWriteResponse>> {
        self.simulate_latency(deadline)?;
        let mut state = self.lock()?;
        // validate the whole batch before touching memory
        let ranges = writes
            .iter()
            .map(|w| span(w.address, w.data.len()))
            .collect::<SniResult<Vec<_>>>()?;
        Ok(writes
            .iter()
            .zip(ranges)
            .map(|(write, range)| {
                state.memory[range].copy_from_slice(&write.data);
                MemoryWriteResponse {
                    request_address: write.address,
                    device_address: write.address,
                    size: write.data.len(),
                }
            })
            .collect())
    }

    fn reset_system(&self, _deadline: Deadline) -> SniResult<()> {
        let mut state = self.lock()?;
        state.wram_mut().fill(0);
        state.paused = false;
        Ok(())
    }

    fn reset_to_menu(&self, _deadline: Deadline) -> SniResult<()> {
        let mut state = self.lock()?;
        state.memory[..ROM_END as usize].fill(0);
        state.wram_mut().fill(0);
        state.paused = false;
        state.booted = None;
        Ok(())
    }

    fn pause_unpause(&self, _deadline: Deadline, paused: bool) -> SniResult<bool> {
        let mut state = self.lock()?;
        state.paused = paused;
        Ok(state.paused)
    }

    fn pause_toggle(&self, _deadline: Deadline) -> SniResult<()> {
        let mut state = self.lock()?;
        state.paused = !state.paused;
        Ok(())
    }

    fn read_directory(&self, _deadline: Deadline, path: &str) -> SniResult<Vec<DirEntry>> {
        self.lock_fs()?.read_directory(path)
    }

    fn make_directory(&self, _deadline: Deadline, path: &str) -> SniResult<()> {
        self.lock_fs()?.make_directory(path)
    }

    fn remove_file(&self, _deadline: Deadline, path: &str) -> SniResult<()> {
        self.lock_fs()?.remove(path)
    }

    fn rename_file(&self, _deadline: Deadline, path: &str, new_name: &str) -> SniResult<()> {
        self.lock_fs()?.rename(path, new_name)
    }

    fn put_file(
        &self,
        deadline: Deadline,
        path: &str,
        size: u32,
        reader: &mut dyn Read,
        mut progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        let total = size as usize;
        let mut data = Vec::with_capacity(total);
        let mut chunk = [0u8; CHUNK];
        while data.len() < total {
            deadline.check()?;
            let want = CHUNK.min(total - data.len());
            let n = reader.read(&mut chunk[..want]).map_err(SniError::Stream)?;
            if n == 0 {
                return Err(SniError::Protocol(format!(
                    "{}: source ended after {} of {} bytes",
                    path,
                    data.len(),
                    total
                )));
            }
            data.extend_from_slice(&chunk[..n]);
            if let Some(report) = progress.as_mut() {
                report(data.len() as u32, size);
            }
        }

        self.lock_fs()?.write_file(path, data)?;
        Ok(size)
    }

    fn get_file(
        &self,
        deadline: Deadline,
        path: &str,
        writer: &mut dyn Write,
        size_received: Option<SizeReceived<'_>>,
        mut progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        let data = self.lock_fs()?.read_file(path)?.to_vec();
        let size = data.len() as u32;
        if let Some(report) = size_received {
            report(size);
        }

        let mut sent = 0usize;
        for chunk in data.chunks(CHUNK) {
            deadline.check()?;
            writer.write_all(chunk).map_err(SniError::Stream)?;
            sent += chunk.len();
            if let Some(report) = progress.as_mut() {
                report(sent as u32, size);
            }
        }
        Ok(size)
    }

    fn boot_file(&self, _deadline: Deadline, path: &str) -> SniResult<()> {
        let rom = self.lock_fs()?.read_file(path)?.to_vec();
        if rom.len() > ROM_END as usize {
            return Err(SniError::Protocol(format!(
                "{}: {} bytes does not fit in ROM",
                path,
                rom.len()
            )));
        }
        let mut state = self.lock()?;
        state.memory[..ROM_END as usize].fill(0);
        state.memory[..rom.len()].copy_from_slice(&rom);
        state.wram_mut().fill(0);
        state.paused = false;
        state.booted = Some(path.to_string());
        log::debug!("mock: booted {} ({} bytes)", path, rom.len());
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
