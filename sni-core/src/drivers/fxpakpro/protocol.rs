//! `USBA` command protocol of the FX Pak Pro (sd2snes) USB interface.
//!
//! Every command starts with a 512-byte header. Unless `NORESP` is set the
//! cart answers with a 512-byte response header before any data. Bulk data
//! moves in 512-byte blocks, or 64-byte blocks when `DATA64B` is set; the
//! final block is zero padded.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::device::{Deadline, DirEntry, DirEntryKind, ProgressReport, SizeReceived};
use crate::error::{SniError, SniResult};
use crate::mapping::check_span;

pub const HEADER_SIZE: usize = 512;
pub const BLOCK_SIZE: usize = 512;
pub const BLOCK_SIZE_64: usize = 64;

/// VGET/VPUT carry at most this many ranges per command.
pub const MAX_VECTOR_CHUNKS: usize = 8;
/// Each VGET/VPUT range is at most this long.
pub const MAX_VECTOR_CHUNK_SIZE: usize = 255;

/// Bound on a single blocking read or write when the caller has no deadline.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte stream to the cart whose blocking calls can be bounded.
pub trait Transport: Read + Write {
    /// Bound every following read and write to `timeout`.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_timeout(timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0,
    Put = 1,
    VGet = 2,
    VPut = 3,
    Ls = 4,
    Mkdir = 5,
    Rm = 6,
    Mv = 7,
    Reset = 8,
    Boot = 9,
    PowerCycle = 10,
    Info = 11,
    MenuReset = 12,
    Stream = 13,
    Time = 14,
    Response = 15,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        [
            Get, Put, VGet, VPut, Ls, Mkdir, Rm, Mv, Reset, Boot, PowerCycle, Info, MenuReset,
            Stream, Time, Response,
        ]
        .into_iter()
        .find(|op| *op as u8 == v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Space {
    File = 0,
    Snes = 1,
    Msu = 2,
    Cmd = 3,
    Config = 4,
}

pub const FLAG_NONE: u8 = 0;
pub const FLAG_NORESP: u8 = 64;
pub const FLAG_DATA64B: u8 = 128;

/// Cart response header.
#[derive(Debug, Clone)]
pub struct Response {
    raw: Box<[u8; HEADER_SIZE]>,
}

impl Response {
    pub fn size(&self) -> u32 {
        read_u32(&self.raw[252..256])
    }

    pub fn is_error(&self) -> bool {
        self.raw[5] != 0
    }

    pub fn bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.raw
    }
}

/// Firmware identification from an INFO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartInfo {
    pub firmware_version: u32,
    pub version_string: String,
    pub rom_name: String,
}

impl CartInfo {
    fn from_response(rsp: &Response) -> Self {
        let raw = rsp.bytes();
        Self {
            firmware_version: read_u32(&raw[256..260]),
            version_string: c_string(&raw[260..]),
            rom_name: c_string(&raw[16..252]),
        }
    }
}

/// One VGET/VPUT range, tied back to the request it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorChunk {
    pub request: usize,
    pub offset: usize,
    pub address: u32,
    pub len: usize,
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn c_string(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

fn padded(len: usize, block: usize) -> usize {
    len.div_ceil(block) * block
}

/// Build a command header.
pub fn header(op: Opcode, space: Space, flags: u8) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[..4].copy_from_slice(b"USBA");
    h[4] = op as u8;
    h[5] = space as u8;
    h[6] = flags;
    h
}

fn set_size(h: &mut [u8; HEADER_SIZE], size: u32) {
    h[252..256].copy_from_slice(&size.to_be_bytes());
}

/// Store a path at `at`; the field runs to the end of the header (or to
/// `252` for the MV destination name) and keeps a terminating NUL.
fn set_name(h: &mut [u8; HEADER_SIZE], at: usize, limit: usize, name: &str) -> SniResult<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= limit - at {
        return Err(SniError::Protocol(format!("path too long: '{}'", name)));
    }
    h[at..at + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Split reads into VGET/VPUT ranges, grouped per command.
///
/// The header carries 24-bit addresses, so a range reaching past `$FFFFFF`
/// is rejected rather than wrapped.
pub fn plan_vector(requests: &[(u32, usize)]) -> SniResult<Vec<Vec<VectorChunk>>> {
    let mut all = vec![];
    for (request, &(address, size)) in requests.iter().enumerate() {
        check_span(address, size)?;
        for offset in (0..size).step_by(MAX_VECTOR_CHUNK_SIZE) {
            // in range: check_span bounds address + size below 2^24
            let address = address + offset as u32;
            all.push(VectorChunk {
                request,
                offset,
                address,
                len: MAX_VECTOR_CHUNK_SIZE.min(size - offset),
            });
        }
    }
    Ok(all.chunks(MAX_VECTOR_CHUNKS).map(<[VectorChunk]>::to_vec).collect())
}

fn vector_header(op: Opcode, group: &[VectorChunk]) -> [u8; HEADER_SIZE] {
    let mut h = header(op, Space::Snes, FLAG_DATA64B | FLAG_NORESP);
    for (i, chunk) in group.iter().enumerate() {
        let at = 32 + i * 4;
        h[at] = chunk.len as u8;
        h[at + 1..at + 4].copy_from_slice(&chunk.address.to_be_bytes()[1..]);
    }
    h
}

/// Command/response conversation over a byte stream.
pub struct Usb2Snes<T> {
    port: T,
}

impl<T: Transport> Usb2Snes<T> {
    pub fn new(port: T) -> Self {
        Self { port }
    }

    pub fn into_inner(self) -> T {
        self.port
    }

    /// Bound the next reads and writes by what is left of `deadline`.
    fn arm(&mut self, deadline: Deadline) -> SniResult<()> {
        let timeout = deadline.remaining_or(IO_TIMEOUT)?;
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn send(&mut self, h: &[u8; HEADER_SIZE]) -> SniResult<()> {
        self.port.write_all(h)?;
        self.port.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> SniResult<Response> {
        let mut raw = Box::new([0u8; HEADER_SIZE]);
        self.port.read_exact(&mut raw[..])?;
        if &raw[..4] != b"USBA" || raw[4] != Opcode::Response as u8 {
            return Err(SniError::Protocol("malformed response header".to_string()));
        }
        Ok(Response { raw })
    }

    /// Send a command and require a successful response.
    fn command(&mut self, deadline: Deadline, h: &[u8; HEADER_SIZE], what: &str) -> SniResult<Response> {
        self.arm(deadline)?;
        self.send(h)?;
        let rsp = self.receive()?;
        if rsp.is_error() {
            return Err(SniError::Protocol(format!("{}: cart reported an error", what)));
        }
        Ok(rsp)
    }

    fn path_command(&mut self, deadline: Deadline, op: Opcode, path: &str) -> SniResult<Response> {
        let mut h = header(op, Space::File, FLAG_NONE);
        set_name(&mut h, 256, HEADER_SIZE, path)?;
        self.command(deadline, &h, &format!("{:?} {}", op, path))
    }

    pub fn info(&mut self, deadline: Deadline) -> SniResult<CartInfo> {
        let rsp = self.command(deadline, &header(Opcode::Info, Space::Snes, FLAG_NONE), "INFO")?;
        Ok(CartInfo::from_response(&rsp))
    }

    /// Read every `(address, size)` range; results are in request order.
    pub fn vget(&mut self, deadline: Deadline, requests: &[(u32, usize)]) -> SniResult<Vec<Vec<u8>>> {
        let mut out: Vec<Vec<u8>> = requests.iter().map(|&(_, size)| vec![0; size]).collect();
        for group in plan_vector(requests)? {
            self.arm(deadline)?;
            self.send(&vector_header(Opcode::VGet, &group))?;

            let total: usize = group.iter().map(|c| c.len).sum();
            let mut data = vec![0u8; padded(total, BLOCK_SIZE_64)];
            self.port.read_exact(&mut data)?;

            let mut at = 0;
            for chunk in &group {
                out[chunk.request][chunk.offset..chunk.offset + chunk.len]
                    .copy_from_slice(&data[at..at + chunk.len]);
                at += chunk.len;
            }
        }
        Ok(out)
    }

    /// Write every `(address, data)` range in order.
    pub fn vput(&mut self, deadline: Deadline, writes: &[(u32, &[u8])]) -> SniResult<()> {
        let sizes: Vec<(u32, usize)> = writes.iter().map(|&(a, d)| (a, d.len())).collect();
        for group in plan_vector(&sizes)? {
            self.arm(deadline)?;
            self.send(&vector_header(Opcode::VPut, &group))?;

            let mut data = Vec::with_capacity(BLOCK_SIZE_64);
            for chunk in &group {
                data.extend_from_slice(&writes[chunk.request].1[chunk.offset..chunk.offset + chunk.len]);
            }
            data.resize(padded(data.len(), BLOCK_SIZE_64), 0);
            self.port.write_all(&data)?;
            self.port.flush()?;
        }
        Ok(())
    }

    pub fn reset(&mut self, deadline: Deadline) -> SniResult<()> {
        self.arm(deadline)?;
        self.send(&header(Opcode::Reset, Space::Snes, FLAG_NORESP))
    }

    pub fn menu_reset(&mut self, deadline: Deadline) -> SniResult<()> {
        self.arm(deadline)?;
        self.send(&header(Opcode::MenuReset, Space::Snes, FLAG_NORESP))
    }

    pub fn list(&mut self, deadline: Deadline, path: &str) -> SniResult<Vec<DirEntry>> {
        self.path_command(deadline, Opcode::Ls, path)?;

        let mut entries = vec![];
        let mut block = [0u8; BLOCK_SIZE];
        'blocks: loop {
            self.arm(deadline)?;
            self.port.read_exact(&mut block)?;
            let mut at = 0;
            while at < BLOCK_SIZE {
                let kind = match block[at] {
                    0xFF => break 'blocks,
                    // listing continues in the next block
                    0x02 => continue 'blocks,
                    0 => DirEntryKind::Directory,
                    1 => DirEntryKind::File,
                    other => {
                        return Err(SniError::Protocol(format!("unknown LS entry type {}", other)))
                    }
                };
                let name_start = at + 1;
                let len = block[name_start..]
                    .iter()
                    .position(|&c| c == 0)
                    .ok_or_else(|| SniError::Protocol("unterminated LS entry".to_string()))?;
                let name = String::from_utf8_lossy(&block[name_start..name_start + len]).into_owned();
                if name != "." && name != ".." {
                    entries.push(DirEntry { name, kind });
                }
                at = name_start + len + 1;
            }
        }
        Ok(entries)
    }

    pub fn mkdir(&mut self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.path_command(deadline, Opcode::Mkdir, path).map(|_| ())
    }

    pub fn rm(&mut self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.path_command(deadline, Opcode::Rm, path).map(|_| ())
    }

    pub fn mv(&mut self, deadline: Deadline, path: &str, new_name: &str) -> SniResult<()> {
        let mut h = header(Opcode::Mv, Space::File, FLAG_NONE);
        set_name(&mut h, 256, HEADER_SIZE, path)?;
        set_name(&mut h, 8, 252, new_name)?;
        self.command(deadline, &h, &format!("MV {}", path)).map(|_| ())
    }

    pub fn boot(&mut self, deadline: Deadline, path: &str) -> SniResult<()> {
        self.path_command(deadline, Opcode::Boot, path).map(|_| ())
    }

    /// Upload `size` bytes from `reader` to `path`.
    ///
    /// The cart waits for exactly `size` bytes once PUT is accepted. If
    /// `reader` fails, the rest is sent as zeros so the stream stays framed,
    /// and the reader's error is returned as `SniError::Stream`.
    pub fn put_file(
        &mut self,
        deadline: Deadline,
        path: &str,
        size: u32,
        reader: &mut dyn Read,
        mut progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        let mut h = header(Opcode::Put, Space::File, FLAG_NONE);
        set_size(&mut h, size);
        set_name(&mut h, 256, HEADER_SIZE, path)?;
        self.command(deadline, &h, &format!("PUT {}", path))?;

        let total = size as usize;
        let mut sent = 0;
        let mut source_error = None;
        let mut block = [0u8; BLOCK_SIZE];
        while sent < total {
            self.arm(deadline)?;
            let want = BLOCK_SIZE.min(total - sent);
            block.fill(0);
            if source_error.is_none() {
                if let Err(e) = reader.read_exact(&mut block[..want]) {
                    block.fill(0);
                    source_error = Some(e);
                }
            }
            self.port.write_all(&block)?;
            sent += want;
            if let (None, Some(report)) = (&source_error, progress.as_mut()) {
                report(sent as u32, size);
            }
        }
        self.port.flush()?;
        match source_error {
            Some(e) => Err(SniError::Stream(e)),
            None => Ok(size),
        }
    }

    /// Download `path` into `writer`; returns the file size.
    ///
    /// A failing `writer` does not cut the transfer short: the remaining
    /// blocks are drained and the error comes back as `SniError::Stream`.
    pub fn get_file(
        &mut self,
        deadline: Deadline,
        path: &str,
        writer: &mut dyn Write,
        size_received: Option<SizeReceived<'_>>,
        mut progress: Option<ProgressReport<'_>>,
    ) -> SniResult<u32> {
        let rsp = self.path_command(deadline, Opcode::Get, path)?;
        let size = rsp.size();
        if let Some(report) = size_received {
            report(size);
        }

        let total = size as usize;
        let mut received = 0;
        let mut sink_error = None;
        let mut block = [0u8; BLOCK_SIZE];
        while received < total {
            self.arm(deadline)?;
            self.port.read_exact(&mut block)?;
            let n = BLOCK_SIZE.min(total - received);
            received += n;
            if sink_error.is_some() {
                continue;
            }
            if let Err(e) = writer.write_all(&block[..n]) {
                sink_error = Some(e);
                continue;
            }
            if let Some(report) = progress.as_mut() {
                report(received as u32, size);
            }
        }
        match sink_error {
            Some(e) => Err(SniError::Stream(e)),
            None => Ok(size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut h = header(Opcode::Put, Space::File, FLAG_NONE);
        set_size(&mut h, 0x0001_0203);
        set_name(&mut h, 256, HEADER_SIZE, "/roms/a.sfc").unwrap();

        assert_eq!(&h[..4], b"USBA");
        assert_eq!(h[4], 1);
        assert_eq!(h[5], 0);
        assert_eq!(&h[252..256], &[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(&h[256..267], b"/roms/a.sfc");
        assert_eq!(h[267], 0);
    }

    #[test]
    fn test_overlong_names_rejected() {
        let mut h = header(Opcode::Mv, Space::File, FLAG_NONE);
        assert!(set_name(&mut h, 256, HEADER_SIZE, &"x".repeat(256)).is_err());
        assert!(set_name(&mut h, 256, HEADER_SIZE, &"x".repeat(255)).is_ok());
        assert!(set_name(&mut h, 8, 252, &"y".repeat(244)).is_err());
    }

    #[test]
    fn test_vector_header_tuples() {
        let group = plan_vector(&[(0xF50010, 2), (0x007FC0, 0x20)]).unwrap().remove(0);
        let h = vector_header(Opcode::VGet, &group);
        assert_eq!(h[4], Opcode::VGet as u8);
        assert_eq!(h[5], Space::Snes as u8);
        assert_eq!(h[6], FLAG_DATA64B | FLAG_NORESP);
        assert_eq!(&h[32..36], &[2, 0xF5, 0x00, 0x10]);
        assert_eq!(&h[36..40], &[0x20, 0x00, 0x7F, 0xC0]);
        assert_eq!(h[40], 0);
    }

    #[test]
    fn test_plan_vector_splits_and_groups() {
        let plan = plan_vector(&[(0x1000, 600), (0x2000, 0), (0x3000, 1)]).unwrap();
        let flat: Vec<_> = plan.iter().flatten().collect();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat[0].len, 255);
        assert_eq!(flat[1].address, 0x1000 + 255);
        assert_eq!(flat[2].len, 90);
        assert_eq!(flat[3].request, 2);
        assert_eq!(plan.len(), 1);

        let many: Vec<(u32, usize)> = (0..9).map(|i| (i * 0x100, 1)).collect();
        let plan = plan_vector(&many).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].len(), MAX_VECTOR_CHUNKS);
        assert_eq!(plan[1].len(), 1);
    }

    #[test]
    fn test_plan_vector_rejects_wide_addresses() {
        assert!(matches!(
            plan_vector(&[(0x100_0000, 1)]),
            Err(SniError::UnmappedAddress(0x100_0000))
        ));
        // the last chunk would cross $FFFFFF
        assert!(plan_vector(&[(0xFF_FF00, 0x101)]).is_err());
        assert!(plan_vector(&[(u32::MAX, 2)]).is_err());

        let edge = plan_vector(&[(0xFF_FF00, 0x100)]).unwrap();
        let last = edge[0].last().unwrap();
        assert_eq!(last.address + last.len as u32, 0x100_0000);
    }

    #[test]
    fn test_opcode_round_trip() {
        assert_eq!(Opcode::from_u8(11), Some(Opcode::Info));
        assert_eq!(Opcode::from_u8(15), Some(Opcode::Response));
        assert_eq!(Opcode::from_u8(16), None);
    }
}
