//! Reading bytes out of another process's address space.
//!
//! The target must be `ptrace`-attached and stopped for every read here to
//! succeed. `attach`/`wait_stopped`/`detach` are the primitives; `AttachGuard`
//! is the scoped-acquisition wrapper that the Stack Reconstructor and the
//! Image Resolver's version read both build on so a detach always happens,
//! even when a read fails partway through a sample.

use std::fs::File;
use std::os::unix::fs::FileExt;

use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::core::types::IntrospectionError;

/// Abstraction over "a source of bytes keyed by address in another process",
/// so the Stack Reconstructor can be tested against an in-memory fake
/// without a live ptrace target.
pub trait MemorySource {
    fn peek(&self, addr: u64, n_bytes: usize) -> Result<Vec<u8>, IntrospectionError>;

    fn read_u32_le(&self, addr: u64) -> Result<u32, IntrospectionError> {
        let bytes = self.peek(addr, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("peek returned wrong length")))
    }

    fn read_u64_le(&self, addr: u64) -> Result<u64, IntrospectionError> {
        let bytes = self.peek(addr, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("peek returned wrong length")))
    }

    fn read_i32_le(&self, addr: u64) -> Result<i32, IntrospectionError> {
        self.read_u32_le(addr).map(|v| v as i32)
    }

    fn read_ptr(&self, addr: u64) -> Result<u64, IntrospectionError> {
        self.read_u64_le(addr)
    }

    /// Reads consecutive 8-byte blocks until a NUL byte is found. Never
    /// assumes an upper bound on string length; stops as soon as a `peek`
    /// fails and propagates that failure.
    fn read_cstring(&self, addr: u64) -> Result<String, IntrospectionError> {
        const CHUNK: usize = 8;
        let mut buf = Vec::new();
        let mut cursor = addr;
        loop {
            let chunk = self.peek(cursor, CHUNK)?;
            if let Some(nul_pos) = chunk.iter().position(|&b| b == 0) {
                buf.extend_from_slice(&chunk[..nul_pos]);
                break;
            }
            buf.extend_from_slice(&chunk);
            cursor += CHUNK as u64;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Reads from a live, ptrace-attached, stopped process via `/proc/<pid>/mem`.
/// Bulk pread is dramatically cheaper than word-at-a-time `PTRACE_PEEKDATA`
/// and is legal to use on a tracee once attach + wait_stopped has completed.
pub struct ProcessMemoryReader {
    pid: Pid,
    mem: File,
}

impl ProcessMemoryReader {
    pub fn open(pid: Pid) -> Result<Self, IntrospectionError> {
        let path = format!("/proc/{}/mem", pid);
        let mem = File::open(&path).map_err(|source| IntrospectionError::PeekFailed {
            pid: pid.as_raw(),
            addr: 0,
            n_bytes: 0,
            source,
        })?;
        Ok(ProcessMemoryReader { pid, mem })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl MemorySource for ProcessMemoryReader {
    fn peek(&self, addr: u64, n_bytes: usize) -> Result<Vec<u8>, IntrospectionError> {
        let mut buf = vec![0u8; n_bytes];
        self.mem
            .read_exact_at(&mut buf, addr)
            .map_err(|source| IntrospectionError::PeekFailed {
                pid: self.pid.as_raw(),
                addr,
                n_bytes,
                source,
            })?;
        Ok(buf)
    }
}

/// `PTRACE_ATTACH` the target. The caller must follow with `wait_stopped`
/// before issuing any reads.
pub fn attach(pid: Pid) -> Result<(), IntrospectionError> {
    ptrace::attach(pid).map_err(|e| IntrospectionError::AttachFailed(pid.as_raw(), e))
}

/// Blocks until the target reports stopped via `waitpid`, distinguishing
/// *exited* and *not stopped* as distinct error kinds.
pub fn wait_stopped(pid: Pid) -> Result<(), IntrospectionError> {
    match waitpid(pid, None) {
        Ok(WaitStatus::Stopped(_, _)) => Ok(()),
        Ok(WaitStatus::Exited(_, _)) => Err(IntrospectionError::TargetExited(pid.as_raw())),
        Ok(other) => Err(IntrospectionError::TargetNotStopped(pid.as_raw(), other)),
        Err(e) => Err(IntrospectionError::AttachFailed(pid.as_raw(), e)),
    }
}

/// `PTRACE_DETACH` the target. Must run on every exit path from an attached
/// state; see `AttachGuard` for the RAII wrapper that guarantees this.
pub fn detach(pid: Pid) -> Result<(), IntrospectionError> {
    ptrace::detach(pid, None).map_err(|e| IntrospectionError::DetachFailed(pid.as_raw(), e))
}

/// Scoped acquisition of the target: attaches and waits for it to stop on
/// construction, detaches on drop regardless of how the guard's scope is
/// exited. A failed detach is logged, not propagated — `?` inside the
/// guard's scope must never skip the detach.
pub struct AttachGuard {
    pid: Pid,
    reader: ProcessMemoryReader,
}

impl AttachGuard {
    pub fn new(pid: Pid) -> Result<Self, IntrospectionError> {
        attach(pid)?;
        wait_stopped(pid)?;
        let reader = ProcessMemoryReader::open(pid)?;
        Ok(AttachGuard { pid, reader })
    }

    pub fn reader(&self) -> &ProcessMemoryReader {
        &self.reader
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if let Err(e) = detach(self.pid) {
            log::warn!("failed to detach from pid {}: {}", self.pid, e);
        }
    }
}

#[cfg(test)]
pub(crate) struct FakeMemory {
    base: u64,
    bytes: Vec<u8>,
}

#[cfg(test)]
impl FakeMemory {
    pub(crate) fn new(base: u64, bytes: Vec<u8>) -> Self {
        FakeMemory { base, bytes }
    }
}

#[cfg(test)]
impl MemorySource for FakeMemory {
    fn peek(&self, addr: u64, n_bytes: usize) -> Result<Vec<u8>, IntrospectionError> {
        if addr < self.base {
            return Err(IntrospectionError::PeekFailed {
                pid: 0,
                addr,
                n_bytes,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "below base"),
            });
        }
        let offset = (addr - self.base) as usize;
        let end = offset.checked_add(n_bytes).ok_or_else(|| IntrospectionError::PeekFailed {
            pid: 0,
            addr,
            n_bytes,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "overflow"),
        })?;
        self.bytes
            .get(offset..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| IntrospectionError::PeekFailed {
                pid: 0,
                addr,
                n_bytes,
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "out of range"),
            })
    }
}

/// A sparse, address-keyed fake `MemorySource` for building the small
/// synthetic target images the Stack Reconstructor's tests exercise:
/// `std::vector` headers, `CallInfo`/`Func`/`Location` structs, and
/// NUL-terminated strings, each placed at whatever address the test chooses.
#[cfg(test)]
pub(crate) struct FakeMemoryBuilder {
    regions: std::collections::BTreeMap<u64, Vec<u8>>,
}

#[cfg(test)]
impl FakeMemoryBuilder {
    pub(crate) fn new() -> Self {
        FakeMemoryBuilder { regions: std::collections::BTreeMap::new() }
    }

    fn put(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.insert(addr, bytes);
    }

    /// A `std::vector<T>` header: `{start, finish, end_of_storage}`, the
    /// latter set equal to `finish` since nothing here reads spare capacity.
    pub(crate) fn vector_header(&mut self, addr: u64, start: u64, finish: u64) -> &mut Self {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&start.to_le_bytes());
        bytes.extend_from_slice(&finish.to_le_bytes());
        bytes.extend_from_slice(&finish.to_le_bytes());
        self.put(addr, bytes);
        self
    }

    /// One `CallInfo` entry (`{call*, func*, <reserved>}`) written at
    /// `vec_data_addr` — callers place successive entries at
    /// `vec_data_addr + i * 24`.
    pub(crate) fn call_info(&mut self, vec_data_addr: u64, call_ptr: u64, func_ptr: u64) -> &mut Self {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&call_ptr.to_le_bytes());
        bytes.extend_from_slice(&func_ptr.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        self.put(vec_data_addr, bytes);
        self
    }

    /// A 96-byte `Func` object: `kind` at offset 56, `Location*` at offset 8,
    /// `name*` at offset 72. `kind` is 0 for script, nonzero for builtin.
    pub(crate) fn func_object(&mut self, addr: u64, kind: u64, name: &str, loc_addr: u64) -> &mut Self {
        let mut bytes = vec![0u8; FUNC_OBJECT_SIZE_FOR_TESTS];
        bytes[8..16].copy_from_slice(&loc_addr.to_le_bytes());
        bytes[56..64].copy_from_slice(&kind.to_le_bytes());
        let name_addr = addr + 0x10_0000;
        bytes[72..80].copy_from_slice(&name_addr.to_le_bytes());
        self.put(addr, bytes);
        self.cstring(name_addr, name);
        self
    }

    /// A `Location` object laid out per the 3.1 offset table:
    /// `filename*@0, first_line@8, last_line@12`.
    pub(crate) fn location_3_1(&mut self, addr: u64, filename_addr: u64, first_line: i32, last_line: i32) -> &mut Self {
        let mut bytes = vec![0u8; 16];
        bytes[0..8].copy_from_slice(&filename_addr.to_le_bytes());
        bytes[8..12].copy_from_slice(&first_line.to_le_bytes());
        bytes[12..16].copy_from_slice(&last_line.to_le_bytes());
        self.put(addr, bytes);
        self
    }

    /// Pads the backing region to a multiple of `read_cstring`'s 8-byte
    /// chunk size beyond the NUL terminator, since `FakeSparseMemory` never
    /// stitches a chunked read across adjacent regions.
    pub(crate) fn cstring(&mut self, addr: u64, s: &str) -> &mut Self {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        let padded_len = bytes.len().div_ceil(8) * 8;
        bytes.resize(padded_len, 0);
        self.put(addr, bytes);
        self
    }

    pub(crate) fn ptr_at(&mut self, addr: u64, value: u64) -> &mut Self {
        self.put(addr, value.to_le_bytes().to_vec());
        self
    }

    /// An interpreter ("BroObj") object: an 8-byte vtable slot followed by
    /// its `Location*` at offset 8.
    pub(crate) fn interp_object(&mut self, addr: u64, loc_addr: u64) -> &mut Self {
        let mut bytes = vec![0u8; 16];
        bytes[8..16].copy_from_slice(&loc_addr.to_le_bytes());
        self.put(addr, bytes);
        self
    }

    pub(crate) fn build(&self) -> FakeSparseMemory {
        FakeSparseMemory { regions: self.regions.clone() }
    }
}

#[cfg(test)]
const FUNC_OBJECT_SIZE_FOR_TESTS: usize = 96;

/// Backing store built by `FakeMemoryBuilder`: every `peek` must fall
/// entirely within one region that was written as a single unit — this
/// fake never stitches adjacent regions together the way real process
/// memory would.
#[cfg(test)]
pub(crate) struct FakeSparseMemory {
    regions: std::collections::BTreeMap<u64, Vec<u8>>,
}

#[cfg(test)]
impl MemorySource for FakeSparseMemory {
    fn peek(&self, addr: u64, n_bytes: usize) -> Result<Vec<u8>, IntrospectionError> {
        if n_bytes == 0 {
            return Ok(Vec::new());
        }
        for (&region_addr, region_bytes) in self.regions.range(..=addr).rev() {
            let offset = (addr - region_addr) as usize;
            if let Some(end) = offset.checked_add(n_bytes) {
                if end <= region_bytes.len() {
                    return Ok(region_bytes[offset..end].to_vec());
                }
            }
        }
        Err(IntrospectionError::PeekFailed {
            pid: 0,
            addr,
            n_bytes,
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no region covers this read"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cstring_stops_at_nul_across_chunks() {
        let mut bytes = b"dns_message".to_vec();
        bytes.push(0);
        bytes.extend_from_slice(b"garbage-after-nul");
        let mem = FakeMemory::new(0x1000, bytes);
        let s = mem.read_cstring(0x1000).unwrap();
        assert_eq!(s, "dns_message");
    }

    #[test]
    fn read_u64_le_roundtrips() {
        let value: u64 = 0x1122_3344_5566_7788;
        let mem = FakeMemory::new(0x2000, value.to_le_bytes().to_vec());
        assert_eq!(mem.read_u64_le(0x2000).unwrap(), value);
    }

    #[test]
    fn peek_below_base_fails() {
        let mem = FakeMemory::new(0x2000, vec![0; 8]);
        assert!(mem.peek(0x1000, 4).is_err());
    }
}
