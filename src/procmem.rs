//! [`Memory`] over a live process via `/proc/<pid>/mem`.
//!
//! Requires ptrace-level access to the target (same user and a permissive
//! `ptrace_scope`, or `CAP_SYS_PTRACE`).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::types::Addr;

pub struct ProcessMemory {
    pid: Pid,
    file: File,
}

impl ProcessMemory {
    /// Open the process memory read-only.
    pub fn open(pid: Pid) -> Result<Self> {
        let file = File::open(format!("/proc/{}/mem", pid))
            .map_err(|e| Error::Other(format!("/proc/{}/mem: {}", pid, e)))?;
        Ok(Self { pid, file })
    }

    /// Open the process memory for reading and writing.
    pub fn open_rw(pid: Pid) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{}/mem", pid))
            .map_err(|e| Error::Other(format!("/proc/{}/mem: {}", pid, e)))?;
        Ok(Self { pid, file })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl Memory for ProcessMemory {
    fn read_bytes(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, addr.addr()).map_err(|e| match e.raw_os_error() {
            Some(code) if code == Errno::EIO as i32 => Error::Unmapped(addr),
            _ => Error::Io(e),
        })
    }

    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, addr.addr()).map_err(|e| match e.raw_os_error() {
            Some(code) if code == Errno::EIO as i32 => Error::Unmapped(addr),
            _ => Error::Io(e),
        })
    }
}
