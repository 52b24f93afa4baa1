//! Syscall name → number table.
//!
//! Ships the common Linux x86_64 numbers; target configurations add to or
//! override them (other kernels number their syscalls differently).

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Common Linux x86_64 syscall numbers.
/// From arch/x86/entry/syscalls/syscall_64.tbl.
const LINUX_X86_64: &[(&str, u64)] = &[
    ("read", 0),
    ("write", 1),
    ("open", 2),
    ("close", 3),
    ("mmap", 9),
    ("mprotect", 10),
    ("munmap", 11),
    ("rt_sigaction", 13),
    ("rt_sigprocmask", 14),
    ("ioctl", 16),
    ("sched_yield", 24),
    ("dup2", 33),
    ("nanosleep", 35),
    ("getpid", 39),
    ("socket", 41),
    ("connect", 42),
    ("sendto", 44),
    ("recvfrom", 45),
    ("fork", 57),
    ("exit", 60),
    ("kill", 62),
    ("getuid", 102),
    ("getgid", 104),
    ("setuid", 105),
    ("geteuid", 107),
    ("getppid", 110),
    ("gettid", 186),
    ("exit_group", 231),
    ("openat", 257),
];

/// Resolves syscall names for one target build.
#[derive(Debug, Clone, Default)]
pub struct SyscallTable {
    numbers: HashMap<String, u64>,
}

impl SyscallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linux_x86_64() -> Self {
        Self {
            numbers: LINUX_X86_64.iter().map(|&(n, nr)| (n.to_string(), nr)).collect(),
        }
    }

    /// Add or replace entries.
    pub fn extend<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        for (name, nr) in entries {
            self.numbers.insert(name.into(), nr);
        }
    }

    pub fn number(&self, name: &str) -> Result<u64> {
        self.numbers
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownSyscall(name.to_string()))
    }

    /// Reverse lookup, mainly for dumps.
    pub fn name(&self, number: u64) -> Option<&str> {
        self.numbers
            .iter()
            .find(|&(_, &nr)| nr == number)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}
