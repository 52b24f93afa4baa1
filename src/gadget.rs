//! Gadget identifiers and the per-target address table.
//!
//! The set of gadgets the engine composes is closed: every chain the
//! engine emits is built from the variants of [`Gadget`]. A target
//! build supplies `(module, offset)` for each one it has located; the
//! [`GadgetTable`] turns those into absolute addresses once.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Addr;

/// x86-64 gadget the engine knows how to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gadget {
    Ret,
    PopRax,
    PopRcx,
    PopRdx,
    PopRsi,
    PopRdi,
    PopR8,
    PopR9,
    PopR10,
    PopRsp,
    /// `mov rax, [rax]; ret`
    LoadRax,
    /// `mov [rdi], rax; ret`
    StoreRaxAtRdi,
    AddRaxRcx,
    AndRaxRcx,
    NegRax,
    SbbRaxRax,
    /// `syscall; ret`
    Syscall,
    /// First springboard hop: saves the caller's rsp into the dispatch
    /// object and jumps through its next slot.
    JopSaveRsp,
    /// Second springboard hop: loads rsp from the dispatch object.
    JopPivotRsp,
}

impl Gadget {
    pub const ALL: [Gadget; 19] = [
        Gadget::Ret,
        Gadget::PopRax,
        Gadget::PopRcx,
        Gadget::PopRdx,
        Gadget::PopRsi,
        Gadget::PopRdi,
        Gadget::PopR8,
        Gadget::PopR9,
        Gadget::PopR10,
        Gadget::PopRsp,
        Gadget::LoadRax,
        Gadget::StoreRaxAtRdi,
        Gadget::AddRaxRcx,
        Gadget::AndRaxRcx,
        Gadget::NegRax,
        Gadget::SbbRaxRax,
        Gadget::Syscall,
        Gadget::JopSaveRsp,
        Gadget::JopPivotRsp,
    ];

    /// Canonical machine-code encoding of the gadget.
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Gadget::Ret => &[0xc3],
            Gadget::PopRax => &[0x58, 0xc3],
            Gadget::PopRcx => &[0x59, 0xc3],
            Gadget::PopRdx => &[0x5a, 0xc3],
            Gadget::PopRsi => &[0x5e, 0xc3],
            Gadget::PopRdi => &[0x5f, 0xc3],
            Gadget::PopR8 => &[0x41, 0x58, 0xc3],
            Gadget::PopR9 => &[0x41, 0x59, 0xc3],
            Gadget::PopR10 => &[0x41, 0x5a, 0xc3],
            Gadget::PopRsp => &[0x5c, 0xc3],
            Gadget::LoadRax => &[0x48, 0x8b, 0x00, 0xc3],
            Gadget::StoreRaxAtRdi => &[0x48, 0x89, 0x07, 0xc3],
            Gadget::AddRaxRcx => &[0x48, 0x01, 0xc8, 0xc3],
            Gadget::AndRaxRcx => &[0x48, 0x21, 0xc8, 0xc3],
            Gadget::NegRax => &[0x48, 0xf7, 0xd8, 0xc3],
            Gadget::SbbRaxRax => &[0x48, 0x19, 0xc0, 0xc3],
            Gadget::Syscall => &[0x0f, 0x05, 0xc3],
            // mov [rdi+0x10], rsp; jmp [rdi+0x8]
            Gadget::JopSaveRsp => &[0x48, 0x89, 0x67, 0x10, 0xff, 0x67, 0x08],
            // mov rsp, [rdi+0x18]; ret
            Gadget::JopPivotRsp => &[0x48, 0x8b, 0x67, 0x18, 0xc3],
        }
    }

    /// Intel-syntax rendering.
    pub fn text(self) -> &'static str {
        match self {
            Gadget::Ret => "ret",
            Gadget::PopRax => "pop rax; ret",
            Gadget::PopRcx => "pop rcx; ret",
            Gadget::PopRdx => "pop rdx; ret",
            Gadget::PopRsi => "pop rsi; ret",
            Gadget::PopRdi => "pop rdi; ret",
            Gadget::PopR8 => "pop r8; ret",
            Gadget::PopR9 => "pop r9; ret",
            Gadget::PopR10 => "pop r10; ret",
            Gadget::PopRsp => "pop rsp; ret",
            Gadget::LoadRax => "mov rax, [rax]; ret",
            Gadget::StoreRaxAtRdi => "mov [rdi], rax; ret",
            Gadget::AddRaxRcx => "add rax, rcx; ret",
            Gadget::AndRaxRcx => "and rax, rcx; ret",
            Gadget::NegRax => "neg rax; ret",
            Gadget::SbbRaxRax => "sbb rax, rax; ret",
            Gadget::Syscall => "syscall; ret",
            Gadget::JopSaveRsp => "mov [rdi+10h], rsp; jmp qword ptr [rdi+8]",
            Gadget::JopPivotRsp => "mov rsp, [rdi+18h]; ret",
        }
    }

    /// Config-file name (`pop_rdi`, `store_rax_at_rdi`, ...).
    pub fn name(self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{:?}", self))
    }
}

impl fmt::Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Resolved gadget addresses for one target build.
#[derive(Debug, Clone, Default)]
pub struct GadgetTable {
    addrs: HashMap<Gadget, Addr>,
}

impl GadgetTable {
    /// Resolve every `(gadget, module, offset)` entry against `bases`.
    ///
    /// Fails with [`Error::UnknownModule`] if an entry names a module that
    /// has no base. Gadgets absent from `entries` stay unresolved and only
    /// fail when a chain asks for them.
    pub fn resolve<'a, I>(entries: I, bases: &HashMap<String, Addr>) -> Result<Self>
    where
        I: IntoIterator<Item = (Gadget, &'a str, u64)>,
    {
        let mut addrs = HashMap::new();
        for (gadget, module, offset) in entries {
            let base = bases
                .get(module)
                .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
            let addr = *base + offset;
            log::debug!("gadget {:<18} {} = {}+{:#x}", gadget.name(), addr, module, offset);
            addrs.insert(gadget, addr);
        }
        Ok(Self { addrs })
    }

    /// Build a table directly from absolute addresses.
    pub fn from_addrs<I: IntoIterator<Item = (Gadget, Addr)>>(entries: I) -> Self {
        Self { addrs: entries.into_iter().collect() }
    }

    pub fn get(&self, gadget: Gadget) -> Result<Addr> {
        self.addrs.get(&gadget).copied().ok_or(Error::MissingGadget(gadget))
    }

    pub fn contains(&self, gadget: Gadget) -> bool {
        self.addrs.contains_key(&gadget)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Resolved entries, sorted by gadget.
    pub fn entries(&self) -> Vec<(Gadget, Addr)> {
        let mut v: Vec<_> = self.addrs.iter().map(|(&g, &a)| (g, a)).collect();
        v.sort();
        v
    }

    /// Gadgets with no resolved address.
    pub fn missing(&self) -> Vec<Gadget> {
        Gadget::ALL.iter().copied().filter(|g| !self.contains(*g)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bases() -> HashMap<String, Addr> {
        let mut b = HashMap::new();
        b.insert("libc".to_string(), Addr(0x7f00_0000_0000));
        b.insert("libkernel".to_string(), Addr(0x8_0000_0000));
        b
    }

    #[test]
    fn resolution_is_base_plus_offset() {
        let entries = vec![
            (Gadget::PopRdi, "libc", 0x2a3e5),
            (Gadget::Ret, "libc", 0x0),
            (Gadget::Syscall, "libkernel", 0x1_0000),
        ];
        let table = GadgetTable::resolve(entries.clone(), &bases()).unwrap();
        for (gadget, module, offset) in entries {
            assert_eq!(table.get(gadget).unwrap(), bases()[module] + offset);
        }
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn unresolved_gadget_is_missing() {
        let table = GadgetTable::resolve(vec![(Gadget::Ret, "libc", 0x10)], &bases()).unwrap();
        assert!(matches!(table.get(Gadget::PopRsp), Err(Error::MissingGadget(Gadget::PopRsp))));
        assert_eq!(table.missing().len(), Gadget::ALL.len() - 1);
    }

    #[test]
    fn unknown_module_fails() {
        let err = GadgetTable::resolve(vec![(Gadget::Ret, "libfoo", 0x10)], &bases()).unwrap_err();
        assert!(matches!(err, Error::UnknownModule(m) if m == "libfoo"));
    }

    #[test]
    fn gadget_names_are_snake_case() {
        assert_eq!(Gadget::PopRdi.name(), "pop_rdi");
        assert_eq!(Gadget::StoreRaxAtRdi.name(), "store_rax_at_rdi");
        let g: Gadget = serde_json::from_str("\"jop_pivot_rsp\"").unwrap();
        assert_eq!(g, Gadget::JopPivotRsp);
    }

    #[test]
    fn every_encoding_ends_in_a_transfer() {
        for g in Gadget::ALL {
            let b = g.bytes();
            let last = b[b.len() - 1];
            let jmp_mem = b.len() >= 3 && b[b.len() - 3] == 0xff;
            assert!(last == 0xc3 || jmp_mem, "{:?}", g);
        }
    }
}
