//! Gadget verification against live memory.
//!
//! Reads the bytes at every resolved gadget address and compares them
//! with the canonical encoding. Stale offsets (a different libc build,
//! a wrong base) show up as mismatches, disassembled so the operator can
//! see what is actually there.

use std::fmt;

use iced_x86::{Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind,
               Instruction, IntelFormatter};

use crate::gadget::{Gadget, GadgetTable};
use crate::memory::Memory;
use crate::types::Addr;

/// Outcome for one gadget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GadgetStatus {
    Ok,
    /// Different bytes at the address; `found` is disassembled in `text`.
    Mismatch { found: Vec<u8>, text: String },
    Unreadable(String),
}

#[derive(Debug, Clone)]
pub struct GadgetCheck {
    pub gadget: Gadget,
    pub addr: Addr,
    pub status: GadgetStatus,
}

impl GadgetCheck {
    pub fn is_ok(&self) -> bool {
        self.status == GadgetStatus::Ok
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checks: Vec<GadgetCheck>,
    /// Gadgets the target does not resolve at all.
    pub missing: Vec<Gadget>,
}

impl VerifyReport {
    /// True when every resolved gadget matched.
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(GadgetCheck::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &GadgetCheck> {
        self.checks.iter().filter(|c| !c.is_ok())
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.checks {
            match &c.status {
                GadgetStatus::Ok => {
                    writeln!(f, "  ok        {:016x}  {}", c.addr.addr(), c.gadget.text())?
                }
                GadgetStatus::Mismatch { text, .. } => writeln!(
                    f,
                    "  MISMATCH  {:016x}  want `{}`, found `{}`",
                    c.addr.addr(),
                    c.gadget.text(),
                    text
                )?,
                GadgetStatus::Unreadable(e) => {
                    writeln!(f, "  UNREAD    {:016x}  {}: {}", c.addr.addr(), c.gadget.text(), e)?
                }
            }
        }
        for g in &self.missing {
            writeln!(f, "  missing   {:>16}  {}", "-", g.text())?;
        }
        Ok(())
    }
}

/// Check every gadget in `table` against `mem`.
pub fn verify_gadgets<M: Memory>(mem: &M, table: &GadgetTable) -> VerifyReport {
    let mut checks = Vec::new();
    for (gadget, addr) in table.entries() {
        let want = gadget.bytes();
        let mut found = vec![0u8; want.len()];
        let status = match mem.read_bytes(addr, &mut found) {
            Err(e) => GadgetStatus::Unreadable(e.to_string()),
            Ok(()) if found == want => GadgetStatus::Ok,
            Ok(()) => {
                let text = disassemble(&found, addr);
                GadgetStatus::Mismatch { found, text }
            }
        };
        match &status {
            GadgetStatus::Ok => log::debug!("{} at {} verified", gadget, addr),
            other => log::warn!("{} at {}: {:?}", gadget, addr, other),
        }
        checks.push(GadgetCheck {
            gadget,
            addr,
            status,
        });
    }
    VerifyReport {
        checks,
        missing: table.missing(),
    }
}

/// Intel-syntax listing of `code`, instructions joined with `; `.
pub fn disassemble(code: &[u8], ip: Addr) -> String {
    let mut decoder = Decoder::with_ip(64, code, ip.addr(), DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut output = TextOutput::default();
    let mut parts = Vec::new();
    let mut insn = Instruction::default();

    while decoder.can_decode() {
        decoder.decode_out(&mut insn);
        if insn.is_invalid() {
            parts.push("(bad)".to_string());
            break;
        }
        output.text.clear();
        formatter.format(&insn, &mut output);
        parts.push(output.text.clone());
    }
    parts.join("; ")
}

#[derive(Default)]
struct TextOutput {
    text: String,
}

impl FormatterOutput for TextOutput {
    fn write(&mut self, text: &str, _kind: FormatterTextKind) {
        self.text.push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::testkit;

    #[test]
    fn installed_gadgets_verify() {
        let target = testkit::target();
        let emu = testkit::emulator(&target);
        let report = verify_gadgets(&emu, target.gadgets());
        assert!(report.is_ok());
        assert_eq!(report.checks.len(), Gadget::ALL.len());
        assert!(report.missing.is_empty());
    }

    #[test]
    fn corrupted_gadget_is_reported() {
        let target = testkit::target();
        let mut emu = testkit::emulator(&target);
        let addr = target.gadget(Gadget::PopRdi).unwrap();
        emu.write_bytes(addr, &[0xcc, 0xcc]).unwrap();

        let report = verify_gadgets(&emu, target.gadgets());
        assert!(!report.is_ok());
        let bad: Vec<_> = report.failures().collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].gadget, Gadget::PopRdi);
        match &bad[0].status {
            GadgetStatus::Mismatch { found, text } => {
                assert_eq!(found, &[0xcc, 0xcc]);
                assert_eq!(text, "int3; int3");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(report.to_string().contains("MISMATCH"));
    }

    #[test]
    fn unmapped_and_missing_gadgets() {
        let target = testkit::target_without(Gadget::Syscall);
        let mem = crate::memory::SparseMemory::new();
        let report = verify_gadgets(&mem, target.gadgets());
        assert_eq!(report.missing, vec![Gadget::Syscall]);
        assert!(report
            .checks
            .iter()
            .all(|c| matches!(c.status, GadgetStatus::Unreadable(_))));
    }

    #[test]
    fn disassembles_canonical_bytes() {
        let text = disassemble(Gadget::Syscall.bytes(), Addr(0x1000));
        assert!(text.starts_with("syscall"));
        assert!(text.ends_with("ret"));
    }
}
