//! x86-64 gadget emulator.
//!
//! Runs chains against a [`SparseMemory`] address space so they can be
//! exercised without a live target. Instructions are decoded from memory
//! with iced-x86 and executed for the subset gadgets are built from:
//! `ret`, `pop`, `mov` between registers and `[base+disp]`, `add`, `and`,
//! `neg`, `sbb`, `jmp` and `syscall`. Anything else faults.
//!
//! Native functions, the context capture/resume pair and syscall handlers
//! are registered by address or number; the emulator dispatches to them
//! instead of decoding.

use std::collections::HashMap;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use crate::checkpoint::{ContextLayout, ContextRoutines};
use crate::error::{Error, Result};
use crate::gadget::GadgetTable;
use crate::memory::{Memory, SparseMemory};
use crate::pivot::Trigger;
use crate::types::Addr;

/// Return address planted by [`Emulator::call_indirect`]; reaching it
/// ends execution.
pub const HOST_RETURN: Addr = Addr(0x0000_dead_0000_0000);
/// Top of the emulator's own (host) stack.
pub const HOST_STACK_TOP: Addr = Addr(0x0000_7ffd_0001_0000);
const HOST_STACK_SIZE: u64 = 0x1_0000;
pub const DEFAULT_STEP_LIMIT: usize = 100_000;
const ENOSYS: u64 = 38;

/// Callee-saved registers, in the order the context routines store them.
const CALLEE_SAVED: [Register; 6] = [
    Register::RBX,
    Register::RBP,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /// Carry flag; the only flag the gadget subset reads.
    pub cf: bool,
}

impl Registers {
    fn slot(&mut self, reg: Register) -> Option<&mut u64> {
        Some(match reg {
            Register::RAX => &mut self.rax,
            Register::RBX => &mut self.rbx,
            Register::RCX => &mut self.rcx,
            Register::RDX => &mut self.rdx,
            Register::RSI => &mut self.rsi,
            Register::RDI => &mut self.rdi,
            Register::RBP => &mut self.rbp,
            Register::RSP => &mut self.rsp,
            Register::R8 => &mut self.r8,
            Register::R9 => &mut self.r9,
            Register::R10 => &mut self.r10,
            Register::R11 => &mut self.r11,
            Register::R12 => &mut self.r12,
            Register::R13 => &mut self.r13,
            Register::R14 => &mut self.r14,
            Register::R15 => &mut self.r15,
            _ => return None,
        })
    }

    pub fn get(&self, reg: Register) -> Option<u64> {
        let mut copy = *self;
        copy.slot(reg).map(|v| *v)
    }

    pub fn set(&mut self, reg: Register, value: u64) -> bool {
        match self.slot(reg) {
            Some(v) => {
                *v = value;
                true
            }
            None => false,
        }
    }

    /// Function-call arguments in SysV order.
    pub fn call_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }

    /// Syscall arguments in Linux x86_64 order.
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }
}

/// Native function body: sees the registers and memory, returns `rax`.
pub type NativeFn = Box<dyn FnMut(&mut Registers, &mut SparseMemory) -> Result<u64>>;

/// Syscall handler: gets the six argument registers, returns `rax`.
pub type SyscallFn = Box<dyn FnMut(&[u64; 6], &mut SparseMemory) -> u64>;

enum Native {
    Function(NativeFn),
    SaveContext(ContextLayout),
    ResumeContext(ContextLayout),
}

enum NativeAction {
    Return(u64),
    Save(ContextLayout),
    Resume(ContextLayout),
}

pub struct Emulator {
    mem: SparseMemory,
    regs: Registers,
    natives: HashMap<u64, Native>,
    syscalls: HashMap<u64, SyscallFn>,
    step_limit: usize,
    steps: usize,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    pub fn new() -> Self {
        let mut mem = SparseMemory::new();
        mem.map(HOST_STACK_TOP - HOST_STACK_SIZE, HOST_STACK_SIZE);
        Self {
            mem,
            regs: Registers::default(),
            natives: HashMap::new(),
            syscalls: HashMap::new(),
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
        }
    }

    pub fn map(&mut self, addr: Addr, len: u64) {
        self.mem.map(addr, len);
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// Instructions executed by the last run.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn set_step_limit(&mut self, limit: usize) {
        self.step_limit = limit;
    }

    /// Map and write the canonical encoding of every resolved gadget.
    pub fn install_gadgets(&mut self, table: &GadgetTable) -> Result<()> {
        for (gadget, addr) in table.entries() {
            let bytes = gadget.bytes();
            self.mem.map(addr, bytes.len() as u64);
            self.mem.write_bytes(addr, bytes)?;
        }
        Ok(())
    }

    pub fn register_native<F>(&mut self, addr: Addr, f: F)
    where
        F: FnMut(&mut Registers, &mut SparseMemory) -> Result<u64> + 'static,
    {
        self.natives.insert(addr.addr(), Native::Function(Box::new(f)));
    }

    pub fn register_context_routines(&mut self, routines: &ContextRoutines) {
        self.natives
            .insert(routines.save.addr(), Native::SaveContext(routines.layout));
        self.natives
            .insert(routines.resume.addr(), Native::ResumeContext(routines.layout));
    }

    pub fn register_syscall<F>(&mut self, number: u64, f: F)
    where
        F: FnMut(&[u64; 6], &mut SparseMemory) -> u64 + 'static,
    {
        self.syscalls.insert(number, Box::new(f));
    }

    /// Perform `call [slot]` with `rdi = this`, from the host stack, and
    /// run until the call returns.
    pub fn call_indirect(&mut self, slot: Addr, this: Addr) -> Result<()> {
        let target = self.mem.read_u64(slot)?;
        self.regs.rsp = (HOST_STACK_TOP - 0x100).addr();
        self.push(HOST_RETURN.addr())?;
        self.regs.rdi = this.addr();
        self.regs.rip = target;
        self.execute()
    }

    /// Run from the current `rip` until it reaches [`HOST_RETURN`].
    pub fn execute(&mut self) -> Result<()> {
        self.steps = 0;
        while self.regs.rip != HOST_RETURN.addr() {
            if self.steps >= self.step_limit {
                return Err(self.fault(format!("step limit {} reached", self.step_limit)));
            }
            self.steps += 1;
            self.step()?;
        }
        log::debug!("emulator returned to host after {} steps", self.steps);
        Ok(())
    }

    fn fault(&self, reason: impl Into<String>) -> Error {
        Error::Fault {
            addr: Addr(self.regs.rip),
            reason: reason.into(),
        }
    }

    fn push(&mut self, value: u64) -> Result<()> {
        self.regs.rsp = self.regs.rsp.wrapping_sub(8);
        self.mem.write_u64(Addr(self.regs.rsp), value)
    }

    fn pop(&mut self) -> Result<u64> {
        let v = self.mem.read_u64(Addr(self.regs.rsp))?;
        self.regs.rsp = self.regs.rsp.wrapping_add(8);
        Ok(v)
    }

    fn step(&mut self) -> Result<()> {
        let rip = self.regs.rip;
        let action = match self.natives.get_mut(&rip) {
            Some(Native::Function(f)) => Some(NativeAction::Return(f(&mut self.regs, &mut self.mem)?)),
            Some(Native::SaveContext(layout)) => Some(NativeAction::Save(*layout)),
            Some(Native::ResumeContext(layout)) => Some(NativeAction::Resume(*layout)),
            None => None,
        };
        match action {
            Some(NativeAction::Return(value)) => {
                self.regs.rax = value;
                self.regs.rip = self.pop()?;
                Ok(())
            }
            Some(NativeAction::Save(layout)) => self.save_context(layout),
            Some(NativeAction::Resume(layout)) => self.resume_context(layout),
            None => {
                let insn = self.fetch()?;
                self.exec(&insn)
            }
        }
    }

    /// Offsets not taken by rip/rsp, in order, for the callee-saved set.
    fn callee_saved_offsets(layout: ContextLayout) -> impl Iterator<Item = u64> {
        (0..layout.size as u64 / 8)
            .map(|i| i * 8)
            .filter(move |&o| o != layout.rip_offset && o != layout.rsp_offset)
            .take(CALLEE_SAVED.len())
    }

    fn save_context(&mut self, layout: ContextLayout) -> Result<()> {
        let ctx = Addr(self.regs.rdi);
        let ret = self.mem.read_u64(Addr(self.regs.rsp))?;
        self.mem.write_u64(ctx + layout.rip_offset, ret)?;
        self.mem.write_u64(ctx + layout.rsp_offset, self.regs.rsp.wrapping_add(8))?;
        for (off, reg) in Self::callee_saved_offsets(layout).zip(CALLEE_SAVED) {
            let v = self.regs.get(reg).unwrap_or(0);
            self.mem.write_u64(ctx + off, v)?;
        }
        self.regs.rax = 0;
        self.regs.rip = self.pop()?;
        Ok(())
    }

    fn resume_context(&mut self, layout: ContextLayout) -> Result<()> {
        let ctx = Addr(self.regs.rdi);
        for (off, reg) in Self::callee_saved_offsets(layout).zip(CALLEE_SAVED) {
            let v = self.mem.read_u64(ctx + off)?;
            self.regs.set(reg, v);
        }
        self.regs.rsp = self.mem.read_u64(ctx + layout.rsp_offset)?;
        self.regs.rip = self.mem.read_u64(ctx + layout.rip_offset)?;
        self.regs.rax = 1;
        Ok(())
    }

    fn fetch(&self) -> Result<Instruction> {
        let rip = self.regs.rip;
        let mut buf = [0u8; 15];
        let mut n = 0;
        while n < buf.len() {
            match self.mem.read_u8(Addr(rip.wrapping_add(n as u64))) {
                Ok(b) => buf[n] = b,
                Err(_) => break,
            }
            n += 1;
        }
        if n == 0 {
            return Err(self.fault("fetch from unmapped memory"));
        }
        let mut decoder = Decoder::with_ip(64, &buf[..n], rip, DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(self.fault("invalid instruction"));
        }
        Ok(insn)
    }

    fn reg(&self, reg: Register) -> Result<u64> {
        self.regs
            .get(reg)
            .ok_or_else(|| self.fault(format!("unsupported register {:?}", reg)))
    }

    fn set_reg(&mut self, reg: Register, value: u64) -> Result<()> {
        if self.regs.set(reg, value) {
            Ok(())
        } else {
            Err(self.fault(format!("unsupported register {:?}", reg)))
        }
    }

    fn effective_address(&self, insn: &Instruction) -> Result<Addr> {
        if insn.memory_index() != Register::None {
            return Err(self.fault("indexed addressing is not supported"));
        }
        let disp = insn.memory_displacement64();
        match insn.memory_base() {
            Register::None => Ok(Addr(disp)),
            // iced already folded rip into the displacement.
            Register::RIP => Ok(Addr(disp)),
            base => Ok(Addr(self.reg(base)?.wrapping_add(disp))),
        }
    }

    /// Read the value of operand 1 (register or memory).
    fn source(&self, insn: &Instruction) -> Result<u64> {
        match insn.op1_kind() {
            OpKind::Register => self.reg(insn.op1_register()),
            OpKind::Memory => self.mem.read_u64(self.effective_address(insn)?),
            other => Err(self.fault(format!("unsupported source operand {:?}", other))),
        }
    }

    fn exec(&mut self, insn: &Instruction) -> Result<()> {
        let next = insn.next_ip();
        match insn.mnemonic() {
            Mnemonic::Ret => {
                if insn.op_count() != 0 {
                    return Err(self.fault("ret imm16 is not supported"));
                }
                self.regs.rip = self.pop()?;
            }
            Mnemonic::Nop => self.regs.rip = next,
            Mnemonic::Pop => {
                let reg = insn.op0_register();
                if reg == Register::RSP {
                    self.regs.rsp = self.mem.read_u64(Addr(self.regs.rsp))?;
                } else {
                    let v = self.pop()?;
                    self.set_reg(reg, v)?;
                }
                self.regs.rip = next;
            }
            Mnemonic::Mov => {
                match insn.op0_kind() {
                    OpKind::Register => {
                        let v = self.source(insn)?;
                        self.set_reg(insn.op0_register(), v)?;
                    }
                    OpKind::Memory if insn.op1_kind() == OpKind::Register => {
                        let addr = self.effective_address(insn)?;
                        let v = self.reg(insn.op1_register())?;
                        self.mem.write_u64(addr, v)?;
                    }
                    _ => return Err(self.fault("unsupported mov form")),
                }
                self.regs.rip = next;
            }
            Mnemonic::Add | Mnemonic::And | Mnemonic::Sbb => {
                if insn.op0_kind() != OpKind::Register {
                    return Err(self.fault("memory destination is not supported"));
                }
                let dst = insn.op0_register();
                let a = self.reg(dst)?;
                let b = self.source(insn)?;
                let (v, cf) = match insn.mnemonic() {
                    Mnemonic::Add => a.overflowing_add(b),
                    Mnemonic::And => (a & b, false),
                    _ => {
                        let (r1, c1) = a.overflowing_sub(b);
                        let (r2, c2) = r1.overflowing_sub(self.regs.cf as u64);
                        (r2, c1 || c2)
                    }
                };
                self.set_reg(dst, v)?;
                self.regs.cf = cf;
                self.regs.rip = next;
            }
            Mnemonic::Neg => {
                if insn.op0_kind() != OpKind::Register {
                    return Err(self.fault("memory destination is not supported"));
                }
                let reg = insn.op0_register();
                let v = self.reg(reg)?;
                self.regs.cf = v != 0;
                self.set_reg(reg, v.wrapping_neg())?;
                self.regs.rip = next;
            }
            Mnemonic::Jmp => {
                self.regs.rip = match insn.op0_kind() {
                    OpKind::Register => self.reg(insn.op0_register())?,
                    OpKind::Memory => self.mem.read_u64(self.effective_address(insn)?)?,
                    OpKind::NearBranch64 => insn.near_branch_target(),
                    other => return Err(self.fault(format!("unsupported jmp operand {:?}", other))),
                };
            }
            Mnemonic::Syscall => {
                let number = self.regs.rax;
                let args = self.regs.syscall_args();
                let ret = match self.syscalls.get_mut(&number) {
                    Some(handler) => handler(&args, &mut self.mem),
                    None => {
                        log::debug!("emulator: unhandled syscall {}", number);
                        ENOSYS.wrapping_neg()
                    }
                };
                self.regs.rcx = next;
                self.regs.r11 = 0;
                self.regs.rax = ret;
                self.regs.rip = next;
            }
            other => return Err(self.fault(format!("unsupported instruction {:?}", other))),
        }
        Ok(())
    }
}

impl Memory for Emulator {
    fn read_bytes(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.mem.read_bytes(addr, buf)
    }

    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.mem.write_bytes(addr, data)
    }
}

/// Trigger that performs `call [slot]` with `rdi = this` on the emulator.
#[derive(Debug, Clone, Copy)]
pub struct IndirectCall {
    pub slot: Addr,
    pub this: Addr,
}

impl Trigger<Emulator> for IndirectCall {
    fn fire(&mut self, emu: &mut Emulator) -> Result<()> {
        emu.call_indirect(self.slot, self.this)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::Gadget;

    fn run_code(code: &[u8], setup: impl FnOnce(&mut Emulator)) -> Result<Emulator> {
        let mut emu = Emulator::new();
        let at = Addr(0x40_0000);
        emu.map(at, 0x1000);
        emu.write_bytes(at, code).unwrap();
        emu.map(Addr(0x50_0000), 0x1000);
        emu.write_u64(Addr(0x50_0000), at.addr()).unwrap();
        setup(&mut emu);
        emu.call_indirect(Addr(0x50_0000), Addr(0x60_0000))?;
        Ok(emu)
    }

    #[test]
    fn decodes_and_runs_arithmetic() {
        // mov rax, rdi; neg rax; sbb rax, rax; ret
        let emu = run_code(&[0x48, 0x89, 0xf8, 0x48, 0xf7, 0xd8, 0x48, 0x19, 0xc0, 0xc3], |_| {})
            .unwrap();
        assert_eq!(emu.registers().rax, u64::MAX);
        assert!(emu.registers().cf);
        assert_eq!(emu.steps(), 4);
    }

    #[test]
    fn neg_of_zero_clears_carry() {
        // neg rax; sbb rax, rax; ret
        let emu = run_code(&[0x48, 0xf7, 0xd8, 0x48, 0x19, 0xc0, 0xc3], |e| {
            e.registers_mut().rax = 0;
        })
        .unwrap();
        assert_eq!(emu.registers().rax, 0);
        assert!(!emu.registers().cf);
    }

    #[test]
    fn memory_operands() {
        // mov [rdi], rax; mov rax, [rdi]; add rax, rcx; ret
        let emu = run_code(&[0x48, 0x89, 0x07, 0x48, 0x8b, 0x07, 0x48, 0x01, 0xc8, 0xc3], |e| {
            e.map(Addr(0x60_0000), 0x1000);
            e.registers_mut().rax = 40;
            e.registers_mut().rcx = 2;
        })
        .unwrap();
        assert_eq!(emu.read_u64(Addr(0x60_0000)).unwrap(), 40);
        assert_eq!(emu.registers().rax, 42);
    }

    #[test]
    fn unknown_syscall_is_enosys() {
        // syscall; ret
        let emu = run_code(&[0x0f, 0x05, 0xc3], |e| e.registers_mut().rax = 0x7777).unwrap();
        assert_eq!(emu.registers().rax as i64, -38);
    }

    #[test]
    fn unsupported_instruction_faults() {
        // cpuid
        let err = run_code(&[0x0f, 0xa2, 0xc3], |_| {}).err().unwrap();
        assert!(matches!(err, Error::Fault { addr: Addr(0x40_0000), .. }));
    }

    #[test]
    fn runaway_loop_hits_step_limit() {
        // jmp $
        let err = run_code(&[0xeb, 0xfe], |e| e.set_step_limit(50)).err().unwrap();
        assert!(matches!(err, Error::Fault { .. }));
    }

    #[test]
    fn execution_from_unmapped_memory_faults() {
        let mut emu = Emulator::new();
        emu.map(Addr(0x50_0000), 8);
        emu.write_u64(Addr(0x50_0000), 0x1234_0000).unwrap();
        let err = emu.call_indirect(Addr(0x50_0000), Addr::NULL).unwrap_err();
        assert!(matches!(err, Error::Fault { addr: Addr(0x1234_0000), .. }));
    }

    #[test]
    fn fetch_stops_at_top_of_address_space() {
        let mut emu = Emulator::new();
        emu.map(Addr(u64::MAX), 1);
        emu.write_u8(Addr(u64::MAX), 0xc3).unwrap();
        emu.map(Addr(0x50_0000), 8);
        emu.write_u64(Addr(0x50_0000), u64::MAX).unwrap();
        emu.call_indirect(Addr(0x50_0000), Addr::NULL).unwrap();
        assert_eq!(emu.steps(), 1);
    }

    #[test]
    fn installed_gadgets_match_their_encoding() {
        let target = testkit::target();
        let emu = testkit::emulator(&target);
        for (g, addr) in target.gadgets().entries() {
            let mut buf = vec![0u8; g.bytes().len()];
            emu.read_bytes(addr, &mut buf).unwrap();
            assert_eq!(buf, g.bytes(), "{:?}", g);
        }
        assert_eq!(target.gadgets().len(), Gadget::ALL.len());
    }

    #[test]
    fn context_routines_roundtrip() {
        let target = testkit::target();
        let mut emu = testkit::emulator(&target);
        let ctx = testkit::SCRATCH + 0x100;
        // Save, clobber, then resume from a fresh host frame.
        emu.registers_mut().rbx = 0xaaaa;
        emu.registers_mut().r15 = 0xbbbb;
        emu.map(Addr(0x50_0000), 8);
        emu.write_u64(Addr(0x50_0000), testkit::SAVE_CONTEXT.addr()).unwrap();
        emu.call_indirect(Addr(0x50_0000), ctx).unwrap();
        assert_eq!(emu.registers().rax, 0);

        emu.registers_mut().rbx = 0;
        emu.registers_mut().r15 = 0;
        emu.write_u64(Addr(0x50_0000), testkit::RESUME_CONTEXT.addr()).unwrap();
        emu.call_indirect(Addr(0x50_0000), ctx).unwrap();
        assert_eq!(emu.registers().rax, 1);
        assert_eq!(emu.registers().rbx, 0xaaaa);
        assert_eq!(emu.registers().r15, 0xbbbb);
    }
}
