//! Single-level conditional regions.
//!
//! `start_branch` turns `rax` into an all-zero/all-one mask and re-pivots
//! the stack to `region_start + (delta & mask)`. Zero in `rax` takes the
//! region; anything else skips past it. `end_branch` patches `delta`
//! once the region's length is known.
//!
//! Emitted by `start_branch` (slot: contents):
//!
//! ```text
//!  0  neg rax; ret              CF = (rax != 0)
//!  1  sbb rax, rax; ret         rax = CF ? !0 : 0
//!  2  pop rdi; ret
//!  3  &flag
//!  4  mov [rdi], rax; ret       flag = mask
//!  5  pop rcx; ret
//!  6  delta                     patched by end_branch
//!  7  and rax, rcx; ret
//!  8  pop rcx; ret
//!  9  region start address
//! 10  add rax, rcx; ret
//! 11  pop rdi; ret
//! 12  &slot 15
//! 13  mov [rdi], rax; ret
//! 14  pop rsp; ret
//! 15  (new rsp, written at run time)
//! ```
//!
//! Clobbers `rax`, `rcx` and `rdi`.

use crate::chain::{Block, Chain, WORD};
use crate::error::{Error, Result};
use crate::gadget::Gadget;
use crate::memory::Memory;
use crate::pivot::PivotStrategy;

const DELTA_SLOT: usize = 6;
const RSP_SLOT: usize = 9;
const PIVOT_OPERAND_SLOT: usize = 15;
const BRANCH_HEADER_SLOTS: usize = 16;

/// Patch-back bookkeeping for the open branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchContext {
    delta_slot: usize,
    rsp_slot: usize,
    region_start: usize,
}

impl BranchContext {
    /// Chain offset of the slot that receives the region length.
    pub fn delta_slot(&self) -> usize {
        self.delta_slot
    }

    /// Chain offset of the slot holding the region's start address.
    pub fn rsp_slot(&self) -> usize {
        self.rsp_slot
    }

    /// Chain offset of the first slot inside the region.
    pub fn region_start(&self) -> usize {
        self.region_start
    }
}

impl<'t, M: Memory, P: PivotStrategy<M>> Chain<'t, M, P> {
    pub fn is_branching(&self) -> bool {
        self.branch.is_some()
    }

    pub fn branch_context(&self) -> Option<BranchContext> {
        self.branch
    }

    /// Open a conditional region, taken iff `rax == 0` when execution
    /// reaches this point.
    pub fn start_branch(&mut self) -> Result<()> {
        self.check_stale()?;
        if self.branch.is_some() {
            return Err(Error::InvalidBranchState("start_branch inside an open branch"));
        }

        let target = self.target();
        let start = self.position();
        let region_start = start + BRANCH_HEADER_SLOTS * WORD;
        let region_addr = self.stack_addr(region_start);
        let operand = self.stack_addr(start + PIVOT_OPERAND_SLOT * WORD);
        let flag = self.layout().flag_slot();

        let mut block = Block::new();
        block.gadget(target, Gadget::NegRax)?;
        block.gadget(target, Gadget::SbbRaxRax)?;
        block.gadget(target, Gadget::PopRdi)?.word(flag.addr(), "&branch flag");
        block.gadget(target, Gadget::StoreRaxAtRdi)?;
        block.gadget(target, Gadget::PopRcx)?.word(0, "branch delta");
        block.gadget(target, Gadget::AndRaxRcx)?;
        block
            .gadget(target, Gadget::PopRcx)?
            .word(region_addr.addr(), format!("branch rsp {}", region_addr));
        block.gadget(target, Gadget::AddRaxRcx)?;
        block.gadget(target, Gadget::PopRdi)?.word(operand.addr(), "&branch pivot");
        block.gadget(target, Gadget::StoreRaxAtRdi)?;
        block.gadget(target, Gadget::PopRsp)?.word(0, "branch target rsp");
        debug_assert_eq!(block.len(), BRANCH_HEADER_SLOTS);

        self.emit(block)?;
        self.branch = Some(BranchContext {
            delta_slot: start + DELTA_SLOT * WORD,
            rsp_slot: start + RSP_SLOT * WORD,
            region_start,
        });
        log::debug!("branch opened at +{:#x}", start);
        Ok(())
    }

    /// Close the open region and patch its length into the delta slot.
    pub fn end_branch(&mut self) -> Result<()> {
        self.check_stale()?;
        let ctx = self
            .branch
            .ok_or(Error::InvalidBranchState("end_branch without start_branch"))?;

        let delta = self.position() - ctx.region_start;
        self.patch(ctx.delta_slot, delta as u64, format!("branch delta = {:#x}", delta))?;
        self.branch = None;
        log::debug!("branch closed, region is {:#x} bytes", delta);
        Ok(())
    }

    /// Whether the most recently executed branch skipped its region.
    ///
    /// Reads the low byte of the scratch flag written by `start_branch`.
    pub fn branch_flag(&self) -> Result<bool> {
        Ok(self.memory().read_u8(self.layout().flag_slot())? != 0)
    }
}
