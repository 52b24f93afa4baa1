//! Checkpoint and rollback through an external context routine pair.
//!
//! The target supplies a "capture context" routine (setjmp-like, one
//! pointer argument, returns normally) and a "resume context" routine
//! (longjmp-like, never returns to its caller). `push_save` captures into
//! the chain's context buffer. `push_restore` rewrites the buffer's stack
//! pointer and resume address so that resuming lands right after the
//! restore block, then resumes: callee-saved state rolls back to the
//! checkpoint while execution carries on in the current chain.

use serde::{Deserialize, Serialize};

use crate::chain::{Block, Chain};
use crate::error::{Error, Result};
use crate::gadget::Gadget;
use crate::memory::Memory;
use crate::pivot::PivotStrategy;
use crate::types::Addr;

/// Shape of the opaque context buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLayout {
    /// Buffer size in bytes.
    pub size: usize,
    /// Offset of the saved resume address.
    pub rip_offset: u64,
    /// Offset of the saved stack pointer.
    pub rsp_offset: u64,
}

impl ContextLayout {
    /// Both saved fields must lie inside the buffer.
    pub fn validate(&self) -> Result<()> {
        let fields = [("rip_offset", self.rip_offset), ("rsp_offset", self.rsp_offset)];
        for (field, offset) in fields {
            let fits = offset
                .checked_add(8)
                .is_some_and(|end| end <= self.size as u64);
            if !fits {
                return Err(Error::Config(format!(
                    "context {} {:#x} does not fit a {:#x}-byte buffer",
                    field, offset, self.size
                )));
            }
        }
        Ok(())
    }
}

impl Default for ContextLayout {
    fn default() -> Self {
        Self {
            size: 0x40,
            rip_offset: 0x00,
            rsp_offset: 0x08,
        }
    }
}

/// Resolved addresses of the capture/resume routine pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextRoutines {
    pub save: Addr,
    pub resume: Addr,
    pub layout: ContextLayout,
}

/// Index of the resume stack pointer within the `push_restore` block.
const RESUME_RSP_WORD: usize = 3;

impl<'t, M: Memory, P: PivotStrategy<M>> Chain<'t, M, P> {
    /// Capture the execution context into the chain's context buffer.
    pub fn push_save(&mut self) -> Result<()> {
        self.check_stale()?;
        if self.is_saved {
            return Err(Error::AlreadySaved);
        }
        let routines = *self.target().context_routines()?;
        let ctx = self.layout().context_buffer();

        self.push_call(routines.save, &[ctx.addr()])?;
        self.is_saved = true;
        log::debug!("checkpoint saved into {}", ctx);
        Ok(())
    }

    /// Resume the saved context, continuing right after this block.
    ///
    /// `force` skips the "was saved" check, for when exactly one arm of a
    /// preceding branch performed the save.
    pub fn push_restore(&mut self, force: bool) -> Result<()> {
        self.check_stale()?;
        if !self.is_saved && !force {
            return Err(Error::NotSaved);
        }
        let target = self.target();
        let routines = *target.context_routines()?;
        let ctx = self.layout().context_buffer();
        let continuation = target.gadget(Gadget::Ret)?;

        let mut block = Block::new();
        block
            .gadget(target, Gadget::PopRdi)?
            .word((ctx + routines.layout.rsp_offset).addr(), "&ctx.rsp");
        block.gadget(target, Gadget::PopRax)?.word(0, "resume rsp");
        block.gadget(target, Gadget::StoreRaxAtRdi)?;
        block
            .gadget(target, Gadget::PopRdi)?
            .word((ctx + routines.layout.rip_offset).addr(), "&ctx.rip");
        block
            .gadget(target, Gadget::PopRax)?
            .word(continuation.addr(), "resume rip: ret");
        block.gadget(target, Gadget::StoreRaxAtRdi)?;
        block.gadget(target, Gadget::PopRdi)?.word(ctx.addr(), "ctx");
        block.word(routines.resume.addr(), format!("resume {}", routines.resume));

        let resume_rsp = self.stack_addr(self.position() + block.byte_len());
        block.set_word(
            RESUME_RSP_WORD,
            resume_rsp.addr(),
            format!("resume rsp {}", resume_rsp),
        );

        self.emit(block)?;
        self.is_saved = false;
        log::debug!("checkpoint restore, resuming at {}", resume_rsp);
        Ok(())
    }
}
