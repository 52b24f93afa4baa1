//! Chain engine: lays out a fake stack and runs it through a pivot.
//!
//! Every `push_*` appends little-endian qwords at the write cursor and
//! writes them through to target memory immediately. The only writes
//! behind the cursor are patches to slots recorded earlier in the same
//! build (the branch delta). Calls, syscalls, conditionals and
//! checkpoints are all expressed as gadget sequences; nothing is
//! interpreted at run time.

use std::fmt::Write as _;

use crate::branch::BranchContext;
use crate::checkpoint::ContextLayout;
use crate::config::TargetContext;
use crate::error::{Error, Result};
use crate::gadget::Gadget;
use crate::memory::Memory;
use crate::pivot::PivotStrategy;
use crate::types::{Addr, Int64};

/// Size of one fake-stack slot.
pub const WORD: usize = 8;

/// Maximum number of register-passed arguments.
pub const MAX_ARGS: usize = 6;

/// SysV function-call argument registers, in order.
pub const CALL_ARG_GADGETS: [Gadget; MAX_ARGS] = [
    Gadget::PopRdi,
    Gadget::PopRsi,
    Gadget::PopRdx,
    Gadget::PopRcx,
    Gadget::PopR8,
    Gadget::PopR9,
];

/// Linux x86_64 syscall argument registers, in order.
pub const SYSCALL_ARG_GADGETS: [Gadget; MAX_ARGS] = [
    Gadget::PopRdi,
    Gadget::PopRsi,
    Gadget::PopRdx,
    Gadget::PopR10,
    Gadget::PopR8,
    Gadget::PopR9,
];

/// Where a chain lives in target memory.
///
/// `stack` is the first chain slot. Functions called from the chain build
/// their frames below the slot being executed, so the caller must leave
/// writable headroom below `stack`.
///
/// Scratch layout: return value at `+0x00`, branch flag at `+0x08`,
/// checkpoint buffer from `+0x10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLayout {
    pub stack: Addr,
    pub capacity: usize,
    pub scratch: Addr,
}

impl ChainLayout {
    pub const RETVAL_OFFSET: u64 = 0x00;
    pub const FLAG_OFFSET: u64 = 0x08;
    pub const CONTEXT_OFFSET: u64 = 0x10;

    /// Scratch bytes needed for a given checkpoint layout.
    pub fn scratch_size(context: &ContextLayout) -> u64 {
        Self::CONTEXT_OFFSET + context.size as u64
    }

    pub fn retval_slot(&self) -> Addr {
        self.scratch + Self::RETVAL_OFFSET
    }

    pub fn flag_slot(&self) -> Addr {
        self.scratch + Self::FLAG_OFFSET
    }

    pub fn context_buffer(&self) -> Addr {
        self.scratch + Self::CONTEXT_OFFSET
    }
}

/// Lifecycle of a chain between `clean()` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Nothing pushed.
    Empty,
    /// Has content, but the last block is not the epilogue.
    Building,
    /// Ends with the epilogue; runnable unless a branch is open.
    Ready,
    /// Inside `run()`.
    Executing,
    /// Has run; must be cleaned before reuse.
    Stale,
}

/// A single annotated slot in the fake stack.
#[derive(Debug, Clone)]
pub struct ChainElement {
    /// Byte offset from the chain start.
    pub offset: usize,
    /// Human-readable description.
    pub description: String,
    /// Value written at this slot.
    pub value: u64,
}

/// Qwords staged for one push, emitted atomically.
#[derive(Debug, Default)]
pub(crate) struct Block {
    words: Vec<(u64, String)>,
}

impl Block {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn gadget(&mut self, target: &TargetContext, gadget: Gadget) -> Result<&mut Self> {
        let addr = target.gadget(gadget)?;
        self.words.push((addr.addr(), gadget.text().to_string()));
        Ok(self)
    }

    pub(crate) fn word(&mut self, value: u64, description: impl Into<String>) -> &mut Self {
        self.words.push((value, description.into()));
        self
    }

    /// Replace a staged word, for values that depend on the block's size.
    pub(crate) fn set_word(&mut self, index: usize, value: u64, description: impl Into<String>) {
        if let Some(w) = self.words.get_mut(index) {
            *w = (value, description.into());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.words.len()
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.words.len() * WORD
    }
}

/// The chain engine.
///
/// Owns its target memory handle and pivot. The fake stack and scratch
/// region are fixed by `layout` and never move; `clean()` only rewinds
/// the cursor and flags.
pub struct Chain<'t, M: Memory, P: PivotStrategy<M>> {
    target: &'t TargetContext,
    mem: M,
    pivot: P,
    layout: ChainLayout,
    position: usize,
    state: ChainState,
    elements: Vec<ChainElement>,
    pub(crate) branch: Option<BranchContext>,
    pub(crate) is_saved: bool,
}

impl<'t, M: Memory, P: PivotStrategy<M>> Chain<'t, M, P> {
    pub fn new(target: &'t TargetContext, mem: M, pivot: P, layout: ChainLayout) -> Self {
        Self {
            target,
            mem,
            pivot,
            layout,
            position: 0,
            state: ChainState::Empty,
            elements: Vec::new(),
            branch: None,
            is_saved: false,
        }
    }

    pub fn target(&self) -> &'t TargetContext {
        self.target
    }

    pub fn layout(&self) -> &ChainLayout {
        &self.layout
    }

    /// Write cursor, in bytes from the chain start.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn is_saved(&self) -> bool {
        self.is_saved
    }

    pub fn elements(&self) -> &[ChainElement] {
        &self.elements
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn pivot(&self) -> &P {
        &self.pivot
    }

    pub fn into_parts(self) -> (M, P) {
        (self.mem, self.pivot)
    }

    /// Absolute address of a chain offset.
    pub fn stack_addr(&self, offset: usize) -> Addr {
        self.layout.stack + offset as u64
    }

    /// Last value stored by `push_get_retval`.
    pub fn retval(&self) -> Result<Int64> {
        self.mem.read_int64(self.layout.retval_slot())
    }

    // ── Guards ───────────────────────────────────────────────────────

    /// Fails if the chain has already run.
    pub fn check_stale(&self) -> Result<()> {
        if self.state == ChainState::Stale {
            return Err(Error::StaleChain);
        }
        Ok(())
    }

    /// Fails if anything has been pushed.
    pub fn check_is_empty(&self) -> Result<()> {
        if self.position != 0 {
            return Err(Error::NotEmpty(self.position));
        }
        Ok(())
    }

    /// Fails if a conditional region is open.
    pub fn check_is_branching(&self) -> Result<()> {
        if self.branch.is_some() {
            return Err(Error::InvalidBranchState("a branch is still open"));
        }
        Ok(())
    }

    // ── Emission ─────────────────────────────────────────────────────

    /// Append `block` at the cursor. Returns the offset it starts at.
    pub(crate) fn emit(&mut self, block: Block) -> Result<usize> {
        self.check_stale()?;
        let start = self.position;
        let needed = start + block.byte_len();
        if needed > self.layout.capacity {
            return Err(Error::StackOverflow {
                needed,
                capacity: self.layout.capacity,
            });
        }

        let bytes: Vec<u8> = block.words.iter().flat_map(|(v, _)| v.to_le_bytes()).collect();
        self.mem.write_bytes(self.stack_addr(start), &bytes)?;

        for (i, (value, description)) in block.words.into_iter().enumerate() {
            let offset = start + i * WORD;
            log::trace!("+{:#06x}: {:#018x}  {}", offset, value, description);
            self.elements.push(ChainElement {
                offset,
                description,
                value,
            });
        }
        self.position = needed;
        self.state = ChainState::Building;
        Ok(start)
    }

    /// Overwrite an already-emitted slot.
    pub(crate) fn patch(&mut self, offset: usize, value: u64, description: String) -> Result<()> {
        if offset % WORD != 0 || offset + WORD > self.position {
            return Err(Error::Other(format!("patch offset {:#x} outside chain", offset)));
        }
        self.mem.write_u64(self.stack_addr(offset), value)?;
        if let Some(e) = self.elements.get_mut(offset / WORD) {
            e.value = value;
            e.description = description;
        }
        Ok(())
    }

    pub fn push_gadget(&mut self, gadget: Gadget) -> Result<()> {
        let mut block = Block::new();
        block.gadget(self.target, gadget)?;
        self.emit(block).map(|_| ())
    }

    pub fn push_constant(&mut self, value: impl Into<Int64>) -> Result<()> {
        let value = value.into();
        let mut block = Block::new();
        block.word(value.value(), format!("{:#x}", value));
        self.emit(block).map(|_| ())
    }

    pub fn push_value(&mut self, addr: Addr) -> Result<()> {
        let mut block = Block::new();
        block.word(addr.addr(), format!("{}", addr));
        self.emit(block).map(|_| ())
    }

    fn load_args(&self, block: &mut Block, regs: &[Gadget; MAX_ARGS], args: &[u64]) -> Result<()> {
        if args.len() > MAX_ARGS {
            return Err(Error::ArgumentOverflow {
                given: args.len(),
                max: MAX_ARGS,
            });
        }
        for (i, (&arg, &reg)) in args.iter().zip(regs.iter()).enumerate() {
            block.gadget(self.target, reg)?.word(arg, format!("arg{} = {:#x}", i, arg));
        }
        Ok(())
    }

    /// Call `target` with up to six integer arguments. `target` must
    /// return normally so the chain continues after it.
    pub fn push_call(&mut self, target: Addr, args: &[u64]) -> Result<()> {
        let mut block = Block::new();
        self.load_args(&mut block, &CALL_ARG_GADGETS, args)?;
        block.word(target.addr(), format!("call {}", target));
        log::debug!("push_call {} ({} args)", target, args.len());
        self.emit(block).map(|_| ())
    }

    /// Invoke syscall `name` through the `syscall; ret` trampoline.
    pub fn push_syscall(&mut self, name: &str, args: &[u64]) -> Result<()> {
        let number = self.target.syscall_number(name)?;
        let mut block = Block::new();
        self.load_args(&mut block, &SYSCALL_ARG_GADGETS, args)?;
        block
            .gadget(self.target, Gadget::PopRax)?
            .word(number, format!("{} = {}", name, number));
        block.gadget(self.target, Gadget::Syscall)?;
        log::debug!("push_syscall {} (nr {}, {} args)", name, number, args.len());
        self.emit(block).map(|_| ())
    }

    /// Copy `rax` into the scratch return slot.
    pub fn push_get_retval(&mut self) -> Result<()> {
        let slot = self.layout.retval_slot();
        let mut block = Block::new();
        block
            .gadget(self.target, Gadget::PopRdi)?
            .word(slot.addr(), format!("&retval {}", slot));
        block.gadget(self.target, Gadget::StoreRaxAtRdi)?;
        self.emit(block).map(|_| ())
    }

    /// Epilogue: reload the stack pointer the pivot saved and return to
    /// the instruction after the hijacked call.
    pub fn push_end(&mut self) -> Result<()> {
        let saved = self.pivot.saved_stack_slot();
        let start = self.position;
        // Slots 0..=6 precede the `pop rsp` operand.
        let operand = self.stack_addr(start + 7 * WORD);

        let mut block = Block::new();
        block
            .gadget(self.target, Gadget::PopRax)?
            .word(saved.addr(), format!("&saved rsp {}", saved));
        block.gadget(self.target, Gadget::LoadRax)?;
        block
            .gadget(self.target, Gadget::PopRdi)?
            .word(operand.addr(), "&epilogue rsp");
        block.gadget(self.target, Gadget::StoreRaxAtRdi)?;
        block.gadget(self.target, Gadget::PopRsp)?.word(0, "caller rsp");
        debug_assert_eq!(block.len(), 8);

        self.emit(block)?;
        self.state = ChainState::Ready;
        Ok(())
    }

    // ── One-shot helpers ─────────────────────────────────────────────

    /// Build, run and clean a single call. Read the result with
    /// [`Chain::retval`].
    pub fn call(&mut self, target: Addr, args: &[u64]) -> Result<()> {
        self.check_is_empty()?;
        self.push_call(target, args)?;
        self.finish_one_shot()
    }

    /// Build, run and clean a single syscall. Read the result with
    /// [`Chain::retval`].
    pub fn syscall(&mut self, name: &str, args: &[u64]) -> Result<()> {
        self.check_is_empty()?;
        self.push_syscall(name, args)?;
        self.finish_one_shot()
    }

    fn finish_one_shot(&mut self) -> Result<()> {
        let built = self.push_get_retval().and_then(|_| self.push_end());
        let result = built.and_then(|_| self.run());
        self.clean();
        result
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Hijack control flow into the chain and block until the epilogue
    /// returns. The chain is stale afterwards, whatever the outcome.
    pub fn run(&mut self) -> Result<()> {
        self.check_stale()?;
        if self.state == ChainState::Empty {
            return Err(Error::EmptyChain);
        }
        self.check_is_branching()?;
        if self.state != ChainState::Ready {
            return Err(Error::Unterminated);
        }

        log::info!(
            "running chain: {} slots at {} on `{}`",
            self.position / WORD,
            self.layout.stack,
            self.target.name()
        );
        self.state = ChainState::Executing;
        let result = self.pivot.hijack(&mut self.mem, self.layout.stack);
        self.state = ChainState::Stale;
        if let Err(e) = &result {
            log::error!("hijack failed: {}", e);
        }
        result
    }

    /// Rewind for the next build. Target buffers are kept as they are.
    pub fn clean(&mut self) {
        self.position = 0;
        self.state = ChainState::Empty;
        self.elements.clear();
        self.branch = None;
        self.is_saved = false;
    }

    /// Annotated listing of the fake stack.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for e in &self.elements {
            let _ = writeln!(
                out,
                "  {:016x}  +{:04x}  {:016x}  {}",
                self.stack_addr(e.offset).addr(),
                e.offset,
                e.value,
                e.description
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::testkit::{self, SCRATCH};
    use crate::memory::Memory;

    fn words(chain: &testkit::TestChain<'_>) -> Vec<u64> {
        let mut buf = vec![0u8; chain.position()];
        chain.memory().read_bytes(chain.layout().stack, &mut buf).unwrap();
        buf.chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn constants_are_written_little_endian() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        let values: [u64; 4] = [0, 1, 0x4B43_5546, 0xdead_beef_cafe_babe];
        for (i, &v) in values.iter().enumerate() {
            chain.push_constant(v).unwrap();
            assert_eq!(chain.position(), (i + 1) * 8);
            let mut b = [0u8; 8];
            chain.memory().read_bytes(chain.stack_addr(i * 8), &mut b).unwrap();
            assert_eq!(b, v.to_le_bytes());
        }
        chain.push_value(Addr(0x7f00_1234_5678)).unwrap();
        chain.push_constant(-1i64).unwrap();
        assert_eq!(words(&chain)[4..], [0x7f00_1234_5678, u64::MAX]);
    }

    #[test]
    #[rustfmt::skip]
    fn push_call_layout() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        chain.push_call(Addr(0x4141_0000), &[1, 2, 3]).unwrap();
        let g = |x| target.gadget(x).unwrap().addr();
        assert_eq!(
            words(&chain),
            vec![
                g(Gadget::PopRdi), 1,
                g(Gadget::PopRsi), 2,
                g(Gadget::PopRdx), 3,
                0x4141_0000,
            ]
        );
        assert_eq!(chain.state(), ChainState::Building);
    }

    #[test]
    #[rustfmt::skip]
    fn push_syscall_layout() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        chain.push_syscall("mprotect", &[0x1000, 0x2000, 7, 9]).unwrap();
        let g = |x| target.gadget(x).unwrap().addr();
        assert_eq!(
            words(&chain),
            vec![
                g(Gadget::PopRdi), 0x1000,
                g(Gadget::PopRsi), 0x2000,
                g(Gadget::PopRdx), 7,
                g(Gadget::PopR10), 9,
                g(Gadget::PopRax), 10,
                g(Gadget::Syscall),
            ]
        );
    }

    #[test]
    fn too_many_arguments() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        let err = chain.push_call(Addr(0x1000), &[0; 7]).unwrap_err();
        assert!(matches!(err, Error::ArgumentOverflow { given: 7, max: 6 }));
        let err = chain.push_syscall("read", &[0; 8]).unwrap_err();
        assert!(matches!(err, Error::ArgumentOverflow { given: 8, .. }));
        assert_eq!(chain.position(), 0);
    }

    #[test]
    fn missing_gadget_fails_before_writing() {
        let target = testkit::target_without(Gadget::PopR10);
        let mut chain = testkit::chain(&target);
        chain.push_constant(0x1111u64).unwrap();
        let err = chain.push_syscall("mmap", &[0, 0x1000, 3, 0x22]).unwrap_err();
        assert!(matches!(err, Error::MissingGadget(Gadget::PopR10)));
        assert_eq!(chain.position(), 8);
        assert!(matches!(chain.push_gadget(Gadget::PopR10), Err(Error::MissingGadget(_))));
    }

    #[test]
    fn unknown_syscall_fails() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        assert!(matches!(chain.push_syscall("nope", &[]), Err(Error::UnknownSyscall(_))));
        assert_eq!(chain.state(), ChainState::Empty);
    }

    #[test]
    fn capacity_is_enforced() {
        let target = testkit::target();
        let mut chain = testkit::chain_with_capacity(&target, 3 * WORD);
        chain.push_constant(1u64).unwrap();
        let err = chain.push_call(Addr(0x1000), &[1]).unwrap_err();
        assert!(matches!(err, Error::StackOverflow { needed: 32, capacity: 24 }));
        assert_eq!(chain.position(), 8);
    }

    #[test]
    fn run_preconditions() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        assert!(matches!(chain.run(), Err(Error::EmptyChain)));

        chain.push_gadget(Gadget::Ret).unwrap();
        assert!(matches!(chain.run(), Err(Error::Unterminated)));

        chain.push_end().unwrap();
        assert_eq!(chain.state(), ChainState::Ready);
        chain.push_gadget(Gadget::Ret).unwrap();
        assert_eq!(chain.state(), ChainState::Building);
    }

    #[test]
    fn run_twice_is_stale() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        chain.push_end().unwrap();
        chain.run().unwrap();
        assert_eq!(chain.state(), ChainState::Stale);
        assert!(matches!(chain.run(), Err(Error::StaleChain)));
        assert!(matches!(chain.push_constant(1u64), Err(Error::StaleChain)));
        assert!(chain.check_stale().is_err());

        chain.clean();
        assert_eq!(chain.state(), ChainState::Empty);
        chain.push_end().unwrap();
        chain.run().unwrap();
    }

    #[test]
    fn epilogue_only_leaves_flag_alone() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        let flag = chain.layout().flag_slot();
        chain.memory_mut().write_u64(flag, 0x5a5a_5a5a).unwrap();

        chain.clean();
        chain.push_end().unwrap();
        chain.run().unwrap();

        assert_eq!(chain.memory().read_u64(flag).unwrap(), 0x5a5a_5a5a);
        assert_eq!(
            chain.memory().read_u64(testkit::SLOT).unwrap(),
            testkit::ORIGINAL_HANDLER
        );
    }

    #[test]
    fn syscall_overwrites_sentinel() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        let slot = chain.layout().retval_slot();
        chain.memory_mut().write_u64(slot, 0x4B43_5546).unwrap();

        chain.syscall("getuid", &[]).unwrap();

        let ret = chain.retval().unwrap();
        assert_ne!(ret.low(), 0x4B43_5546);
        assert_eq!(ret.value(), testkit::UID);
        assert_eq!(chain.state(), ChainState::Empty);
        assert_eq!(chain.position(), 0);
    }

    #[test]
    fn one_shot_requires_empty_chain() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        chain.push_constant(0u64).unwrap();
        assert!(matches!(chain.call(Addr(0x1000), &[]), Err(Error::NotEmpty(8))));
        assert!(matches!(chain.syscall("getuid", &[]), Err(Error::NotEmpty(8))));
        assert_eq!(chain.position(), 8);
    }

    #[test]
    fn call_native_with_six_arguments() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        chain.call(testkit::SUM6, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(chain.retval().unwrap().value(), 21);
    }

    #[test]
    fn chained_calls_feed_retval() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        chain.push_syscall("getpid", &[]).unwrap();
        chain.push_get_retval().unwrap();
        chain.push_call(testkit::SUM6, &[10, 20, 30, 40, 50, 60]).unwrap();
        chain.push_get_retval().unwrap();
        chain.push_end().unwrap();
        chain.run().unwrap();
        // The last stored value wins.
        assert_eq!(chain.retval().unwrap().value(), 210);
    }

    #[test]
    fn clean_keeps_buffers() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        let layout = *chain.layout();
        chain.push_constant(0x77u64).unwrap();
        chain.clean();
        assert_eq!(*chain.layout(), layout);
        assert!(chain.elements().is_empty());
        // Contents stay until overwritten.
        assert_eq!(chain.memory().read_u64(layout.stack).unwrap(), 0x77);
        assert_eq!(layout.scratch, SCRATCH);
    }

    #[test]
    fn dump_lists_every_slot() {
        let target = testkit::target();
        let mut chain = testkit::chain(&target);
        chain.push_syscall("getuid", &[]).unwrap();
        let dump = chain.dump();
        assert_eq!(dump.lines().count(), 3);
        assert!(dump.contains("pop rax; ret"));
        assert!(dump.contains("getuid = 102"));
        assert!(dump.contains("syscall; ret"));
    }
}
