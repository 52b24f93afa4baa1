//! ropvm — a ROP/JOP chain engine for Linux x86_64 targets.
//!
//! Builds return-oriented programs out of a small vocabulary of gadgets
//! resolved per target, writes them into a fake stack in target memory,
//! and runs them by corrupting one indirect call site. On top of plain
//! gadget sequences the engine offers function calls, syscalls,
//! single-level conditionals and checkpoint/rollback of callee-saved
//! state.
//!
//! # Module overview
//!
//! ## Primitives
//!
//! - [`error`] — Error types used throughout the crate.
//! - [`types`] — `Addr` and `Int64` word types.
//! - [`memory`] — The `Memory` trait and a sparse in-process address space.
//! - [`procmem`] — `Memory` over `/proc/<pid>/mem`. *(Linux-only)*
//!
//! ## Target description
//!
//! - [`gadget`] — Gadget vocabulary, canonical encodings, `GadgetTable`.
//! - [`syscall`] — Linux x86_64 syscall name/number mapping.
//! - [`config`] — JSON target configs and their resolution against module bases.
//!
//! ## Chain engine
//!
//! - [`chain`] — Fake-stack builder, one-shot helpers and `run`.
//! - [`branch`] — Conditional regions selected by `rax`.
//! - [`checkpoint`] — Save/restore through a capture/resume routine pair.
//! - [`pivot`] — Hijacking a dispatch slot to enter the chain.
//!
//! ## Tooling
//!
//! - [`emulator`] — x86-64 gadget emulator used to exercise chains offline.
//! - [`verify`] — Gadget byte verification against live memory.

pub mod error;
pub mod types;
pub mod memory;
pub mod gadget;
pub mod syscall;
pub mod config;
pub mod chain;
pub mod branch;
pub mod checkpoint;
pub mod pivot;
pub mod emulator;
pub mod verify;

// Linux-only modules (/proc/<pid>/mem)
#[cfg(target_os = "linux")]
pub mod procmem;
