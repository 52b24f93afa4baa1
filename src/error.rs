use thiserror::Error;

use crate::gadget::Gadget;
use crate::types::Addr;

#[derive(Error, Debug)]
pub enum Error {
    #[error("gadget `{0}` is not resolved for this target")]
    MissingGadget(Gadget),

    #[error("too many arguments: {given} given, at most {max} supported")]
    ArgumentOverflow { given: usize, max: usize },

    #[error("a checkpoint is already saved; restore it before saving again")]
    AlreadySaved,

    #[error("no checkpoint saved")]
    NotSaved,

    #[error("invalid branch state: {0}")]
    InvalidBranchState(&'static str),

    #[error("chain is not empty (position {0:#x})")]
    NotEmpty(usize),

    #[error("chain is empty")]
    EmptyChain,

    #[error("chain already ran; clean() it before reuse")]
    StaleChain,

    #[error("chain does not end with an epilogue")]
    Unterminated,

    #[error("fake stack overflow: {needed:#x} bytes needed, capacity {capacity:#x}")]
    StackOverflow { needed: usize, capacity: usize },

    #[error("unknown syscall `{0}`")]
    UnknownSyscall(String),

    #[error("no base address for module `{0}`")]
    UnknownModule(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unmapped memory at {0}")]
    Unmapped(Addr),

    #[error("execution fault at {addr}: {reason}")]
    Fault { addr: Addr, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
