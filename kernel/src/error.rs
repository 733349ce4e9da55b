//! Kernel error kinds
//!
//! Internal APIs return `Result`; the syscall layer flattens errors to
//! the -1 / 0 convention user programs see.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("no such name")]
    NotFound,
    #[error("name already exists")]
    Exists,
    #[error("name is reserved")]
    Reserved,
    #[error("out of sectors or frames")]
    OutOfSpace,
    #[error("out of table slots")]
    OutOfSlots,
    #[error("wrong object kind for this operation")]
    TypeMismatch,
    #[error("object is in use")]
    InUse,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("unexpected protocol message")]
    ProtocolViolation,
    #[error("send exhausted retransmissions")]
    NetworkFailure,
}

pub type Result<T> = core::result::Result<T, KernelError>;
