use thiserror::Error;

use crate::device::usb::PipeType;

use super::transfer::{Outcome, SlotId};

/// Errors returned to class drivers by the submission API.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcdError {
    #[error("no free transfer slot")]
    ResourceExhausted,
    #[error("pipe type {found:?} used with a {expected:?} submission")]
    ProtocolMismatch { expected: PipeType, found: PipeType },
    #[error("{0:?} transfers are not implemented")]
    NotImplemented(PipeType),
    #[error("transfer of {requested} bytes exceeds the slot payload region of {limit} bytes")]
    TransferTooLarge { requested: usize, limit: usize },
    #[error("transfer failed: {0}")]
    Transfer(Outcome),
}

/// Misuse of the slot pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {0} released twice")]
    DoubleRelease(SlotId),
    #[error("slot {0} released by an earlier owner")]
    StaleRelease(SlotId),
    #[error("slot {0} released while still linked on a list")]
    StillListed(SlotId),
    #[error("slot {0} released while its transfer is in flight")]
    ReleaseBusy(SlotId),
    #[error("slot {0} does not exist")]
    OutOfRange(SlotId),
}

/// Controller bring-up failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("pool size {0} is outside 1..=32")]
    InvalidPoolSize(usize),
    #[error("scratch register test failed: wrote {wrote:#010x}, read {read:#010x}")]
    ScratchMismatch { wrote: u32, read: u32 },
    #[error("timed out waiting for {what} (register {register:#05x})")]
    Timeout { what: &'static str, register: u32 },
}
