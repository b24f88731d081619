//! Transfer records and their outcomes.

use std::{fmt, sync::Arc};

use crate::device::usb::{Direction, Pipe, PipeType, UsbDevice};

use super::constants::{memory, ptd_maps};

/// Index of a transfer slot. Doubles as the bit position in the done and
/// skip bitmaps of the slot's PTD class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u8);

impl SlotId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u8)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Mask of this slot in a done/skip bitmap.
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tenancy of a slot, from its acquisition to its release.
///
/// The generation changes on every acquisition, so a lease left over from
/// an earlier tenant no longer matches the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lease {
    pub(crate) slot: SlotId,
    pub(crate) generation: u32,
}

/// PID of the transaction a PTD issues. The values are the PTD encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Out = 0,
    In = 1,
    Setup = 2,
    Ping = 3,
}

impl Token {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Out,
            1 => Self::In,
            2 => Self::Setup,
            _ => Self::Ping,
        }
    }

    /// Data stage token for a pipe direction.
    #[must_use]
    pub const fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::In => Self::In,
            Direction::Out => Self::Out,
        }
    }

    /// Tokens whose payload travels from the host to the device.
    #[must_use]
    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::Out | Self::Setup)
    }
}

/// How a transfer ended, as decided by the completion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The endpoint NAKed until the PTD's NAK counter ran out, but the
    /// timeout has not elapsed. Never reported to callers.
    Retry,
    Halt,
    Babble,
    BufferError,
    WrongLength,
    NakTimeout,
    /// Hardware and software state disagree.
    ProtocolError,
}

impl Outcome {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Halt => "endpoint halted",
            Self::Babble => "babble detected",
            Self::BufferError => "buffer or transaction error",
            Self::WrongLength => "wrong transfer length",
            Self::NakTimeout => "NAK timeout",
            Self::ProtocolError => "controller state inconsistency",
        };
        write!(f, "{text}")
    }
}

/// Hardware class a transfer is scheduled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtdClass {
    /// Periodic (INT) PTDs.
    Periodic,
    /// Asynchronous (ATL) PTDs for control and bulk transfers.
    Async,
}

impl PtdClass {
    /// Isochronous pipes have no class here.
    #[must_use]
    pub const fn for_pipe(pipe: Pipe) -> Option<Self> {
        match pipe.pipe_type() {
            PipeType::Interrupt => Some(Self::Periodic),
            PipeType::Control | PipeType::Bulk => Some(Self::Async),
            PipeType::Isochronous => None,
        }
    }

    /// Chip address of the PTD row of `slot`.
    #[must_use]
    pub const fn ptd_address(self, slot: SlotId) -> u32 {
        let base = match self {
            Self::Periodic => memory::INT_PTD_BASE,
            Self::Async => memory::ATL_PTD_BASE,
        };
        base + (slot.index() * memory::PTD_BYTES) as u32 / 8
    }

    #[must_use]
    pub const fn done_map(self) -> u32 {
        match self {
            Self::Periodic => ptd_maps::INT_DONEMAP,
            Self::Async => ptd_maps::ATL_DONEMAP,
        }
    }

    #[must_use]
    pub const fn skip_map(self) -> u32 {
        match self {
            Self::Periodic => ptd_maps::INT_SKIPMAP,
            Self::Async => ptd_maps::ATL_SKIPMAP,
        }
    }
}

impl fmt::Display for PtdClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Periodic => write!(f, "INT"),
            Self::Async => write!(f, "ATL"),
        }
    }
}

/// Re-arm hook of periodic transfers. Runs in interrupt context with the
/// outcome and the received bytes; returning true schedules the slot again.
pub type RearmFn = Box<dyn FnMut(&UsbDevice, Outcome, &[u8]) -> bool + Send>;

/// Completion hook of asynchronous transfers. Runs from
/// [`usb_event_poll`](super::Isp1760::usb_event_poll), never from interrupt
/// context.
pub type CompletionFn = Box<dyn FnOnce(CompletedTransfer) + Send>;

/// Who gets told about a finished transfer.
pub(crate) enum Completion {
    /// A blocking caller polls the slot.
    Waiter,
    Rearm(RearmFn),
    Callback(CompletionFn),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiter => write!(f, "Waiter"),
            Self::Rearm(_) => write!(f, "Rearm(..)"),
            Self::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

/// What a completion callback receives.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub slot: SlotId,
    pub device: Arc<UsbDevice>,
    pub pipe: Pipe,
    pub outcome: Outcome,
    pub actual_length: usize,
    /// The transfer buffer. For IN transfers the first `actual_length`
    /// bytes hold received data.
    pub data: Vec<u8>,
}

/// The software half of a transfer slot.
///
/// Exactly one party owns a `Transfer` at a time: the caller that acquired
/// it, the slot table while the PTD is scheduled or parked, or the
/// interrupt handler while it evaluates the completion.
#[derive(Debug)]
pub struct Transfer {
    lease: Lease,
    class: PtdClass,
    pub(crate) device: Arc<UsbDevice>,
    pub(crate) pipe: Pipe,
    pub(crate) token: Token,
    pub(crate) data: Vec<u8>,
    pub(crate) actual_length: usize,
    /// NAK timeout in milliseconds; 0 selects the driver default.
    pub(crate) timeout_ms: u32,
    pub(crate) start_ms: u64,
    pub(crate) completion: Completion,
}

impl Transfer {
    pub(crate) const fn new(
        lease: Lease,
        class: PtdClass,
        device: Arc<UsbDevice>,
        pipe: Pipe,
    ) -> Self {
        Self {
            lease,
            class,
            device,
            pipe,
            token: Token::for_direction(pipe.direction()),
            data: Vec::new(),
            actual_length: 0,
            timeout_ms: 0,
            start_ms: 0,
            completion: Completion::Waiter,
        }
    }

    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.lease.slot
    }

    pub(crate) const fn lease(&self) -> Lease {
        self.lease
    }

    #[must_use]
    pub const fn class(&self) -> PtdClass {
        self.class
    }

    #[must_use]
    pub const fn requested_length(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub const fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Prepare the next phase on this slot.
    pub(crate) fn stage(&mut self, pipe: Pipe, token: Token, data: Vec<u8>) {
        self.pipe = pipe;
        self.token = token;
        self.data = data;
        self.actual_length = 0;
    }

    /// Direction whose data toggle this transfer uses.
    pub(crate) const fn toggle_direction(&self) -> Direction {
        self.pipe.direction()
    }

    pub(crate) fn received(&self) -> &[u8] {
        &self.data[..self.actual_length.min(self.data.len())]
    }

    pub(crate) fn into_completed(self, outcome: Outcome) -> (CompletedTransfer, Completion) {
        let completed = CompletedTransfer {
            slot: self.lease.slot,
            device: self.device,
            pipe: self.pipe,
            outcome,
            actual_length: self.actual_length,
            data: self.data,
        };
        (completed, self.completion)
    }
}
