//! Pending Transfer Descriptors.
//!
//! A PTD is the 8 dword record the ISP1760 executes for one transaction.
//! This module only translates between the packed words and their fields;
//! scheduling policy lives elsewhere.

use std::fmt;

use crate::device::usb::{PipeType, Speed};

use super::{
    constants::{memory::PTD_DWORDS, ptd as defaults},
    transfer::{Token, Transfer},
};

/// Raw descriptor words as stored in chip memory.
pub type PtdWords = [u32; PTD_DWORDS];

/// Endpoint type field of DW1.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control = 0,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    const fn from_bits(bits: u32) -> Option<Self> {
        match bits & 0x3 {
            0 => Some(Self::Control),
            2 => Some(Self::Bulk),
            3 => Some(Self::Interrupt),
            _ => None,
        }
    }

    const fn for_pipe(pipe_type: PipeType) -> Self {
        match pipe_type {
            PipeType::Bulk => Self::Bulk,
            PipeType::Interrupt => Self::Interrupt,
            PipeType::Control | PipeType::Isochronous => Self::Control,
        }
    }
}

/// Every field of a PTD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtdFields {
    // DW0
    pub valid: bool,
    pub length: u16,
    pub max_packet: u16,
    pub multiplier: u8,
    /// Endpoint number, split over DW0 bit 31 and DW1 bits 0..2.
    pub endpoint: u8,
    // DW1
    pub device_address: u8,
    pub token: Token,
    pub endpoint_type: EndpointType,
    pub split: bool,
    pub se: u8,
    pub hub_port: u8,
    pub hub_address: u8,
    // DW2
    pub micro_frame: u8,
    pub start_address: u16,
    pub nak_reload: u8,
    // DW3
    pub bytes_done: u16,
    pub nak_count: u8,
    pub error_counter: u8,
    pub toggle: bool,
    pub ping: bool,
    pub complete_split: bool,
    pub transaction_error: bool,
    pub babble: bool,
    pub halted: bool,
    pub active: bool,
    // DW4 / DW5, interrupt PTDs only
    pub micro_start_split: u8,
    pub micro_complete_split: u8,
}

impl PtdFields {
    /// Fields of a freshly scheduled transfer.
    ///
    /// `toggle` is the endpoint's current data toggle and `payload_address`
    /// the chip address of the slot's payload buffer.
    #[must_use]
    pub fn for_transfer(transfer: &Transfer, toggle: bool, payload_address: u32) -> Self {
        let pipe = transfer.pipe;
        let device = &transfer.device;
        let speed = pipe.speed();
        let high_speed = speed == Speed::High;
        let endpoint_type = EndpointType::for_pipe(pipe.pipe_type());
        let periodic = endpoint_type == EndpointType::Interrupt;
        let (hub_address, hub_port) = match device.parent() {
            Some(parent) if !high_speed => (parent.hub_address, parent.port),
            _ => (0, 0),
        };

        let pick = |hs: u32, fs: u32| -> u8 {
            match (periodic, high_speed) {
                (false, _) => 0,
                (true, true) => hs as u8,
                (true, false) => fs as u8,
            }
        };
        let nak_reload = if periodic {
            0
        } else {
            defaults::ASYNC_NAK_RELOAD as u8
        };

        Self {
            valid: true,
            length: transfer.requested_length() as u16 & 0x7fff,
            max_packet: device.max_packet(pipe) & 0x7ff,
            multiplier: u8::from(high_speed),
            endpoint: pipe.endpoint(),
            device_address: pipe.device_address(),
            token: transfer.token,
            endpoint_type,
            split: speed.needs_split(),
            se: if speed == Speed::Low { 2 } else { 0 },
            hub_port,
            hub_address,
            micro_frame: pick(
                defaults::periodic::HS_MICRO_FRAME,
                defaults::periodic::FS_MICRO_FRAME,
            ),
            start_address: payload_address as u16,
            nak_reload,
            bytes_done: 0,
            nak_count: nak_reload,
            error_counter: defaults::ERROR_COUNTER as u8,
            toggle,
            ping: false,
            complete_split: false,
            transaction_error: false,
            babble: false,
            halted: false,
            active: true,
            micro_start_split: pick(
                defaults::periodic::HS_START_SPLIT,
                defaults::periodic::FS_START_SPLIT,
            ),
            micro_complete_split: pick(
                defaults::periodic::HS_COMPLETE_SPLIT,
                defaults::periodic::FS_COMPLETE_SPLIT,
            ),
        }
    }

    /// Pack into the chip's word layout.
    #[must_use]
    pub fn encode(&self) -> PtdWords {
        let ep = u32::from(self.endpoint);
        let mut words = [0u32; PTD_DWORDS];

        words[0] = ((ep & 0x1) << 31)
            | ((u32::from(self.multiplier) & 0x3) << 29)
            | ((u32::from(self.max_packet) & 0x7ff) << 18)
            | ((u32::from(self.length) & 0x7fff) << 3)
            | u32::from(self.valid);
        words[1] = ((u32::from(self.hub_address) & 0x7f) << 25)
            | ((u32::from(self.hub_port) & 0x7f) << 18)
            | ((u32::from(self.se) & 0x3) << 16)
            | (u32::from(self.split) << 14)
            | ((self.endpoint_type as u32) << 12)
            | ((self.token as u32) << 10)
            | ((u32::from(self.device_address) & 0x7f) << 3)
            | ((ep & 0xe) >> 1);
        words[2] = ((u32::from(self.nak_reload) & 0xf) << 25)
            | (u32::from(self.start_address) << 8)
            | u32::from(self.micro_frame);
        words[3] = (u32::from(self.active) << 31)
            | (u32::from(self.halted) << 30)
            | (u32::from(self.babble) << 29)
            | (u32::from(self.transaction_error) << 28)
            | (u32::from(self.complete_split) << 27)
            | (u32::from(self.ping) << 26)
            | (u32::from(self.toggle) << 25)
            | ((u32::from(self.error_counter) & 0x3) << 23)
            | ((u32::from(self.nak_count) & 0xf) << 19)
            | (u32::from(self.bytes_done) & 0x7fff);
        words[4] = u32::from(self.micro_start_split);
        words[5] = u32::from(self.micro_complete_split);
        words
    }

    /// Unpack all fields. Returns `None` for the reserved endpoint type 1.
    #[must_use]
    pub fn decode(words: &PtdWords) -> Option<Self> {
        let bit = |word: u32, n: u32| (word >> n) & 1 != 0;
        let [dw0, dw1, dw2, dw3, dw4, dw5, _, _] = *words;

        Some(Self {
            valid: bit(dw0, 0),
            length: ((dw0 >> 3) & 0x7fff) as u16,
            max_packet: ((dw0 >> 18) & 0x7ff) as u16,
            multiplier: ((dw0 >> 29) & 0x3) as u8,
            endpoint: (((dw1 & 0x7) << 1) | (dw0 >> 31)) as u8,
            device_address: ((dw1 >> 3) & 0x7f) as u8,
            token: Token::from_bits(dw1 >> 10),
            endpoint_type: EndpointType::from_bits(dw1 >> 12)?,
            split: bit(dw1, 14),
            se: ((dw1 >> 16) & 0x3) as u8,
            hub_port: ((dw1 >> 18) & 0x7f) as u8,
            hub_address: ((dw1 >> 25) & 0x7f) as u8,
            micro_frame: (dw2 & 0xff) as u8,
            start_address: ((dw2 >> 8) & 0xffff) as u16,
            nak_reload: ((dw2 >> 25) & 0xf) as u8,
            bytes_done: (dw3 & 0x7fff) as u16,
            nak_count: ((dw3 >> 19) & 0xf) as u8,
            error_counter: ((dw3 >> 23) & 0x3) as u8,
            toggle: bit(dw3, 25),
            ping: bit(dw3, 26),
            complete_split: bit(dw3, 27),
            transaction_error: bit(dw3, 28),
            babble: bit(dw3, 29),
            halted: bit(dw3, 30),
            active: bit(dw3, 31),
            micro_start_split: (dw4 & 0xff) as u8,
            micro_complete_split: (dw5 & 0xff) as u8,
        })
    }
}

/// Field-by-field dump for debug logging.
impl fmt::Display for PtdFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "V={} A={} H={} B={} X={} ep={} dev={} token={:?} type={:?} len={} done={} \
             maxpak={} mult={} DT={} cerr={} nak={}/{} start={:#x}",
            u8::from(self.valid),
            u8::from(self.active),
            u8::from(self.halted),
            u8::from(self.babble),
            u8::from(self.transaction_error),
            self.endpoint,
            self.device_address,
            self.token,
            self.endpoint_type,
            self.length,
            self.bytes_done,
            self.max_packet,
            self.multiplier,
            u8::from(self.toggle),
            self.error_counter,
            self.nak_count,
            self.nak_reload,
            super::constants::memory::chip_to_cpu(u32::from(self.start_address)),
        )?;
        if self.split {
            write!(
                f,
                " split({} se={} hub={} port={})",
                if self.complete_split { "complete" } else { "start" },
                self.se,
                self.hub_address,
                self.hub_port
            )?;
        }
        if self.endpoint_type == EndpointType::Interrupt {
            write!(
                f,
                " uframe={:#04x} uSA={:#04x} uSCS={:#04x}",
                self.micro_frame, self.micro_start_split, self.micro_complete_split
            )?;
        }
        Ok(())
    }
}

/// The completion-relevant part of a PTD read back from the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtdStatus {
    pub active: bool,
    pub halted: bool,
    pub babble: bool,
    pub transaction_error: bool,
    pub bytes_done: usize,
    /// Data toggle for the next transaction on this endpoint.
    pub toggle: bool,
    pub nak_remaining: u8,
}

impl PtdStatus {
    #[must_use]
    pub const fn decode(words: &PtdWords) -> Self {
        let dw3 = words[3];
        Self {
            active: dw3 & (1 << 31) != 0,
            halted: dw3 & (1 << 30) != 0,
            babble: dw3 & (1 << 29) != 0,
            transaction_error: dw3 & (1 << 28) != 0,
            bytes_done: (dw3 & 0x7fff) as usize,
            toggle: dw3 & (1 << 25) != 0,
            nak_remaining: ((dw3 >> 19) & 0xf) as u8,
        }
    }
}

/// Serialize PTD words the way chip memory stores them.
#[must_use]
pub fn words_to_bytes(words: &PtdWords) -> [u8; PTD_DWORDS * 4] {
    let mut bytes = [0u8; PTD_DWORDS * 4];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

#[must_use]
pub fn bytes_to_words(bytes: &[u8; PTD_DWORDS * 4]) -> PtdWords {
    let mut words = [0u32; PTD_DWORDS];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}
