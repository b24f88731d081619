use std::sync::{Mutex, MutexGuard};

use crate::device::isp1760::Outcome;

use super::pipe::{Direction, Pipe, Speed};

const MAX_ENDPOINTS: usize = 16;

/// Address of the hub port a device hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubPort {
    pub hub_address: u8,
    pub port: u8,
}

#[derive(Debug)]
struct EndpointTable {
    /// One toggle bit per endpoint; indexed by [`Direction::index`].
    toggle: [u16; 2],
    /// One halt bit per endpoint; indexed by [`Direction::index`].
    halted: [u16; 2],
    max_packet_in: [u16; MAX_ENDPOINTS],
    max_packet_out: [u16; MAX_ENDPOINTS],
    last_status: Option<Outcome>,
    actual_length: usize,
}

/// A USB device as seen by the host controller core.
///
/// The class layer owns these records and shares them with the core via
/// `Arc`. The core reads addressing information, and reads and updates the
/// per-endpoint data toggle and halt bits.
#[derive(Debug)]
pub struct UsbDevice {
    address: u8,
    speed: Speed,
    parent: Option<HubPort>,
    endpoints: Mutex<EndpointTable>,
}

impl UsbDevice {
    /// Create a device record with `max_packet0` as the control endpoint's
    /// packet size in both directions.
    #[must_use]
    pub fn new(address: u8, speed: Speed, parent: Option<HubPort>, max_packet0: u16) -> Self {
        let mut max_packet_in = [0; MAX_ENDPOINTS];
        let mut max_packet_out = [0; MAX_ENDPOINTS];
        max_packet_in[0] = max_packet0;
        max_packet_out[0] = max_packet0;

        Self {
            address,
            speed,
            parent,
            endpoints: Mutex::new(EndpointTable {
                toggle: [0; 2],
                halted: [0; 2],
                max_packet_in,
                max_packet_out,
                last_status: None,
                actual_length: 0,
            }),
        }
    }

    #[must_use]
    pub const fn address(&self) -> u8 {
        self.address
    }

    #[must_use]
    pub const fn speed(&self) -> Speed {
        self.speed
    }

    #[must_use]
    pub const fn parent(&self) -> Option<HubPort> {
        self.parent
    }

    fn table(&self) -> MutexGuard<'_, EndpointTable> {
        // The lock only fails if another thread panicked while holding it.
        // Nothing sensible can continue from that state.
        self.endpoints.lock().unwrap()
    }

    /// Record the max packet size of an endpoint from its descriptor.
    pub fn set_max_packet(&self, endpoint: u8, direction: Direction, size: u16) {
        let mut table = self.table();
        let ep = usize::from(endpoint) % MAX_ENDPOINTS;
        match direction {
            Direction::In => table.max_packet_in[ep] = size,
            Direction::Out => table.max_packet_out[ep] = size,
        }
    }

    /// Max packet size for the endpoint a pipe addresses. Falls back to the
    /// size class packed into the pipe for endpoints without a descriptor.
    #[must_use]
    pub fn max_packet(&self, pipe: Pipe) -> u16 {
        let table = self.table();
        let ep = usize::from(pipe.endpoint());
        let size = match pipe.direction() {
            Direction::In => table.max_packet_in[ep],
            Direction::Out => table.max_packet_out[ep],
        };
        if size == 0 {
            pipe.max_packet_hint()
        } else {
            size
        }
    }

    #[must_use]
    pub fn toggle(&self, endpoint: u8, direction: Direction) -> bool {
        (self.table().toggle[direction.index()] >> endpoint) & 1 != 0
    }

    pub fn set_toggle(&self, endpoint: u8, direction: Direction, toggle: bool) {
        let mut table = self.table();
        let bits = &mut table.toggle[direction.index()];
        *bits = (*bits & !(1 << endpoint)) | (u16::from(toggle) << endpoint);
    }

    #[must_use]
    pub fn is_halted(&self, endpoint: u8, direction: Direction) -> bool {
        self.table().halted[direction.index()] & (1 << endpoint) != 0
    }

    pub fn halt(&self, endpoint: u8, direction: Direction) {
        self.table().halted[direction.index()] |= 1 << endpoint;
    }

    /// Mark an endpoint running again, e.g. after a CLEAR_FEATURE(HALT).
    /// The data toggle restarts at DATA0.
    pub fn clear_halt(&self, endpoint: u8, direction: Direction) {
        let mut table = self.table();
        table.halted[direction.index()] &= !(1 << endpoint);
        table.toggle[direction.index()] &= !(1 << endpoint);
    }

    /// Status of the most recent transfer phase that reached an outcome.
    #[must_use]
    pub fn last_status(&self) -> Option<Outcome> {
        self.table().last_status
    }

    /// Bytes moved by the most recent transfer.
    #[must_use]
    pub fn actual_length(&self) -> usize {
        self.table().actual_length
    }

    pub(crate) fn record_status(&self, outcome: Outcome) {
        self.table().last_status = Some(outcome);
    }

    pub(crate) fn set_actual_length(&self, length: usize) {
        self.table().actual_length = length;
    }
}
