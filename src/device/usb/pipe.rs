//! The packed pipe word class drivers hand to the host controller.
//!
//! Layout of the 32-bit value:
//!
//! | bits   | meaning                                        |
//! |--------|------------------------------------------------|
//! | 0..1   | max packet size class (8, 16, 32, 64 bytes)    |
//! | 7      | direction, 1 = IN (device to host)             |
//! | 8..14  | device address                                 |
//! | 15..18 | endpoint number                                |
//! | 19     | data toggle (unused by the host controller)    |
//! | 26..27 | speed: 0 full, 1 low, 2 high                   |
//! | 30..31 | type: 0 isochronous, 1 interrupt, 2 control, 3 bulk |

use std::fmt;

const DIR_IN: u32 = 0x80;

/// USB bus speed of a device.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Full = 0,
    Low = 1,
    High = 2,
}

impl Speed {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => Self::Low,
            2 => Self::High,
            // 3 is reserved; treat it like the default speed
            _ => Self::Full,
        }
    }

    /// Full and low speed devices behind a high speed hub need split
    /// transactions.
    #[must_use]
    pub const fn needs_split(self) -> bool {
        !matches!(self, Self::High)
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "Low Speed (1.5 Mbps)",
            Self::Full => "Full Speed (12 Mbps)",
            Self::High => "High Speed (480 Mbps)",
        };
        write!(f, "{name}")
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeType {
    Isochronous = 0,
    Interrupt = 1,
    Control = 2,
    Bulk = 3,
}

impl PipeType {
    const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Isochronous,
            1 => Self::Interrupt,
            2 => Self::Control,
            _ => Self::Bulk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

impl Direction {
    #[must_use]
    pub const fn reversed(self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }

    /// Index into per-direction tables; OUT is 1 like the data toggle
    /// bookkeeping of the class layer expects.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::In => 0,
            Self::Out => 1,
        }
    }
}

/// A packed pipe descriptor.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pipe(u32);

impl Pipe {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Build a pipe word the way the class layer does.
    #[must_use]
    pub const fn new(
        pipe_type: PipeType,
        direction: Direction,
        device_address: u8,
        endpoint: u8,
        speed: Speed,
        max_packet_class: u8,
    ) -> Self {
        let dir = match direction {
            Direction::In => DIR_IN,
            Direction::Out => 0,
        };
        Self(
            ((pipe_type as u32) << 30)
                | ((speed as u32) << 26)
                | (((endpoint & 0xf) as u32) << 15)
                | (((device_address & 0x7f) as u32) << 8)
                | dir
                | (max_packet_class & 0x3) as u32,
        )
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn pipe_type(self) -> PipeType {
        PipeType::from_bits(self.0 >> 30)
    }

    #[must_use]
    pub const fn direction(self) -> Direction {
        if self.0 & DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    #[must_use]
    pub const fn device_address(self) -> u8 {
        ((self.0 >> 8) & 0x7f) as u8
    }

    #[must_use]
    pub const fn endpoint(self) -> u8 {
        ((self.0 >> 15) & 0xf) as u8
    }

    #[must_use]
    pub const fn speed(self) -> Speed {
        Speed::from_bits(self.0 >> 26)
    }

    /// Maximum packet size encoded in the pipe (8 << class).
    #[must_use]
    pub const fn max_packet_hint(self) -> u16 {
        8 << (self.0 & 0x3)
    }

    /// The same pipe with the direction bit flipped, used for the status
    /// stage of control transfers.
    #[must_use]
    pub const fn reversed(self) -> Self {
        Self(self.0 ^ DIR_IN)
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("type", &self.pipe_type())
            .field("direction", &self.direction())
            .field("device", &self.device_address())
            .field("endpoint", &self.endpoint())
            .field("speed", &self.speed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_class_layer_encoding() {
        // usb_rcvbulkpipe(dev 5, ep 2), high speed, 64 byte class
        let raw = (3 << 30) | (2 << 26) | (2 << 15) | (5 << 8) | 0x80 | 3;
        let pipe = Pipe::from_raw(raw);
        assert_eq!(pipe.pipe_type(), PipeType::Bulk);
        assert_eq!(pipe.direction(), Direction::In);
        assert_eq!(pipe.device_address(), 5);
        assert_eq!(pipe.endpoint(), 2);
        assert_eq!(pipe.speed(), Speed::High);
        assert_eq!(pipe.max_packet_hint(), 64);
        assert_eq!(
            Pipe::new(PipeType::Bulk, Direction::In, 5, 2, Speed::High, 3),
            pipe
        );
    }

    #[test]
    fn reversing_only_touches_direction() {
        let pipe = Pipe::new(PipeType::Control, Direction::In, 1, 0, Speed::Low, 0);
        let status = pipe.reversed();
        assert_eq!(status.direction(), Direction::Out);
        assert_eq!(status.pipe_type(), PipeType::Control);
        assert_eq!(status.speed(), Speed::Low);
        assert_eq!(status.reversed(), pipe);
    }
}
