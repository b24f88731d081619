/// A USB SETUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl DeviceRequest {
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const SET_CONFIGURATION: u8 = 0x09;

    /// Standard GET_DESCRIPTOR(DEVICE) request.
    #[must_use]
    pub const fn get_device_descriptor(length: u16) -> Self {
        Self {
            request_type: 0x80,
            request: Self::GET_DESCRIPTOR,
            value: 0x0100,
            index: 0,
            length,
        }
    }

    /// Wire representation, little endian.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_descriptor_wire_format() {
        let req = DeviceRequest::get_device_descriptor(18);
        assert_eq!(req.to_bytes(), [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(DeviceRequest::from_bytes(&req.to_bytes()), req);
    }
}
