//! Device models the simulated chip talks to.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::{self, Debug},
};

use crate::device::{
    isp1760::{PtdClass, Token},
    usb::DeviceRequest,
};

/// One PTD execution as the device sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimTransaction {
    pub class: PtdClass,
    pub slot: usize,
    pub device_address: u8,
    pub endpoint: u8,
    pub token: Token,
    /// Data toggle the PTD started with.
    pub toggle: bool,
    /// Bytes the host asked to move.
    pub length: usize,
    pub max_packet: usize,
    pub split: bool,
    pub hub_address: u8,
    pub hub_port: u8,
    /// Payload of OUT and SETUP transactions.
    pub data: Vec<u8>,
}

/// How a device answers a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimResponse {
    /// IN data. More bytes than requested are reported as such.
    Data(Vec<u8>),
    /// OUT or SETUP data accepted in full.
    Accept,
    /// Only this many bytes were moved.
    Partial(usize),
    Nak,
    Stall,
    Babble,
    TransactionError,
}

/// A device behind the simulated root port.
pub trait SimDevice: Debug + Send {
    fn transact(&mut self, transaction: &SimTransaction) -> SimResponse;
}

/// A device whose behaviour is a closure.
pub struct FnDevice<F>(pub F);

impl<F> Debug for FnDevice<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnDevice")
    }
}

impl<F> SimDevice for FnDevice<F>
where
    F: FnMut(&SimTransaction) -> SimResponse + Send,
{
    fn transact(&mut self, transaction: &SimTransaction) -> SimResponse {
        (self.0)(transaction)
    }
}

/// A device that plays back a fixed list of responses, then keeps giving
/// the fallback.
#[derive(Debug)]
pub struct ScriptedDevice {
    script: VecDeque<SimResponse>,
    fallback: SimResponse,
}

impl ScriptedDevice {
    #[must_use]
    pub fn new(script: impl IntoIterator<Item = SimResponse>, fallback: SimResponse) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
        }
    }

    /// A device that gives the same answer to everything.
    #[must_use]
    pub const fn always(response: SimResponse) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: response,
        }
    }
}

impl SimDevice for ScriptedDevice {
    fn transact(&mut self, _transaction: &SimTransaction) -> SimResponse {
        self.script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A small well-behaved device.
///
/// Endpoint 0 answers GET_DESCRIPTOR(DEVICE) with its descriptor and
/// accepts every other request. Bulk OUT data is echoed back on the bulk IN
/// endpoint with the same number, and interrupt IN endpoints hand out
/// queued reports. Endpoints with nothing to send NAK.
#[derive(Debug)]
pub struct EchoDevice {
    descriptor: Vec<u8>,
    pending_request: Option<DeviceRequest>,
    echo: BTreeMap<u8, VecDeque<Vec<u8>>>,
    reports: BTreeMap<u8, VecDeque<Vec<u8>>>,
    interrupt_endpoints: Vec<u8>,
}

impl EchoDevice {
    #[must_use]
    pub fn new(descriptor: Vec<u8>) -> Self {
        Self {
            descriptor,
            pending_request: None,
            echo: BTreeMap::new(),
            reports: BTreeMap::new(),
            interrupt_endpoints: Vec::new(),
        }
    }

    /// A typical 18 byte device descriptor with a 64 byte control endpoint.
    #[must_use]
    pub fn with_default_descriptor() -> Self {
        Self::new(vec![
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x6b, 0x1d, 0x04, 0x01, 0x00, 0x01,
            0x01, 0x02, 0x03, 0x01,
        ])
    }

    /// Queue reports to return from interrupt IN endpoint `endpoint`.
    pub fn queue_reports(&mut self, endpoint: u8, reports: impl IntoIterator<Item = Vec<u8>>) {
        self.reports.entry(endpoint).or_default().extend(reports);
        if !self.interrupt_endpoints.contains(&endpoint) {
            self.interrupt_endpoints.push(endpoint);
        }
    }

    fn control(&mut self, transaction: &SimTransaction) -> SimResponse {
        match transaction.token {
            Token::Setup => {
                let Ok(bytes) = <[u8; 8]>::try_from(transaction.data.as_slice()) else {
                    return SimResponse::Stall;
                };
                self.pending_request = Some(DeviceRequest::from_bytes(&bytes));
                SimResponse::Accept
            }
            Token::In => match self.pending_request.take() {
                Some(request)
                    if request.request == DeviceRequest::GET_DESCRIPTOR
                        && transaction.length > 0 =>
                {
                    let length = transaction
                        .length
                        .min(usize::from(request.length))
                        .min(self.descriptor.len());
                    SimResponse::Data(self.descriptor[..length].to_vec())
                }
                _ => SimResponse::Data(Vec::new()),
            },
            Token::Out | Token::Ping => SimResponse::Accept,
        }
    }
}

impl SimDevice for EchoDevice {
    fn transact(&mut self, transaction: &SimTransaction) -> SimResponse {
        let endpoint = transaction.endpoint;
        if endpoint == 0 {
            return self.control(transaction);
        }
        match transaction.token {
            Token::In if self.interrupt_endpoints.contains(&endpoint) => self
                .reports
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
                .map_or(SimResponse::Nak, SimResponse::Data),
            Token::In => self
                .echo
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
                .map_or(SimResponse::Nak, SimResponse::Data),
            Token::Out => {
                self.echo
                    .entry(endpoint)
                    .or_default()
                    .push_back(transaction.data.clone());
                SimResponse::Accept
            }
            Token::Setup | Token::Ping => SimResponse::Stall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(endpoint: u8, token: Token, length: usize, data: Vec<u8>) -> SimTransaction {
        SimTransaction {
            class: PtdClass::Async,
            slot: 0,
            device_address: 1,
            endpoint,
            token,
            toggle: false,
            length,
            max_packet: 64,
            split: false,
            hub_address: 0,
            hub_port: 0,
            data,
        }
    }

    #[test]
    fn scripted_device_falls_back_after_the_script() {
        let mut device = ScriptedDevice::new([SimResponse::Nak], SimResponse::Accept);
        let t = transaction(1, Token::Out, 0, Vec::new());
        assert_eq!(device.transact(&t), SimResponse::Nak);
        assert_eq!(device.transact(&t), SimResponse::Accept);
        assert_eq!(device.transact(&t), SimResponse::Accept);
    }

    #[test]
    fn echo_device_answers_get_descriptor_with_the_requested_length() {
        let mut device = EchoDevice::with_default_descriptor();
        let setup = DeviceRequest::get_device_descriptor(8).to_bytes().to_vec();
        assert_eq!(
            device.transact(&transaction(0, Token::Setup, 8, setup)),
            SimResponse::Accept
        );
        let SimResponse::Data(data) = device.transact(&transaction(0, Token::In, 64, Vec::new()))
        else {
            panic!("expected descriptor data");
        };
        assert_eq!(data, vec![0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40]);
    }

    #[test]
    fn echo_device_returns_bulk_data_on_the_in_endpoint() {
        let mut device = EchoDevice::with_default_descriptor();
        let in_tx = transaction(2, Token::In, 64, Vec::new());
        assert_eq!(device.transact(&in_tx), SimResponse::Nak);

        device.transact(&transaction(2, Token::Out, 3, vec![1, 2, 3]));
        assert_eq!(device.transact(&in_tx), SimResponse::Data(vec![1, 2, 3]));
    }
}
