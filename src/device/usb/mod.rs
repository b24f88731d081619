//! USB device records and pipe encoding shared with class drivers.

pub mod device;
pub mod pipe;
pub mod request;

pub use device::{HubPort, UsbDevice};
pub use pipe::{Direction, Pipe, PipeType, Speed};
pub use request::DeviceRequest;
