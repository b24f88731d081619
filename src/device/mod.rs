pub mod interrupt_line;
pub mod isp1760;
pub mod usb;
