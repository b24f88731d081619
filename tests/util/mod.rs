#![allow(dead_code)]

use std::sync::Arc;

use isp1760_hcd::{
    device::{
        isp1760::{CompletionMode, DriverConfig, Isp1760},
        usb::{Direction, Pipe, PipeType, Speed, UsbDevice},
    },
    sim::{SimChip, SimPlatform},
};

pub const DEVICE_ADDRESS: u8 = 1;

/// A driver wired to a simulated chip on simulated time.
pub struct Harness {
    pub chip: Arc<SimChip>,
    pub platform: Arc<SimPlatform>,
    pub driver: Arc<Isp1760>,
}

impl Harness {
    /// Build the driver without bringing the chip up. In interrupt mode the
    /// platform delivers chip interrupts to the driver.
    pub fn new(config: DriverConfig) -> Self {
        let chip = Arc::new(SimChip::new());
        let platform = Arc::new(SimPlatform::new(chip.clone()));
        let interrupt_driven = config.completion == CompletionMode::Interrupt;
        let driver = Arc::new(
            Isp1760::new(chip.clone(), platform.clone(), config).expect("valid configuration"),
        );
        if interrupt_driven {
            platform.attach_driver(&driver);
        }
        Self {
            chip,
            platform,
            driver,
        }
    }

    /// Build the driver and run the bring-up sequence.
    pub fn started(config: DriverConfig) -> Self {
        let harness = Self::new(config);
        harness.driver.init().expect("controller comes up");
        harness
    }

    /// Let `frames` frames of simulated time pass.
    pub fn run_frames(&self, frames: usize) {
        use isp1760_hcd::device::isp1760::Platform;
        for _ in 0..frames {
            self.platform.relax();
        }
    }

    pub fn assert_consistent(&self) {
        assert_eq!(self.driver.check_invariants(), Ok(()));
    }
}

pub fn high_speed_device() -> Arc<UsbDevice> {
    Arc::new(UsbDevice::new(DEVICE_ADDRESS, Speed::High, None, 64))
}

pub fn bulk_pipe(direction: Direction, endpoint: u8) -> Pipe {
    Pipe::new(
        PipeType::Bulk,
        direction,
        DEVICE_ADDRESS,
        endpoint,
        Speed::High,
        3,
    )
}

pub fn control_pipe(direction: Direction) -> Pipe {
    Pipe::new(
        PipeType::Control,
        direction,
        DEVICE_ADDRESS,
        0,
        Speed::High,
        3,
    )
}

pub fn interrupt_pipe(endpoint: u8) -> Pipe {
    Pipe::new(
        PipeType::Interrupt,
        Direction::In,
        DEVICE_ADDRESS,
        endpoint,
        Speed::High,
        3,
    )
}
