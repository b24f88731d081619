//! A simulated ISP1760 and platform for running the driver without
//! hardware.

pub mod chip;
pub mod devices;

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, OnceLock, Weak,
};

use crate::device::isp1760::{Isp1760, Platform};

pub use chip::{LoggedTransaction, SimChip};
pub use devices::{EchoDevice, FnDevice, ScriptedDevice, SimDevice, SimResponse, SimTransaction};

/// Platform services on simulated time.
///
/// The clock is the chip's frame clock and delays advance it. Every
/// [`Platform::relax`] runs one frame; if the chip then asserts its
/// interrupt and interrupts are not masked, the attached driver's interrupt
/// handler runs right there, like a CPU taking the interrupt between two
/// instructions of the foreground.
#[derive(Debug)]
pub struct SimPlatform {
    chip: Arc<SimChip>,
    mask_depth: AtomicU32,
    driver: OnceLock<Weak<Isp1760>>,
}

impl SimPlatform {
    #[must_use]
    pub fn new(chip: Arc<SimChip>) -> Self {
        Self {
            chip,
            mask_depth: AtomicU32::new(0),
            driver: OnceLock::new(),
        }
    }

    /// Deliver chip interrupts to `driver`. Only the first call has an
    /// effect.
    pub fn attach_driver(&self, driver: &Arc<Isp1760>) {
        let _ = self.driver.set(Arc::downgrade(driver));
    }

    fn deliver_interrupt(&self) {
        if self.mask_depth.load(Ordering::Acquire) != 0 || !self.chip.irq_asserted() {
            return;
        }
        if let Some(driver) = self.driver.get().and_then(Weak::upgrade) {
            driver.on_interrupt();
        }
    }
}

impl Platform for SimPlatform {
    fn now_ms(&self) -> u64 {
        self.chip.now_us() / 1000
    }

    fn delay_us(&self, us: u32) {
        self.chip.advance_us(u64::from(us));
    }

    fn mask_interrupts(&self) -> u32 {
        self.mask_depth.fetch_add(1, Ordering::AcqRel)
    }

    fn restore_interrupts(&self, state: u32) {
        self.mask_depth.store(state, Ordering::Release);
    }

    fn relax(&self) {
        self.chip.run_frame();
        self.deliver_interrupt();
    }
}
