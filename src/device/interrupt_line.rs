use std::fmt::Debug;

/// The interrupt pin of the host controller.
///
/// Whoever models the chip raises the line; whoever owns the CPU side
/// decides how that turns into a call of the driver's interrupt handler.
pub trait InterruptLine: Debug + Send + Sync {
    /// Signal an interrupt.
    fn interrupt(&self);
}

/// An interrupt line that is not connected to anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyInterruptLine;

impl InterruptLine for DummyInterruptLine {
    fn interrupt(&self) {}
}
