//! The tokio runtime that stands in for the simulated chip's clock and for
//! the CPU's interrupt entry.

use std::{sync::Arc, sync::OnceLock, time::Duration};

use anyhow::{anyhow, Context, Result};
use isp1760_hcd::{
    device::{interrupt_line::InterruptLine, isp1760::Isp1760},
    sim::SimChip,
};
use tokio::{runtime::Handle, sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tracing::trace;

static RUNTIME_HANDLE: OnceLock<Handle> = OnceLock::new();

pub fn runtime() -> &'static Handle {
    RUNTIME_HANDLE.get().expect("runtime not initialized")
}

pub fn init_runtime() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    RUNTIME_HANDLE
        .set(rt.handle().clone())
        .map_err(|_| anyhow!("runtime already initialized"))?;

    // Keep runtime alive forever
    std::mem::forget(rt);

    Ok(())
}

/// Interrupt line that wakes the interrupt task.
#[derive(Debug, Default)]
pub struct NotifyLine(Notify);

impl InterruptLine for NotifyLine {
    fn interrupt(&self) {
        self.0.notify_one();
    }
}

/// Run one frame of the simulated chip every `period`.
pub fn spawn_frame_clock(chip: Arc<SimChip>, period: Duration) -> JoinHandle<()> {
    runtime().spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            chip.run_frame();
        }
    })
}

/// Call the driver's interrupt handler whenever `line` fires.
pub fn spawn_interrupt_handler(line: Arc<NotifyLine>, driver: Arc<Isp1760>) -> JoinHandle<()> {
    runtime().spawn(async move {
        loop {
            line.0.notified().await;
            trace!("Interrupt");
            driver.on_interrupt();
        }
    })
}
