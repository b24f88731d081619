#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate
)]
// now allow a few rules which are denied by the above's statement
#![allow(clippy::multiple_crate_versions)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::all)]

//! isp1760-hcd
//!
//! Drives the ISP1760 host controller core against the chip simulator.

mod async_runtime;
mod cli;

use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::Cli;
use isp1760_hcd::{
    device::{
        isp1760::{CompletionMode, DriverConfig, Isp1760, Outcome, SystemPlatform},
        usb::{DeviceRequest, Direction, Pipe, PipeType, Speed, UsbDevice},
    },
    sim::{EchoDevice, SimChip},
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::async_runtime::{spawn_frame_clock, spawn_interrupt_handler, NotifyLine};

const DEVICE_ADDRESS: u8 = 1;
const BULK_ENDPOINT: u8 = 2;
const INTERRUPT_ENDPOINT: u8 = 1;

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    // Log messages from the log crate as well.
    tracing_log::LogTracer::init()?;

    async_runtime::init_runtime()?;

    let config = DriverConfig {
        pool_size: usize::from(args.pool_size),
        nak_timeout_ms: args.nak_timeout_ms,
        completion: if args.polled {
            CompletionMode::Polled
        } else {
            CompletionMode::Interrupt
        },
        dump_ptd: args.dump_ptd,
        ..DriverConfig::default()
    };

    let chip = Arc::new(SimChip::new());
    let mut device_model = EchoDevice::with_default_descriptor();
    device_model.queue_reports(
        INTERRUPT_ENDPOINT,
        (0..args.reports).map(|n| vec![0, 0, 0x04 + (n % 26) as u8, 0, 0, 0, 0, 0]),
    );
    chip.attach(DEVICE_ADDRESS, Box::new(device_model));

    let driver = Arc::new(
        Isp1760::new(chip.clone(), Arc::new(SystemPlatform::new()), config)
            .context("Invalid driver configuration")?,
    );

    let line = Arc::new(NotifyLine::default());
    chip.connect_irq(line.clone());
    let _clock = spawn_frame_clock(chip.clone(), Duration::from_millis(1));
    if !args.polled {
        let _irq = spawn_interrupt_handler(line, driver.clone());
    }

    driver.init().context("Failed to initialize the host controller")?;
    info!("We're up!");

    let result = exercise_device(&driver, args.reports);

    let stats = driver.stats();
    info!(
        "{} transfers completed, {} retries, {} stray done bits, {} stuck",
        stats.completed, stats.retries, stats.unmatched_done_bits, stats.stuck_transfers
    );
    driver.stop();
    result
}

fn exercise_device(driver: &Isp1760, reports: usize) -> Result<()> {
    let device = Arc::new(UsbDevice::new(DEVICE_ADDRESS, Speed::High, None, 64));

    let ep0_in = Pipe::new(
        PipeType::Control,
        Direction::In,
        DEVICE_ADDRESS,
        0,
        Speed::High,
        3,
    );
    let mut descriptor = [0u8; 18];
    let length = driver
        .submit_control_msg(
            &device,
            ep0_in,
            &mut descriptor,
            &DeviceRequest::get_device_descriptor(18),
        )
        .context("GET_DESCRIPTOR failed")?;
    info!(
        "Device descriptor ({length} bytes): vendor {:04x} product {:04x}",
        u16::from_le_bytes([descriptor[8], descriptor[9]]),
        u16::from_le_bytes([descriptor[10], descriptor[11]])
    );

    device.set_max_packet(BULK_ENDPOINT, Direction::In, 512);
    device.set_max_packet(BULK_ENDPOINT, Direction::Out, 512);
    let bulk_out = Pipe::new(
        PipeType::Bulk,
        Direction::Out,
        DEVICE_ADDRESS,
        BULK_ENDPOINT,
        Speed::High,
        3,
    );
    let bulk_in = Pipe::new(
        PipeType::Bulk,
        Direction::In,
        DEVICE_ADDRESS,
        BULK_ENDPOINT,
        Speed::High,
        3,
    );

    let mut message = *b"hello, isp1760";
    driver
        .submit_bulk_msg(&device, bulk_out, &mut message, 0)
        .context("Bulk OUT failed")?;
    let mut echo = [0u8; 64];
    let length = driver
        .submit_bulk_msg(&device, bulk_in, &mut echo, 0)
        .context("Bulk IN failed")?;
    info!(
        "Bulk echo: {:?}",
        String::from_utf8_lossy(&echo[..length])
    );

    // An asynchronous read with nothing queued runs into the NAK timeout.
    let (done_tx, done_rx) = mpsc::channel();
    driver
        .submit_bulk_async(&device, bulk_in, vec![0; 64], 200, move |completed| {
            let _ = done_tx.send(completed.outcome);
        })
        .context("Asynchronous bulk IN failed")?;
    let outcome = poll_until(driver, &done_rx, Duration::from_secs(2))
        .context("Asynchronous bulk IN never completed")?;
    info!("Asynchronous bulk IN finished: {outcome}");

    let interrupt_in = Pipe::new(
        PipeType::Interrupt,
        Direction::In,
        DEVICE_ADDRESS,
        INTERRUPT_ENDPOINT,
        Speed::High,
        3,
    );
    let (report_tx, report_rx) = mpsc::channel();
    let mut remaining = reports;
    driver
        .submit_int_msg(
            &device,
            interrupt_in,
            vec![0; 8],
            8,
            move |_device, outcome, data| {
                let _ = report_tx.send((outcome, data.to_vec()));
                remaining = remaining.saturating_sub(1);
                outcome == Outcome::Success && remaining > 0
            },
        )
        .context("Interrupt IN failed")?;

    for _ in 0..reports {
        let (outcome, data) = poll_until(driver, &report_rx, Duration::from_secs(2))
            .context("No interrupt report")?;
        if outcome == Outcome::Success {
            info!("Interrupt report: {data:02x?}");
        } else {
            warn!("Interrupt transfer ended: {outcome}");
            break;
        }
    }

    Ok(())
}

/// Run completion callbacks until `rx` yields a value or `timeout` passes.
fn poll_until<T>(driver: &Isp1760, rx: &mpsc::Receiver<T>, timeout: Duration) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        driver.usb_event_poll();
        if let Ok(value) = rx.try_recv() {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            bail!("Timed out after {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
