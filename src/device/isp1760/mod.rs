//! Driver core for the NXP ISP1760 USB host controller.
//!
//! Control, bulk and interrupt transfers are scheduled onto a fixed pool of
//! transfer slots. Each slot owns one PTD row in the asynchronous (ATL) or
//! periodic (INT) table and a 1 KiB payload region in chip memory. The
//! interrupt handler matches the chip's done bitmaps against the active
//! lists and decides per transfer whether it succeeded, failed, needs a
//! retry or has to be re-armed.

pub mod bus;
pub mod completion;
pub mod config;
pub mod constants;
mod controller;
pub mod error;
pub mod ptd;
mod slots;
mod stats;
pub mod transfer;

pub use bus::{Platform, RegisterBus, SystemPlatform};
pub use config::{CompletionMode, DriverConfig};
pub use controller::Isp1760;
pub use error::{HcdError, InitError, SlotError};
pub use slots::{Place, SlotInfo, SlotState};
pub use stats::StatsSnapshot;
pub use transfer::{CompletedTransfer, Outcome, PtdClass, SlotId, Token, Transfer};
