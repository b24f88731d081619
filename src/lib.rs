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

//! Transfer-slot scheduler and completion engine for ISP1760 USB host
//! controllers, plus a register-level chip simulator to run it against.

pub mod device;
pub mod sim;
