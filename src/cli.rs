use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = "Runs the ISP1760 driver against a simulated controller with one \
                  device attached: enumerates it, exchanges bulk data and reads \
                  interrupt reports."
)]
pub struct Cli {
    /// Increase log verbosity. Repeat for more.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Number of transfer slots.
    #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u16).range(1..=32))]
    pub pool_size: u16,

    /// NAK timeout in milliseconds for transfers that do not set their own.
    #[arg(long, default_value_t = 1000)]
    pub nak_timeout_ms: u32,

    /// Poll for completions instead of servicing the interrupt line.
    #[arg(long, action = ArgAction::SetTrue)]
    pub polled: bool,

    /// Log every PTD written to and read back from the chip.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dump_ptd: bool,

    /// Interrupt reports to read before stopping.
    #[arg(long, default_value_t = 3)]
    pub reports: usize,
}
