use super::{constants::MAX_SLOTS, error::InitError};

/// How completed PTDs are noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// An interrupt handler calls [`Isp1760::on_interrupt`](super::Isp1760::on_interrupt).
    #[default]
    Interrupt,
    /// [`Isp1760::usb_event_poll`](super::Isp1760::usb_event_poll) runs the
    /// interrupt handler itself, for platforms without a wired interrupt.
    Polled,
}

/// Driver tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Number of transfer slots, at most one per done-map bit.
    pub pool_size: usize,
    /// NAK timeout of transfers submitted with a timeout of 0.
    pub nak_timeout_ms: u32,
    /// How long a blocking wait runs before it checks for a stuck PTD.
    pub stuck_after_ms: u64,
    pub completion: CompletionMode,
    /// Log every PTD written and read back.
    pub dump_ptd: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pool_size: MAX_SLOTS,
            nak_timeout_ms: 1000,
            stuck_after_ms: 5000,
            completion: CompletionMode::default(),
            dump_ptd: false,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), InitError> {
        if (1..=MAX_SLOTS).contains(&self.pool_size) {
            Ok(())
        } else {
            Err(InitError::InvalidPoolSize(self.pool_size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_is_bounded_by_the_bitmaps() {
        assert!(DriverConfig::default().validate().is_ok());
        for pool_size in [0, MAX_SLOTS + 1] {
            let config = DriverConfig {
                pool_size,
                ..DriverConfig::default()
            };
            assert_eq!(
                config.validate(),
                Err(InitError::InvalidPoolSize(pool_size))
            );
        }
    }
}
