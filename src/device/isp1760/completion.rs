//! Turning the status bits of a finished PTD into a transfer outcome.

use tracing::error;

use super::{
    ptd::PtdStatus,
    transfer::{Outcome, Token},
};

/// What the completion engine needs to know about the transfer besides the
/// hardware status.
#[derive(Debug, Clone, Copy)]
pub struct Expectation {
    pub token: Token,
    pub requested: usize,
    /// Milliseconds since the transfer phase was first submitted.
    pub elapsed_ms: u64,
    /// NAK timeout in milliseconds, already resolved against the default.
    pub timeout_ms: u64,
}

/// Decide the outcome of a completed PTD.
///
/// The checks run in a fixed priority order; the first that applies wins.
#[must_use]
pub fn evaluate(status: &PtdStatus, expect: &Expectation) -> Outcome {
    if status.active && status.nak_remaining != 0 {
        // The chip reported completion of a PTD it still considers live.
        error!(
            "PTD completed while active with NAK count {}",
            status.nak_remaining
        );
        return Outcome::ProtocolError;
    }
    if status.halted {
        return Outcome::Halt;
    }
    if status.babble {
        return Outcome::Babble;
    }
    if status.transaction_error {
        return Outcome::BufferError;
    }
    if status.active {
        // NAK counter exhausted
        return if expect.elapsed_ms >= expect.timeout_ms {
            Outcome::NakTimeout
        } else {
            Outcome::Retry
        };
    }
    if expect.token.is_outbound() && status.bytes_done != expect.requested {
        return Outcome::WrongLength;
    }
    Outcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    const DONE: PtdStatus = PtdStatus {
        active: false,
        halted: false,
        babble: false,
        transaction_error: false,
        bytes_done: 64,
        toggle: true,
        nak_remaining: 3,
    };

    const BULK_IN: Expectation = Expectation {
        token: Token::In,
        requested: 64,
        elapsed_ms: 0,
        timeout_ms: 1000,
    };

    #[test]
    fn clean_completion_is_success() {
        assert_eq!(evaluate(&DONE, &BULK_IN), Outcome::Success);
    }

    #[test]
    fn short_inbound_transfers_succeed() {
        let status = PtdStatus {
            bytes_done: 13,
            ..DONE
        };
        assert_eq!(evaluate(&status, &BULK_IN), Outcome::Success);
    }

    #[test]
    fn short_outbound_transfers_are_wrong_length() {
        let status = PtdStatus {
            bytes_done: 13,
            ..DONE
        };
        for token in [Token::Out, Token::Setup] {
            let expect = Expectation { token, ..BULK_IN };
            assert_eq!(evaluate(&status, &expect), Outcome::WrongLength);
        }
    }

    #[test]
    fn active_with_nak_budget_left_is_a_protocol_error() {
        let status = PtdStatus {
            active: true,
            halted: true,
            ..DONE
        };
        assert_eq!(evaluate(&status, &BULK_IN), Outcome::ProtocolError);
    }

    #[test]
    fn error_bits_are_checked_in_priority_order() {
        let all = PtdStatus {
            halted: true,
            babble: true,
            transaction_error: true,
            ..DONE
        };
        assert_eq!(evaluate(&all, &BULK_IN), Outcome::Halt);

        let babble = PtdStatus {
            halted: false,
            ..all
        };
        assert_eq!(evaluate(&babble, &BULK_IN), Outcome::Babble);

        let xact = PtdStatus {
            babble: false,
            ..babble
        };
        assert_eq!(evaluate(&xact, &BULK_IN), Outcome::BufferError);
    }

    #[test]
    fn halt_wins_over_nak_exhaustion() {
        let status = PtdStatus {
            active: true,
            halted: true,
            nak_remaining: 0,
            ..DONE
        };
        assert_eq!(evaluate(&status, &BULK_IN), Outcome::Halt);
    }

    #[test]
    fn nak_exhaustion_retries_until_the_timeout() {
        let status = PtdStatus {
            active: true,
            nak_remaining: 0,
            bytes_done: 0,
            ..DONE
        };
        let early = Expectation {
            elapsed_ms: 999,
            ..BULK_IN
        };
        assert_eq!(evaluate(&status, &early), Outcome::Retry);

        let late = Expectation {
            elapsed_ms: 1000,
            ..BULK_IN
        };
        assert_eq!(evaluate(&status, &late), Outcome::NakTimeout);
    }
}
