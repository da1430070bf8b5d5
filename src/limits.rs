//! Bandwidth limit values and their validation rules.

use thiserror::Error;

/// A bandwidth limit: a sustained rate plus a burst ceiling.
///
/// Both fields must be strictly positive wherever the limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Sustained transfer rate, in bytes per second.
    pub bytes_per_sec: u64,
    /// Maximum instantaneously available bytes (ceiling on banked tokens).
    pub burst: u64,
}

/// Why a limit (or a pair of limits) was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LimitError {
    /// A rate or a burst was zero.
    #[error("bandwidth limits must be greater than zero")]
    OutOfRange,
    /// The global rate was below the per-connection rate.
    #[error("global bandwidth limit must be at least the per-connection limit")]
    GlobalBelowPerConn,
}

impl RateLimit {
    /// A limit of `bytes_per_sec`, with the burst set to one second's worth
    /// of bytes.
    pub const fn per_second(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            burst: bytes_per_sec,
        }
    }

    /// Check that both fields are strictly positive.
    ///
    /// # Errors
    ///
    /// [`LimitError::OutOfRange`] if either field is zero.
    pub fn validate(&self) -> Result<(), LimitError> {
        if self.bytes_per_sec == 0 || self.burst == 0 {
            Err(LimitError::OutOfRange)
        } else {
            Ok(())
        }
    }

    /// Validate a (global, per-connection) pair.
    ///
    /// # Errors
    ///
    /// [`LimitError::OutOfRange`] if any field of either limit is zero, then
    /// [`LimitError::GlobalBelowPerConn`] if the global rate is below the
    /// per-connection rate.
    pub fn validate_pair(global: Self, per_conn: Self) -> Result<(), LimitError> {
        global.validate()?;
        per_conn.validate()?;
        if global.bytes_per_sec < per_conn.bytes_per_sec {
            return Err(LimitError::GlobalBelowPerConn);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{LimitError, RateLimit};

    #[test]
    fn per_second_banks_one_second_of_bytes() {
        let limit = RateLimit::per_second(512);
        assert_eq!(limit.bytes_per_sec, 512);
        assert_eq!(limit.burst, 512);
    }

    #[test]
    fn positive_ordered_pairs_are_valid() {
        for (global, per_conn) in [(1, 1), (100, 50), (100, 100), (u64::MAX, 1)] {
            assert_matches!(
                RateLimit::validate_pair(
                    RateLimit::per_second(global),
                    RateLimit::per_second(per_conn)
                ),
                Ok(()),
                "global={global}, per_conn={per_conn}"
            );
        }
    }

    #[test]
    fn zero_fields_are_out_of_range() {
        assert_matches!(
            RateLimit::per_second(0).validate(),
            Err(LimitError::OutOfRange)
        );
        assert_matches!(
            RateLimit {
                bytes_per_sec: 10,
                burst: 0
            }
            .validate(),
            Err(LimitError::OutOfRange)
        );
        assert_matches!(
            RateLimit::validate_pair(RateLimit::per_second(0), RateLimit::per_second(10)),
            Err(LimitError::OutOfRange)
        );
        assert_matches!(
            RateLimit::validate_pair(RateLimit::per_second(10), RateLimit::per_second(0)),
            Err(LimitError::OutOfRange)
        );
    }

    #[test]
    fn global_below_per_conn_is_invalid() {
        assert_matches!(
            RateLimit::validate_pair(RateLimit::per_second(10), RateLimit::per_second(100)),
            Err(LimitError::GlobalBelowPerConn)
        );
    }

    #[test]
    fn zero_check_runs_before_the_ordering_check() {
        assert_matches!(
            RateLimit::validate_pair(RateLimit::per_second(0), RateLimit::per_second(100)),
            Err(LimitError::OutOfRange)
        );
    }
}
