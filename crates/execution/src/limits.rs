//! Row/byte/time/speed caps attached to streams.

use std::time::{Duration, Instant};

use fq_common::{FqError, OverflowMode, Result, Settings};

/// A row and byte cap with its overflow policy. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeLimits {
    pub max_rows: u64,
    pub max_bytes: u64,
    pub mode: OverflowMode,
}

impl SizeLimits {
    pub fn new(max_rows: u64, max_bytes: u64, mode: OverflowMode) -> Self {
        Self {
            max_rows,
            max_bytes,
            mode,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_rows == 0 && self.max_bytes == 0
    }

    pub fn exceeded(&self, rows: u64, bytes: u64) -> bool {
        (self.max_rows != 0 && rows > self.max_rows) || (self.max_bytes != 0 && bytes > self.max_bytes)
    }

    /// `Ok(true)` while within limits, `Ok(false)` once crossed under a
    /// non-throwing policy.
    ///
    /// # Errors
    /// [`FqError::LimitExceeded`] when crossed under [`OverflowMode::Throw`].
    pub fn check(&self, rows: u64, bytes: u64, what: &str) -> Result<bool> {
        if !self.exceeded(rows, bytes) {
            return Ok(true);
        }
        match self.mode {
            OverflowMode::Throw => Err(FqError::LimitExceeded(format!(
                "{what}: {rows} rows ({bytes} bytes), maximum {} rows ({} bytes)",
                self.max_rows, self.max_bytes
            ))),
            OverflowMode::Break | OverflowMode::Any => Ok(false),
        }
    }
}

/// Limits every stream may carry, checked against its own progress.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalLimits {
    pub size: SizeLimits,
    pub max_execution_time: Option<Duration>,
    pub timeout_overflow_mode: OverflowMode,
    /// Rows per second; zero disables the check.
    pub min_execution_speed: u64,
    pub timeout_before_checking_execution_speed: Duration,
}

impl LocalLimits {
    /// Read limits of a source stream.
    pub fn for_read(settings: &Settings) -> Self {
        Self {
            size: SizeLimits::new(
                settings.max_rows_to_read,
                settings.max_bytes_to_read,
                settings.read_overflow_mode,
            ),
            max_execution_time: (settings.max_execution_time_ms > 0)
                .then(|| Duration::from_millis(settings.max_execution_time_ms)),
            timeout_overflow_mode: settings.timeout_overflow_mode,
            min_execution_speed: 0,
            timeout_before_checking_execution_speed: Duration::from_millis(
                settings.timeout_before_checking_execution_speed_ms,
            ),
        }
    }

    /// Limits on the final result.
    pub fn for_result(settings: &Settings) -> Self {
        Self {
            size: SizeLimits::new(
                settings.max_result_rows,
                settings.max_result_bytes,
                OverflowMode::Throw,
            ),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_unlimited() && self.max_execution_time.is_none() && self.min_execution_speed == 0
    }

    /// Checks the elapsed-time cap; `Ok(false)` asks the stream to stop.
    pub fn check_time(&self, started: Instant) -> Result<bool> {
        let Some(max) = self.max_execution_time else {
            return Ok(true);
        };
        let elapsed = started.elapsed();
        if elapsed <= max {
            return Ok(true);
        }
        match self.timeout_overflow_mode {
            OverflowMode::Throw => Err(FqError::LimitExceeded(format!(
                "timeout exceeded: elapsed {:.3}s, maximum {:.3}s",
                elapsed.as_secs_f64(),
                max.as_secs_f64()
            ))),
            _ => Ok(false),
        }
    }

    /// Fails when fewer than `min_execution_speed` rows per second were read
    /// once the grace period is over.
    pub fn check_speed(&self, started: Instant, rows: u64) -> Result<()> {
        if self.min_execution_speed == 0 {
            return Ok(());
        }
        let elapsed = started.elapsed();
        if elapsed <= self.timeout_before_checking_execution_speed || elapsed.is_zero() {
            return Ok(());
        }
        let speed = rows as f64 / elapsed.as_secs_f64();
        if speed < self.min_execution_speed as f64 {
            return Err(FqError::LimitExceeded(format!(
                "query is executing too slow: {speed:.1} rows/sec, minimum {}",
                self.min_execution_speed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_limits_follow_overflow_mode() {
        let throw = SizeLimits::new(10, 0, OverflowMode::Throw);
        assert!(throw.check(10, 1_000_000, "read").expect("within"));
        assert!(matches!(
            throw.check(11, 0, "read"),
            Err(FqError::LimitExceeded(_))
        ));
        let brk = SizeLimits::new(0, 100, OverflowMode::Break);
        assert!(!brk.check(1, 101, "read").expect("break"));
        assert!(SizeLimits::default().check(u64::MAX, u64::MAX, "x").expect("unlimited"));
    }

    #[test]
    fn time_limit_breaks_or_throws() {
        let started = Instant::now() - Duration::from_secs(5);
        let mut limits = LocalLimits {
            max_execution_time: Some(Duration::from_secs(1)),
            timeout_overflow_mode: OverflowMode::Break,
            ..LocalLimits::default()
        };
        assert!(!limits.check_time(started).expect("break"));
        limits.timeout_overflow_mode = OverflowMode::Throw;
        assert!(limits.check_time(started).is_err());
        assert!(limits.check_time(Instant::now()).expect("fresh"));
    }
}
