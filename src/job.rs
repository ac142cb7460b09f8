use crate::error::ScopeError;
use std::time::Duration;

/// A long-running process that completes, fails, or runs out of time.
///
/// Acquisitions implement this so callers can drive them the same way on the
/// calling thread or a worker thread.
pub trait Job {
    /// The type returned on completion
    type Output;

    /// Run the job, giving up once `timeout` has elapsed
    fn run(&mut self, timeout: Duration) -> Result<Self::Output, ScopeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountdownJob {
        remaining: u32,
    }

    impl Job for CountdownJob {
        type Output = u32;

        fn run(&mut self, timeout: Duration) -> Result<Self::Output, ScopeError> {
            if timeout.is_zero() {
                return Err(ScopeError::Collaborator("no time left".to_string()));
            }
            let mut ticks = 0;
            while self.remaining > 0 {
                self.remaining -= 1;
                ticks += 1;
            }
            Ok(ticks)
        }
    }

    #[test]
    fn test_job_completes() {
        let mut job = CountdownJob { remaining: 3 };
        assert_eq!(job.run(Duration::from_secs(1)).unwrap(), 3);
        assert_eq!(job.run(Duration::from_secs(1)).unwrap(), 0);
    }

    #[test]
    fn test_job_without_time_fails() {
        let mut job = CountdownJob { remaining: 3 };
        assert!(job.run(Duration::ZERO).is_err());
    }
}
