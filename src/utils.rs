use std::time::{Duration, Instant};

/// Why [`poll_until`] gave up.
#[derive(Debug, PartialEq)]
pub enum PollError<E> {
    /// The deadline passed after `polls` unproductive attempts
    Expired { polls: usize },
    /// The check itself failed
    Failed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Expired { polls } => write!(f, "deadline passed after {polls} polls"),
            PollError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PollError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Expired { .. } => None,
            PollError::Failed(e) => Some(e),
        }
    }
}

/// Call `check` until it yields a value, the deadline passes, or it fails.
///
/// `Ok(None)` means "not yet" and is followed by a sleep of `interval`. The
/// check always runs at least once, so a frame that is already waiting is
/// picked up even with a zero timeout.
pub fn poll_until<T, E>(
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Result<Option<T>, E>,
) -> Result<T, PollError<E>> {
    let deadline = Instant::now() + timeout;
    let mut polls = 0usize;

    loop {
        polls += 1;
        if let Some(value) = check().map_err(PollError::Failed)? {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            return Err(PollError::Expired { polls });
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_returns_first_ready_value() {
        let mut frames: VecDeque<Option<u8>> = VecDeque::from([None, None, Some(7), Some(9)]);
        let result = poll_until(Duration::from_secs(1), Duration::ZERO, || {
            Ok::<_, String>(frames.pop_front().flatten())
        });

        assert_eq!(result, Ok(7));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_zero_timeout_still_checks_once() {
        let result = poll_until(Duration::ZERO, Duration::ZERO, || Ok::<_, String>(Some("ready")));
        assert_eq!(result, Ok("ready"));

        let result = poll_until(Duration::ZERO, Duration::ZERO, || Ok::<Option<()>, String>(None));
        assert_eq!(result, Err(PollError::Expired { polls: 1 }));
    }

    #[test]
    fn test_expires_when_never_ready() {
        let result = poll_until(Duration::from_millis(20), Duration::from_millis(2), || {
            Ok::<Option<()>, String>(None)
        });

        match result {
            Err(PollError::Expired { polls }) => assert!(polls >= 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_check_failure_stops_immediately() {
        let mut calls = 0;
        let result = poll_until(Duration::from_secs(1), Duration::ZERO, || {
            calls += 1;
            Err::<Option<()>, _>("checksum mismatch".to_string())
        });

        assert_eq!(result, Err(PollError::Failed("checksum mismatch".to_string())));
        assert_eq!(calls, 1);
    }
}
