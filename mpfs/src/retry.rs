use std::time::Duration;

use crate::error::Error;

/// Retry policy for façade operations.
///
/// Driver errors are transient (a hiccup on the wire, a missed prompt) and
/// worth another attempt; everything else, in particular the remote file
/// system errors, is surfaced immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    tries: u32,
    delay: Duration,
    backoff: u32,
    sleep: fn(Duration),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            tries: 3,
            delay: Duration::from_secs(1),
            backoff: 2,
            sleep: std::thread::sleep,
        }
    }
}

impl RetryPolicy {
    /// The default policy: three attempts, backing off 1 s, 2 s, 4 s.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never sleeps, for tests.
    pub fn no_wait() -> Self {
        RetryPolicy {
            sleep: |_| {},
            ..Self::default()
        }
    }

    /// The backoff schedule, one delay per attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut delay = self.delay;
        (0..self.tries).map(move |_| {
            let current = delay;
            delay *= self.backoff;
            current
        })
    }

    /// Run `op`, retrying transient failures up to the attempt limit. The
    /// last error is surfaced once the attempts are exhausted.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
        let mut delay = self.delay;
        let mut last = None;

        for attempt in 1..=self.tries {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, error = %e, "transient driver error");
                    last = Some(e);
                    if attempt < self.tries {
                        (self.sleep)(delay);
                        delay *= self.backoff;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last.expect("at least one attempt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::DriverError;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_schedule_is_one_two_four() {
        let policy = RetryPolicy::new();
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn transient_errors_are_tried_three_times() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::no_wait().run(|| {
            calls += 1;
            Err(Error::Driver(DriverError::PromptLost))
        });
        assert_eq!(calls, 3);
        assert!(matches!(result, Err(Error::Driver(_))));
    }

    #[test]
    fn remote_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::no_wait().run(|| {
            calls += 1;
            Err(Error::Remote(
                crate::fs::RemoteIoError::NoSuchFileOrDirectory("x".into()),
            ))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(Error::Remote(_))));
    }

    #[test]
    fn success_after_a_failure_is_returned() {
        let mut calls = 0;
        let result = RetryPolicy::no_wait().run(|| {
            calls += 1;
            if calls < 2 {
                Err(Error::Driver(DriverError::PromptLost))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
