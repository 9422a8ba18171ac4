//! Small helpers shared across the protocol stack.

use std::time::Duration;

/// Retries `op` up to `bound` times while `transient` classifies the error as
/// retryable, sleeping `delay` between attempts.
///
/// The last result is returned unchanged, so callers can map a still-transient
/// error to their own timeout kind.
pub fn with_retry<T, E>(
    bound: usize,
    delay: Duration,
    mut op: impl FnMut() -> Result<T, E>,
    mut transient: impl FnMut(&E) -> bool,
) -> Result<T, E> {
    assert!(bound > 0);

    let mut result = op();

    for attempt in 1..bound {
        match &result {
            Ok(_) => break,
            Err(e) if transient(e) => {
                tracing::trace!("transient failure, retry {attempt}/{bound}");
                std::thread::sleep(delay);
                result = op();
            }
            Err(_) => break,
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_success() {
        let mut calls = 0;
        let result: Result<u32, ()> = with_retry(
            10,
            Duration::ZERO,
            || {
                calls += 1;
                Ok(7)
            },
            |_| true,
        );
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_transient_until_success() {
        let mut calls = 0;
        let result: Result<u32, &str> = with_retry(
            10,
            Duration::ZERO,
            || {
                calls += 1;
                if calls < 4 { Err("wait") } else { Ok(42) }
            },
            |e| *e == "wait",
        );
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 4);
    }

    #[test]
    fn gives_up_after_bound() {
        let mut calls = 0;
        let result: Result<(), &str> = with_retry(
            5,
            Duration::ZERO,
            || {
                calls += 1;
                Err("wait")
            },
            |e| *e == "wait",
        );
        assert_eq!(result, Err("wait"));
        assert_eq!(calls, 5);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), &str> = with_retry(
            5,
            Duration::ZERO,
            || {
                calls += 1;
                Err("fault")
            },
            |e| *e == "wait",
        );
        assert_eq!(result, Err("fault"));
        assert_eq!(calls, 1);
    }
}
