use crate::item::{now_seconds, Item};
use crate::DrainError;
use std::time::Duration;

/// What a remote status code means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Worth retrying the same call after a short sleep.
    Transient,
    /// Give up on the item for this pass.
    Deferred,
}

/// 2xx succeeds. Transport failure (0), 4xx and 503 are transient.
/// Everything else defers the whole item.
pub fn classify(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        0 | 400..=499 | 503 => Classification::Transient,
        _ => Classification::Deferred,
    }
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    Succeeded { status: u16, attempts: u32 },
    /// Either a hard error or the attempt cap ran out.
    Escalate { status: u16, attempts: u32 },
}

impl RetryVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryVerdict::Succeeded { .. })
    }
}

/// Immediate retry loop for soft errors.
pub struct BoundedRetry<'a> {
    max_attempts: u32,
    delay: Duration,
    sleeper: &'a dyn Sleeper,
}

impl<'a> BoundedRetry<'a> {
    pub fn new(max_attempts: u32, delay: Duration, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            sleeper,
        }
    }

    /// Run `call` (given the 1-based attempt number) until it succeeds,
    /// hits a deferring status, or exhausts the attempt cap.
    pub fn run<F>(&self, mut call: F) -> Result<RetryVerdict, DrainError>
    where
        F: FnMut(u32) -> Result<u16, DrainError>,
    {
        let mut attempt = 1;
        loop {
            let status = call(attempt)?;
            match classify(status) {
                Classification::Success => {
                    return Ok(RetryVerdict::Succeeded { status, attempts: attempt });
                }
                Classification::Deferred => {
                    tracing::warn!(status, attempt, "remote call failed hard");
                    return Ok(RetryVerdict::Escalate { status, attempts: attempt });
                }
                Classification::Transient if attempt >= self.max_attempts => {
                    tracing::warn!(status, attempt, "retry count reached max_block_count");
                    return Ok(RetryVerdict::Escalate { status, attempts: attempt });
                }
                Classification::Transient => {
                    tracing::info!(
                        status,
                        attempt,
                        delay_secs = self.delay.as_secs(),
                        "transient failure, sleeping before retry"
                    );
                    self.sleeper.sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Whole-item backoff recorded in RETRY.
#[derive(Debug, Clone, Copy)]
pub struct DeferredRetry {
    retry_delay: Duration,
}

impl DeferredRetry {
    pub fn new(retry_delay: Duration) -> Self {
        Self { retry_delay }
    }

    pub fn next_retry_at(&self, now: i64) -> i64 {
        now + self.retry_delay.as_secs() as i64
    }

    /// Write RETRY unless one is already set. Returns the time the item
    /// becomes eligible again.
    pub fn schedule(&self, item: &Item, now: i64) -> Result<i64, DrainError> {
        let retry = item.retry();
        if retry.exists() {
            return item.retry_time();
        }
        let at = self.next_retry_at(now);
        retry.write(&at.to_string())?;
        tracing::info!(item = %item.name(), retry_at = at, "retry scheduled");
        Ok(at)
    }

    pub fn schedule_now(&self, item: &Item) -> Result<i64, DrainError> {
        self.schedule(item, now_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: RefCell<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.borrow_mut().push(duration);
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(200), Classification::Success);
        assert_eq!(classify(201), Classification::Success);
        assert_eq!(classify(0), Classification::Transient);
        assert_eq!(classify(403), Classification::Transient);
        assert_eq!(classify(503), Classification::Transient);
        assert_eq!(classify(500), Classification::Deferred);
        assert_eq!(classify(502), Classification::Deferred);
        assert_eq!(classify(302), Classification::Deferred);
    }

    #[test]
    fn test_transient_then_success() {
        let sleeper = RecordingSleeper::default();
        let retry = BoundedRetry::new(5, Duration::from_secs(7), &sleeper);
        let mut statuses = vec![503, 0, 200].into_iter();

        let verdict = retry.run(|_| Ok(statuses.next().unwrap())).unwrap();
        assert_eq!(verdict, RetryVerdict::Succeeded { status: 200, attempts: 3 });
        assert_eq!(sleeper.slept.borrow().len(), 2);
        assert_eq!(sleeper.slept.borrow()[0], Duration::from_secs(7));
    }

    #[test]
    fn test_cap_escalates() {
        let sleeper = RecordingSleeper::default();
        let retry = BoundedRetry::new(3, Duration::from_secs(1), &sleeper);
        let mut calls = 0;

        let verdict = retry
            .run(|_| {
                calls += 1;
                Ok(404)
            })
            .unwrap();
        assert_eq!(verdict, RetryVerdict::Escalate { status: 404, attempts: 3 });
        assert_eq!(calls, 3);
        assert_eq!(sleeper.slept.borrow().len(), 2);
    }

    #[test]
    fn test_hard_error_escalates_immediately() {
        let sleeper = RecordingSleeper::default();
        let retry = BoundedRetry::new(10, Duration::from_secs(1), &sleeper);

        let verdict = retry.run(|_| Ok(500)).unwrap();
        assert_eq!(verdict, RetryVerdict::Escalate { status: 500, attempts: 1 });
        assert!(sleeper.slept.borrow().is_empty());
    }

    #[test]
    fn test_deferred_keeps_existing_retry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ITEM")).unwrap();
        let item = Item::new(dir.path(), "ITEM");
        let deferred = DeferredRetry::new(Duration::from_secs(2400));

        assert_eq!(deferred.schedule(&item, 1000).unwrap(), 3400);
        assert_eq!(item.retry().read().unwrap(), "3400");

        assert_eq!(deferred.schedule(&item, 5000).unwrap(), 3400);
        assert_eq!(item.retry().read().unwrap(), "3400");
    }
}
