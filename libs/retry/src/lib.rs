//! Batched retry primitives.
//!
//! This library runs a unit operation against every item of a batch where
//! each item can fail independently of the others (tagging, linking or
//! protecting a set of freshly created instances). Key concepts:
//!
//! - **Retry policy**: how many attempts an item gets and how long to wait
//!   before each of them.
//! - **Outcome**: the terminal result for one item, index-aligned with the
//!   input batch.
//! - **Incomplete operation**: the aggregate failure carrying every item id
//!   and the per-item error, so callers can re-drive only the failures.
//!
//! # Invariants
//!
//! - One item's failure never blocks another item's attempts
//! - Attempt 1 is never delayed; attempt `k > 1` waits `base * 2^(k-2)`
//! - An item never starts attempt `k + 1` before attempt `k` has resolved
//! - Outcomes are returned in input order regardless of completion order

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of attempts per item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff base.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default number of items worked on at the same time.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Attempt cap and deterministic exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts per item (at least 1).
    pub max_attempts: u32,

    /// Delay before attempt 2; doubles for every later attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy. A zero attempt count is raised to one.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay to wait before the given (1-based) attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Terminal failure of a single item.
#[derive(Debug, Error)]
pub enum BatchFailure<E> {
    /// Every attempt returned an error; the last one is kept.
    #[error("{error} (after {attempts} attempts)")]
    Exhausted {
        attempts: u32,
        #[source]
        error: E,
    },

    /// The operation panicked. Panics are not retried.
    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl<E> BatchFailure<E> {
    /// The operation error, if the failure was not a panic.
    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { error, .. } => Some(error),
            Self::Panicked(_) => None,
        }
    }
}

/// Result for one item of a batch.
pub type BatchOutcome<E> = Result<(), BatchFailure<E>>;

/// One or more items of a batched operation failed after retries.
#[derive(Debug, Error)]
#[error(
    "incomplete operation '{operation}': all_item_ids={}; errors={}",
    .all_item_ids.join("|"),
    describe_errors(.errors)
)]
pub struct IncompleteOperation<E: fmt::Display> {
    /// Name of the operation (for logs and error messages).
    pub operation: String,

    /// Every item the operation was attempted on, in input order.
    pub all_item_ids: Vec<String>,

    /// Failed item id -> failure.
    pub errors: BTreeMap<String, BatchFailure<E>>,
}

impl<E: fmt::Display> IncompleteOperation<E> {
    /// Ids of the items that failed, for re-driving the operation.
    pub fn failed_item_ids(&self) -> Vec<String> {
        self.errors.keys().cloned().collect()
    }
}

fn describe_errors<E: fmt::Display>(errors: &BTreeMap<String, BatchFailure<E>>) -> String {
    errors
        .iter()
        .map(|(id, failure)| format!("'{}' => '{}'", id, failure))
        .collect::<Vec<_>>()
        .join("|")
}

/// Runs an operation over a batch with per-item retries.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    policy: RetryPolicy,
    concurrency: usize,
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl BatchExecutor {
    /// Create an executor that works on one item at a time.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Work on up to `concurrency` items at the same time.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// The retry policy applied to every item.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` on every item, returning one outcome per item in
    /// input order.
    pub async fn run_batch<T, F, Fut, E>(&self, items: &[T], operation: F) -> Vec<BatchOutcome<E>>
    where
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let operation = &operation;
        stream::iter(items.iter().enumerate())
            .map(|(index, item)| self.run_item(index, item, operation))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// Run `operation` on every item and fold the outcomes into a single
    /// result. Items are identified by their `Display` form.
    pub async fn run_batch_operation<T, F, Fut, E>(
        &self,
        operation_name: &str,
        items: &[T],
        operation: F,
    ) -> Result<(), IncompleteOperation<E>>
    where
        T: fmt::Display,
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let outcomes = self.run_batch(items, operation).await;

        let mut errors = BTreeMap::new();
        for (item, outcome) in items.iter().zip(outcomes) {
            if let Err(failure) = outcome {
                errors.insert(item.to_string(), failure);
            }
        }

        if errors.is_empty() {
            return Ok(());
        }

        warn!(
            operation = operation_name,
            failed = errors.len(),
            total = items.len(),
            "Batch operation incomplete"
        );

        Err(IncompleteOperation {
            operation: operation_name.to_string(),
            all_item_ids: items.iter().map(|item| item.to_string()).collect(),
            errors,
        })
    }

    async fn run_item<T, F, Fut, E>(&self, index: usize, item: &T, operation: &F) -> BatchOutcome<E>
    where
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!(
                    index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            let result = AssertUnwindSafe(async { operation(item).await })
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(error)) if attempt >= self.policy.max_attempts => {
                    warn!(index, attempt, error = %error, "Retries exhausted");
                    return Err(BatchFailure::Exhausted {
                        attempts: attempt,
                        error,
                    });
                }
                Ok(Err(error)) => {
                    debug!(index, attempt, error = %error, "Attempt failed");
                    attempt += 1;
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(index, attempt, panic = %message, "Operation panicked");
                    return Err(BatchFailure::Panicked(message));
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    struct OpError(String);

    impl fmt::Display for OpError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(10))
    }

    #[rstest]
    #[case(1, 0)]
    #[case(2, 1000)]
    #[case(3, 2000)]
    #[case(4, 4000)]
    #[case(5, 8000)]
    fn test_delay_before(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_policy_never_zero_attempts() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_all_items_succeed() {
        let executor = BatchExecutor::new(fast_policy());
        let items = vec![1, 2, 3, 4];

        let outcomes = executor
            .run_batch(&items, |_| async { Ok::<(), OpError>(()) })
            .await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|o| o.is_ok()));
    }

    #[tokio::test]
    async fn test_one_permanent_failure_is_index_aligned() {
        let executor = BatchExecutor::new(fast_policy()).with_concurrency(4);
        let items = vec![1, 2, 3, 4];
        let calls = Mutex::new(BTreeMap::<i32, u32>::new());

        let outcomes = executor
            .run_batch(&items, |item| {
                *calls.lock().unwrap().entry(*item).or_default() += 1;
                let item = *item;
                async move {
                    if item == 3 {
                        Err(OpError(format!("error-{}", item)))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        let failed: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_err())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(failed, vec![2]);

        let calls = calls.lock().unwrap();
        assert_eq!(calls[&3], 3);
        assert_eq!(calls[&1], 1);
        assert_eq!(calls[&4], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intermittent_failure_recovers_on_last_attempt() {
        let executor = BatchExecutor::new(RetryPolicy::default());
        let items = vec!["i-1", "i-2", "i-3", "i-4"];
        let calls = Mutex::new(0u32);
        let started = tokio::time::Instant::now();

        let outcomes = executor
            .run_batch(&items, |item| {
                let attempt = if *item == "i-3" {
                    let mut calls = calls.lock().unwrap();
                    *calls += 1;
                    *calls
                } else {
                    3
                };
                async move {
                    if attempt < 3 {
                        Err(OpError("not yet".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(*calls.lock().unwrap(), 3);
        // 1s before attempt 2, 2s before attempt 3
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_panic_is_captured_and_batch_continues() {
        let executor = BatchExecutor::new(fast_policy());
        let items = vec![1, 2, 3];
        let calls = Mutex::new(BTreeMap::<i32, u32>::new());

        let outcomes = executor
            .run_batch(&items, |item| {
                *calls.lock().unwrap().entry(*item).or_default() += 1;
                let item = *item;
                async move {
                    if item == 2 {
                        panic!("boom-{}", item);
                    }
                    Ok::<(), OpError>(())
                }
            })
            .await;

        assert!(outcomes[0].is_ok());
        assert!(outcomes[2].is_ok());
        match &outcomes[1] {
            Err(BatchFailure::Panicked(message)) => assert_eq!(message, "boom-2"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(calls.lock().unwrap()[&2], 1);
    }

    #[tokio::test]
    async fn test_run_batch_operation_reports_failed_subset() {
        let executor = BatchExecutor::new(fast_policy());
        let items = vec!["i-1", "i-2", "i-3", "i-4"];

        let err = executor
            .run_batch_operation("tag", &items, |item| {
                let fail = *item == "i-2" || *item == "i-4";
                let item = item.to_string();
                async move {
                    if fail {
                        Err(OpError(format!("error-{}", item)))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.operation, "tag");
        assert_eq!(err.all_item_ids, vec!["i-1", "i-2", "i-3", "i-4"]);
        assert_eq!(err.failed_item_ids(), vec!["i-2", "i-4"]);
        assert_eq!(
            err.errors["i-2"].error(),
            Some(&OpError("error-i-2".to_string()))
        );

        let message = err.to_string();
        assert!(message.contains("all_item_ids=i-1|i-2|i-3|i-4"));
        assert!(message.contains("'i-4' => 'error-i-4 (after 3 attempts)'"));
    }

    #[tokio::test]
    async fn test_run_batch_operation_ok_when_clean() {
        let executor = BatchExecutor::default();
        let items = vec!["i-1"];

        let result = executor
            .run_batch_operation("protect", &items, |_| async { Ok::<(), OpError>(()) })
            .await;

        assert!(result.is_ok());
    }
}
