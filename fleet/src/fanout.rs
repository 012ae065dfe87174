//! Run a check against every member of a set concurrently.

use futures::future::join_all;
use std::{fmt::Debug, future::Future};

/// Run `check` against every item concurrently and return every outcome, in input order.
///
/// Returns only after all checks have completed: a failing check does not cancel the others.
pub async fn wait_for<'a, T, F, Fut, O>(items: &'a [T], check: F) -> Vec<O>
where
    F: FnMut(&'a T) -> Fut,
    Fut: Future<Output = O>,
{
    join_all(items.iter().map(check)).await
}

/// Panic listing every failed outcome.
pub fn assert_all<T, E: Debug>(outcomes: &[Result<T, E>]) {
    let failures: Vec<_> = outcomes
        .iter()
        .enumerate()
        .filter_map(|(index, outcome)| outcome.as_ref().err().map(|err| (index, err)))
        .collect();
    assert!(failures.is_empty(), "checks failed: {failures:?}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Clock, Runner};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    #[test_traced]
    fn test_all_checks_complete() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let delays = [3u64, 1, 2, 5];
            let completed = AtomicUsize::new(0);
            let started = context.current();
            let outcomes = wait_for(&delays, |delay| {
                let context = context.clone();
                let completed = &completed;
                async move {
                    context.sleep(Duration::from_secs(*delay)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    if *delay % 2 == 0 {
                        Err(*delay)
                    } else {
                        Ok(*delay)
                    }
                }
            })
            .await;

            // Every check ran, concurrently
            assert_eq!(completed.load(Ordering::SeqCst), delays.len());
            assert_eq!(
                context.current().duration_since(started).unwrap(),
                Duration::from_secs(5)
            );
            assert_eq!(outcomes, vec![Ok(3), Ok(1), Err(2), Ok(5)]);
        });
    }

    #[test]
    fn test_empty() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let outcomes: Vec<()> = wait_for(&[] as &[u8], |_| async {}).await;
            assert!(outcomes.is_empty());
        });
    }

    #[test]
    #[should_panic(expected = "checks failed")]
    fn test_assert_all() {
        assert_all::<(), _>(&[Ok(()), Err("stalled"), Ok(())]);
    }
}
