//! Bounded polling helpers.
//!
//! Turn "eventually true" device state into a synchronous yes/no with a hard
//! deadline. A predicate that fails counts as not satisfied yet.

use std::{
    fmt::Display,
    future::Future,
    time::{Duration, Instant},
};

/// Outcome of one predicate evaluation.
pub trait Satisfied {
    fn satisfied(self) -> bool;
}

impl Satisfied for bool {
    fn satisfied(self) -> bool {
        self
    }
}

impl<E: Display> Satisfied for Result<bool, E> {
    fn satisfied(self) -> bool {
        match self {
            Ok(done) => done,
            Err(err) => {
                log::debug!("Predicate not satisfied yet: {err}");
                false
            }
        }
    }
}

/// Re-evaluate `predicate` every `interval` until it holds or `deadline`
/// elapses. Returns whether it held.
pub fn wait_until<P, R>(mut predicate: P, deadline: Duration, interval: Duration) -> bool
where
    P: FnMut() -> R,
    R: Satisfied,
{
    let started = Instant::now();
    loop {
        if predicate().satisfied() {
            return true;
        }
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return false;
        }
        std::thread::sleep(interval.min(deadline - elapsed));
    }
}

/// Async variant of [`wait_until`] on the tokio timer.
pub async fn wait_until_async<P, F, R>(
    mut predicate: P,
    deadline: Duration,
    interval: Duration,
) -> bool
where
    P: FnMut() -> F,
    F: Future<Output = R>,
    R: Satisfied,
{
    let started = Instant::now();
    loop {
        if predicate().await.satisfied() {
            return true;
        }
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return false;
        }
        tokio::time::sleep(interval.min(deadline - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        cell::Cell,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    #[test]
    fn becomes_true_within_a_few_attempts() {
        let started = Instant::now();
        let attempts = Cell::new(0u32);
        let done = wait_until(
            || {
                attempts.set(attempts.get() + 1);
                started.elapsed() >= Duration::from_millis(30)
            },
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        assert!(done);
        assert!(attempts.get() <= 4, "took {} attempts", attempts.get());
    }

    #[test]
    fn gives_up_at_the_deadline() {
        let started = Instant::now();
        assert!(!wait_until(
            || false,
            Duration::from_millis(50),
            Duration::from_millis(10)
        ));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn errors_count_as_not_yet() {
        let calls = Cell::new(0u32);
        let done = wait_until(
            || -> Result<bool, String> {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("port not there yet".to_string())
                } else {
                    Ok(true)
                }
            },
            Duration::from_secs(1),
            Duration::from_millis(1),
        );
        assert!(done);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn async_variant_polls_the_future() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let done = wait_until_async(
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
            Duration::from_secs(1),
            Duration::from_millis(5),
        )
        .await;
        assert!(done);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
