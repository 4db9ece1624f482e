// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Generic time for delays and timeouts, in the style of `hickory-proto`'s
//! `Time`/`TokioTime`: an abstraction boundary so tests can inject
//! deterministic timing instead of depending on wall-clock scheduling.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// A suspension future: either the original future's output, or nothing
/// if the duration elapsed first.
#[async_trait]
pub trait Clock: Clone + Send + Sync + 'static {
    /// Suspends the caller until `duration` has elapsed.
    async fn sleep(&self, duration: Duration);

    /// Races `future` against `duration`, returning `None` on elapse.
    async fn timeout<F>(&self, duration: Duration, future: F) -> Option<F::Output>
    where
        F: Future + Send,
        F::Output: Send;
}

/// Production clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }

    async fn timeout<F>(&self, duration: Duration, future: F) -> Option<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        tokio::time::timeout(duration, future).await.ok()
    }
}

/// The deterministic clock tests inject in place of [`TokioClock`]. A thin
/// pass-through to `tokio::time`, meant to be paired with
/// `#[tokio::test(start_paused = true)]` and `tokio::time::advance` so
/// idle-disconnect and timeout tests step time explicitly instead of racing
/// wall-clock scheduling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualClock;

impl ManualClock {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for ManualClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }

    async fn timeout<F>(&self, duration: Duration, future: F) -> Option<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        tokio::time::timeout(duration, future).await.ok()
    }
}
