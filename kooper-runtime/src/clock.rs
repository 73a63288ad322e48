//! Injectable time source for polling loops and deadlines
use std::{sync::Arc, time::Duration};

use futures::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};

/// A source of timers
///
/// Everything in the runtime that waits for wall-clock time goes through a `Clock`,
/// so that the waiting can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    /// Resolves once `duration` has elapsed
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Yields once per `period`, starting one `period` from now
    fn ticker(&self, period: Duration) -> BoxStream<'static, ()>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        (**self).after(duration)
    }

    fn ticker(&self, period: Duration) -> BoxStream<'static, ()> {
        (**self).ticker(period)
    }
}

/// [`Clock`] backed by the Tokio timer
///
/// Honours `tokio::time::pause` and `tokio::time::advance`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }

    fn ticker(&self, period: Duration) -> BoxStream<'static, ()> {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        futures::stream::unfold(interval, |mut interval| async move {
            interval.tick().await;
            Some(((), interval))
        })
        .boxed()
    }
}
