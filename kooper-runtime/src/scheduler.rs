//! Delays items until their deadline, collapsing duplicates
use ahash::AHashMap;
use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use std::{
    collections::hash_map::Entry,
    hash::Hash,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// A request to emit `item` once `ready_at` has passed.
#[derive(Debug)]
pub struct DelayRequest<T> {
    pub item: T,
    pub ready_at: Instant,
}

/// Bookkeeping for an item waiting in the delay queue.
struct Waiting {
    ready_at: Instant,
    queue_key: delay_queue::Key,
}

#[pin_project(project = DelayingProj)]
pub struct Delaying<T, R> {
    /// Items waiting for their deadline.
    ///
    /// Only touched through `delay` and `poll_expired` so that `waiting` stays in sync.
    queue: DelayQueue<T>,
    /// Deadline of every item currently in `queue`, used to collapse duplicates.
    waiting: AHashMap<T, Waiting>,
    #[pin]
    requests: Fuse<R>,
}

impl<T: Hash + Eq + Clone, R> DelayingProj<'_, T, R> {
    /// Queue an item, keeping the earlier deadline when it is already waiting.
    fn delay(&mut self, request: DelayRequest<T>) {
        match self.waiting.entry(request.item) {
            Entry::Occupied(mut waiting) if waiting.get().ready_at > request.ready_at => {
                let waiting = waiting.get_mut();
                self.queue.reset_at(&waiting.queue_key, request.ready_at);
                waiting.ready_at = request.ready_at;
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                let item = entry.key().clone();
                entry.insert(Waiting {
                    ready_at: request.ready_at,
                    queue_key: self.queue.insert_at(item, request.ready_at),
                });
            }
        }
    }
}

impl<T, R> Stream for Delaying<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = DelayRequest<T>>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        while let Poll::Ready(Some(request)) = this.requests.as_mut().poll_next(cx) {
            this.delay(request);
        }

        match this.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let item = expired.into_inner();
                this.waiting.remove(&item);
                Poll::Ready(Some(item))
            }
            // nothing is waiting, finish only once no more requests can arrive
            Poll::Ready(None) if this.requests.is_terminated() => Poll::Ready(None),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

/// Emit every requested item at its `ready_at`.
///
/// An item requested again while it is still waiting is emitted only once, at the earlier of
/// the two deadlines. Once emitted, it can be requested again.
pub fn delaying<T, R>(requests: R) -> Delaying<T, R>
where
    T: Eq + Hash + Clone,
    R: Stream<Item = DelayRequest<T>>,
{
    Delaying {
        queue: DelayQueue::new(),
        waiting: AHashMap::new(),
        requests: requests.fuse(),
    }
}
