//! Event sources that feed object keys into the work queue
//!
//! An [`Informer`] keeps a [`Store`] of the objects it has seen, queues the key of every
//! object that changes, and periodically queues every known key again so that a missed
//! change is eventually picked up.
use std::{fmt::Debug, sync::Arc, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use educe::Educe;
use futures::{future, stream::BoxStream, Stream, StreamExt};
use kooper_core::ObjectKey;
use kube_client::{Api, Resource};
use kube_runtime::watcher;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, TokioClock},
    workqueue::WorkQueue,
};

/// Errors raised by event sources
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Stream of changes consumed by an [`Informer`]
pub type EventStream<K> = BoxStream<'static, Result<Event<K>, SourceError>>;

/// A change observed on the watched objects
#[derive(Clone, Debug, PartialEq)]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    Deleted(K),
    /// The source was (re)listed, and these are all objects that currently exist
    ///
    /// Any object seen before but missing here should be assumed deleted.
    Restarted(Vec<K>),
}

/// Something that produces object keys for a controller
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Prepare the source before any key is produced
    ///
    /// Called once per controller start, before the workers are spawned.
    async fn initialize(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Feed keys into `queue` until `shutdown` is cancelled
    ///
    /// Every known key should be queued again each `resync_interval`.
    async fn run(&self, queue: WorkQueue<String>, resync_interval: Duration, shutdown: CancellationToken);
}

#[async_trait]
impl<S: EventSource + ?Sized> EventSource for Arc<S> {
    async fn initialize(&self) -> Result<(), SourceError> {
        (**self).initialize().await
    }

    async fn run(&self, queue: WorkQueue<String>, resync_interval: Duration, shutdown: CancellationToken) {
        (**self).run(queue, resync_interval, shutdown).await;
    }
}

/// A readable cache of the objects seen by an [`Informer`]
///
/// Cloning produces a new handle to the same cache.
#[derive(Educe)]
#[educe(Clone)]
pub struct Store<K> {
    objects: Arc<RwLock<AHashMap<String, Arc<K>>>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: Arc::default(),
        }
    }
}

impl<K: Resource> Store<K> {
    /// The cached object for `key`, as `namespace/name` or `name`
    ///
    /// This is a cache and may be stale.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }

    /// All cached objects
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.objects.read().values().cloned().collect()
    }

    /// Keys of all cached objects
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Apply an event, returning the keys that changed
    pub(crate) fn apply(&self, event: Event<K>) -> Vec<String> {
        match event {
            Event::Applied(obj) => key_of(&obj).map_or_else(Vec::new, |key| {
                self.objects.write().insert(key.clone(), Arc::new(obj));
                vec![key]
            }),
            Event::Deleted(obj) => key_of(&obj).map_or_else(Vec::new, |key| {
                self.objects.write().remove(&key);
                vec![key]
            }),
            Event::Restarted(objs) => {
                let fresh = objs
                    .into_iter()
                    .filter_map(|obj| Some((key_of(&obj)?, Arc::new(obj))))
                    .collect::<AHashMap<_, _>>();
                let mut objects = self.objects.write();
                let mut changed = objects
                    .keys()
                    .filter(|key| !fresh.contains_key(*key))
                    .cloned()
                    .collect::<Vec<_>>();
                changed.extend(fresh.keys().cloned());
                *objects = fresh;
                changed
            }
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> Option<String> {
    let key = ObjectKey::from_meta(obj.meta());
    if key.is_none() {
        tracing::warn!("ignoring object without a name");
    }
    key.map(|key| key.to_string())
}

/// Maintains a [`Store`] from a stream of [`Event`]s and queues the keys of changed objects
pub struct Informer<K> {
    events: Box<dyn Fn() -> EventStream<K> + Send + Sync>,
    store: Store<K>,
    clock: Arc<dyn Clock>,
    backoff: ExponentialBuilder,
}

impl<K> Informer<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Informer over the streams produced by `events`
    ///
    /// `events` is called again whenever the previous stream ends.
    pub fn new<F>(events: F) -> Self
    where
        F: Fn() -> EventStream<K> + Send + Sync + 'static,
    {
        Self {
            events: Box::new(events),
            store: Store::default(),
            clock: Arc::new(TokioClock),
            backoff: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(800))
                .with_max_delay(Duration::from_secs(30))
                .with_factor(2.0)
                .with_max_times(usize::MAX),
        }
    }

    /// Use a different time source for resyncs and backoff
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Use a different backoff after stream errors
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// A read handle to the objects seen so far
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    fn resync(&self, queue: &WorkQueue<String>) {
        let keys = self.store.keys();
        tracing::debug!(objects = keys.len(), "resyncing");
        for key in keys {
            queue.add(key);
        }
    }
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Informer over a [`kube_runtime::watcher`] on `api`
    pub fn watch(api: Api<K>, config: watcher::Config) -> Self {
        Self::new(move || from_watcher(watcher(api.clone(), config.clone())).boxed())
    }
}

/// Collapse the initial listing of a watcher into a single [`Event::Restarted`]
fn from_watcher<K>(
    stream: impl Stream<Item = watcher::Result<watcher::Event<K>>>,
) -> impl Stream<Item = Result<Event<K>, SourceError>> {
    stream
        .scan(None::<Vec<K>>, |listing, event| {
            let event = match event {
                Ok(watcher::Event::Apply(obj)) => Some(Ok(Event::Applied(obj))),
                Ok(watcher::Event::Delete(obj)) => Some(Ok(Event::Deleted(obj))),
                Ok(watcher::Event::Init) => {
                    *listing = Some(Vec::new());
                    None
                }
                Ok(watcher::Event::InitApply(obj)) => {
                    listing.get_or_insert_with(Vec::new).push(obj);
                    None
                }
                Ok(watcher::Event::InitDone) => Some(Ok(Event::Restarted(listing.take().unwrap_or_default()))),
                Err(err) => Some(Err(SourceError::from(err))),
            };
            future::ready(Some(event))
        })
        .filter_map(future::ready)
}

#[async_trait]
impl<K> EventSource for Informer<K>
where
    K: Resource + Send + Sync + 'static,
{
    #[tracing::instrument(skip_all)]
    async fn run(&self, queue: WorkQueue<String>, resync_interval: Duration, shutdown: CancellationToken) {
        let mut resyncs = self.clock.ticker(resync_interval);
        let mut backoff = self.backoff.clone().build();
        loop {
            let mut events = (self.events)();
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    Some(()) = resyncs.next() => self.resync(&queue),
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            backoff = self.backoff.clone().build();
                            for key in self.store.apply(event) {
                                queue.add(key);
                            }
                        }
                        Some(Err(err)) => {
                            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                            tracing::warn!(error = %err, ?delay, "event stream failed, backing off");
                            tokio::select! {
                                () = shutdown.cancelled() => return,
                                () = self.clock.after(delay) => {}
                            }
                        }
                        None => break,
                    }
                }
            }
            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            tracing::debug!(?delay, "event stream ended, restarting");
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = self.clock.after(delay) => {}
            }
        }
    }
}
