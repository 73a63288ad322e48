//! Registration of CustomResourceDefinitions
//!
//! The [`CrdManager`] makes sure the definition backing a custom resource exists before
//! anything tries to watch it. Every operation first checks that the cluster is recent enough to
//! serve CustomResourceDefinitions at all, and fails without touching the cluster otherwise.
//!
//! A definition moves through the following states, which are reported in log fields:
//!
//! ```text
//! Absent -> Creating -> Pending -> Ready
//!              |           |
//!              |           +-> TimedOut
//!              +-> Ready (already registered)
//! ```
use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use kooper_client::ExtensionApi;
use kooper_core::{
    version::{ClusterVersion, ParseVersionError, MIN_CLUSTER_VERSION},
    CrdConf,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, TokioClock},
    informer::{EventSource, SourceError},
    workqueue::WorkQueue,
};

/// Interval between checks for a freshly created definition.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// How long a freshly created definition may take to be served.
pub const READY_TIMEOUT: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster version {found} is not supported, at least {minimum} is required")]
    UnsupportedClusterVersion {
        found: ClusterVersion,
        minimum: ClusterVersion,
    },

    #[error("timed out waiting for crd {name} to be present")]
    TimeoutWaitingForCrd { name: String },

    #[error("failed to get the cluster version: {0}")]
    ServerVersion(#[source] kooper_client::Error),

    #[error("failed to parse the cluster version: {0}")]
    InvalidVersion(#[source] ParseVersionError),

    #[error("error creating crd {name}: {source}")]
    Create {
        name: String,
        source: kooper_client::Error,
    },

    #[error("error deleting crd {name}: {source}")]
    Delete {
        name: String,
        source: kooper_client::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lifecycle of a definition as observed by the [`CrdManager`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrdState {
    /// Not registered
    Absent,
    /// Create request in flight
    Creating,
    /// Created, not yet served
    Pending,
    /// Served by the apiserver
    Ready,
    /// Gave up waiting for the definition to be served
    TimedOut,
    /// The cluster is too old to serve definitions
    Unsupported,
    /// Removed from the cluster
    Deleted,
}

impl fmt::Display for CrdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CrdState::Absent => "absent",
            CrdState::Creating => "creating",
            CrdState::Pending => "pending",
            CrdState::Ready => "ready",
            CrdState::TimedOut => "timed-out",
            CrdState::Unsupported => "unsupported",
            CrdState::Deleted => "deleted",
        })
    }
}

/// Creates, awaits and deletes CustomResourceDefinitions through an [`ExtensionApi`]
pub struct CrdManager<A, C = TokioClock> {
    api: A,
    clock: C,
    check_interval: Duration,
    ready_timeout: Duration,
}

impl<A: ExtensionApi> CrdManager<A> {
    /// Manage definitions through `api`, polling on the Tokio timer
    pub fn new(api: A) -> Self {
        Self {
            api,
            clock: TokioClock,
            check_interval: CHECK_INTERVAL,
            ready_timeout: READY_TIMEOUT,
        }
    }
}

impl<A: ExtensionApi, C: Clock> CrdManager<A, C> {
    /// Use a different time source for polling and deadlines
    pub fn with_clock<C2: Clock>(self, clock: C2) -> CrdManager<A, C2> {
        CrdManager {
            api: self.api,
            clock,
            check_interval: self.check_interval,
            ready_timeout: self.ready_timeout,
        }
    }

    /// Change how often a created definition is checked for, 2s by default
    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Change how long [`CrdManager::ensure_present`] waits for a created definition, 3m by default
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Fails unless the apiserver is at least [`MIN_CLUSTER_VERSION`]
    pub async fn validate_cluster_version(&self) -> Result<ClusterVersion> {
        let raw = self.api.server_version().await.map_err(Error::ServerVersion)?;
        let found = ClusterVersion::parse(&raw).map_err(Error::InvalidVersion)?;
        if found < MIN_CLUSTER_VERSION {
            tracing::error!(version = %found, state = %CrdState::Unsupported, "cluster too old for crds");
            return Err(Error::UnsupportedClusterVersion {
                found,
                minimum: MIN_CLUSTER_VERSION,
            });
        }
        Ok(found)
    }

    /// Register the definition declared by `conf`, waiting until it is served
    ///
    /// A definition that is already registered counts as present, and is not updated.
    ///
    /// # Errors
    /// [`Error::UnsupportedClusterVersion`] on old clusters, before anything is created.
    /// [`Error::TimeoutWaitingForCrd`] if a created definition is not served in time.
    #[tracing::instrument(skip_all, fields(crd = %conf.crd_name()))]
    pub async fn ensure_present(&self, conf: &CrdConf) -> Result<()> {
        self.validate_cluster_version().await?;
        let name = conf.crd_name();

        tracing::debug!(state = %CrdState::Creating, "creating crd");
        match self.api.create(&conf.to_definition()).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {
                tracing::info!(state = %CrdState::Ready, "crd already registered");
                return Ok(());
            }
            Err(source) => return Err(Error::Create { name, source }),
        }

        tracing::info!(state = %CrdState::Pending, "crd created");
        self.wait_to_be_present(&name, self.ready_timeout).await
    }

    /// Poll until the definition called `name` is served, or `timeout` elapses
    ///
    /// The cluster version is checked again before every poll.
    #[tracing::instrument(skip(self))]
    pub async fn wait_to_be_present(&self, name: &str, timeout: Duration) -> Result<()> {
        self.validate_cluster_version().await?;

        let mut deadline = self.clock.after(timeout);
        let mut checks = self.clock.ticker(self.check_interval);
        loop {
            tokio::select! {
                biased;
                () = &mut deadline => break,
                check = checks.next() => {
                    if check.is_none() {
                        break;
                    }
                    self.validate_cluster_version().await?;
                    match self.api.get(name).await {
                        Ok(_) => {
                            tracing::info!(state = %CrdState::Ready, "crd is present");
                            return Ok(());
                        }
                        Err(err) => tracing::debug!(error = %err, state = %CrdState::Pending, "crd not present yet"),
                    }
                }
            }
        }

        tracing::warn!(state = %CrdState::TimedOut, "gave up waiting for crd");
        Err(Error::TimeoutWaitingForCrd { name: name.into() })
    }

    /// Remove the definition called `name`
    ///
    /// Deleting a definition that is not registered succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.validate_cluster_version().await?;
        match self.api.delete(name).await {
            Ok(()) => tracing::info!(state = %CrdState::Deleted, "crd deleted"),
            Err(err) if err.is_not_found() => tracing::debug!(state = %CrdState::Absent, "crd already absent"),
            Err(source) => {
                return Err(Error::Delete {
                    name: name.into(),
                    source,
                })
            }
        }
        Ok(())
    }
}

/// An [`EventSource`] for a custom resource, registering its definition before it is watched
pub struct CrdSource<S, A, C = TokioClock> {
    conf: CrdConf,
    manager: CrdManager<A, C>,
    source: S,
}

impl<S, A, C> CrdSource<S, A, C>
where
    S: EventSource,
    A: ExtensionApi,
    C: Clock,
{
    /// Wrap `source`, which watches the resource declared by `conf`
    pub fn new(conf: CrdConf, manager: CrdManager<A, C>, source: S) -> Self {
        Self { conf, manager, source }
    }
}

#[async_trait]
impl<S, A, C> EventSource for CrdSource<S, A, C>
where
    S: EventSource,
    A: ExtensionApi,
    C: Clock,
{
    async fn initialize(&self) -> Result<(), SourceError> {
        self.manager.ensure_present(&self.conf).await?;
        self.source.initialize().await
    }

    async fn run(&self, queue: WorkQueue<String>, resync_interval: Duration, shutdown: CancellationToken) {
        self.source.run(queue, resync_interval, shutdown).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{CrdManager, CrdSource, Error};
    use crate::{clock::Clock, informer::EventSource};
    use ahash::AHashMap;
    use async_trait::async_trait;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kooper_client::ExtensionApi;
    use kooper_core::CrdConf;
    use kube_client::error::ErrorResponse;
    use parking_lot::Mutex;
    use futures::{
        future::BoxFuture,
        poll,
        stream::{self, BoxStream},
        FutureExt, StreamExt,
    };
    use std::{
        pin::pin,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        task::Poll,
        time::Duration,
    };
    use tokio::{sync::watch, time::Instant};

    /// In-memory apiextensions API
    pub(crate) struct FakeApi {
        version: String,
        crds: Mutex<AHashMap<String, CustomResourceDefinition>>,
        /// `get` calls answered with "not found" after a create
        hidden_gets: AtomicUsize,
        fail_create: AtomicBool,
        pub(crate) creates: AtomicUsize,
        pub(crate) gets: AtomicUsize,
        pub(crate) deletes: AtomicUsize,
    }

    impl FakeApi {
        pub(crate) fn new(version: &str) -> Arc<Self> {
            Arc::new(Self {
                version: version.into(),
                crds: Mutex::default(),
                hidden_gets: AtomicUsize::new(0),
                fail_create: AtomicBool::new(false),
                creates: AtomicUsize::new(0),
                gets: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            })
        }

        fn served_after(self: Arc<Self>, gets: usize) -> Arc<Self> {
            self.hidden_gets.store(gets, Ordering::SeqCst);
            self
        }

        fn with(self: Arc<Self>, conf: &CrdConf) -> Arc<Self> {
            self.crds.lock().insert(conf.crd_name(), conf.to_definition());
            self
        }

        fn stored(&self, name: &str) -> Option<CustomResourceDefinition> {
            self.crds.lock().get(name).cloned()
        }

        fn mutations(&self) -> usize {
            self.creates.load(Ordering::SeqCst) + self.deletes.load(Ordering::SeqCst)
        }
    }

    fn api_error(code: u16, reason: &str) -> kube_client::Error {
        kube_client::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: reason.into(),
            reason: reason.into(),
            code,
        })
    }

    #[async_trait]
    impl ExtensionApi for FakeApi {
        async fn create(&self, crd: &CustomResourceDefinition) -> kooper_client::Result<CustomResourceDefinition> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let name = crd.metadata.name.clone().unwrap_or_default();
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(kooper_client::Error::from_kube(&name, api_error(500, "InternalError")));
            }
            let mut crds = self.crds.lock();
            if crds.contains_key(&name) {
                return Err(kooper_client::Error::AlreadyExists { name });
            }
            crds.insert(name, crd.clone());
            Ok(crd.clone())
        }

        async fn get(&self, name: &str) -> kooper_client::Result<CustomResourceDefinition> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            let hidden = self
                .hidden_gets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            match self.stored(name) {
                Some(crd) if !hidden => Ok(crd),
                _ => Err(kooper_client::Error::NotFound { name: name.into() }),
            }
        }

        async fn delete(&self, name: &str) -> kooper_client::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            match self.crds.lock().remove(name) {
                Some(_) => Ok(()),
                None => Err(kooper_client::Error::NotFound { name: name.into() }),
            }
        }

        async fn server_version(&self) -> kooper_client::Result<String> {
            Ok(self.version.clone())
        }
    }

    /// Timer deadlines are rounded up to the next millisecond
    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed <= expected + Duration::from_millis(1),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    pub(crate) fn foos() -> CrdConf {
        CrdConf::new("Foo", "foos", "example.com", "v1")
    }

    #[tokio::test]
    async fn ensure_present_creates_and_waits_until_served() {
        tokio::time::pause();
        let api = FakeApi::new("v1.29.2").served_after(2);
        let start = Instant::now();
        CrdManager::new(api.clone()).ensure_present(&foos()).await.unwrap();

        assert_eq!(api.creates.load(Ordering::SeqCst), 1);
        assert_eq!(api.gets.load(Ordering::SeqCst), 3);
        assert_elapsed(start, Duration::from_secs(6));
        let stored = api.stored("foos.example.com").unwrap();
        assert_eq!(
            stored.spec.names.categories,
            Some(vec!["all".to_string(), "kooper".to_string()])
        );
        assert!(stored.spec.versions[0].subresources.is_none());
    }

    #[tokio::test]
    async fn ensure_present_is_idempotent() {
        tokio::time::pause();
        let api = FakeApi::new("v1.29.2");
        let manager = CrdManager::new(api.clone());
        manager.ensure_present(&foos()).await.unwrap();
        manager.ensure_present(&foos()).await.unwrap();
        assert_eq!(api.creates.load(Ordering::SeqCst), 2);
        assert_eq!(api.crds.lock().len(), 1);
    }

    #[tokio::test]
    async fn already_registered_crd_is_not_polled() {
        let api = FakeApi::new("v1.10.0").with(&foos());
        CrdManager::new(api.clone()).ensure_present(&foos()).await.unwrap();
        assert_eq!(api.creates.load(Ordering::SeqCst), 1);
        assert_eq!(api.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn old_clusters_are_rejected_before_any_mutation() {
        let api = FakeApi::new("v1.6.4").with(&foos());
        let manager = CrdManager::new(api.clone());

        let err = manager.ensure_present(&foos()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedClusterVersion { .. }), "{err}");
        let err = manager.delete("foos.example.com").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedClusterVersion { .. }), "{err}");
        let err = manager
            .wait_to_be_present("foos.example.com", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedClusterVersion { .. }), "{err}");

        assert_eq!(api.mutations(), 0);
        assert_eq!(api.gets.load(Ordering::SeqCst), 0);
        assert!(api.stored("foos.example.com").is_some());
    }

    #[tokio::test]
    async fn unparseable_versions_are_errors() {
        let api = FakeApi::new("not-a-version");
        let err = CrdManager::new(api.clone()).ensure_present(&foos()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidVersion(_)), "{err}");
        assert_eq!(api.mutations(), 0);
    }

    #[tokio::test]
    async fn waiting_times_out() {
        tokio::time::pause();
        let api = FakeApi::new("v1.29.2");
        let start = Instant::now();
        let err = CrdManager::new(api.clone())
            .wait_to_be_present("bars.example.com", Duration::from_secs(9))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimeoutWaitingForCrd { ref name } if name == "bars.example.com"));
        assert_elapsed(start, Duration::from_secs(9));
        // polled at 2s, 4s, 6s and 8s
        assert_eq!(api.gets.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn ensure_present_times_out_when_never_served() {
        tokio::time::pause();
        let api = FakeApi::new("v1.29.2").served_after(usize::MAX);
        let err = CrdManager::new(api)
            .with_ready_timeout(Duration::from_secs(5))
            .ensure_present(&foos())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "timed out waiting for crd foos.example.com to be present");
    }

    #[tokio::test]
    async fn create_failures_name_the_crd() {
        let api = FakeApi::new("v1.29.2");
        api.fail_create.store(true, Ordering::SeqCst);
        let err = CrdManager::new(api.clone()).ensure_present(&foos()).await.unwrap_err();
        assert!(err.to_string().starts_with("error creating crd foos.example.com"), "{err}");
        assert_eq!(api.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_removes_and_tolerates_missing() {
        let api = FakeApi::new("v1.29.2").with(&foos());
        let manager = CrdManager::new(api.clone());
        manager.delete("foos.example.com").await.unwrap();
        assert!(api.stored("foos.example.com").is_none());
        manager.delete("foos.example.com").await.unwrap();
        assert_eq!(api.deletes.load(Ordering::SeqCst), 2);
    }

    /// A clock that only moves when told to
    struct ManualClock {
        now: watch::Sender<Duration>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: watch::channel(Duration::ZERO).0,
            })
        }

        fn advance(&self, by: Duration) {
            self.now.send_modify(|now| *now += by);
        }
    }

    impl Clock for ManualClock {
        fn after(&self, duration: Duration) -> BoxFuture<'static, ()> {
            let mut now = self.now.subscribe();
            let deadline = *now.borrow() + duration;
            async move {
                while *now.borrow_and_update() < deadline {
                    if now.changed().await.is_err() {
                        return;
                    }
                }
            }
            .boxed()
        }

        fn ticker(&self, period: Duration) -> BoxStream<'static, ()> {
            let now = self.now.subscribe();
            let first = *now.borrow() + period;
            stream::unfold((now, first), move |(mut now, next)| async move {
                while *now.borrow_and_update() < next {
                    if now.changed().await.is_err() {
                        return None;
                    }
                }
                Some(((), (now, next + period)))
            })
            .boxed()
        }
    }

    #[tokio::test]
    async fn waiting_follows_an_injected_clock() {
        let clock = ManualClock::new();
        let api = FakeApi::new("v1.29.2").with(&foos()).served_after(1);
        let manager = CrdManager::new(api.clone()).with_clock(clock.clone());

        let mut wait = pin!(manager.wait_to_be_present("foos.example.com", Duration::from_secs(9)));
        assert!(poll!(&mut wait).is_pending());
        clock.advance(Duration::from_secs(2));
        assert!(poll!(&mut wait).is_pending());
        assert_eq!(api.gets.load(Ordering::SeqCst), 1);
        clock.advance(Duration::from_secs(2));
        assert!(matches!(poll!(&mut wait), Poll::Ready(Ok(()))));
        assert_eq!(api.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn injected_clock_past_the_deadline_times_out() {
        let clock = ManualClock::new();
        let api = FakeApi::new("v1.29.2");
        let manager = CrdManager::new(api.clone()).with_clock(clock.clone());

        let mut wait = pin!(manager.wait_to_be_present("bars.example.com", Duration::from_secs(9)));
        assert!(poll!(&mut wait).is_pending());
        clock.advance(Duration::from_secs(2));
        assert!(poll!(&mut wait).is_pending());
        clock.advance(Duration::from_secs(2));
        assert!(poll!(&mut wait).is_pending());
        assert_eq!(api.gets.load(Ordering::SeqCst), 2);

        // the deadline wins over the checks that are due at the same time
        clock.advance(Duration::from_secs(6));
        match poll!(&mut wait) {
            Poll::Ready(Err(Error::TimeoutWaitingForCrd { name })) => assert_eq!(name, "bars.example.com"),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(api.gets.load(Ordering::SeqCst), 2);
    }

    struct Noop;

    #[async_trait]
    impl EventSource for Noop {
        async fn run(
            &self,
            _queue: crate::workqueue::WorkQueue<String>,
            _resync_interval: Duration,
            _shutdown: tokio_util::sync::CancellationToken,
        ) {
        }
    }

    #[tokio::test]
    async fn crd_source_registers_before_watching() {
        let api = FakeApi::new("v1.29.2").with(&foos());
        let source = CrdSource::new(foos(), CrdManager::new(api.clone()), Noop);
        source.initialize().await.unwrap();
        assert_eq!(api.creates.load(Ordering::SeqCst), 1);

        let source = CrdSource::new(foos(), CrdManager::new(FakeApi::new("v1.5.0")), Noop);
        assert!(source.initialize().await.is_err());
    }
}
