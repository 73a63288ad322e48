//! Leader election on `coordination.k8s.io/v1` Leases
//!
//! Every replica runs a [`LeaderElector`] against the same Lease. The replica named in
//! `spec.holderIdentity` leads, and keeps leading by renewing the lease well within its
//! `leaseDurationSeconds`. The others poll the lease and take it over once they have not seen it
//! change for a full lease duration.
//!
//! Expiry is judged on local monotonic time only: a replica notes when it last saw the lease
//! change, and never compares the timestamps written by other replicas with its own clock.
//! This tolerates clock skew between nodes but does not fence: for a short time after a leader
//! stalls, two replicas may both believe they lead.
//!
//! ```rust,ignore
//! let election = LeaderElectionConfig::builder("my-controller", "default", &pod_name, "my-controller-group")
//!     .finish()?;
//! let elector = LeaderElector::spawn(election, client);
//! let controller = Controller::new(config, source, handler).with_leadership(elector.state());
//! ```
use std::time::Duration;

use futures::prelude::*;
use k8s_openapi::{api::coordination::v1::Lease, apimachinery::pkg::apis::meta::v1::MicroTime};
use kube_client::{
    api::{Api, Patch, PatchParams, PostParams},
    Client, Resource,
};
use rand::Rng;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;

/// Spread applied to retry delays so replicas do not hit the apiserver in lockstep.
const JITTER_FACTOR: f64 = 1.2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid leader election config: {0}")]
    Config(String),
    #[error("timeout while updating the lease")]
    Timeout,
    #[error("lease request failed: {0}")]
    Client(#[source] kube_client::Error),
    #[error("leader elector task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Validated configuration of a [`LeaderElector`]
///
/// Construct an instance via [`LeaderElectionConfigBuilder::finish`].
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig(LeaderElectionConfigBuilder);

impl LeaderElectionConfig {
    /// Start configuring an election on the lease `namespace/name`, as `identity`
    ///
    /// `manager` names the server-side apply field manager, and should be shared by all replicas.
    pub fn builder(name: &str, namespace: &str, identity: &str, manager: &str) -> LeaderElectionConfigBuilder {
        LeaderElectionConfigBuilder {
            name: name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            manager: manager.into(),
            ..LeaderElectionConfigBuilder::default()
        }
    }
}

/// Leader election settings before validation
#[derive(Clone, Debug)]
pub struct LeaderElectionConfigBuilder {
    /// Name of the lease.
    pub name: String,
    /// Namespace of the lease.
    pub namespace: String,
    /// Identity written to the lease while leading, usually the pod name.
    pub identity: String,
    /// Server-side apply field manager, distinct from `identity`.
    pub manager: String,
    /// How long a lease stays valid without being renewed. Defaults to 15s.
    ///
    /// Replicas wait this long after the last observed change before taking over.
    pub lease_duration: Duration,
    /// How often the leader renews the lease. Defaults to 10s.
    pub renew_deadline: Duration,
    /// Base delay before retrying after a failed request. Defaults to 2s.
    pub retry_period: Duration,
    /// Timeout for each request to the apiserver. Defaults to 5s.
    pub api_timeout: Duration,
}

impl Default for LeaderElectionConfigBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: String::new(),
            identity: String::new(),
            manager: String::new(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            api_timeout: Duration::from_secs(5),
        }
    }
}

impl LeaderElectionConfigBuilder {
    /// Finish building the config by validating it.
    ///
    /// # Errors
    /// Will return [`Error::Config`] unless:
    /// - `name`, `identity` and `manager` are not empty;
    /// - `lease_duration` is greater than `renew_deadline`;
    /// - `renew_deadline` is greater than `1.2 * retry_period`;
    /// - every duration is at least one second.
    pub fn finish(self) -> Result<LeaderElectionConfig> {
        let invalid = |msg: &str| Err(Error::Config(msg.into()));
        if self.name.is_empty() {
            return invalid("name may not be empty");
        }
        if self.identity.is_empty() {
            return invalid("identity may not be empty");
        }
        if self.manager.is_empty() {
            return invalid("manager may not be empty");
        }
        if self.lease_duration <= self.renew_deadline {
            return invalid("lease_duration must be greater than renew_deadline");
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::Config(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        for (field, value) in [
            ("lease_duration", self.lease_duration),
            ("renew_deadline", self.renew_deadline),
            ("retry_period", self.retry_period),
            ("api_timeout", self.api_timeout),
        ] {
            if value < Duration::from_secs(1) {
                return Err(Error::Config(format!("{field} must be at least 1 second")));
            }
        }
        Ok(LeaderElectionConfig(self))
    }
}

/// Leadership as seen by one replica
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// This replica holds the lease.
    Leading,
    /// Another replica holds the lease.
    Following,
    /// The lease is unknown, unheld, or the elector is not running.
    Standby,
}

impl LeaderState {
    /// Whether this replica holds the lease
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leading)
    }
}

/// What the elector last saw of the lease
#[derive(Clone, Debug, PartialEq)]
enum Observed {
    Leading { lease: Lease, changed_at: Instant },
    Following { holder: String, lease: Lease, changed_at: Instant },
    Standby,
}

impl Observed {
    fn lease(&self) -> Option<&Lease> {
        match self {
            Self::Leading { lease, .. } | Self::Following { lease, .. } => Some(lease),
            Self::Standby => None,
        }
    }

    fn changed_at(&self) -> Option<Instant> {
        match self {
            Self::Leading { changed_at, .. } | Self::Following { changed_at, .. } => Some(*changed_at),
            Self::Standby => None,
        }
    }

    fn as_state(&self) -> LeaderState {
        match self {
            Self::Leading { .. } => LeaderState::Leading,
            Self::Following { .. } => LeaderState::Following,
            Self::Standby => LeaderState::Standby,
        }
    }
}

/// Background task acquiring and renewing a Lease
pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderElectionConfigBuilder,
    observed: Observed,
    state_tx: watch::Sender<LeaderState>,
    shutdown: CancellationToken,
    failed_last_attempt: bool,
}

impl LeaderElector {
    /// Spawn an elector onto the runtime
    #[must_use = "the handle exposes the leader state and stops the elector"]
    pub fn spawn(config: LeaderElectionConfig, client: Client) -> LeaderElectorHandle {
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let shutdown = CancellationToken::new();
        let elector = LeaderElector {
            api: Api::namespaced(client, &config.0.namespace),
            config: config.0,
            observed: Observed::Standby,
            state_tx,
            shutdown: shutdown.clone(),
            failed_last_attempt: false,
        };
        LeaderElectorHandle {
            shutdown,
            state: state_rx,
            task: tokio::spawn(elector.run()),
        }
    }

    #[tracing::instrument(skip_all, fields(lease = %self.config.name, identity = %self.config.identity))]
    async fn run(mut self) {
        tracing::info!("leader elector started");
        loop {
            if let Err(err) = self.try_acquire_or_renew().await {
                tracing::warn!(error = %err, "failed to acquire or renew lease");
                self.failed_last_attempt = true;
                self.observe(None);
            }
            let delay = self.next_attempt_in();
            tracing::trace!(?delay, "waiting for next lease check");
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.observe(None);
        tracing::info!("leader elector stopped");
    }

    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        let current = timeout(self.config.api_timeout, self.api.get_opt(&self.config.name))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::Client)?;
        let exists = current.is_some();
        if let Some(lease) = current {
            self.observe(Some(lease));
        }

        if let Observed::Following { holder, .. } = &self.observed {
            if !self.is_lease_expired() {
                tracing::debug!(%holder, "lease held by another replica");
                return Ok(());
            }
        }

        let taking_over = !matches!(self.observed, Observed::Leading { .. });
        let now = MicroTime(k8s_openapi::chrono::Utc::now());
        let mut lease = self.observed.lease().cloned().unwrap_or_default();
        let meta = lease.meta_mut();
        meta.name = Some(self.config.name.clone());
        meta.namespace = Some(self.config.namespace.clone());
        meta.managed_fields = None;
        let spec = lease.spec.get_or_insert_with(Default::default);
        spec.lease_duration_seconds = i32::try_from(self.config.lease_duration.as_secs()).ok();
        spec.renew_time = Some(now.clone());
        if taking_over {
            tracing::info!("taking over lease");
            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(now);
            spec.lease_transitions = Some(spec.lease_transitions.map_or(0, |n| n + 1));
        }

        let written = if exists {
            let params = PatchParams::apply(&self.config.manager).force();
            timeout(
                self.config.api_timeout,
                self.api.patch(&self.config.name, &params, &Patch::Apply(lease)),
            )
            .await
        } else {
            timeout(self.config.api_timeout, self.api.create(&PostParams::default(), &lease)).await
        };
        let lease = written.map_err(|_| Error::Timeout)?.map_err(Error::Client)?;
        self.failed_last_attempt = false;
        self.observe(Some(lease));
        Ok(())
    }

    /// Record the latest lease, or its absence, and publish the resulting state
    fn observe(&mut self, lease: Option<Lease>) {
        self.observed = match lease {
            Some(lease) if Some(&lease) == self.observed.lease() => return,
            Some(lease) => {
                let holder = lease
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.holder_identity.clone())
                    .unwrap_or_default();
                let changed_at = Instant::now();
                if holder == self.config.identity {
                    Observed::Leading { lease, changed_at }
                } else if holder.is_empty() {
                    // released, free to take
                    Observed::Standby
                } else {
                    Observed::Following {
                        holder,
                        lease,
                        changed_at,
                    }
                }
            }
            None => Observed::Standby,
        };
        let state = self.observed.as_state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::info!(from = ?current, to = ?state, "leader state changed");
            *current = state;
            true
        });
    }

    fn next_attempt_in(&self) -> Duration {
        let mut rng = rand::rng();
        let wait = match &self.observed {
            Observed::Leading { .. } => self.config.renew_deadline,
            Observed::Following { .. } => {
                let jitter = rng.random_range(0.01..1.0) * JITTER_FACTOR;
                self.config.lease_duration + self.config.lease_duration.mul_f64(jitter)
            }
            Observed::Standby if self.failed_last_attempt => {
                let jitter = rng.random_range(0.5..1.5) * JITTER_FACTOR;
                return self.config.retry_period.mul_f64(jitter);
            }
            Observed::Standby => return Duration::ZERO,
        };
        let changed_at = self.observed.changed_at().unwrap_or_else(Instant::now);
        (changed_at + wait).saturating_duration_since(Instant::now())
    }

    fn is_lease_expired(&self) -> bool {
        self.observed
            .changed_at()
            .is_none_or(|changed_at| changed_at + self.config.lease_duration <= Instant::now())
    }
}

/// Handle to a spawned [`LeaderElector`]
pub struct LeaderElectorHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<LeaderState>,
    task: JoinHandle<()>,
}

impl LeaderElectorHandle {
    /// A receiver of the elector's state
    ///
    /// It implements [`Leadership`](crate::leader::Leadership), so it can gate a controller directly.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Stop the elector and wait for it to finish
    ///
    /// The lease is not released; another replica takes over once it expires.
    pub fn shutdown(self) -> impl Future<Output = Result<()>> {
        self.shutdown.cancel();
        self.task.map_err(Error::Task)
    }
}
