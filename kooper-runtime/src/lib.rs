//! Runtime for kooper operators
//!
//! This crate contains the moving parts of an operator:
//! - [`crd`] registers CustomResourceDefinitions and waits for them to be served
//! - [`informer`] watches objects and queues the keys of those that change
//! - [`workqueue`] deduplicates, delays and rate limits keys
//! - [`controller`] runs handlers for queued keys with bounded retries
//! - [`coordination`] and [`leader`] restrict processing to a single leading replica
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod clock;
pub mod controller;
pub mod coordination;
pub mod crd;
pub mod handler;
pub mod informer;
pub mod leader;
pub mod metrics;
mod scheduler;
pub mod workqueue;

pub use clock::{Clock, TokioClock};
pub use controller::Controller;
pub use coordination::{LeaderElectionConfig, LeaderElector, LeaderState};
pub use crd::{CrdManager, CrdSource};
pub use handler::{handler_fn, CachedHandler, Handler, HandlerError, ResourceHandler};
pub use informer::{Event, EventSource, Informer, Store};
pub use leader::{AlwaysLeader, Leadership};
pub use metrics::{Metrics, MetricsRecorder, NoopRecorder, Outcome};
pub use workqueue::WorkQueue;

/// Re-export of the watcher driving [`Informer::watch`]
pub use kube_runtime::watcher;
