//! Kooper is a toolkit for writing Kubernetes operators in Rust.
//!
//! # Overview
//!
//! An operator built with kooper registers the CustomResourceDefinition it works on, watches
//! objects, and runs a handler for every object that changes. Handlers are retried with
//! exponential backoff, and when several replicas run, only the one holding a Lease handles
//! anything.
//!
//! The main modules are:
//!
//! - [`core`](crate::core) with the [`CrdConf`] declaration, object keys, and controller [`Config`]
//! - [`client`](crate::client) with the [`ExtensionApi`](crate::client::ExtensionApi) used to manage definitions
//! - [`runtime`](crate::runtime) with the [`Controller`](crate::runtime::Controller),
//!   [`Informer`](crate::runtime::Informer), [`WorkQueue`](crate::runtime::WorkQueue) and
//!   [`LeaderElector`](crate::runtime::LeaderElector)
//!
//! # Running a controller
//! ```no_run
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use kooper::{
//!     runtime::{handler_fn, Controller, HandlerError, Informer},
//!     Api, Client, Config,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::try_default().await?;
//!     let informer = Informer::watch(Api::<ConfigMap>::all(client), Default::default());
//!     let handler = handler_fn(|key: String| async move {
//!         println!("reconciling {key}");
//!         Ok::<_, HandlerError>(())
//!     });
//!     let config = Config::builder("configmaps").finish()?;
//!     Controller::new(config, informer, handler)
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Examples
//! A complete operator with leader election lives in the `examples` folder of the `kooper` crate.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub use kube_client::{Api, Client};

/// Re-exports from [`kooper-client`](kooper_client)
#[doc(inline)]
pub use kooper_client as client;

/// Re-exports from [`kooper-runtime`](kooper_runtime)
#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
#[doc(inline)]
pub use kooper_runtime as runtime;

pub use crate::core::{Config, CrdConf, ObjectKey, Scope};
/// Re-exports from [`kooper_core`](kooper_core)
#[doc(inline)]
pub use kooper_core as core;
