//! Types shared by the kooper crates, without any client behavior
//!
//! This crate is available as a minimal alternative to `kooper` where a client is not available.
//! The same information here is always re-exported from `kooper` under `kooper::core`.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub use config::{Config, ConfigBuilder, ConfigError};

pub mod crd;
pub use crd::{CrdConf, ScaleSubresource, Scope};

pub mod key;
pub use key::ObjectKey;

pub mod version;
pub use version::{ClusterVersion, MIN_CLUSTER_VERSION};
