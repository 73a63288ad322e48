//! Work queue keys for Kubernetes objects

use std::{fmt, str::FromStr};

use thiserror::Error;

/// A key that could not be split into namespace and name
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unexpected key format: {0:?}")]
pub struct InvalidKey(String);

/// The identity of an object as queued for reconciliation: `<namespace>/<name>` or `<name>`
///
/// ```
/// use kooper_core::ObjectKey;
/// let key: ObjectKey = "default/my-config".parse().unwrap();
/// assert_eq!(key.namespace.as_deref(), Some("default"));
/// assert_eq!(key.name, "my-config");
/// assert_eq!(ObjectKey::new("nodes-1").to_string(), "nodes-1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the object, `None` for cluster scoped objects
    pub namespace: Option<String>,
    /// Name of the object
    pub name: String,
}

impl ObjectKey {
    /// Key of a cluster scoped object
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Place the key inside a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Build the key for an object from its metadata
    ///
    /// Returns `None` for objects without a name, which the apiserver never emits.
    #[must_use]
    pub fn from_meta(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Option<Self> {
        let name = meta.name.as_deref()?;
        Some(Self {
            namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
            name: name.into(),
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = InvalidKey;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(ObjectKey::new(name)),
            (Some(ns), Some(name), None) if !name.is_empty() => {
                let key = ObjectKey::new(name);
                Ok(if ns.is_empty() { key } else { key.within(ns) })
            }
            _ => Err(InvalidKey(key.to_string())),
        }
    }
}
