//! Access to the `apiextensions.k8s.io` API used to manage CustomResourceDefinitions
//!
//! The [`ExtensionApi`] trait is the narrow capability kooper needs from the apiserver:
//! create, get and delete a definition, and report the server release. [`KubeExtensionApi`]
//! implements it on top of a [`kube_client::Client`]; tests and alternative transports can
//! provide their own implementation.
#![deny(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube_client::{
    api::{Api, DeleteParams, PostParams},
    Client,
};

mod error;
pub use error::Error;

pub use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextensions;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Operations kooper performs against the apiextensions API
#[async_trait]
pub trait ExtensionApi: Send + Sync {
    /// Create a CustomResourceDefinition
    ///
    /// Returns [`Error::AlreadyExists`] if an object with the same name is already registered.
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition>;

    /// Fetch a CustomResourceDefinition by name
    ///
    /// Returns [`Error::NotFound`] if it is not registered.
    async fn get(&self, name: &str) -> Result<CustomResourceDefinition>;

    /// Delete a CustomResourceDefinition by name
    ///
    /// Returns [`Error::NotFound`] if it is not registered.
    async fn delete(&self, name: &str) -> Result<()>;

    /// The `gitVersion` reported by the apiserver, e.g. `v1.29.2`
    async fn server_version(&self) -> Result<String>;
}

#[async_trait]
impl<T: ExtensionApi + ?Sized> ExtensionApi for Arc<T> {
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        (**self).create(crd).await
    }

    async fn get(&self, name: &str) -> Result<CustomResourceDefinition> {
        (**self).get(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name).await
    }

    async fn server_version(&self) -> Result<String> {
        (**self).server_version().await
    }
}

/// [`ExtensionApi`] backed by a [`kube_client::Client`]
#[derive(Clone)]
pub struct KubeExtensionApi {
    client: Client,
    crds: Api<CustomResourceDefinition>,
}

impl KubeExtensionApi {
    /// Wrap a client
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            crds: Api::all(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl ExtensionApi for KubeExtensionApi {
    #[tracing::instrument(skip_all, fields(crd = crd.metadata.name.as_deref().unwrap_or_default()))]
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<CustomResourceDefinition> {
        let name = crd.metadata.name.as_deref().unwrap_or_default();
        self.crds
            .create(&PostParams::default(), crd)
            .await
            .map_err(|err| Error::from_kube(name, err))
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<CustomResourceDefinition> {
        self.crds.get(name).await.map_err(|err| Error::from_kube(name, err))
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<()> {
        self.crds
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|err| Error::from_kube(name, err))?;
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await.map_err(Error::Api)?;
        Ok(info.git_version)
    }
}
