//! Error handling in [`kooper_client`][crate]
use thiserror::Error;

pub use kube_client::error::ErrorResponse;

/// Possible errors when talking to the apiextensions API
#[derive(Error, Debug)]
pub enum Error {
    /// The object being created is already registered
    #[error("{name} already exists")]
    AlreadyExists {
        /// Name of the object
        name: String,
    },

    /// The requested object is not registered
    #[error("{name} not found")]
    NotFound {
        /// Name of the object
        name: String,
    },

    /// Any other failure returned by the client
    ///
    /// Network errors, throttling and rejected requests all end up here.
    #[error("ApiError: {0}")]
    Api(#[source] kube_client::Error),
}

impl Error {
    /// Classify an error returned by `kube_client` for the object called `name`
    #[must_use]
    pub fn from_kube(name: &str, err: kube_client::Error) -> Self {
        match err {
            kube_client::Error::Api(ErrorResponse { code: 409, ref reason, .. }) if reason == "AlreadyExists" => {
                Error::AlreadyExists { name: name.into() }
            }
            kube_client::Error::Api(ErrorResponse { code: 404, .. }) => Error::NotFound { name: name.into() },
            err => Error::Api(err),
        }
    }

    /// Whether this is an [`Error::AlreadyExists`]
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Whether this is an [`Error::NotFound`]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
