//! The business logic invoked for every queued key
use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use kube_client::Resource;

use crate::informer::Store;

/// Error returned by a handler
///
/// Any failure makes the controller retry the key, until its retries run out.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles one key, as `namespace/name` or `name`
///
/// The same key is never handled by two workers at once.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Bring whatever `key` refers to into its desired state
    async fn handle(&self, key: &str) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        (**self).handle(key).await
    }
}

/// A [`Handler`] calling an async closure, see [`handler_fn`]
pub struct HandlerFn<F>(F);

/// Build a [`Handler`] from an async closure taking the key
///
/// ```
/// use kooper_runtime::handler::{handler_fn, HandlerError};
/// let handler = handler_fn(|key: String| async move {
///     tracing::info!(%key, "handling");
///     Ok::<_, HandlerError>(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        (self.0)(key.to_string()).await
    }
}

/// Reacts to objects being present or gone
#[async_trait]
pub trait ResourceHandler<K>: Send + Sync {
    /// The object exists, possibly after a change
    async fn add(&self, obj: Arc<K>) -> Result<(), HandlerError>;

    /// The object with this key no longer exists
    async fn delete(&self, key: &str) -> Result<(), HandlerError>;
}

#[async_trait]
impl<K, H> ResourceHandler<K> for Arc<H>
where
    K: Send + Sync + 'static,
    H: ResourceHandler<K> + ?Sized,
{
    async fn add(&self, obj: Arc<K>) -> Result<(), HandlerError> {
        (**self).add(obj).await
    }

    async fn delete(&self, key: &str) -> Result<(), HandlerError> {
        (**self).delete(key).await
    }
}

/// Looks keys up in an informer [`Store`] and dispatches to a [`ResourceHandler`]
pub struct CachedHandler<K, H> {
    store: Store<K>,
    handler: H,
}

impl<K, H> CachedHandler<K, H>
where
    K: Resource + Send + Sync + 'static,
    H: ResourceHandler<K>,
{
    /// Dispatch keys of objects in `store` to `handler`
    pub fn new(store: Store<K>, handler: H) -> Self {
        Self { store, handler }
    }
}

#[async_trait]
impl<K, H> Handler for CachedHandler<K, H>
where
    K: Resource + Send + Sync + 'static,
    H: ResourceHandler<K>,
{
    async fn handle(&self, key: &str) -> Result<(), HandlerError> {
        match self.store.get(key) {
            Some(obj) => self.handler.add(obj).await,
            None => self.handler.delete(key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{handler_fn, CachedHandler, Handler, HandlerError, ResourceHandler};
    use crate::informer::{Event, Store};
    use async_trait::async_trait;
    use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl ResourceHandler<ConfigMap> for Recorder {
        async fn add(&self, obj: Arc<ConfigMap>) -> Result<(), HandlerError> {
            let name = obj.metadata.name.clone().unwrap_or_default();
            self.0.lock().push(format!("add {name}"));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), HandlerError> {
            self.0.lock().push(format!("delete {key}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn cached_objects_are_added_and_missing_ones_deleted() {
        let store = Store::default();
        store.apply(Event::Applied(ConfigMap {
            metadata: ObjectMeta {
                name: Some("present".into()),
                namespace: Some("ns".into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }));
        let recorder = Arc::new(Recorder::default());
        let handler = CachedHandler::new(store, recorder.clone());

        handler.handle("ns/present").await.unwrap();
        handler.handle("ns/gone").await.unwrap();
        assert_eq!(*recorder.0.lock(), vec!["add present", "delete ns/gone"]);
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = handler_fn(|key: String| async move {
            let result: Result<(), HandlerError> = if key == "bad" { Err("bad key".into()) } else { Ok(()) };
            result
        });
        assert!(handler.handle("good").await.is_ok());
        assert!(handler.handle("bad").await.is_err());
    }
}
