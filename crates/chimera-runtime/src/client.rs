//! Typed convenience wrapper over a [`BridgeModule`].
//!
//! Mirrors the generated client a script caller would use: `call` for future
//! methods and `on` for streams, returning an [`Unsubscribe`] handle.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::module::BridgeModule;

#[derive(Clone)]
pub struct BridgeClient {
    module: Arc<BridgeModule>,
}

impl BridgeClient {
    pub fn new(module: Arc<BridgeModule>) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &BridgeModule {
        &self.module
    }

    pub async fn call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        self.module.invoke(method, args).await
    }

    /// Call and deserialize the result into `T`.
    pub async fn call_as<T>(&self, method: &str, args: Vec<serde_json::Value>) -> Result<T, BridgeError>
    where
        T: DeserializeOwned,
    {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| BridgeError::Decode(e.to_string()))
    }

    /// Run `callback` for every event on `stream` until unsubscribed.
    ///
    /// The subscription is registered before this returns, so events emitted
    /// afterwards are never missed. Must be called within a Tokio runtime.
    pub fn on<F>(&self, stream: &str, mut callback: F) -> Result<Unsubscribe, BridgeError>
    where
        F: FnMut(serde_json::Value) + Send + 'static,
    {
        let mut subscription = self.module.subscribe(stream)?;
        let stream = stream.to_string();

        let task = tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                callback(payload);
            }
            tracing::trace!("[client] Stream {} ended", stream);
        });

        Ok(Unsubscribe { task })
    }
}

/// Handle returned by [`BridgeClient::on`].
///
/// Dropping it leaves the listener running; call [`Unsubscribe::remove`].
pub struct Unsubscribe {
    task: JoinHandle<()>,
}

impl Unsubscribe {
    /// Stop delivering events and release the listener.
    pub fn remove(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}
