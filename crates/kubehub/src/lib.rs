//! keel kubehub: the transport layer between keel and the control plane.
//!
//! A [`Transport`] performs exactly one network operation per call against a
//! single [`ResourceDescriptor`] and reports what happened; it never retries.
//! [`KubeTransport`] talks to a real cluster through kube-rs, while
//! [`MemoryTransport`] is an in-process control plane enforcing the same
//! optimistic-concurrency rules.

#![forbid(unsafe_code)]

use std::path::Path;

use async_trait::async_trait;
use keel_core::{Error, Propagation, Representation, ResourceDescriptor};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::info;

mod kubeapi;
pub mod memory;

pub use kubeapi::{map_kube_error, KubeTransport};
pub use memory::{MemoryTransport, Op};

/// Create/Get/Update/Delete/List for one kind of object.
#[async_trait]
pub trait Transport<R: Representation>: Send + Sync {
    fn descriptor(&self) -> &ResourceDescriptor;

    /// Store a new object. The desired object must not carry a resourceVersion.
    async fn create(&self, desired: &R) -> Result<R, Error>;

    async fn get(&self, name: &str) -> Result<R, Error>;

    /// Replace the whole object. Fails with `Conflict` when `current`'s
    /// resourceVersion is no longer the latest one.
    async fn update(&self, current: &R) -> Result<R, Error>;

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), Error>;

    /// Point-in-time snapshot of every object in scope.
    async fn list(&self) -> Result<Vec<R>, Error>;
}

/// Resolve a connection handle: an explicit kubeconfig file (optionally with
/// a context), the default kubeconfig with a context, or full inference
/// (`KUBECONFIG`, `~/.kube/config`, in-cluster service account).
pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client, Error> {
    let opts = KubeConfigOptions { context: context.map(|s| s.to_string()), ..Default::default() };
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .map_err(|e| Error::Invalid(format!("reading kubeconfig {}: {}", path.display(), e)))?;
            Config::from_custom_kubeconfig(kc, &opts)
                .await
                .map_err(|e| Error::Invalid(format!("loading kubeconfig {}: {}", path.display(), e)))?
        }
        None if context.is_some() => Config::from_kubeconfig(&opts)
            .await
            .map_err(|e| Error::Invalid(format!("loading kubeconfig: {}", e)))?,
        None => Config::infer().await.map_err(|e| Error::Connection(format!("inferring kube config: {}", e)))?,
    };
    info!(cluster_url = %config.cluster_url, context = ?context, "kube client configured");
    Client::try_from(config).map_err(|e| Error::Connection(e.to_string()))
}
