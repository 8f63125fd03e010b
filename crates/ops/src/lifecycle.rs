//! Create, update and delete one object in sequence, attributing every
//! failure to the phase that produced it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use keel_core::{Error, Propagation, Representation};
use keel_kubehub::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::retry::RetryPolicy;
use crate::update::{cancellable, update_with_retry, UpdateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Create,
    Get,
    Update,
    Delete,
    List,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Create => "create",
            Phase::Get => "get",
            Phase::Update => "update",
            Phase::Delete => "delete",
            Phase::List => "list",
        })
    }
}

/// A failure tagged with the phase and object it belongs to.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{phase} {kind} {name:?}: {source}")]
pub struct PhaseError {
    pub phase: Phase,
    pub kind: String,
    pub name: String,
    #[source]
    pub source: Error,
}

impl PhaseError {
    pub fn exit_code(&self) -> i32 { self.source.exit_code() }
}

/// What a full create, update, delete sequence produced.
#[derive(Debug, Clone)]
pub struct RunReport<R> {
    pub created: R,
    pub updated: UpdateOutcome<R>,
}

/// Drives one object through its lifecycle over any [`Transport`].
///
/// Every phase observes the same cancellation token; cancelling it makes the
/// in-flight phase fail with `Cancelled` and nothing after it runs.
pub struct Lifecycle<R, T: ?Sized> {
    transport: Arc<T>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    _repr: PhantomData<fn() -> R>,
}

impl<R, T> Lifecycle<R, T>
where
    R: Representation,
    T: Transport<R> + ?Sized,
{
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport, policy: RetryPolicy::default(), cancel: CancellationToken::new(), _repr: PhantomData }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn transport(&self) -> &T { &self.transport }

    pub fn policy(&self) -> &RetryPolicy { &self.policy }

    pub fn cancellation(&self) -> &CancellationToken { &self.cancel }

    fn fail(&self, phase: Phase, name: &str, source: Error) -> PhaseError {
        let kind = self.transport.descriptor().kind().to_string();
        error!(%phase, kind = %kind, name, error = %source, "phase failed");
        PhaseError { phase, kind, name: name.to_string(), source }
    }

    pub async fn create(&self, desired: &R) -> Result<R, PhaseError> {
        let name = desired.name().unwrap_or_default();
        let kind = self.transport.descriptor().kind();
        info!(kind, name, "creating");
        let created = cancellable(&self.cancel, self.transport.create(desired))
            .await
            .map_err(|e| self.fail(Phase::Create, name, e))?;
        info!(kind, name, rv = ?created.resource_version(), "created");
        Ok(created)
    }

    pub async fn get(&self, name: &str) -> Result<R, PhaseError> {
        cancellable(&self.cancel, self.transport.get(name)).await.map_err(|e| self.fail(Phase::Get, name, e))
    }

    /// Conflict-retrying update of `name`; see [`update_with_retry`].
    pub async fn update<F>(&self, name: &str, mutate: F) -> Result<UpdateOutcome<R>, PhaseError>
    where
        F: FnMut(&mut R) -> Result<(), Error>,
    {
        info!(kind = self.transport.descriptor().kind(), name, "updating");
        update_with_retry(&*self.transport, name, &self.policy, &self.cancel, mutate)
            .await
            .map_err(|e| self.fail(Phase::Update, name, e))
    }

    /// Delete `name`. Deleting an object that does not exist is `NotFound`.
    pub async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), PhaseError> {
        let kind = self.transport.descriptor().kind();
        info!(kind, name, %propagation, "deleting");
        cancellable(&self.cancel, self.transport.delete(name, propagation))
            .await
            .map_err(|e| self.fail(Phase::Delete, name, e))?;
        info!(kind, name, "deleted");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<R>, PhaseError> {
        cancellable(&self.cancel, self.transport.list()).await.map_err(|e| self.fail(Phase::List, "", e))
    }

    /// Create `desired`, update it with `mutate`, then delete it. Stops at the
    /// first failing phase; earlier phases are not undone.
    pub async fn run<F>(&self, desired: &R, mutate: F, propagation: Propagation) -> Result<RunReport<R>, PhaseError>
    where
        F: FnMut(&mut R) -> Result<(), Error>,
    {
        let created = self.create(desired).await?;
        let name = created.name().unwrap_or_default().to_string();
        let updated = self.update(&name, mutate).await?;
        self.delete(&name, propagation).await?;
        Ok(RunReport { created, updated })
    }
}
