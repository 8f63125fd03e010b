//! Read-modify-write with optimistic concurrency.
//!
//! Each attempt re-reads the latest object, applies the caller's mutation to
//! that fresh copy and submits it carrying the resourceVersion it was read
//! at. Only `Conflict` is retried; every other failure ends the loop at once.

use std::future::Future;

use keel_core::{Error, Representation};
use keel_kubehub::Transport;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;

/// Result of a committed update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome<R> {
    /// The object as stored after the successful write.
    pub object: R,
    /// Read-modify-write cycles used, 1 when there was no conflict.
    pub attempts: u32,
}

/// Race `fut` against `cancel`; a fired token wins and yields `Cancelled`.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Apply `mutate` to object `name` until it commits, the policy's attempt
/// budget is spent (`RetryExhausted`) or `cancel` fires (`Cancelled`).
///
/// `mutate` runs once per attempt, always against the freshly read object,
/// and must not touch `metadata.resourceVersion` (`VersionTampered`). An error
/// returned by `mutate` aborts the loop without a write.
pub async fn update_with_retry<R, T, F>(
    transport: &T,
    name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut mutate: F,
) -> Result<UpdateOutcome<R>, Error>
where
    R: Representation,
    T: Transport<R> + ?Sized,
    F: FnMut(&mut R) -> Result<(), Error>,
{
    let kind = transport.descriptor().kind().to_string();
    let max = policy.attempts();
    for attempt in 1..=max {
        counter!("update_attempts_total", 1u64);
        let mut current = cancellable(cancel, transport.get(name)).await?;
        let read_at = current.resource_version().map(str::to_string);
        mutate(&mut current)?;
        let after = current.resource_version().map(str::to_string);
        if after != read_at {
            return Err(Error::VersionTampered { name: name.to_string(), before: read_at, after });
        }
        debug!(kind = %kind, name, attempt, rv = ?read_at, "submitting update");
        match cancellable(cancel, transport.update(&current)).await {
            Ok(object) => {
                counter!("update_ok_total", 1u64);
                info!(kind = %kind, name, attempt, rv = ?object.resource_version(), "update committed");
                return Ok(UpdateOutcome { object, attempts: attempt });
            }
            Err(e) if e.is_conflict() => {
                counter!("update_conflicts_total", 1u64);
                if attempt == max {
                    break;
                }
                let delay = policy.backoff(attempt);
                warn!(kind = %kind, name, attempt, ?delay, "update conflicted; re-reading");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
    counter!("update_retry_exhausted_total", 1u64);
    warn!(kind = %kind, name, attempts = max, "update gave up after repeated conflicts");
    Err(Error::RetryExhausted { name: name.to_string(), attempts: max })
}
