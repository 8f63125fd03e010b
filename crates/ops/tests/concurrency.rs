#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_core::{DynamicDoc, Error, ResourceDescriptor};
use keel_kubehub::{MemoryTransport, Op};
use keel_ops::{Lifecycle, RetryPolicy, StatefulWorkload, WorkloadSpec};
use tokio::task::JoinSet;

fn bump(d: &mut DynamicDoc) -> Result<(), Error> {
    let n = d.get_i64(["spec", "replicas"])?;
    d.set(["spec", "replicas"], n + 1)?;
    Ok(())
}

async fn contend(writers: usize) -> (MemoryTransport<DynamicDoc>, Vec<u32>) {
    let t = MemoryTransport::<DynamicDoc>::new(ResourceDescriptor::stateful_sets("default"));
    let lc = Arc::new(Lifecycle::new(Arc::new(t.clone())).with_policy(RetryPolicy::immediate(writers as u32 + 1)));
    let spec = WorkloadSpec { replicas: 0, ..WorkloadSpec::default() };
    lc.create(&DynamicDoc::desired(&spec)).await.expect("create");

    let mut set = JoinSet::new();
    for _ in 0..writers {
        let lc = Arc::clone(&lc);
        set.spawn(async move { lc.update("book-server", bump).await.map(|o| o.attempts) });
    }
    let mut attempts = Vec::new();
    while let Some(joined) = set.join_next().await {
        attempts.push(joined.expect("join").expect("update"));
    }
    (t, attempts)
}

#[tokio::test]
async fn racing_writers_lose_no_increment() {
    let (t, attempts) = contend(8).await;
    let stored = t.stored("book-server").expect("stored");
    assert_eq!(stored["spec"]["replicas"], serde_json::json!(8));
    assert_eq!(t.calls(Op::Update), attempts.iter().sum::<u32>() as usize);
    assert!(attempts.iter().any(|&a| a > 1), "writers never collided: {:?}", attempts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versions_strictly_increase_under_contention() {
    let (t, attempts) = contend(16).await;
    assert_eq!(attempts.len(), 16);
    let history = t.write_history("book-server");
    assert_eq!(history.len(), 17);
    assert!(history.windows(2).all(|w| w[0] < w[1]), "{:?}", history);
    let stored = t.stored("book-server").expect("stored");
    assert_eq!(stored["metadata"]["resourceVersion"], serde_json::json!(history[16].to_string()));
}
