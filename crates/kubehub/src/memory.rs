//! In-process control plane.
//!
//! Stores documents keyed by name and arbitrates writes the way the API server
//! does: a global revision counter feeds `metadata.resourceVersion`, creates
//! must not carry a version, and updates must carry the latest one. Faults and
//! interfering writers can be queued to exercise callers' error paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use keel_core::{Error, Propagation, Representation, ResourceDescriptor};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::Transport;

/// Transport operation, used to target injected faults and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Get,
    Update,
    Delete,
    List,
}

type Interference = (String, Box<dyn FnOnce(&mut Value) + Send>);

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Value>,
    revision: u64,
    faults: HashMap<Op, VecDeque<Error>>,
    interference: VecDeque<Interference>,
    calls: HashMap<Op, usize>,
    deletions: Vec<(String, Propagation)>,
    history: Vec<(String, u64)>,
}

impl State {
    fn next_revision(&mut self, name: &str) -> u64 {
        self.revision += 1;
        self.history.push((name.to_string(), self.revision));
        self.revision
    }

    fn enter(&mut self, op: Op) -> Result<(), Error> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => {
                debug!(?op, error = %err, "injected fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn meta_mut(doc: &mut Value) -> Result<&mut Map<String, Value>, Error> {
    let root = doc.as_object_mut().ok_or_else(|| Error::Invalid("object document must be a mapping".into()))?;
    root.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
    root.get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .ok_or_else(|| Error::Invalid("metadata must be a mapping".into()))
}

fn meta_str<'a>(doc: &'a Value, field: &str) -> Option<&'a str> {
    doc.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// In-memory [`Transport`] for one descriptor. Clones and [`view`]s share the
/// same store.
///
/// [`view`]: MemoryTransport::view
pub struct MemoryTransport<R> {
    descriptor: ResourceDescriptor,
    state: Arc<Mutex<State>>,
    _repr: PhantomData<fn() -> R>,
}

impl<R> Clone for MemoryTransport<R> {
    fn clone(&self) -> Self {
        Self { descriptor: self.descriptor.clone(), state: Arc::clone(&self.state), _repr: PhantomData }
    }
}

impl<R: Representation> MemoryTransport<R> {
    pub fn new(descriptor: ResourceDescriptor) -> Self {
        Self { descriptor, state: Arc::new(Mutex::new(State::default())), _repr: PhantomData }
    }

    /// Same store, seen through another representation.
    pub fn view<S: Representation>(&self) -> MemoryTransport<S> {
        MemoryTransport { descriptor: self.descriptor.clone(), state: Arc::clone(&self.state), _repr: PhantomData }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call of `op` fail with `err` (queued, first in first out).
    pub fn fail_next(&self, op: Op, err: Error) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Convenience: the next `n` updates are rejected as stale.
    pub fn conflict_next_updates(&self, n: usize) {
        for _ in 0..n {
            let err = Error::Conflict {
                kind: self.descriptor.kind().to_string(),
                name: String::new(),
                message: "injected conflict".into(),
            };
            self.fail_next(Op::Update, err);
        }
    }

    /// Let another writer change the stored object right before the next
    /// update is evaluated. The change gets its own resourceVersion, so the
    /// pending update becomes stale.
    pub fn interfere_before_next_update(&self, name: &str, f: impl FnOnce(&mut Value) + Send + 'static) {
        self.lock().interference.push_back((name.to_string(), Box::new(f)));
    }

    pub fn calls(&self, op: Op) -> usize { self.lock().calls.get(&op).copied().unwrap_or(0) }

    pub fn deletions(&self) -> Vec<(String, Propagation)> { self.lock().deletions.clone() }

    /// Revisions assigned to successful writes of `name`, oldest first.
    pub fn write_history(&self, name: &str) -> Vec<u64> {
        self.lock().history.iter().filter(|(n, _)| n == name).map(|(_, rv)| *rv).collect()
    }

    /// Stored document for `name`, bypassing faults and call counters.
    pub fn stored(&self, name: &str) -> Option<Value> { self.lock().objects.get(name).cloned() }

    fn not_found(&self, name: &str) -> Error {
        Error::NotFound { kind: self.descriptor.kind().to_string(), name: name.to_string() }
    }

    fn apply_interference(&self, st: &mut State) {
        while let Some((name, f)) = st.interference.pop_front() {
            let Some(mut doc) = st.objects.get(&name).cloned() else { continue };
            f(&mut doc);
            let rv = st.next_revision(&name);
            if let Ok(meta) = meta_mut(&mut doc) {
                meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
            }
            debug!(name = %name, rv, "interfering write");
            st.objects.insert(name, doc);
        }
    }
}

#[async_trait]
impl<R: Representation> Transport<R> for MemoryTransport<R> {
    fn descriptor(&self) -> &ResourceDescriptor { &self.descriptor }

    async fn create(&self, desired: &R) -> Result<R, Error> {
        tokio::task::yield_now().await;
        let mut doc = desired.to_document()?;
        let mut st = self.lock();
        st.enter(Op::Create)?;
        let name = meta_str(&doc, "name").ok_or_else(|| Error::Invalid("metadata.name is required".into()))?.to_string();
        if meta_str(&doc, "resourceVersion").is_some() {
            return Err(Error::Invalid("resourceVersion should not be set on objects to be created".into()));
        }
        if st.objects.contains_key(&name) {
            return Err(Error::AlreadyExists { kind: self.descriptor.kind().to_string(), name });
        }
        let rv = st.next_revision(&name);
        let meta = meta_mut(&mut doc)?;
        if let Some(ns) = self.descriptor.namespace() {
            meta.entry("namespace").or_insert_with(|| Value::String(ns.to_string()));
        }
        meta.insert("uid".into(), Value::String(Uuid::new_v4().to_string()));
        meta.insert(
            "creationTimestamp".into(),
            Value::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
        meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
        debug!(name = %name, rv, "created");
        st.objects.insert(name, doc.clone());
        drop(st);
        R::from_document(doc)
    }

    async fn get(&self, name: &str) -> Result<R, Error> {
        tokio::task::yield_now().await;
        let doc = {
            let mut st = self.lock();
            st.enter(Op::Get)?;
            st.objects.get(name).cloned().ok_or_else(|| self.not_found(name))?
        };
        R::from_document(doc)
    }

    async fn update(&self, current: &R) -> Result<R, Error> {
        tokio::task::yield_now().await;
        let mut doc = current.to_document()?;
        let mut st = self.lock();
        st.enter(Op::Update)?;
        self.apply_interference(&mut st);
        let name = meta_str(&doc, "name").ok_or_else(|| Error::Invalid("metadata.name is required".into()))?.to_string();
        let stored = st.objects.get(&name).ok_or_else(|| self.not_found(&name))?;
        let sent_rv = meta_str(&doc, "resourceVersion")
            .ok_or_else(|| Error::Invalid("metadata.resourceVersion must be specified for an update".into()))?;
        if Some(sent_rv) != meta_str(stored, "resourceVersion") {
            return Err(Error::Conflict {
                kind: self.descriptor.kind().to_string(),
                name,
                message: "the object has been modified; please apply your changes to the latest version and try again".into(),
            });
        }
        // Server-owned identity survives a whole-object replace.
        let uid = meta_str(stored, "uid").map(str::to_string);
        let created = meta_str(stored, "creationTimestamp").map(str::to_string);
        let rv = st.next_revision(&name);
        let meta = meta_mut(&mut doc)?;
        if let Some(uid) = uid {
            meta.insert("uid".into(), Value::String(uid));
        }
        if let Some(ts) = created {
            meta.insert("creationTimestamp".into(), Value::String(ts));
        }
        meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
        debug!(name = %name, rv, "updated");
        st.objects.insert(name, doc.clone());
        drop(st);
        R::from_document(doc)
    }

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), Error> {
        tokio::task::yield_now().await;
        let mut st = self.lock();
        st.enter(Op::Delete)?;
        if st.objects.remove(name).is_none() {
            return Err(self.not_found(name));
        }
        debug!(name, %propagation, "deleted");
        st.deletions.push((name.to_string(), propagation));
        Ok(())
    }

    async fn list(&self) -> Result<Vec<R>, Error> {
        tokio::task::yield_now().await;
        let docs: Vec<Value> = {
            let mut st = self.lock();
            st.enter(Op::List)?;
            st.objects.values().cloned().collect()
        };
        docs.into_iter().map(R::from_document).collect()
    }
}
