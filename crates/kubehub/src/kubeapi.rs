use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{Error, Propagation, Representation, ResourceDescriptor};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, TypeMeta},
    Client,
};
use metrics::counter;
use tracing::debug;

use crate::Transport;

fn api_resource(d: &ResourceDescriptor) -> ApiResource {
    ApiResource {
        group: d.group().to_string(),
        version: d.version().to_string(),
        api_version: d.api_version(),
        kind: d.kind().to_string(),
        plural: d.plural().to_string(),
    }
}

fn policy(p: Propagation) -> PropagationPolicy {
    match p {
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Orphan => PropagationPolicy::Orphan,
    }
}

/// Map a kube-rs failure onto keel's taxonomy for object `kind`/`name`.
pub fn map_kube_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
            (404, _) => Error::NotFound { kind: kind.to_string(), name: name.to_string() },
            (409, "AlreadyExists") => Error::AlreadyExists { kind: kind.to_string(), name: name.to_string() },
            (409, _) => Error::Conflict { kind: kind.to_string(), name: name.to_string(), message: ae.message },
            (401 | 403, _) => Error::Unauthorized(ae.message),
            (408 | 504, _) | (_, "Timeout") => Error::Timeout(ae.message),
            (code, reason) => Error::Api { code, reason: reason.to_string(), message: ae.message },
        },
        kube::Error::SerdeError(e) => Error::Codec(e.to_string()),
        kube::Error::Auth(e) => Error::Unauthorized(e.to_string()),
        other => Error::Connection(other.to_string()),
    }
}

fn to_dynamic<R: Representation>(obj: &R) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(obj.to_document()?)?)
}

fn from_dynamic<R: Representation>(obj: DynamicObject) -> Result<R, Error> {
    R::from_document(serde_json::to_value(&obj)?)
}

/// List items arrive without `apiVersion`/`kind`; restore them from the
/// descriptor so both representations see the same document.
fn with_types(mut obj: DynamicObject, d: &ResourceDescriptor) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: d.api_version(), kind: d.kind().to_string() });
    }
    obj
}

/// Transport over kube-rs' dynamic API. Both representations travel as
/// `DynamicObject` documents, so one transport serves typed and dynamic
/// callers alike.
pub struct KubeTransport<R> {
    api: Api<DynamicObject>,
    descriptor: ResourceDescriptor,
    request_timeout: Option<Duration>,
    _repr: PhantomData<fn() -> R>,
}

impl<R: Representation> KubeTransport<R> {
    /// `client` is an already-resolved connection handle; it is cheap to clone
    /// and may be shared by any number of transports.
    pub fn new(client: Client, descriptor: ResourceDescriptor) -> Self {
        let ar = api_resource(&descriptor);
        let api = match descriptor.namespace() {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };
        Self { api, descriptor, request_timeout: None, _repr: PhantomData }
    }

    /// Bound every request; an expired request surfaces as `Timeout`.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn call<T, F>(&self, op: &'static str, name: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        counter!("kube_requests_total", 1u64, "op" => op);
        debug!(op, kind = %self.descriptor.kind(), name, "kube request");
        let res = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(r) => r,
                Err(_) => return Err(Error::Timeout(format!("{} {} {:?} after {:?}", op, self.descriptor.kind(), name, limit))),
            },
            None => fut.await,
        };
        res.map_err(|e| {
            counter!("kube_request_errors_total", 1u64, "op" => op);
            map_kube_error(e, self.descriptor.kind(), name)
        })
    }
}

#[async_trait]
impl<R: Representation> Transport<R> for KubeTransport<R> {
    fn descriptor(&self) -> &ResourceDescriptor { &self.descriptor }

    async fn create(&self, desired: &R) -> Result<R, Error> {
        let name = desired.name().unwrap_or_default().to_string();
        let obj = to_dynamic(desired)?;
        let created = self.call("create", &name, self.api.create(&PostParams::default(), &obj)).await?;
        from_dynamic(with_types(created, &self.descriptor))
    }

    async fn get(&self, name: &str) -> Result<R, Error> {
        let obj = self.call("get", name, self.api.get(name)).await?;
        from_dynamic(with_types(obj, &self.descriptor))
    }

    async fn update(&self, current: &R) -> Result<R, Error> {
        let name = current.name().ok_or_else(|| Error::Invalid("object has no metadata.name".into()))?.to_string();
        let obj = to_dynamic(current)?;
        let replaced = self.call("replace", &name, self.api.replace(&name, &PostParams::default(), &obj)).await?;
        from_dynamic(with_types(replaced, &self.descriptor))
    }

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), Error> {
        let dp = DeleteParams { propagation_policy: Some(policy(propagation)), ..Default::default() };
        self.call("delete", name, self.api.delete(name, &dp)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<R>, Error> {
        let list = self.call("list", "", self.api.list(&ListParams::default())).await?;
        list.items.into_iter().map(|obj| from_dynamic(with_types(obj, &self.descriptor))).collect()
    }
}
