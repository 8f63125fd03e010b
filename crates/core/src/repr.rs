//! The `Representation` capability shared by typed and dynamic objects.

use std::ops::{Deref, DerefMut};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::Error;

/// A cluster object in one of its interchangeable forms.
///
/// Both forms must produce the same wire document for the same logical
/// object; transports only ever see documents.
pub trait Representation: Clone + Send + Sync + Sized + 'static {
    /// `metadata.name`
    fn name(&self) -> Option<&str>;

    /// `metadata.resourceVersion`, the optimistic-concurrency token.
    fn resource_version(&self) -> Option<&str>;

    fn to_document(&self) -> Result<Value, Error>;

    fn from_document(doc: Value) -> Result<Self, Error>;

    fn to_wire_document(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(&self.to_document()?)?)
    }

    fn from_wire_document(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_document(serde_json::from_slice(bytes)?)
    }
}

/// Compile-time-checked object: a `k8s-openapi` struct whose fields are plain
/// Rust fields. Derefs to the inner struct.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Typed<K>(pub K);

impl<K> Deref for Typed<K> {
    type Target = K;
    fn deref(&self) -> &K { &self.0 }
}

impl<K> DerefMut for Typed<K> {
    fn deref_mut(&mut self) -> &mut K { &mut self.0 }
}

impl<K> From<K> for Typed<K> {
    fn from(inner: K) -> Self { Self(inner) }
}

impl<K> Representation for Typed<K>
where
    K: k8s_openapi::Resource + k8s_openapi::Metadata<Ty = ObjectMeta> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> Option<&str> { self.0.metadata().name.as_deref() }

    fn resource_version(&self) -> Option<&str> { self.0.metadata().resource_version.as_deref() }

    fn to_document(&self) -> Result<Value, Error> { Ok(serde_json::to_value(&self.0)?) }

    /// Rejects documents of another kind before handing them to serde.
    fn from_document(doc: Value) -> Result<Self, Error> {
        let api_version = doc.get("apiVersion").and_then(|v| v.as_str());
        let kind = doc.get("kind").and_then(|v| v.as_str());
        if api_version.is_some_and(|v| v != K::API_VERSION) || kind.is_some_and(|k| k != K::KIND) {
            return Err(Error::Codec(format!(
                "expected {} {}, got {} {}",
                K::API_VERSION,
                K::KIND,
                api_version.unwrap_or("-"),
                kind.unwrap_or("-")
            )));
        }
        Ok(Self(serde_json::from_value(doc)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynamicDoc;
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn typed() -> Typed<StatefulSet> {
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        Typed(StatefulSet {
            metadata: ObjectMeta { name: Some("web".into()), ..Default::default() },
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                service_name: "web".into(),
                selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![Container { name: "web".into(), image: Some("nginx:1".into()), ..Default::default() }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }

    #[test]
    fn typed_and_dynamic_share_the_wire_document() {
        let dynamic = DynamicDoc::try_from(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "web" },
            "spec": {
                "replicas": 3,
                "serviceName": "web",
                "selector": { "matchLabels": { "app": "web" } },
                "template": {
                    "metadata": { "labels": { "app": "web" } },
                    "spec": { "containers": [ { "name": "web", "image": "nginx:1" } ] }
                }
            }
        }))
        .expect("mapping");
        let t = typed();
        assert_eq!(t.to_document().expect("typed"), dynamic.to_document().expect("dynamic"));

        // Either side can be rebuilt from the other's bytes.
        let back = Typed::<StatefulSet>::from_wire_document(&dynamic.to_wire_document().expect("bytes")).expect("typed");
        assert_eq!(back, t);
    }

    #[test]
    fn typed_round_trip_is_field_for_field() {
        let t = typed();
        let back = Typed::<StatefulSet>::from_wire_document(&t.to_wire_document().expect("bytes")).expect("decode");
        assert_eq!(back.spec.as_ref().and_then(|s| s.replicas), Some(3));
        assert_eq!(back, t);
        assert_eq!(back.name(), Some("web"));
        assert_eq!(back.resource_version(), None);
    }

    #[test]
    fn typed_rejects_other_kinds() {
        let svc = json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": "web" } });
        let err = Typed::<StatefulSet>::from_document(svc.clone()).unwrap_err();
        assert!(matches!(err, Error::Codec(ref m) if m.contains("expected apps/v1 StatefulSet")), "{err}");
        assert!(Typed::<Service>::from_document(svc).is_ok());
    }

    #[test]
    fn typed_fields_are_plain_struct_access() {
        let mut t = typed();
        if let Some(spec) = t.spec.as_mut() {
            spec.replicas = Some(1);
        }
        assert_eq!(t.to_document().expect("doc")["spec"]["replicas"], json!(1));
    }
}
