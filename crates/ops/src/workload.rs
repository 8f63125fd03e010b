//! The managed workload: a StatefulSet running the book server and the
//! NodePort Service exposing it, built in either representation.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::{DynamicDoc, Error, FieldPath, Representation, Typed};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Desired shape of the workload. Defaults describe the book server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub pull_policy: String,
    pub replicas: i32,
    pub container_port: i32,
    pub args: Vec<String>,
    /// Port the Service listens on inside the cluster.
    pub service_port: i32,
    /// Port opened on every node.
    pub node_port: i32,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            name: "book-server".into(),
            image: "almasood/book-server:latest".into(),
            pull_policy: "IfNotPresent".into(),
            replicas: 2,
            container_port: 3000,
            args: ["serve", "--port=3000", "--secret=secret", "--auth=true"].iter().map(|s| s.to_string()).collect(),
            service_port: 3000,
            node_port: 30080,
        }
    }
}

impl WorkloadSpec {
    pub fn named(name: &str) -> Self { Self { name: name.to_string(), ..Self::default() } }

    /// `app=<name>`, used as selector and pod template labels alike.
    pub fn labels(&self) -> BTreeMap<String, String> { BTreeMap::from([("app".to_string(), self.name.clone())]) }

    fn container(&self) -> Container {
        Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(self.pull_policy.clone()),
            args: Some(self.args.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("http".into()),
                container_port: self.container_port,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn container_doc(&self) -> Value {
        json!({
            "name": self.name,
            "image": self.image,
            "imagePullPolicy": self.pull_policy,
            "args": self.args,
            "ports": [{ "name": "http", "containerPort": self.container_port, "protocol": "TCP" }],
        })
    }

    /// The NodePort Service in front of the StatefulSet's pods.
    pub fn service(&self) -> Typed<Service> {
        Typed(Service {
            metadata: ObjectMeta { name: Some(self.name.clone()), labels: Some(self.labels()), ..Default::default() },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".into()),
                selector: Some(self.labels()),
                ports: Some(vec![ServicePort {
                    name: Some("http".into()),
                    port: self.service_port,
                    target_port: Some(IntOrString::Int(self.container_port)),
                    node_port: Some(self.node_port),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

/// In-place change applied during an update cycle. Empty fields are left
/// alone, so applying the same mutation twice changes nothing the second time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub replicas: Option<i32>,
    pub image: Option<String>,
}

impl Mutation {
    pub fn replicas(n: i32) -> Self { Self { replicas: Some(n), ..Self::default() } }

    pub fn image(image: &str) -> Self { Self { image: Some(image.to_string()), ..Self::default() } }

    fn check(&self) -> Result<(), Error> {
        match self.replicas {
            Some(n) if n < 0 => Err(Error::Invalid(format!("replicas must not be negative, got {}", n))),
            _ => Ok(()),
        }
    }
}

/// A StatefulSet representation the lifecycle can build and mutate.
pub trait StatefulWorkload: Representation {
    /// Desired object for `spec`, without any server-assigned metadata.
    fn desired(spec: &WorkloadSpec) -> Self;

    fn apply(&mut self, mutation: &Mutation) -> Result<(), Error>;

    fn replicas(&self) -> Option<i32>;

    /// Images of all pod template containers, in order.
    fn images(&self) -> Vec<String>;
}

impl StatefulWorkload for Typed<StatefulSet> {
    fn desired(spec: &WorkloadSpec) -> Self {
        Typed(StatefulSet {
            metadata: ObjectMeta { name: Some(spec.name.clone()), ..Default::default() },
            spec: Some(StatefulSetSpec {
                replicas: Some(spec.replicas),
                service_name: spec.name.clone(),
                selector: LabelSelector { match_labels: Some(spec.labels()), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(spec.labels()), ..Default::default() }),
                    spec: Some(PodSpec { containers: vec![spec.container()], ..Default::default() }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<(), Error> {
        mutation.check()?;
        let name = self.name().unwrap_or_default().to_string();
        let sts = self.spec.as_mut().ok_or_else(|| Error::Invalid(format!("StatefulSet {:?} has no spec", name)))?;
        if let Some(n) = mutation.replicas {
            sts.replicas = Some(n);
        }
        if let Some(image) = &mutation.image {
            let container = sts
                .template
                .spec
                .as_mut()
                .and_then(|pod| pod.containers.first_mut())
                .ok_or_else(|| Error::Invalid(format!("StatefulSet {:?} has no containers", name)))?;
            container.image = Some(image.clone());
        }
        Ok(())
    }

    fn replicas(&self) -> Option<i32> { self.spec.as_ref().and_then(|s| s.replicas) }

    fn images(&self) -> Vec<String> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|pod| pod.containers.iter().filter_map(|c| c.image.clone()).collect())
            .unwrap_or_default()
    }
}

fn containers_path() -> FieldPath { FieldPath::from(["spec", "template", "spec", "containers"]) }

impl StatefulWorkload for DynamicDoc {
    fn desired(spec: &WorkloadSpec) -> Self {
        let labels = json!({ "app": spec.name });
        let doc = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": spec.name },
            "spec": {
                "replicas": spec.replicas,
                "serviceName": spec.name,
                "selector": { "matchLabels": labels },
                "template": {
                    "metadata": { "labels": labels },
                    "spec": { "containers": [spec.container_doc()] },
                },
            },
        });
        match doc {
            Value::Object(map) => DynamicDoc::from(map),
            _ => DynamicDoc::default(),
        }
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<(), Error> {
        mutation.check()?;
        if let Some(n) = mutation.replicas {
            self.set(["spec", "replicas"], n)?;
        }
        if let Some(image) = &mutation.image {
            // Sequences are replaced as a whole, never patched element-wise.
            let mut containers = self.get_seq(containers_path())?.clone();
            let first = containers
                .first_mut()
                .and_then(Value::as_object_mut)
                .ok_or_else(|| Error::Invalid(format!("{} has no container mapping", containers_path())))?;
            first.insert("image".into(), Value::String(image.clone()));
            self.set(containers_path(), Value::Array(containers))?;
        }
        Ok(())
    }

    fn replicas(&self) -> Option<i32> { self.get_i64(["spec", "replicas"]).ok().and_then(|n| i32::try_from(n).ok()) }

    fn images(&self) -> Vec<String> {
        self.get_seq(containers_path())
            .map(|cs| cs.iter().filter_map(|c| c.get("image").and_then(Value::as_str).map(str::to_string)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_representations_describe_the_same_object() {
        let spec = WorkloadSpec::default();
        let typed = <Typed<StatefulSet> as StatefulWorkload>::desired(&spec);
        let dynamic = <DynamicDoc as StatefulWorkload>::desired(&spec);
        assert_eq!(typed.to_document().expect("typed"), dynamic.to_document().expect("dynamic"));
        assert_eq!(dynamic.get_str(["spec", "serviceName"]).expect("serviceName"), "book-server");
        assert_eq!(dynamic.get_str("spec.template.spec.containers[0].args[0]".parse::<FieldPath>().expect("path")).expect("arg"), "serve");
    }

    #[test]
    fn mutations_agree_across_representations() {
        let spec = WorkloadSpec::default();
        let mut typed = <Typed<StatefulSet> as StatefulWorkload>::desired(&spec);
        let mut dynamic = <DynamicDoc as StatefulWorkload>::desired(&spec);
        let m = Mutation { replicas: Some(1), image: Some("almasood/book-server:v2".into()) };
        typed.apply(&m).expect("typed");
        dynamic.apply(&m).expect("dynamic");
        assert_eq!(typed.replicas(), Some(1));
        assert_eq!(dynamic.images(), vec!["almasood/book-server:v2".to_string()]);
        assert_eq!(typed.to_document().expect("typed"), dynamic.to_document().expect("dynamic"));
    }

    #[test]
    fn negative_replicas_are_rejected() {
        let mut dynamic = <DynamicDoc as StatefulWorkload>::desired(&WorkloadSpec::default());
        assert!(matches!(dynamic.apply(&Mutation::replicas(-1)), Err(Error::Invalid(_))));
        assert_eq!(dynamic.replicas(), Some(2));
    }

    #[test]
    fn image_change_without_containers_fails() {
        let mut typed = Typed(StatefulSet {
            metadata: ObjectMeta { name: Some("bare".into()), ..Default::default() },
            spec: Some(StatefulSetSpec::default()),
            ..Default::default()
        });
        assert!(matches!(typed.apply(&Mutation::image("x")), Err(Error::Invalid(_))));

        let mut doc = DynamicDoc::new("apps/v1", "StatefulSet", "bare");
        assert!(matches!(doc.apply(&Mutation::image("x")), Err(Error::Path(_))));
    }

    #[test]
    fn service_exposes_node_port() {
        let svc = WorkloadSpec::default().service();
        let doc = svc.to_document().expect("doc");
        assert_eq!(doc["kind"], "Service");
        assert_eq!(doc["spec"]["type"], "NodePort");
        assert_eq!(doc["spec"]["ports"][0]["nodePort"], 30080);
        assert_eq!(doc["spec"]["ports"][0]["targetPort"], 3000);
        assert_eq!(doc["spec"]["selector"]["app"], "book-server");
    }
}
