use serde::{Deserialize, Serialize};

use crate::Error;

/// Routes an operation to one collection of cluster objects: group/version,
/// kind (with its plural resource name) and an optional namespace.
///
/// Identifies *where* an object lives, never its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    group: String,
    version: String,
    kind: String,
    plural: String,
    namespace: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespace: Option<&str>) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespace: namespace.map(|s| s.to_string()),
        }
    }

    /// `apps/v1` StatefulSets in `namespace`.
    pub fn stateful_sets(namespace: &str) -> Self {
        Self::new("apps", "v1", "StatefulSet", "statefulsets", Some(namespace))
    }

    /// Core `v1` Services in `namespace`.
    pub fn services(namespace: &str) -> Self {
        Self::new("", "v1", "Service", "services", Some(namespace))
    }

    /// Parse a `v1/Kind` or `group/v1/Kind` key. The plural is the lowercased
    /// kind with an `s` appended, which holds for the built-in workload kinds.
    pub fn parse(key: &str, namespace: Option<&str>) -> Result<Self, Error> {
        let parts: Vec<_> = key.split('/').collect();
        let (group, version, kind) = match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => ("", *version, *kind),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => (*group, *version, *kind),
            _ => return Err(Error::Invalid(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        };
        let plural = format!("{}s", kind.to_ascii_lowercase());
        Ok(Self::new(group, version, kind, &plural, namespace))
    }

    pub fn group(&self) -> &str { &self.group }
    pub fn version(&self) -> &str { &self.version }
    pub fn kind(&self) -> &str { &self.kind }
    pub fn plural(&self) -> &str { &self.plural }
    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    /// Wire `apiVersion`: `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Same kind, different namespace.
    pub fn in_namespace(&self, namespace: Option<&str>) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), ..self.clone() }
    }
}

impl std::fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} ({})", self.api_version(), self.plural, ns),
            None => write!(f, "{}/{}", self.api_version(), self.plural),
        }
    }
}
