//! Schema-less object representation addressed by field paths.
//!
//! A [`DynamicDoc`] is the JSON document of a cluster object held as a nested
//! mapping. Fields are reached with a [`FieldPath`] (ordered keys and sequence
//! indices). Every access is checked at runtime and fails with a [`PathError`]
//! at the first segment that does not match the document's shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, PathError, Representation};

/// One step of a field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl From<&str> for Segment {
    fn from(k: &str) -> Self { Segment::Key(k.to_string()) }
}

impl From<String> for Segment {
    fn from(k: String) -> Self { Segment::Key(k) }
}

impl From<usize> for Segment {
    fn from(i: usize) -> Self { Segment::Index(i) }
}

/// Ordered sequence of keys/indices, e.g. `spec.template.spec.containers[0].image`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    pub fn new() -> Self { Self(Vec::new()) }

    pub fn key(mut self, k: impl Into<String>) -> Self {
        self.0.push(Segment::Key(k.into()));
        self
    }

    pub fn index(mut self, i: usize) -> Self {
        self.0.push(Segment::Index(i));
        self
    }

    pub fn segments(&self) -> &[Segment] { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    fn render(segs: &[Segment]) -> String {
        if segs.is_empty() {
            return ".".to_string();
        }
        let mut out = String::new();
        for seg in segs {
            match seg {
                Segment::Key(k) => {
                    if !out.is_empty() { out.push('.'); }
                    out.push_str(k);
                }
                Segment::Index(i) => out.push_str(&format!("[{}]", i)),
            }
        }
        out
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&Self::render(&self.0)) }
}

impl<S: Into<Segment>, const N: usize> From<[S; N]> for FieldPath {
    fn from(segs: [S; N]) -> Self { Self(segs.into_iter().map(Into::into).collect()) }
}

impl From<Vec<Segment>> for FieldPath {
    fn from(segs: Vec<Segment>) -> Self { Self(segs) }
}

impl From<&FieldPath> for FieldPath {
    fn from(p: &FieldPath) -> Self { p.clone() }
}

/// Dotted form with bracketed indices: `spec.containers[0].image`.
/// Keys that themselves contain dots or brackets need the builder API.
impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let malformed = || PathError::Malformed { path: s.to_string() };
        let mut segs = Vec::new();
        for part in s.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(p) => (&part[..p], &part[p..]),
                None => (part, ""),
            };
            if key.is_empty() && (segs.is_empty() || rest.is_empty()) {
                return Err(malformed());
            }
            if !key.is_empty() {
                segs.push(Segment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let inner = rest.strip_prefix('[').ok_or_else(malformed)?;
                let end = inner.find(']').ok_or_else(malformed)?;
                let idx = inner[..end].parse::<usize>().map_err(|_| malformed())?;
                segs.push(Segment::Index(idx));
                rest = &inner[end + 1..];
            }
        }
        Ok(Self(segs))
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

fn as_map_mut<'a>(v: &'a mut Value, at: &[Segment]) -> Result<&'a mut Map<String, Value>, PathError> {
    match v {
        Value::Object(m) => Ok(m),
        other => Err(PathError::NotContainer { path: FieldPath::render(at), found: kind_of(other) }),
    }
}

fn as_seq_mut<'a>(v: &'a mut Value, at: &[Segment]) -> Result<&'a mut Vec<Value>, PathError> {
    match v {
        Value::Array(items) => Ok(items),
        other => Err(PathError::NotContainer { path: FieldPath::render(at), found: kind_of(other) }),
    }
}

/// A cluster object as a nested JSON mapping. The root is always a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct DynamicDoc {
    root: Value,
}

impl Default for DynamicDoc {
    fn default() -> Self { Self { root: Value::Object(Map::new()) } }
}

impl TryFrom<Value> for DynamicDoc {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::Object(_) => Ok(Self { root: v }),
            other => Err(Error::Codec(format!("object document must be a mapping, got a {}", kind_of(&other)))),
        }
    }
}

impl From<DynamicDoc> for Value {
    fn from(d: DynamicDoc) -> Self { d.root }
}

impl From<Map<String, Value>> for DynamicDoc {
    fn from(m: Map<String, Value>) -> Self { Self { root: Value::Object(m) } }
}

impl DynamicDoc {
    /// Skeleton document carrying `apiVersion`, `kind` and `metadata.name`.
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        let mut root = Map::new();
        root.insert("apiVersion".into(), Value::String(api_version.to_string()));
        root.insert("kind".into(), Value::String(kind.to_string()));
        let mut meta = Map::new();
        meta.insert("name".into(), Value::String(name.to_string()));
        root.insert("metadata".into(), Value::Object(meta));
        Self::from(root)
    }

    pub fn api_version(&self) -> Option<&str> { self.get_str(["apiVersion"]).ok() }

    pub fn kind(&self) -> Option<&str> { self.get_str(["kind"]).ok() }

    pub fn namespace(&self) -> Option<&str> { self.get_str(["metadata", "namespace"]).ok() }

    /// Value at `path`. A missing key, an index past the end or an explicit
    /// `null` is `NotFound`; descending into a scalar is `NotContainer`.
    pub fn get(&self, path: impl Into<FieldPath>) -> Result<&Value, PathError> {
        let path = path.into();
        let segs = path.segments();
        if segs.is_empty() {
            return Err(PathError::Empty);
        }
        let mut cur = &self.root;
        for (i, seg) in segs.iter().enumerate() {
            let not_found = || PathError::NotFound { path: FieldPath::render(&segs[..=i]) };
            cur = match (seg, cur) {
                (Segment::Key(k), Value::Object(map)) => map.get(k).ok_or_else(not_found)?,
                (Segment::Index(idx), Value::Array(items)) => items.get(*idx).ok_or_else(not_found)?,
                (_, Value::Null) => return Err(not_found()),
                (_, other) => return Err(PathError::NotContainer { path: FieldPath::render(&segs[..i]), found: kind_of(other) }),
            };
        }
        if cur.is_null() {
            return Err(PathError::NotFound { path: path.to_string() });
        }
        Ok(cur)
    }

    pub fn get_i64(&self, path: impl Into<FieldPath>) -> Result<i64, PathError> {
        let path = path.into();
        let v = self.get(&path)?;
        v.as_i64().ok_or_else(|| PathError::TypeMismatch { path: path.to_string(), expected: "integer", found: kind_of(v) })
    }

    pub fn get_str(&self, path: impl Into<FieldPath>) -> Result<&str, PathError> {
        let path = path.into();
        let v = self.get(&path)?;
        v.as_str().ok_or_else(|| PathError::TypeMismatch { path: path.to_string(), expected: "string", found: kind_of(v) })
    }

    pub fn get_bool(&self, path: impl Into<FieldPath>) -> Result<bool, PathError> {
        let path = path.into();
        let v = self.get(&path)?;
        v.as_bool().ok_or_else(|| PathError::TypeMismatch { path: path.to_string(), expected: "boolean", found: kind_of(v) })
    }

    pub fn get_map(&self, path: impl Into<FieldPath>) -> Result<&Map<String, Value>, PathError> {
        let path = path.into();
        let v = self.get(&path)?;
        v.as_object().ok_or_else(|| PathError::TypeMismatch { path: path.to_string(), expected: "mapping", found: kind_of(v) })
    }

    pub fn get_seq(&self, path: impl Into<FieldPath>) -> Result<&Vec<Value>, PathError> {
        let path = path.into();
        let v = self.get(&path)?;
        v.as_array().ok_or_else(|| PathError::TypeMismatch { path: path.to_string(), expected: "sequence", found: kind_of(v) })
    }

    /// Store `value` at `path`, creating missing intermediate mappings.
    ///
    /// Intermediate sequences are never created (which element would it be?),
    /// so a missing node followed by an index is `ImplicitSequence`. Indices
    /// must address an existing element. On error the document is unchanged.
    pub fn set(&mut self, path: impl Into<FieldPath>, value: impl Into<Value>) -> Result<(), PathError> {
        let path = path.into();
        let segs = path.segments();
        let (last, parents) = segs.split_last().ok_or(PathError::Empty)?;
        self.check_settable(segs)?;
        let mut cur = &mut self.root;
        for (i, seg) in parents.iter().enumerate() {
            cur = match seg {
                Segment::Key(k) => {
                    let slot = as_map_mut(cur, &segs[..i])?.entry(k.clone()).or_insert(Value::Null);
                    if slot.is_null() {
                        *slot = Value::Object(Map::new());
                    }
                    slot
                }
                Segment::Index(idx) => {
                    let items = as_seq_mut(cur, &segs[..i])?;
                    let len = items.len();
                    items
                        .get_mut(*idx)
                        .ok_or_else(|| PathError::IndexOutOfBounds { path: FieldPath::render(&segs[..i]), index: *idx, len })?
                }
            };
        }
        match last {
            Segment::Key(k) => {
                as_map_mut(cur, parents)?.insert(k.clone(), value.into());
            }
            Segment::Index(idx) => {
                let items = as_seq_mut(cur, parents)?;
                let len = items.len();
                let slot = items
                    .get_mut(*idx)
                    .ok_or_else(|| PathError::IndexOutOfBounds { path: FieldPath::render(parents), index: *idx, len })?;
                *slot = value.into();
            }
        }
        Ok(())
    }

    /// Read-only walk applying `set`'s rules, so a failing `set` never
    /// leaves half-built mappings behind.
    fn check_settable(&self, segs: &[Segment]) -> Result<(), PathError> {
        // `None` once the walk is below a node that `set` would create.
        let mut cur = Some(&self.root);
        for (i, seg) in segs.iter().enumerate() {
            let at = &segs[..i];
            let Some(node) = cur else {
                if matches!(seg, Segment::Index(_)) {
                    return Err(PathError::ImplicitSequence { path: FieldPath::render(at) });
                }
                continue;
            };
            cur = match (seg, node) {
                (Segment::Key(k), Value::Object(map)) => map.get(k).filter(|v| !v.is_null()),
                (Segment::Index(idx), Value::Array(items)) => Some(items.get(*idx).ok_or_else(|| {
                    PathError::IndexOutOfBounds { path: FieldPath::render(at), index: *idx, len: items.len() }
                })?),
                (_, other) => return Err(PathError::NotContainer { path: FieldPath::render(at), found: kind_of(other) }),
            };
        }
        Ok(())
    }

    /// Remove and return the value at `path`.
    pub fn remove(&mut self, path: impl Into<FieldPath>) -> Result<Value, PathError> {
        let path = path.into();
        let segs = path.segments();
        let (last, parents) = segs.split_last().ok_or(PathError::Empty)?;
        // Validates the parent chain with the same rules as `get`.
        if !parents.is_empty() {
            self.get(FieldPath::from(parents.to_vec()))?;
        }
        let mut cur = &mut self.root;
        for (i, seg) in parents.iter().enumerate() {
            cur = match seg {
                Segment::Key(k) => as_map_mut(cur, &segs[..i])?
                    .get_mut(k)
                    .ok_or_else(|| PathError::NotFound { path: FieldPath::render(&segs[..=i]) })?,
                Segment::Index(idx) => as_seq_mut(cur, &segs[..i])?
                    .get_mut(*idx)
                    .ok_or_else(|| PathError::NotFound { path: FieldPath::render(&segs[..=i]) })?,
            };
        }
        let not_found = || PathError::NotFound { path: path.to_string() };
        match last {
            Segment::Key(k) => as_map_mut(cur, parents)?.remove(k).ok_or_else(not_found),
            Segment::Index(idx) => {
                let items = as_seq_mut(cur, parents)?;
                if *idx < items.len() { Ok(items.remove(*idx)) } else { Err(not_found()) }
            }
        }
    }
}

impl Representation for DynamicDoc {
    fn name(&self) -> Option<&str> { self.get_str(["metadata", "name"]).ok() }

    fn resource_version(&self) -> Option<&str> { self.get_str(["metadata", "resourceVersion"]).ok() }

    fn to_document(&self) -> Result<Value, Error> { Ok(self.root.clone()) }

    fn from_document(doc: Value) -> Result<Self, Error> { Self::try_from(doc) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> DynamicDoc {
        DynamicDoc::try_from(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "book-server", "resourceVersion": "7" },
            "spec": {
                "replicas": 2,
                "template": { "spec": { "containers": [ { "name": "book-server", "image": "a:1" } ] } }
            }
        }))
        .expect("mapping")
    }

    #[test]
    fn set_then_get_replicas() {
        let mut d = doc();
        d.set(["spec", "replicas"], 1).expect("set");
        assert_eq!(d.get_i64(["spec", "replicas"]).expect("get"), 1);
        assert_eq!(d.get(["spec", "replicas"]).expect("get"), &json!(1));
    }

    #[test]
    fn get_missing_path_is_not_found() {
        let d = doc();
        assert_eq!(d.get(["spec", "serviceName"]), Err(PathError::NotFound { path: "spec.serviceName".into() }));
        assert!(matches!(d.get(["status", "replicas"]), Err(PathError::NotFound { .. })));
        let p: FieldPath = "spec.template.spec.containers[3].image".parse().expect("path");
        assert!(matches!(d.get(p), Err(PathError::NotFound { .. })));
    }

    #[test]
    fn set_through_scalar_is_path_error() {
        let mut d = doc();
        let before = d.clone();
        let err = d.set(["metadata", "name", "first"], "x").unwrap_err();
        assert_eq!(err, PathError::NotContainer { path: "metadata.name".into(), found: "string" });
        assert_eq!(d, before);
    }

    #[test]
    fn set_creates_intermediate_mappings() {
        let mut d = doc();
        d.set(["spec", "template", "metadata", "labels", "app"], "book-server").expect("set");
        assert_eq!(d.get_str(["spec", "template", "metadata", "labels", "app"]).expect("get"), "book-server");
    }

    #[test]
    fn set_never_creates_sequences() {
        let mut d = doc();
        let p = FieldPath::new().key("spec").key("volumeClaimTemplates").index(0).key("name");
        assert_eq!(d.set(p, "data"), Err(PathError::ImplicitSequence { path: "spec.volumeClaimTemplates".into() }));
        assert!(d.get(["spec", "volumeClaimTemplates"]).is_err());
    }

    #[test]
    fn failed_set_leaves_no_partial_mappings() {
        let mut d = DynamicDoc::new("apps/v1", "StatefulSet", "x");
        let before = d.clone();
        let p: FieldPath = "spec.volumeClaimTemplates[0].name".parse().expect("path");
        assert_eq!(d.set(p, "data"), Err(PathError::ImplicitSequence { path: "spec.volumeClaimTemplates".into() }));
        assert_eq!(d, before);

        let p: FieldPath = "a.b.c[0]".parse().expect("path");
        assert_eq!(d.set(p, 1), Err(PathError::ImplicitSequence { path: "a.b.c".into() }));
        assert!(d.get(["a"]).is_err());
        assert_eq!(d, before);
    }

    #[test]
    fn indices_must_exist() {
        let mut d = doc();
        let ok: FieldPath = "spec.template.spec.containers[0].image".parse().expect("path");
        d.set(&ok, "b:2").expect("set");
        assert_eq!(d.get_str(&ok).expect("get"), "b:2");

        let oob: FieldPath = "spec.template.spec.containers[1].image".parse().expect("path");
        assert_eq!(
            d.set(oob, "c:3"),
            Err(PathError::IndexOutOfBounds { path: "spec.template.spec.containers".into(), index: 1, len: 1 })
        );
    }

    #[test]
    fn typed_getters_check_leaf_type() {
        let d = doc();
        assert_eq!(
            d.get_i64(["metadata", "name"]),
            Err(PathError::TypeMismatch { path: "metadata.name".into(), expected: "integer", found: "string" })
        );
        assert!(d.get_seq(["spec", "template", "spec", "containers"]).is_ok());
        assert!(d.get_map(["spec", "replicas"]).is_err());

        let mut d = d;
        d.set(["spec", "template", "spec", "hostNetwork"], false).expect("set");
        assert_eq!(d.get_bool(["spec", "template", "spec", "hostNetwork"]), Ok(false));
        assert_eq!(
            d.get_bool(["spec", "replicas"]),
            Err(PathError::TypeMismatch { path: "spec.replicas".into(), expected: "boolean", found: "number" })
        );
    }

    #[test]
    fn remove_returns_old_value() {
        let mut d = doc();
        assert_eq!(d.remove(["spec", "replicas"]).expect("remove"), json!(2));
        assert!(matches!(d.remove(["spec", "replicas"]), Err(PathError::NotFound { .. })));
        assert!(matches!(d.remove(["nope", "x"]), Err(PathError::NotFound { .. })));
    }

    #[test]
    fn path_parsing_and_display() {
        let p: FieldPath = "spec.template.spec.containers[0].ports[1].containerPort".parse().expect("path");
        assert_eq!(p.segments().len(), 8);
        assert_eq!(p.to_string(), "spec.template.spec.containers[0].ports[1].containerPort");
        assert_eq!("".parse::<FieldPath>(), Err(PathError::Empty));
        assert!("spec..replicas".parse::<FieldPath>().is_err());
        assert!("spec.containers[x]".parse::<FieldPath>().is_err());
        assert!("spec.containers[0".parse::<FieldPath>().is_err());
    }

    #[test]
    fn identity_accessors_and_root_must_be_mapping() {
        let d = doc();
        assert_eq!(d.name(), Some("book-server"));
        assert_eq!(d.resource_version(), Some("7"));
        assert_eq!(d.kind(), Some("StatefulSet"));
        assert!(DynamicDoc::from_document(json!([1, 2])).is_err());
    }

    #[test]
    fn wire_round_trip_is_field_for_field() {
        let d = doc();
        let bytes = d.to_wire_document().expect("encode");
        let back = DynamicDoc::from_wire_document(&bytes).expect("decode");
        assert_eq!(back, d);
    }
}
