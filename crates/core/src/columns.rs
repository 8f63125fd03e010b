//! Summary columns for the kinds keel manages, rendered from raw documents.
//!
//! Works on documents rather than typed structs so both representations
//! print the same way.

use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub label: &'static str,
    pub value: String,
}

fn col(label: &'static str, value: impl Into<String>) -> Column {
    Column { label, value: value.into() }
}

/// Columns for a `(group/version, kind)` pair; unknown kinds get name and
/// resourceVersion only.
pub fn summarize(api_version: &str, kind: &str, raw: &Value) -> Vec<Column> {
    let mut out = vec![col("NAME", raw.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("-"))];
    match (api_version, kind) {
        ("apps/v1", "StatefulSet") => out.extend(statefulset(raw)),
        ("v1", "Service") => out.extend(service(raw)),
        _ => {}
    }
    out.push(col("RV", raw.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or("-")));
    out
}

fn statefulset(raw: &Value) -> Vec<Column> {
    let desired = raw.pointer("/spec/replicas").and_then(|v| v.as_u64()).unwrap_or(1);
    let ready = raw.pointer("/status/readyReplicas").and_then(|v| v.as_u64()).unwrap_or(0);
    let images: Vec<&str> = raw
        .pointer("/spec/template/spec/containers")
        .and_then(|v| v.as_array())
        .map(|cs| cs.iter().filter_map(|c| c.get("image").and_then(|v| v.as_str())).collect())
        .unwrap_or_default();
    vec![
        col("READY", format!("{}/{}", ready, desired)),
        col("IMAGES", if images.is_empty() { "-".to_string() } else { images.join(",") }),
    ]
}

fn service(raw: &Value) -> Vec<Column> {
    let mut out = Vec::new();
    out.push(col("TYPE", raw.pointer("/spec/type").and_then(|v| v.as_str()).unwrap_or("ClusterIP")));
    out.push(col("CLUSTER-IP", raw.pointer("/spec/clusterIP").and_then(|v| v.as_str()).unwrap_or("-")));
    let mut ports: Vec<String> = Vec::new();
    if let Some(arr) = raw.pointer("/spec/ports").and_then(|v| v.as_array()) {
        for p in arr.iter().take(4) {
            let port = p.get("port").and_then(|v| v.as_u64()).unwrap_or(0);
            let proto = p.get("protocol").and_then(|v| v.as_str()).unwrap_or("TCP");
            match p.get("nodePort").and_then(|v| v.as_u64()) {
                Some(np) => ports.push(format!("{}:{}/{}", port, np, proto)),
                None => ports.push(format!("{}/{}", port, proto)),
            }
        }
    }
    out.push(col("PORTS", if ports.is_empty() { "-".to_string() } else { ports.join(",") }));
    out
}
