//! Normalization of resource documents before comparison.
//!
//! The backend injects fields into live objects (identifiers, timestamps,
//! status subresources, defaulted values) that never appear in desired
//! documents. Each kind carries an ignore-set of such fields, expressed as
//! RFC 6901 JSON pointers; applications can extend it.

use serde_json::{Map, Value};

use crate::models::plan::FieldDrift;
use crate::models::resource::ResourceKind;

/// Fields every backend populates regardless of kind.
const COMMON_IGNORED: &[&str] = &[
    "/metadata/uid",
    "/metadata/resourceVersion",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/managedFields",
    "/metadata/selfLink",
    "/metadata/annotations/kubectl.kubernetes.io~1last-applied-configuration",
    "/status",
];

fn kind_ignored(kind: &ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Service => &["/spec/clusterIP", "/spec/clusterIPs"],
        ResourceKind::Deployment => &["/metadata/annotations/deployment.kubernetes.io~1revision"],
        ResourceKind::ServiceAccount => &["/secrets"],
        ResourceKind::Pod => &["/spec/nodeName"],
        ResourceKind::Namespace => &["/spec/finalizers"],
        _ => &[],
    }
}

/// The set of fields excluded when comparing two documents of one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreSet {
    pointers: Vec<String>,
}

impl IgnoreSet {
    /// Built-in ignore-set for `kind`.
    pub fn for_kind(kind: &ResourceKind) -> Self {
        let pointers = COMMON_IGNORED
            .iter()
            .chain(kind_ignored(kind))
            .map(|p| (*p).to_string())
            .collect();
        Self { pointers }
    }

    pub fn extend<'a>(&mut self, pointers: impl IntoIterator<Item = &'a str>) {
        for p in pointers {
            if !self.pointers.iter().any(|existing| existing == p) {
                self.pointers.push(p.to_string());
            }
        }
    }

    /// Copy of `value` with every ignored field removed and empty containers
    /// collapsed, so absent and empty compare equal.
    pub fn normalize(&self, value: &Value) -> Value {
        let mut out = value.clone();
        for pointer in &self.pointers {
            remove_pointer(&mut out, pointer);
        }
        strip_empty(&mut out);
        out
    }

    /// Whether two documents are equal after normalization.
    pub fn equivalent(&self, desired: &Value, live: &Value) -> bool {
        self.normalize(desired) == self.normalize(live)
    }
}

/// Remove the field at `pointer`. Missing paths are ignored.
pub fn remove_pointer(value: &mut Value, pointer: &str) -> Option<Value> {
    if pointer.is_empty() {
        return None;
    }
    let (parent, last) = pointer.rsplit_once('/')?;
    let key = unescape(last);
    let target = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    };
    match target? {
        Value::Object(map) => map.remove(&key),
        Value::Array(items) => {
            let idx: usize = key.parse().ok()?;
            (idx < items.len()).then(|| items.remove(idx))
        }
        _ => None,
    }
}

fn strip_empty(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                strip_empty(v);
            }
            map.retain(|_, v| !is_empty_value(v));
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_empty(v);
            }
        }
        _ => {}
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Leaf-level differences between two normalized documents.
///
/// Objects are walked key by key; arrays and scalars are compared whole.
pub fn field_drift(expected: &Value, actual: &Value) -> Vec<FieldDrift> {
    let mut out = Vec::new();
    walk(String::new(), expected, actual, &mut out);
    out
}

fn walk(path: String, expected: &Value, actual: &Value, out: &mut Vec<FieldDrift>) {
    let nested = |v: &Value| v.is_object() || v.is_null();
    if (expected.is_object() || actual.is_object()) && nested(expected) && nested(actual) {
        let empty = Map::new();
        let e = expected.as_object().unwrap_or(&empty);
        let a = actual.as_object().unwrap_or(&empty);
        let mut keys: Vec<&String> = e.keys().chain(a.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            let child = format!("{path}/{}", escape(key));
            let ev = e.get(key).unwrap_or(&Value::Null);
            let av = a.get(key).unwrap_or(&Value::Null);
            walk(child, ev, av, out);
        }
        return;
    }
    if expected != actual {
        out.push(FieldDrift {
            field: if path.is_empty() { "/".into() } else { path },
            expected: expected.clone(),
            actual: actual.clone(),
        });
    }
}
