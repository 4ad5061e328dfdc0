use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// The kind of a managed resource.
///
/// Well-known kinds carry their own dependency rank and normalization rules;
/// anything else (including instances of custom types) is `Custom`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Namespace,
    CustomResourceDefinition,
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    Job,
    CronJob,
    Pod,
    Service,
    ConfigMap,
    Secret,
    ServiceAccount,
    Ingress,
    PersistentVolumeClaim,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    Custom(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Namespace => "Namespace",
            Self::CustomResourceDefinition => "CustomResourceDefinition",
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
            Self::Pod => "Pod",
            Self::Service => "Service",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::ServiceAccount => "ServiceAccount",
            Self::Ingress => "Ingress",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::Custom(kind) => kind,
        }
    }

    /// Dependency class used to order a plan.
    ///
    /// 0 = containers (namespaces), 1 = type definitions, 2 = workloads,
    /// 3 = everything else.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Namespace => 0,
            Self::CustomResourceDefinition => 1,
            Self::Deployment
            | Self::StatefulSet
            | Self::DaemonSet
            | Self::ReplicaSet
            | Self::Job
            | Self::CronJob
            | Self::Pod => 2,
            _ => 3,
        }
    }

    /// Whether resources of this kind live outside any namespace.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            Self::Namespace
                | Self::CustomResourceDefinition
                | Self::ClusterRole
                | Self::ClusterRoleBinding
        )
    }
}

impl From<&str> for ResourceKind {
    fn from(s: &str) -> Self {
        match s {
            "Namespace" => Self::Namespace,
            "CustomResourceDefinition" => Self::CustomResourceDefinition,
            "Deployment" => Self::Deployment,
            "StatefulSet" => Self::StatefulSet,
            "DaemonSet" => Self::DaemonSet,
            "ReplicaSet" => Self::ReplicaSet,
            "Job" => Self::Job,
            "CronJob" => Self::CronJob,
            "Pod" => Self::Pod,
            "Service" => Self::Service,
            "ConfigMap" => Self::ConfigMap,
            "Secret" => Self::Secret,
            "ServiceAccount" => Self::ServiceAccount,
            "Ingress" => Self::Ingress,
            "PersistentVolumeClaim" => Self::PersistentVolumeClaim,
            "ClusterRole" => Self::ClusterRole,
            "ClusterRoleBinding" => Self::ClusterRoleBinding,
            "Role" => Self::Role,
            "RoleBinding" => Self::RoleBinding,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for ResourceKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a managed resource within a destination.
///
/// Ordered lexicographically by (kind, namespace, name).
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<ResourceKind>, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.map(String::from),
            name: name.to_string(),
        }
    }

    pub fn namespaced(kind: impl Into<ResourceKind>, namespace: &str, name: &str) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    pub fn cluster(kind: impl Into<ResourceKind>, name: &str) -> Self {
        Self::new(kind, None, name)
    }

    pub fn rank(&self) -> u8 {
        self.kind.rank()
    }

    /// Derive the key of a manifest. Namespaced kinds without an explicit
    /// namespace fall back to `default_namespace`.
    pub fn from_manifest(manifest: &Value, default_namespace: &str) -> Result<Self, CoreError> {
        let kind = manifest
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CoreError::MissingField("kind".into()))?;
        let kind = ResourceKind::from(kind);

        let name = manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CoreError::MissingField("metadata.name".into()))?;

        let namespace = if kind.is_cluster_scoped() {
            None
        } else {
            Some(
                manifest
                    .pointer("/metadata/namespace")
                    .and_then(Value::as_str)
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or(default_namespace)
                    .to_string(),
            )
        };

        Ok(Self {
            kind,
            namespace,
            name: name.to_string(),
        })
    }
}

impl Ord for ResourceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .as_str()
            .cmp(other.kind.as_str())
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ResourceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A resource document at a specific revision. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub manifest: Value,
    pub revision: String,
}

impl DesiredResource {
    /// Build from a render-complete manifest. The resolved namespace is
    /// written back into the manifest so it compares cleanly with live state.
    pub fn from_manifest(
        mut manifest: Value,
        revision: &str,
        default_namespace: &str,
    ) -> Result<Self, CoreError> {
        if !manifest.is_object() {
            return Err(CoreError::InvalidResource(
                "resource document must be a JSON object".into(),
            ));
        }
        let key = ResourceKey::from_manifest(&manifest, default_namespace)?;
        if let Some(ns) = &key.namespace {
            if let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata.insert("namespace".into(), Value::String(ns.clone()));
            }
        }
        Ok(Self {
            key,
            manifest,
            revision: revision.to_string(),
        })
    }

    /// Copy of this resource carrying `selector` in `metadata.labels`.
    pub fn with_label(&self, selector: &LabelSelector) -> Self {
        let mut labeled = self.clone();
        if let Some(metadata) = labeled
            .manifest
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            let labels = metadata
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(selector.key.clone(), Value::String(selector.value.clone()));
            }
        }
        labeled
    }

    /// For a CustomResourceDefinition, the kind it declares.
    pub fn defined_kind(&self) -> Option<ResourceKind> {
        if self.key.kind != ResourceKind::CustomResourceDefinition {
            return None;
        }
        self.manifest
            .pointer("/spec/names/kind")
            .and_then(Value::as_str)
            .map(ResourceKind::from)
    }
}

/// Live state of a resource as last seen on the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "object", rename_all = "snake_case")]
pub enum LiveObject {
    Present(Value),
    NotFound,
}

impl LiveObject {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Present(v) => Some(v),
            Self::NotFound => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Live snapshot of one resource, refreshed on each poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedResource {
    pub key: ResourceKey,
    pub live: LiveObject,
}

impl ObservedResource {
    pub fn present(key: ResourceKey, object: Value) -> Self {
        Self {
            key,
            live: LiveObject::Present(object),
        }
    }

    pub fn not_found(key: ResourceKey) -> Self {
        Self {
            key,
            live: LiveObject::NotFound,
        }
    }
}

/// Equality label selector used to discover resources owned by an application.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, object: &Value) -> bool {
        object
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(&self.key))
            .and_then(Value::as_str)
            == Some(self.value.as_str())
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}
