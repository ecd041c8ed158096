//! Typed access to the cluster's object store.
//!
//! Every controller reads and writes through a [`ClusterGateway`], which keeps the reconcile logic
//! independent of the API server and lets tests run it against [`memory::MemoryGateway`].

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelector, LabelSelectorRequirement, ObjectMeta,
    },
    kube::{api::DynamicObject, runtime::reflector::ObjectRef, Resource},
};

mod kube;
#[cfg(test)]
pub mod memory;

pub use self::kube::KubeGateway;

/// Any Kubernetes object the gateway can move across the wire.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{object} was not found"))]
    NotFound { object: ObjectRef<DynamicObject> },

    #[snafu(display("{object} already exists"))]
    AlreadyExists { object: ObjectRef<DynamicObject> },

    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: ObjectRef<DynamicObject> },

    #[snafu(display("request for {object} failed"))]
    Request {
        source: stackable_operator::kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to serialize {object}"))]
    Serialize {
        source: serde_json::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to deserialize {object}"))]
    Deserialize {
        source: serde_json::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("invalid label selector: {message}"))]
    InvalidSelector { message: String },

    #[snafu(display("failed to discover the resources served by {group_version}"))]
    Discovery {
        source: stackable_operator::kube::Error,
        group_version: String,
    },

    #[snafu(display("failed to publish event for {object}"))]
    PublishEvent {
        source: stackable_operator::kube::Error,
        object: ObjectRef<DynamicObject>,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Whether an admission webhook could not be reached while handling the request.
    pub fn is_webhook_unreachable(&self) -> bool {
        matches!(
            self,
            Error::Request {
                source: stackable_operator::kube::Error::Api(response),
                ..
            } if response.message.contains("failed to call webhook")
        )
    }

    /// The object the failed call was about, if any.
    pub fn object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::NotFound { object }
            | Error::AlreadyExists { object }
            | Error::Conflict { object }
            | Error::Request { object, .. }
            | Error::Serialize { object, .. }
            | Error::Deserialize { object, .. }
            | Error::PublishEvent { object, .. } => Some(object.clone()),
            Error::InvalidSelector { .. } | Error::Discovery { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// A Kubernetes event to attach to an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperandEvent {
    pub type_: EventType,
    pub reason: String,
    pub message: String,
    pub action: String,
}

impl OperandEvent {
    pub fn normal(reason: &str, message: impl Into<String>) -> Self {
        OperandEvent {
            type_: EventType::Normal,
            reason: reason.to_string(),
            message: message.into(),
            action: "Reconcile".to_string(),
        }
    }

    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        OperandEvent {
            type_: EventType::Warning,
            ..Self::normal(reason, message)
        }
    }
}

/// Restricts a list call by labels and by well-known fields.
#[derive(Clone, Debug, Default)]
pub struct ListSelector {
    pub labels: Option<LabelSelector>,
    /// Equality constraints on `metadata.name` and `metadata.namespace`.
    pub fields: BTreeMap<String, String>,
}

impl ListSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with_labels(labels: LabelSelector) -> Self {
        ListSelector {
            labels: Some(labels),
            ..Self::default()
        }
    }

    pub fn with_label(key: &str, value: &str) -> Self {
        Self::with_labels(LabelSelector {
            match_labels: Some([(key.to_string(), value.to_string())].into()),
            ..LabelSelector::default()
        })
    }

    /// Selects objects whose label `key` takes any of `values`.
    pub fn with_label_in(key: &str, values: impl IntoIterator<Item = String>) -> Self {
        Self::with_labels(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: "In".to_string(),
                values: Some(values.into_iter().collect()),
            }]),
            ..LabelSelector::default()
        })
    }

    pub fn with_field(key: &str, value: &str) -> Self {
        ListSelector {
            fields: [(key.to_string(), value.to_string())].into(),
            ..Self::default()
        }
    }

    pub fn label_query(&self) -> Result<Option<String>> {
        self.labels
            .as_ref()
            .map(|labels| {
                stackable_operator::label_selector::convert_label_selector_to_query_string(labels)
                    .map_err(|err| Error::InvalidSelector {
                        message: err.to_string(),
                    })
            })
            .transpose()
    }

    pub fn field_query(&self) -> Option<String> {
        (!self.fields.is_empty()).then(|| {
            self.fields
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",")
        })
    }

    /// Evaluates the selector locally against an object's metadata.
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        let fields_match = self.fields.iter().all(|(key, value)| match key.as_str() {
            "metadata.name" => meta.name.as_deref() == Some(value.as_str()),
            "metadata.namespace" => meta.namespace.as_deref() == Some(value.as_str()),
            _ => false,
        });
        fields_match
            && self
                .labels
                .as_ref()
                .map_or(true, |selector| label_selector_matches(selector, meta))
    }
}

fn label_selector_matches(selector: &LabelSelector, meta: &ObjectMeta) -> bool {
    let empty = BTreeMap::new();
    let labels = meta.labels.as_ref().unwrap_or(&empty);
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(key, value)| labels.get(key) == Some(value));
    let expressions_match = selector.match_expressions.iter().flatten().all(|req| {
        let values = req.values.as_deref().unwrap_or_default();
        match req.operator.as_str() {
            "In" => labels.get(&req.key).is_some_and(|v| values.contains(v)),
            "NotIn" => labels.get(&req.key).map_or(true, |v| !values.contains(v)),
            "Exists" => labels.contains_key(&req.key),
            "DoesNotExist" => !labels.contains_key(&req.key),
            _ => false,
        }
    });
    labels_match && expressions_match
}

#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Fetches an object, `None` when it does not exist.
    async fn get<K: Object>(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>>;

    /// Lists objects in `namespace`, or across all namespaces when `None`.
    async fn list<K: Object>(&self, namespace: Option<&str>, selector: &ListSelector)
        -> Result<Vec<K>>;

    /// Fails with [`Error::AlreadyExists`] when an object of that name exists.
    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    /// Replaces an object, guarded by its `resourceVersion` when one is set.
    async fn update<K: Object>(&self, obj: &K) -> Result<K>;

    /// Sends the difference between `baseline` and `obj` as a JSON merge patch.
    async fn patch<K: Object>(&self, obj: &K, baseline: &K) -> Result<K>;

    /// Returns `false` when the object was already gone.
    async fn delete<K: Object>(&self, obj: &K) -> Result<bool>;

    /// Writes the status subresource, guarded by the object's `resourceVersion`.
    async fn update_status<K: Object>(&self, obj: &K) -> Result<K>;

    /// Whether the API server currently serves `kind` in `group_version` (such as `cert-manager.io/v1`).
    async fn kind_exists(&self, group_version: &str, kind: &str) -> Result<bool>;

    async fn publish_event<K: Object>(&self, obj: &K, event: &OperandEvent) -> Result<()>;

    async fn delete_named<K: Object>(&self, name: &str, namespace: Option<&str>) -> Result<bool> {
        match self.get::<K>(name, namespace).await? {
            Some(obj) => self.delete(&obj).await,
            None => Ok(false),
        }
    }
}

/// Reference to an object that may not exist yet.
pub fn object_ref<K: Object>(name: &str, namespace: Option<&str>) -> ObjectRef<DynamicObject> {
    let object = ObjectRef::<K>::new(name);
    match namespace {
        Some(namespace) => object.within(namespace),
        None => object,
    }
    .erase()
}

pub fn object_ref_of<K: Object>(obj: &K) -> ObjectRef<DynamicObject> {
    ObjectRef::from_obj(obj).erase()
}

/// Computes an RFC 7386 merge patch turning `from` into `to`.
pub fn merge_patch(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, new) in to {
                match from.get(key) {
                    Some(old) if old == new => {}
                    Some(old) => {
                        patch.insert(key.clone(), merge_patch(old, new));
                    }
                    None => {
                        patch.insert(key.clone(), new.clone());
                    }
                }
            }
            for key in from.keys().filter(|key| !to.contains_key(*key)) {
                patch.insert(key.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        _ => to.clone(),
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_merge_patch_only_carries_changes() {
        let from = json!({
            "metadata": {"name": "a", "labels": {"keep": "1", "drop": "2"}},
            "spec": {"duration": null, "secretName": "s"},
        });
        let to = json!({
            "metadata": {"name": "a", "labels": {"keep": "1", "add": "3"}},
            "spec": {"duration": "17520h0m0s", "secretName": "s"},
        });
        assert_eq!(
            merge_patch(&from, &to),
            json!({
                "metadata": {"labels": {"add": "3", "drop": null}},
                "spec": {"duration": "17520h0m0s"},
            })
        );
    }

    #[test]
    fn test_merge_patch_removes_fields() {
        let from = json!({"spec": {"duration": "1h", "renewBefore": "5m"}});
        let to = json!({"spec": {}});
        assert_eq!(
            merge_patch(&from, &to),
            json!({"spec": {"duration": null, "renewBefore": null}})
        );
    }

    #[test]
    fn test_selector_matching() {
        let meta = ObjectMeta {
            name: Some("leaf".to_string()),
            namespace: Some("apps".to_string()),
            labels: Some([("certmanager.k8s.io/issuer-name".to_string(), "ca-issuer".to_string())].into()),
            ..ObjectMeta::default()
        };
        assert!(ListSelector::everything().matches(&meta));
        assert!(ListSelector::with_label_in(
            "certmanager.k8s.io/issuer-name",
            ["other".to_string(), "ca-issuer".to_string()]
        )
        .matches(&meta));
        assert!(!ListSelector::with_label_in("certmanager.k8s.io/issuer-name", []).matches(&meta));
        assert!(ListSelector::with_field("metadata.name", "leaf").matches(&meta));
        assert!(!ListSelector::with_field("metadata.name", "other").matches(&meta));
        assert!(!ListSelector::with_label("app", "x").matches(&meta));
    }

    #[test]
    fn test_queries() {
        let selector = ListSelector::with_field("metadata.name", "operand-deployment-lifecycle-manager");
        assert_eq!(
            selector.field_query().as_deref(),
            Some("metadata.name=operand-deployment-lifecycle-manager")
        );
        assert_eq!(selector.label_query().unwrap(), None);
    }
}
