//! In-memory [`ClusterGateway`] for reconcile tests.
//!
//! Objects are stored as JSON, resource versions are assigned on every write and checked on
//! update, every write and event is recorded, and individual verbs can be made to fail per kind.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use serde_json::Value;
use stackable_operator::{
    k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc},
    kube::{core::ErrorResponse, Resource},
};

use super::{
    merge_patch, object_ref, object_ref_of, ClusterGateway, Error, ListSelector, Object,
    OperandEvent, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    Delete,
    UpdateStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub verb: Verb,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: String,
    pub name: String,
    pub event: OperandEvent,
}

/// (apiVersion, kind, namespace, name)
type Key = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    last_version: u64,
    writes: Vec<Write>,
    events: Vec<RecordedEvent>,
    /// Injected failures and the message they carry.
    failures: BTreeMap<(Verb, String), String>,
    served: BTreeSet<(String, String)>,
}

#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

fn key<K: Object>(name: &str, namespace: Option<&str>) -> Key {
    (
        K::api_version(&()).into_owned(),
        K::kind(&()).into_owned(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn key_of<K: Object>(obj: &K) -> Key {
    let meta = obj.meta();
    key::<K>(
        meta.name.as_deref().unwrap_or_default(),
        meta.namespace.as_deref(),
    )
}

fn to_value<K: Object>(obj: &K) -> Value {
    let mut value = serde_json::to_value(obj).expect("objects must serialize");
    value["apiVersion"] = K::api_version(&()).into();
    value["kind"] = K::kind(&()).into();
    value
}

fn from_value<K: Object>(value: &Value) -> K {
    serde_json::from_value(value.clone()).expect("stored objects must deserialize")
}

/// Kinds whose status is only writable through a plain update.
const WITHOUT_STATUS_SUBRESOURCE: &[&str] =
    &[crate::external_crd::cert_manager::LEGACY_GROUP_VERSION];

fn has_status_subresource<K: Object>() -> bool {
    !WITHOUT_STATUS_SUBRESOURCE.contains(&K::api_version(&()).as_ref())
}

fn injected_failure(message: &str) -> stackable_operator::kube::Error {
    stackable_operator::kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    })
}

fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(target) = target {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        apply_merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

impl State {
    fn check<K: Object>(&self, verb: Verb, name: &str, namespace: Option<&str>) -> Result<()> {
        if let Some(message) = self.failures.get(&(verb, K::kind(&()).into_owned())) {
            return Err(Error::Request {
                source: injected_failure(message),
                object: object_ref::<K>(name, namespace),
            });
        }
        Ok(())
    }

    fn record<K: Object>(&mut self, verb: Verb, key: &Key) {
        self.writes.push(Write {
            verb,
            kind: K::kind(&()).into_owned(),
            namespace: (!key.2.is_empty()).then(|| key.2.clone()),
            name: key.3.clone(),
        });
    }

    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    /// Verifies the optimistic concurrency token of `obj` against the stored copy.
    fn stored_for_write<K: Object>(&self, obj: &K) -> Result<&Value> {
        let stored = self
            .objects
            .get(&key_of(obj))
            .ok_or_else(|| Error::NotFound {
                object: object_ref_of(obj),
            })?;
        if let Some(version) = &obj.meta().resource_version {
            if stored["metadata"]["resourceVersion"].as_str() != Some(version.as_str()) {
                return Err(Error::Conflict {
                    object: object_ref_of(obj),
                });
            }
        }
        Ok(stored)
    }

    /// Stores `value`, finishing a pending deletion once the last finalizer is gone.
    fn store<K: Object>(&mut self, key: Key, mut value: Value) -> K {
        value["metadata"]["resourceVersion"] = self.next_version().into();
        let obj: K = from_value(&value);
        let meta = obj.meta();
        if meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().map_or(true, Vec::is_empty)
        {
            self.objects.remove(&key);
        } else {
            self.objects.insert(key, value);
        }
        obj
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("gateway state lock poisoned")
    }

    /// Stores an object without recording a write.
    pub fn seed<K: Object>(&self, obj: K) -> K {
        let mut state = self.state();
        let mut value = to_value(&obj);
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = uuid::Uuid::new_v4().to_string().into();
        }
        state.store(key_of(&obj), value)
    }

    /// Marks `kind` as served by `group_version` for [`ClusterGateway::kind_exists`].
    pub fn serve(&self, group_version: &str, kind: &str) {
        self.state()
            .served
            .insert((group_version.to_string(), kind.to_string()));
    }

    /// Makes every future `verb` call on `K` fail with a request error.
    pub fn fail<K: Object>(&self, verb: Verb) {
        self.fail_with::<K>(verb, "injected failure");
    }

    /// Like [`MemoryGateway::fail`], with the message the API server would have sent.
    pub fn fail_with<K: Object>(&self, verb: Verb, message: &str) {
        self.state()
            .failures
            .insert((verb, K::kind(&()).into_owned()), message.to_string());
    }

    pub fn heal(&self) {
        self.state().failures.clear();
    }

    pub fn object<K: Object>(&self, name: &str, namespace: Option<&str>) -> Option<K> {
        self.state()
            .objects
            .get(&key::<K>(name, namespace))
            .map(from_value)
    }

    pub fn objects<K: Object>(&self) -> Vec<K> {
        let api_version = K::api_version(&());
        let kind = K::kind(&());
        self.state()
            .objects
            .iter()
            .filter(|((v, k, _, _), _)| *v == api_version && *k == kind)
            .map(|(_, value)| from_value(value))
            .collect()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state().writes.clone()
    }

    pub fn writes_to(&self, kind: &str) -> Vec<Write> {
        self.writes().into_iter().filter(|w| w.kind == kind).collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state().events.clone()
    }

    pub fn events_with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event.reason == reason)
            .collect()
    }

    /// Forgets recorded writes and events, keeping the objects.
    pub fn clear_history(&self) {
        let mut state = self.state();
        state.writes.clear();
        state.events.clear();
    }
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    async fn get<K: Object>(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>> {
        let state = self.state();
        state.check::<K>(Verb::Get, name, namespace)?;
        Ok(state.objects.get(&key::<K>(name, namespace)).map(from_value))
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<K>> {
        let objects = {
            let state = self.state();
            state.check::<K>(Verb::List, "", namespace)?;
            let api_version = K::api_version(&());
            let kind = K::kind(&());
            state
                .objects
                .iter()
                .filter(|((v, k, ns, _), _)| {
                    *v == api_version && *k == kind && namespace.map_or(true, |n| n == ns.as_str())
                })
                .map(|(_, value)| from_value::<K>(value))
                .collect::<Vec<_>>()
        };
        Ok(objects
            .into_iter()
            .filter(|obj| selector.matches(obj.meta()))
            .collect())
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let mut state = self.state();
        let key = key_of(obj);
        state.check::<K>(Verb::Create, &key.3, obj.meta().namespace.as_deref())?;
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                object: object_ref_of(obj),
            });
        }
        let mut value = to_value(obj);
        value["metadata"]["uid"] = uuid::Uuid::new_v4().to_string().into();
        state.record::<K>(Verb::Create, &key);
        Ok(state.store(key, value))
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let mut state = self.state();
        let key = key_of(obj);
        state.check::<K>(Verb::Update, &key.3, obj.meta().namespace.as_deref())?;
        let stored = state.stored_for_write(obj)?;
        let mut value = to_value(obj);
        // Updates never touch the status subresource or server-owned metadata.
        if has_status_subresource::<K>() {
            value["status"] = stored["status"].clone();
        }
        value["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        value["metadata"]["deletionTimestamp"] = stored["metadata"]["deletionTimestamp"].clone();
        if let Some(fields) = value.as_object_mut().filter(|v| v["status"].is_null()) {
            fields.remove("status");
        }
        state.record::<K>(Verb::Update, &key);
        Ok(state.store(key, value))
    }

    async fn patch<K: Object>(&self, obj: &K, baseline: &K) -> Result<K> {
        let mut state = self.state();
        let key = key_of(obj);
        state.check::<K>(Verb::Patch, &key.3, obj.meta().namespace.as_deref())?;
        let mut value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                object: object_ref_of(obj),
            })?;
        apply_merge_patch(&mut value, &merge_patch(&to_value(baseline), &to_value(obj)));
        state.record::<K>(Verb::Patch, &key);
        Ok(state.store(key, value))
    }

    async fn delete<K: Object>(&self, obj: &K) -> Result<bool> {
        let mut state = self.state();
        let key = key_of(obj);
        state.check::<K>(Verb::Delete, &key.3, obj.meta().namespace.as_deref())?;
        let Some(stored) = state.objects.get(&key).cloned() else {
            return Ok(false);
        };
        state.record::<K>(Verb::Delete, &key);
        let stored: K = from_value(&stored);
        if stored.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            let mut value = to_value(&stored);
            if value["metadata"]["deletionTimestamp"].is_null() {
                value["metadata"]["deletionTimestamp"] = serde_json::to_value(Time(Utc::now()))
                    .expect("timestamps must serialize");
            }
            state.store::<K>(key, value);
        } else {
            state.objects.remove(&key);
        }
        Ok(true)
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K> {
        let mut state = self.state();
        let key = key_of(obj);
        state.check::<K>(Verb::UpdateStatus, &key.3, obj.meta().namespace.as_deref())?;
        if !has_status_subresource::<K>() {
            return Err(Error::NotFound {
                object: object_ref_of(obj),
            });
        }
        let mut value = state.stored_for_write(obj)?.clone();
        value["status"] = to_value(obj)["status"].clone();
        state.record::<K>(Verb::UpdateStatus, &key);
        Ok(state.store(key, value))
    }

    async fn kind_exists(&self, group_version: &str, kind: &str) -> Result<bool> {
        Ok(self
            .state()
            .served
            .contains(&(group_version.to_string(), kind.to_string())))
    }

    async fn publish_event<K: Object>(&self, obj: &K, event: &OperandEvent) -> Result<()> {
        self.state().events.push(RecordedEvent {
            kind: K::kind(&()).into_owned(),
            name: obj.meta().name.clone().unwrap_or_default(),
            event: event.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use stackable_operator::k8s_openapi::{
        api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;
    use crate::external_crd::cert_manager::v1alpha1;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_optimistic_concurrency() {
        let gateway = MemoryGateway::new();
        let created = gateway.create(&config_map("a")).await.unwrap();
        let mut first = created.clone();
        first.data = Some([("k".to_string(), "1".to_string())].into());
        gateway.update(&first).await.unwrap();
        let mut stale = created;
        stale.data = Some([("k".to_string(), "2".to_string())].into());
        assert!(matches!(
            gateway.update(&stale).await,
            Err(Error::Conflict { .. })
        ));
        assert!(gateway.create(&config_map("a")).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_finalizers_delay_deletion() {
        let gateway = MemoryGateway::new();
        let mut cm = config_map("held");
        cm.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
        let cm = gateway.seed(cm);
        assert!(gateway.delete(&cm).await.unwrap());
        let mut pending = gateway.object::<ConfigMap>("held", Some("ns")).unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());
        pending.metadata.finalizers = Some(vec![]);
        gateway.update(&pending).await.unwrap();
        assert!(gateway.object::<ConfigMap>("held", Some("ns")).is_none());
        assert!(!gateway.delete(&pending).await.unwrap());
    }

    #[tokio::test]
    async fn test_legacy_status_is_written_with_the_object() {
        let gateway = MemoryGateway::new();
        let mut legacy: v1alpha1::Certificate = serde_yaml::from_str(
            "
            apiVersion: certmanager.k8s.io/v1alpha1
            kind: Certificate
            metadata: {name: leaf, namespace: ns}
            spec:
              secretName: leaf-secret
              issuerRef: {name: cs-ca-issuer}
            ",
        )
        .unwrap();
        legacy = gateway.seed(legacy);
        legacy.status = Some(v1alpha1::CertificateStatus::default());
        assert!(gateway.update_status(&legacy).await.unwrap_err().is_not_found());
        gateway.update(&legacy).await.unwrap();
        assert!(gateway
            .object::<v1alpha1::Certificate>("leaf", Some("ns"))
            .unwrap()
            .status
            .is_some());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let gateway = MemoryGateway::new();
        gateway.fail::<ConfigMap>(Verb::Create);
        assert!(matches!(
            gateway.create(&config_map("a")).await,
            Err(Error::Request { .. })
        ));
        gateway.heal();
        gateway.create(&config_map("a")).await.unwrap();
        assert_eq!(gateway.writes_to("ConfigMap").len(), 1);
    }
}
