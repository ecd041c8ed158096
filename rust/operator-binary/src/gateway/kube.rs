use async_trait::async_trait;
use serde_json::json;
use snafu::ResultExt;
use stackable_operator::{
    client::Client,
    kube::{
        self,
        api::{
            Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams,
            PostParams,
        },
        core::ErrorResponse,
        runtime::{
            events::{Event, EventType as KubeEventType, Recorder, Reporter},
            reflector::ObjectRef,
        },
        Resource,
    },
};

use super::{
    merge_patch, object_ref, object_ref_of, ClusterGateway, DeserializeSnafu, DiscoverySnafu,
    Error, EventType, ListSelector, Object, OperandEvent, PublishEventSnafu, Result,
    SerializeSnafu,
};

/// [`ClusterGateway`] talking to the API server.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    /// Reported as the source of published events.
    controller: String,
}

impl KubeGateway {
    pub fn new(client: Client, controller: &str) -> Self {
        KubeGateway {
            client,
            controller: controller.to_string(),
        }
    }

    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        let client = self.client.as_kube_client();
        match namespace {
            Some(namespace) => Api::namespaced_with(client, namespace, &resource),
            None => Api::all_with(client, &resource),
        }
    }

    fn api_for<K: Object>(&self, obj: &K) -> Api<DynamicObject> {
        self.api::<K>(obj.meta().namespace.as_deref())
    }
}

fn classify(source: kube::Error, object: ObjectRef<DynamicObject>) -> Error {
    let response = match &source {
        kube::Error::Api(ErrorResponse { code, reason, .. }) => {
            Some((*code, reason == "AlreadyExists"))
        }
        _ => None,
    };
    match response {
        Some((404, _)) => Error::NotFound { object },
        Some((409, true)) => Error::AlreadyExists { object },
        Some((409, false)) => Error::Conflict { object },
        _ => Error::Request { source, object },
    }
}

fn to_dynamic<K: Object>(obj: &K) -> Result<DynamicObject> {
    let mut value = serde_json::to_value(obj).with_context(|_| SerializeSnafu {
        object: object_ref_of(obj),
    })?;
    value["apiVersion"] = K::api_version(&()).into();
    value["kind"] = K::kind(&()).into();
    serde_json::from_value(value).with_context(|_| SerializeSnafu {
        object: object_ref_of(obj),
    })
}

fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K> {
    let object = ObjectRef::from_obj_with(&obj, ApiResource::erase::<K>(&())).erase();
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .context(DeserializeSnafu { object })
}

fn name_of<K: Object>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get<K: Object>(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>> {
        let object = self
            .api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|err| classify(err, object_ref::<K>(name, namespace)))?;
        object.map(from_dynamic).transpose()
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: &ListSelector,
    ) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(labels) = selector.label_query()? {
            params = params.labels(&labels);
        }
        if let Some(fields) = selector.field_query() {
            params = params.fields(&fields);
        }
        let objects = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|err| classify(err, object_ref::<K>("", namespace)))?;
        objects.items.into_iter().map(from_dynamic).collect()
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let created = self
            .api_for(obj)
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|err| classify(err, object_ref_of(obj)))?;
        from_dynamic(created)
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let updated = self
            .api_for(obj)
            .replace(&name_of(obj), &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|err| classify(err, object_ref_of(obj)))?;
        from_dynamic(updated)
    }

    async fn patch<K: Object>(&self, obj: &K, baseline: &K) -> Result<K> {
        let serialize = |k: &K| {
            serde_json::to_value(k).with_context(|_| SerializeSnafu {
                object: object_ref_of(obj),
            })
        };
        let patch = merge_patch(&serialize(baseline)?, &serialize(obj)?);
        let patched = self
            .api_for(obj)
            .patch(&name_of(obj), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| classify(err, object_ref_of(obj)))?;
        from_dynamic(patched)
    }

    async fn delete<K: Object>(&self, obj: &K) -> Result<bool> {
        match self
            .api_for(obj)
            .delete(&name_of(obj), &DeleteParams::default())
            .await
            .map_err(|err| classify(err, object_ref_of(obj)))
        {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<K> {
        let value = serde_json::to_value(obj).with_context(|_| SerializeSnafu {
            object: object_ref_of(obj),
        })?;
        let patch = json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        let patched = self
            .api_for(obj)
            .patch_status(&name_of(obj), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| classify(err, object_ref_of(obj)))?;
        from_dynamic(patched)
    }

    async fn kind_exists(&self, group_version: &str, kind: &str) -> Result<bool> {
        let client = self.client.as_kube_client();
        let resources = if group_version.contains('/') {
            client.list_api_group_resources(group_version).await
        } else {
            client.list_core_api_resources(group_version).await
        };
        match resources {
            Ok(resources) => Ok(resources.resources.iter().any(|r| r.kind == kind)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(false),
            Err(source) => Err(source).context(DiscoverySnafu { group_version }),
        }
    }

    async fn publish_event<K: Object>(&self, obj: &K, event: &OperandEvent) -> Result<()> {
        let recorder = Recorder::new(
            self.client.as_kube_client(),
            Reporter {
                controller: self.controller.clone(),
                instance: None,
            },
            obj.object_ref(&()),
        );
        recorder
            .publish(Event {
                type_: match event.type_ {
                    EventType::Normal => KubeEventType::Normal,
                    EventType::Warning => KubeEventType::Warning,
                },
                reason: event.reason.clone(),
                note: Some(event.message.clone()),
                action: event.action.clone(),
                secondary: None,
            })
            .await
            .context(PublishEventSnafu {
                object: object_ref_of(obj),
            })
    }
}
