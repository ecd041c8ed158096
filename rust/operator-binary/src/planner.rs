//! Decides whether an operand Deployment has to be created, updated or left alone.
//!
//! Before touching anything the planner looks for earlier installations of the same component
//! anywhere on the cluster and refuses to continue when one lives under another name or namespace.

use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        apps::v1::Deployment,
        core::v1::{Container, PodSpec, PodTemplateSpec, Probe, ResourceRequirements},
    },
    kube::ResourceExt,
};
use tracing::{debug, info};

use crate::{
    catalog::workloads::Component,
    gateway::{self, ClusterGateway, ListSelector},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to search for existing {component} deployments"))]
    SearchDeployments {
        source: gateway::Error,
        component: Component,
    },

    #[snafu(display(
        "The service {name} is already deployed as {existing}. Please remove it if you want this version of {name} to be deployed."
    ))]
    DuplicateInstall { name: String, existing: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_duplicate_install(&self) -> bool {
        matches!(self, Error::DuplicateInstall { .. })
    }
}

#[derive(Debug, PartialEq)]
pub enum Intent {
    Create(Box<Deployment>),
    /// Replace the existing Deployment, the desired one carries its `resourceVersion`.
    Update(Box<Deployment>),
    Unchanged,
}

/// Plans how to converge `component` towards `desired`.
pub async fn plan<G: ClusterGateway>(
    gateway: &G,
    component: Component,
    mut desired: Deployment,
) -> Result<Intent> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();
    let candidates = find_similar(gateway, component).await?;
    debug!(
        deployment = %name,
        candidates = candidates.len(),
        "searched for existing deployments"
    );

    let mut existing = None;
    for candidate in candidates.into_values() {
        let candidate_namespace = candidate.namespace().unwrap_or_default();
        if candidate.name_any() != name || candidate_namespace != namespace {
            return DuplicateInstallSnafu {
                existing: format!("{candidate_namespace}/{}", candidate.name_any()),
                name,
            }
            .fail();
        }
        existing = Some(candidate);
    }

    let Some(existing) = existing else {
        return Ok(Intent::Create(Box::new(desired)));
    };
    match first_difference(&desired, &existing) {
        Some(field) => {
            info!(deployment = %name, field, "deployment drifted from its desired state");
            desired.metadata.resource_version = existing.metadata.resource_version;
            Ok(Intent::Update(Box::new(desired)))
        }
        None => Ok(Intent::Unchanged),
    }
}

/// Deployments that look like `component`, keyed by `(namespace, name)`.
///
/// Matches either carry the component's `app` label or run its image in their first container.
async fn find_similar<G: ClusterGateway>(
    gateway: &G,
    component: Component,
) -> Result<BTreeMap<(String, String), Deployment>> {
    let by_label = gateway
        .list::<Deployment>(None, &component.selector())
        .await
        .context(SearchDeploymentsSnafu { component })?;
    let image_name = component.image_name();
    let by_image = gateway
        .list::<Deployment>(None, &ListSelector::everything())
        .await
        .context(SearchDeploymentsSnafu { component })?
        .into_iter()
        .filter(|deployment| {
            first_container(deployment)
                .and_then(|container| container.image.as_deref())
                .is_some_and(|image| image.contains(&image_name))
        });

    let mut similar = BTreeMap::new();
    for deployment in by_label.into_iter().chain(by_image) {
        similar
            .entry((
                deployment.namespace().unwrap_or_default(),
                deployment.name_any(),
            ))
            .or_insert(deployment);
    }
    Ok(similar)
}

fn first_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()
}

fn template(deployment: &Deployment) -> Option<&PodTemplateSpec> {
    deployment.spec.as_ref().map(|spec| &spec.template)
}

fn pod_labels(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    template(deployment)?.metadata.as_ref()?.labels.as_ref()
}

fn pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    template(deployment)?.spec.as_ref()
}

/// Names the first field the planner watches that differs between the two Deployments.
pub fn first_difference(desired: &Deployment, existing: &Deployment) -> Option<&'static str> {
    if desired.metadata.labels != existing.metadata.labels {
        return Some("labels");
    }
    if desired.spec.as_ref().and_then(|s| s.replicas)
        != existing.spec.as_ref().and_then(|s| s.replicas)
    {
        return Some("replicas");
    }
    if pod_labels(desired) != pod_labels(existing) {
        return Some("pod labels");
    }
    match (pod_spec(desired), pod_spec(existing)) {
        (Some(desired), Some(existing)) => pod_difference(desired, existing),
        (None, None) => None,
        _ => Some("pod spec"),
    }
}

fn pod_difference(desired: &PodSpec, existing: &PodSpec) -> Option<&'static str> {
    if desired.image_pull_secrets != existing.image_pull_secrets {
        return Some("image pull secrets");
    }
    if desired.service_account_name != existing.service_account_name {
        return Some("service account");
    }
    if desired.security_context != existing.security_context {
        return Some("pod security context");
    }
    let volumes = |pod: &PodSpec| {
        pod.volumes
            .iter()
            .flatten()
            .map(|volume| {
                (
                    volume.name.clone(),
                    volume.secret.as_ref().map(|s| s.secret_name.clone()),
                )
            })
            .collect::<Vec<_>>()
    };
    if volumes(desired) != volumes(existing) {
        return Some("volumes");
    }
    if desired.containers.len() != existing.containers.len() {
        return Some("container count");
    }
    desired
        .containers
        .iter()
        .zip(&existing.containers)
        .find_map(|(desired, existing)| container_difference(desired, existing))
}

fn container_difference(desired: &Container, existing: &Container) -> Option<&'static str> {
    if desired.name != existing.name {
        return Some("container name");
    }
    if desired.image != existing.image {
        return Some("image");
    }
    if desired.image_pull_policy != existing.image_pull_policy {
        return Some("image pull policy");
    }
    if desired.args != existing.args {
        return Some("args");
    }
    let probe = |probe: &Option<Probe>| {
        probe.as_ref().map(|probe| {
            (
                probe.exec.as_ref().and_then(|exec| exec.command.clone()),
                probe.initial_delay_seconds,
                probe.timeout_seconds,
            )
        })
    };
    if probe(&desired.liveness_probe) != probe(&existing.liveness_probe) {
        return Some("liveness probe");
    }
    if probe(&desired.readiness_probe) != probe(&existing.readiness_probe) {
        return Some("readiness probe");
    }
    let security = |container: &Container| {
        container.security_context.as_ref().map(|sc| {
            (
                sc.run_as_non_root,
                sc.run_as_user,
                sc.allow_privilege_escalation,
                sc.read_only_root_filesystem,
                sc.privileged,
                sc.capabilities.clone(),
            )
        })
    };
    if security(desired) != security(existing) {
        return Some("container security context");
    }
    let quantities = |resources: &Option<ResourceRequirements>| {
        let empty = ResourceRequirements::default();
        let resources = resources.as_ref().unwrap_or(&empty);
        ["cpu", "memory"].map(|resource| {
            (
                resources.limits.as_ref().and_then(|l| l.get(resource)).cloned(),
                resources.requests.as_ref().and_then(|r| r.get(resource)).cloned(),
            )
        })
    };
    if quantities(&desired.resources) != quantities(&existing.resources) {
        return Some("resources");
    }
    let env = |container: &Container| {
        container
            .env
            .iter()
            .flatten()
            .map(|var| {
                (
                    var.name.clone(),
                    var.value.clone(),
                    var.value_from
                        .as_ref()
                        .map(|from| from.field_ref.as_ref().map(|f| f.field_path.clone())),
                )
            })
            .collect::<Vec<_>>()
    };
    if env(desired) != env(existing) {
        return Some("env");
    }
    let mounts = |container: &Container| container.volume_mounts.clone().unwrap_or_default();
    if mounts(desired) != mounts(existing) {
        return Some("volume mounts");
    }
    None
}

#[cfg(test)]
mod test {
    use stackable_operator::k8s_openapi::{
        api::core::v1::{EnvVar, SecretVolumeSource, Volume},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;
    use crate::{
        catalog::workloads, config::OperatorEnvironment, crd::CertManager,
        gateway::memory::MemoryGateway,
    };

    fn desired(component: Component, namespace: &str) -> Deployment {
        let oc: CertManager = serde_yaml::from_str(
            "
apiVersion: operator.ibm.com/v1alpha1
kind: CertManager
metadata:
  name: default
  uid: 0b7f2d4e-1c1d-4f0e-8a55-4d6c2f1e9a01
spec:
  enableWebhook: true
",
        )
        .unwrap();
        workloads::deployment(component, &oc, &OperatorEnvironment::for_namespace(namespace))
            .unwrap()
    }

    fn containers(deployment: &mut Deployment) -> &mut Vec<Container> {
        &mut deployment
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers
    }

    #[tokio::test]
    async fn test_create_without_candidates() {
        let gateway = MemoryGateway::new();
        let deployment = desired(Component::Controller, "cs");
        let intent = plan(&gateway, Component::Controller, deployment.clone())
            .await
            .unwrap();
        assert_eq!(intent, Intent::Create(Box::new(deployment)));
    }

    #[tokio::test]
    async fn test_unchanged_and_drifted() {
        let gateway = MemoryGateway::new();
        let existing = gateway.seed(desired(Component::Webhook, "cs"));
        let intent = plan(&gateway, Component::Webhook, desired(Component::Webhook, "cs"))
            .await
            .unwrap();
        assert_eq!(intent, Intent::Unchanged);

        let mut changed = desired(Component::Webhook, "cs");
        containers(&mut changed)[0].image = Some("quay.io/x/webhook:1.0".to_string());
        let Intent::Update(update) = plan(&gateway, Component::Webhook, changed).await.unwrap()
        else {
            panic!("expected an update");
        };
        assert_eq!(
            update.metadata.resource_version,
            existing.metadata.resource_version
        );
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_install_by_label() {
        let gateway = MemoryGateway::new();
        gateway.seed(desired(Component::Controller, "legacy-ns"));
        let err = plan(&gateway, Component::Controller, desired(Component::Controller, "cs"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_install());
        assert_eq!(
            err.to_string(),
            "The service cert-manager-controller is already deployed as legacy-ns/cert-manager-controller. Please remove it if you want this version of cert-manager-controller to be deployed."
        );
    }

    #[tokio::test]
    async fn test_duplicate_install_by_image() {
        let gateway = MemoryGateway::new();
        let mut other = desired(Component::Cainjector, "cs");
        other.metadata = ObjectMeta {
            name: Some("my-cainjector".to_string()),
            namespace: Some("cs".to_string()),
            ..ObjectMeta::default()
        };
        gateway.seed(other);
        let err = plan(&gateway, Component::Cainjector, desired(Component::Cainjector, "cs"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateInstall { existing, .. } if existing == "cs/my-cainjector"
        ));
    }

    #[test]
    fn test_env_and_volume_differences() {
        let base = desired(Component::Controller, "cs");
        assert_eq!(first_difference(&base, &base), None);

        let mut env = base.clone();
        containers(&mut env)[0].env.as_mut().unwrap()[0] = EnvVar {
            name: "POD_NAMESPACE".to_string(),
            value: Some("cs".to_string()),
            ..EnvVar::default()
        };
        assert_eq!(first_difference(&base, &env), Some("env"));

        let mut volumes = base.clone();
        volumes.spec.as_mut().unwrap().template.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some("tls".to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        }]);
        assert_eq!(first_difference(&base, &volumes), Some("volumes"));

        let mut replicas = base.clone();
        replicas.spec.as_mut().unwrap().replicas = Some(3);
        assert_eq!(first_difference(&base, &replicas), Some("replicas"));
    }

    #[test]
    fn test_ignored_fields() {
        let base = desired(Component::Controller, "cs");
        let mut annotated = base.clone();
        annotated
            .spec
            .as_mut()
            .unwrap()
            .template
            .metadata
            .as_mut()
            .unwrap()
            .annotations = None;
        assert_eq!(first_difference(&base, &annotated), None);
    }
}
