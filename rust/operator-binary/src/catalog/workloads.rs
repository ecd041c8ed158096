//! Deployments of the operand's components.

use std::collections::BTreeMap;

use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, DeploymentSpec},
            core::v1::{
                Affinity, Capabilities, Container, ContainerPort, EnvVar, EnvVarSource,
                ExecAction, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
                ObjectFieldSelector, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
                ResourceRequirements, SeccompProfile, SecurityContext,
            },
        },
        apimachinery::pkg::{
            api::resource::Quantity,
            apis::meta::v1::{LabelSelector, ObjectMeta},
        },
    },
    kube::ResourceExt,
};
use tracing::debug;

use super::{owner_reference, Result, WEBHOOK_SERVING_SECRET};
use crate::{
    config::OperatorEnvironment,
    crd::{CertManager, CertManagerSpec},
    gateway::ListSelector,
};

pub const DEFAULT_IMAGE_REGISTRY: &str = "icr.io/cpopen/cpfs";
pub const IMAGE_VERSION: &str = "0.12.0";
const ACMESOLVER_IMAGE_NAME: &str = "icp-cert-manager-acmesolver";

/// Workload of an earlier operand release, only ever removed.
pub const CONFIGMAP_WATCHER_NAME: &str = "configmap-watcher";

const LEADER_ELECTION_NAMESPACE: &str = "cert-manager";
const WEBHOOK_SECURE_PORT: i32 = 10250;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Component {
    Controller,
    Cainjector,
    Webhook,
}

impl Component {
    pub fn deployment_name(self) -> String {
        format!("cert-manager-{self}")
    }

    /// Value of the `app` label, which is also how earlier installations are found.
    pub fn app_label(self) -> String {
        format!("ibm-cert-manager-{self}")
    }

    pub fn image_name(self) -> String {
        format!("icp-cert-manager-{self}")
    }

    pub fn service_account(self) -> String {
        self.app_label()
    }

    pub fn selector(self) -> ListSelector {
        ListSelector::with_label("app", &self.app_label())
    }

    fn image_override(self, env: &OperatorEnvironment) -> Option<&str> {
        match self {
            Component::Controller => env.controller_image.as_deref(),
            Component::Cainjector => env.cainjector_image.as_deref(),
            Component::Webhook => env.webhook_image.as_deref(),
        }
    }

    fn labels(self) -> BTreeMap<String, String> {
        let app = self.app_label();
        [
            ("app", app.as_str()),
            ("app.kubernetes.io/name", app.as_str()),
            ("app.kubernetes.io/component", "cert-manager"),
            ("app.kubernetes.io/managed-by", "operator"),
            ("app.kubernetes.io/instance", "cert-manager"),
            ("release", "cert-manager"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn resources<'a>(self, spec: &'a CertManagerSpec) -> Option<&'a ResourceRequirements> {
        match self {
            Component::Controller => spec.cert_manager_controller.as_ref(),
            Component::Cainjector => spec.cert_manager_ca_injector.as_ref(),
            Component::Webhook => spec.cert_manager_webhook.as_ref(),
        }
        .and_then(|config| config.resources.as_ref())
    }

    fn probe_process(self) -> &'static str {
        match self {
            Component::Controller => "cert-manager",
            Component::Cainjector => "cainjector",
            Component::Webhook => "webhook",
        }
    }

    fn readiness_message(self) -> &'static str {
        match self {
            Component::Controller => "start cert-manager",
            Component::Cainjector => "start cert-manager cainjector",
            Component::Webhook => "start cert-manager webhook",
        }
    }
}

/// Resolves an operand image.
///
/// An environment override wins and is used verbatim when pinned by digest. The postfix names a
/// platform variant of a tag and is appended to anything that is not a digest.
pub fn image_id(image_name: &str, post_fix: &str, env_override: Option<&str>) -> String {
    match env_override.filter(|image| !image.is_empty()) {
        Some(image) if image.contains("sha256:") => image.to_string(),
        Some(image) => format!("{image}{post_fix}"),
        None => format!("{DEFAULT_IMAGE_REGISTRY}/{image_name}:{IMAGE_VERSION}{post_fix}"),
    }
}

fn resolve_image(image_name: &str, spec: &CertManagerSpec, env_override: Option<&str>) -> String {
    if spec.image_registry.is_empty() {
        image_id(image_name, &spec.image_post_fix, env_override)
    } else {
        format!(
            "{}/{image_name}:{IMAGE_VERSION}{}",
            spec.image_registry, spec.image_post_fix
        )
    }
}

fn default_resources() -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        limits: Some(quantities("500m", "500Mi")),
        requests: Some(quantities("100m", "300Mi")),
        ..ResourceRequirements::default()
    }
}

fn exec_probe(command: &str) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
        }),
        initial_delay_seconds: Some(60),
        timeout_seconds: Some(10),
        period_seconds: Some(30),
        failure_threshold: Some(10),
        ..Probe::default()
    }
}

fn pod_namespace_env() -> EnvVar {
    EnvVar {
        name: "POD_NAMESPACE".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "metadata.namespace".to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn node_affinity() -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/arch".to_string(),
                        operator: "In".to_string(),
                        values: Some(
                            ["amd64", "ppc64le", "s390x"].map(String::from).to_vec(),
                        ),
                    }]),
                    ..NodeSelectorTerm::default()
                }],
            }),
            ..NodeAffinity::default()
        }),
        ..Affinity::default()
    }
}

fn pod_annotations(component: Component) -> BTreeMap<String, String> {
    let scc = match component {
        Component::Webhook => "hostnetwork",
        _ => "restricted",
    };
    [
        ("openshift.io/scc", scc),
        ("productName", "IBM Cloud Platform Common Services"),
        ("productID", "068a62892a1e4db39641342e592daa25"),
        ("productMetric", "FREE"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn container_security(read_only_root_filesystem: bool) -> SecurityContext {
    SecurityContext {
        run_as_non_root: Some(true),
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(read_only_root_filesystem),
        privileged: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Capabilities::default()
        }),
        ..SecurityContext::default()
    }
}

fn component_container(
    component: Component,
    spec: &CertManagerSpec,
    env: &OperatorEnvironment,
) -> Container {
    let namespace = &env.deploy_namespace;
    let mut container = Container {
        name: component.deployment_name(),
        image: Some(resolve_image(
            &component.image_name(),
            spec,
            component.image_override(env),
        )),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![pod_namespace_env()]),
        liveness_probe: Some(exec_probe(&format!(
            "pgrep {} -l",
            component.probe_process()
        ))),
        readiness_probe: Some(exec_probe(&format!(
            "exec echo {}",
            component.readiness_message()
        ))),
        security_context: Some(container_security(component != Component::Webhook)),
        resources: Some(
            component
                .resources(spec)
                .cloned()
                .unwrap_or_else(default_resources),
        ),
        ..Container::default()
    };
    match component {
        Component::Controller => {
            let acmesolver = resolve_image(
                ACMESOLVER_IMAGE_NAME,
                spec,
                env.acmesolver_image.as_deref(),
            );
            let resource_namespace = if spec.resource_namespace.is_empty() {
                namespace
            } else {
                &spec.resource_namespace
            };
            container.args = Some(vec![
                format!("--acme-http01-solver-image={acmesolver}"),
                format!("--cluster-resource-namespace={resource_namespace}"),
                format!("--leader-election-namespace={LEADER_ELECTION_NAMESPACE}"),
            ]);
            container.env.get_or_insert_with(Vec::new).push(EnvVar {
                name: "POD_RESTART".to_string(),
                value: Some("true".to_string()),
                ..EnvVar::default()
            });
        }
        Component::Webhook => {
            let dns_names = [
                component.deployment_name(),
                format!("{}.{namespace}", component.deployment_name()),
                format!("{}.{namespace}.svc", component.deployment_name()),
            ]
            .join(",");
            container.args = Some(vec![
                "--v=2".to_string(),
                format!("--secure-port={WEBHOOK_SECURE_PORT}"),
                format!("--dynamic-serving-ca-secret-namespace={namespace}"),
                format!("--dynamic-serving-ca-secret-name={WEBHOOK_SERVING_SECRET}"),
                format!("--dynamic-serving-dns-names={dns_names}"),
            ]);
            container.ports = Some(vec![ContainerPort {
                name: Some("https".to_string()),
                protocol: Some("TCP".to_string()),
                container_port: WEBHOOK_SECURE_PORT,
                ..ContainerPort::default()
            }]);
        }
        Component::Cainjector => {}
    }
    container
}

/// The Deployment `component` should have, owned by `oc`.
pub fn deployment(
    component: Component,
    oc: &CertManager,
    env: &OperatorEnvironment,
) -> Result<Deployment> {
    let labels = component.labels();
    let selector = match component {
        Component::Webhook => BTreeMap::from([("app".to_string(), component.app_label())]),
        _ => labels.clone(),
    };
    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(component.deployment_name()),
            namespace: Some(env.deploy_namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(oc)?]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations(component)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(node_affinity()),
                    host_network: (component == Component::Webhook)
                        .then(|| oc.spec.host_network()),
                    service_account_name: Some(component.service_account()),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..SeccompProfile::default()
                        }),
                        ..PodSecurityContext::default()
                    }),
                    containers: vec![component_container(component, &oc.spec, env)],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    };
    debug!(
        deployment = deployment.name_any(),
        image = ?deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers[0].image.as_ref()),
        "rendered operand deployment"
    );
    Ok(deployment)
}

#[cfg(test)]
mod test {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::crd::ComponentConfig;

    fn oc(spec: &str) -> CertManager {
        serde_yaml::from_str(&format!(
            "
apiVersion: operator.ibm.com/v1alpha1
kind: CertManager
metadata:
  name: default
  uid: 6b5c1a43-2f15-4c42-a0e6-2c1f3b0a9b11
spec:
{spec}"
        ))
        .unwrap()
    }

    fn container(deployment: &Deployment) -> &Container {
        &deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn test_image_id() {
        assert_eq!(
            image_id("icp-cert-manager-controller", "", None),
            "icr.io/cpopen/cpfs/icp-cert-manager-controller:0.12.0"
        );
        assert_eq!(
            image_id("icp-cert-manager-controller", "-amd64", Some("")),
            "icr.io/cpopen/cpfs/icp-cert-manager-controller:0.12.0-amd64"
        );
        assert_eq!(
            image_id("icp-cert-manager-controller", "-amd64", Some("quay.io/x/ctl:1.0")),
            "quay.io/x/ctl:1.0-amd64"
        );
        assert_eq!(
            image_id(
                "icp-cert-manager-controller",
                "-amd64",
                Some("quay.io/x/ctl@sha256:abc")
            ),
            "quay.io/x/ctl@sha256:abc"
        );
    }

    #[test]
    fn test_registry_override() {
        let oc = oc("  imageRegistry: registry.example.com/cs\n  imagePostFix: -ppc64le\n");
        let env = OperatorEnvironment {
            controller_image: Some("quay.io/x/ctl:1.0".to_string()),
            ..OperatorEnvironment::for_namespace("cs")
        };
        let deployment = deployment(Component::Controller, &oc, &env).unwrap();
        let container = container(&deployment);
        assert_eq!(
            container.image.as_deref(),
            Some("registry.example.com/cs/icp-cert-manager-controller:0.12.0-ppc64le")
        );
        assert_eq!(
            container.args.as_ref().unwrap()[0],
            "--acme-http01-solver-image=registry.example.com/cs/icp-cert-manager-acmesolver:0.12.0-ppc64le"
        );
    }

    #[test]
    fn test_controller() {
        let oc = oc("  resourceNamespace: shared\n");
        let deployment =
            deployment(Component::Controller, &oc, &OperatorEnvironment::for_namespace("cs"))
                .unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("cert-manager-controller"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("cs"));
        let owner = &deployment.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "CertManager");
        assert_eq!(owner.controller, Some(true));

        let container = container(&deployment);
        assert_eq!(
            container.args.as_ref().unwrap()[1..],
            [
                "--cluster-resource-namespace=shared",
                "--leader-election-namespace=cert-manager"
            ]
        );
        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "POD_NAMESPACE");
        assert_eq!(env[1].value.as_deref(), Some("true"));
        assert_eq!(
            container.liveness_probe.as_ref().unwrap().exec.as_ref().unwrap().command,
            Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "pgrep cert-manager -l".to_string()
            ])
        );
        assert_eq!(
            container.resources.as_ref().unwrap().limits.as_ref().unwrap()["memory"],
            Quantity("500Mi".to_string())
        );
    }

    #[test]
    fn test_webhook() {
        let env = OperatorEnvironment::for_namespace("cs");
        let deployment = deployment(Component::Webhook, &oc("  enableWebhook: true\n"), &env).unwrap();
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(
            spec.selector.match_labels,
            Some(BTreeMap::from([(
                "app".to_string(),
                "ibm-cert-manager-webhook".to_string()
            )]))
        );
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.host_network, Some(false));
        let container = &pod.containers[0];
        assert!(container
            .args
            .as_ref()
            .unwrap()
            .contains(&"--dynamic-serving-dns-names=cert-manager-webhook,cert-manager-webhook.cs,cert-manager-webhook.cs.svc".to_string()));
        assert_eq!(
            container.security_context.as_ref().unwrap().read_only_root_filesystem,
            Some(false)
        );

        let host = deployment(
            Component::Webhook,
            &oc("  disableHostNetwork: false\n"),
            &env,
        )
        .unwrap();
        assert_eq!(
            host.spec.unwrap().template.spec.unwrap().host_network,
            Some(true)
        );
    }

    #[test]
    fn test_resource_override() {
        let mut oc = oc("  enableWebhook: true\n");
        let resources = ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity("80m".to_string()),
            )])),
            ..ResourceRequirements::default()
        };
        oc.spec.cert_manager_ca_injector = Some(ComponentConfig {
            resources: Some(resources.clone()),
        });
        let env = OperatorEnvironment::for_namespace("cs");
        for component in Component::iter() {
            let deployment = deployment(component, &oc, &env).unwrap();
            let expected = match component {
                Component::Cainjector => resources.clone(),
                _ => default_resources(),
            };
            assert_eq!(container(&deployment).resources, Some(expected));
        }
    }
}
