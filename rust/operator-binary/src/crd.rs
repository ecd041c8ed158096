use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::ResourceRequirements,
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

/// The only [`CertManager`] name the lifecycle controller acts on.
pub const CANONICAL_NAME: &str = "default";

/// Finalizer owned exclusively by the lifecycle controller.
pub const FINALIZER: &str = "certmanager.operators.ibm.com";

/// Whether CA refresh runs when `enableCertRefresh` is left unset.
///
/// Read by [`CertManagerSpec::cert_refresh_enabled`], which the refresh controller consults
/// on every pass. The packaged default `CertManager` manifest sets the flag to `true`
/// explicitly, so this fallback only applies to hand-written objects.
pub const DEFAULT_ENABLE_CERT_REFRESH: bool = false;

/// Whether the webhook stays off the node network when `disableHostNetwork` is left unset.
pub const DEFAULT_DISABLE_HOST_NETWORK: bool = true;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "operator.ibm.com",
    version = "v1alpha1",
    kind = "CertManager",
    status = "CertManagerStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerSpec {
    /// Registry to pull the operand images from, replacing `icr.io/cpopen/cpfs`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_registry: String,

    /// Suffix appended to every operand image reference that is not pinned by digest.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_post_fix: String,

    /// Deploy the cert-manager webhook and cainjector.
    #[serde(default)]
    pub enable_webhook: bool,

    /// Namespace the cert-manager controller stores cluster-scoped issuer data in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_namespace: String,

    /// Keep the webhook off the node network namespace. Defaults to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_host_network: Option<bool>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_manager_controller: Option<ComponentConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_manager_webhook: Option<ComponentConfig>,

    #[serde(
        default,
        rename = "certManagerCAInjector",
        skip_serializing_if = "Option::is_none"
    )]
    pub cert_manager_ca_injector: Option<ComponentConfig>,

    /// Retained for compatibility, the configmap-watcher is no longer deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_watcher: Option<ComponentConfig>,

    /// Delete leaf certificate secrets whenever their issuing CA rotates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_cert_refresh: Option<bool>,

    /// Additional CA certificates whose leaves are refreshed on rotation.
    #[serde(
        default,
        rename = "refreshCertsBasedOnCA",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub refresh_certs_based_on_ca: Vec<CaCertificate>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Names a CA `Certificate` (current schema) by name and namespace.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaCertificate {
    pub cert_name: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerStatus {
    #[serde(default)]
    pub cert_manager_status: String,
}

impl CertManagerSpec {
    pub fn cert_refresh_enabled(&self) -> bool {
        self.enable_cert_refresh
            .unwrap_or(DEFAULT_ENABLE_CERT_REFRESH)
    }

    pub fn host_network(&self) -> bool {
        !self
            .disable_host_network
            .unwrap_or(DEFAULT_DISABLE_HOST_NETWORK)
    }
}

impl CertManager {
    /// The status message currently published on the object, empty when none was written yet.
    pub fn status_message(&self) -> &str {
        self.status
            .as_ref()
            .map_or("", |status| status.cert_manager_status.as_str())
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .iter()
            .flatten()
            .any(|finalizer| finalizer == FINALIZER)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deserialization() {
        let input: &str = r#"
        apiVersion: operator.ibm.com/v1alpha1
        kind: CertManager
        metadata:
          name: default
        spec:
          enableWebhook: true
          disableHostNetwork: false
          imageRegistry: quay.io/example
          version: 4.0.0
          certManagerCAInjector:
            resources:
              limits:
                cpu: 100m
          refreshCertsBasedOnCA:
          - certName: my-ca
            namespace: apps
        "#;
        let cert_manager: CertManager = serde_yaml::from_str(input).unwrap();
        assert!(cert_manager.spec.enable_webhook);
        assert!(cert_manager.spec.host_network());
        assert_eq!(cert_manager.spec.image_registry, "quay.io/example");
        assert_eq!(cert_manager.spec.version, "4.0.0");
        assert!(cert_manager
            .spec
            .cert_manager_ca_injector
            .and_then(|c| c.resources)
            .and_then(|r| r.limits)
            .is_some_and(|limits| limits.contains_key("cpu")));
        assert_eq!(
            cert_manager.spec.refresh_certs_based_on_ca,
            vec![CaCertificate {
                cert_name: "my-ca".to_string(),
                namespace: "apps".to_string(),
            }]
        );
        assert_eq!(cert_manager.status_message(), "");
    }

    #[test]
    fn test_defaults() {
        let spec = CertManagerSpec::default();
        assert_eq!(spec.cert_refresh_enabled(), DEFAULT_ENABLE_CERT_REFRESH);
        assert!(!spec.host_network());
        assert!(!spec.enable_webhook);
    }
}
