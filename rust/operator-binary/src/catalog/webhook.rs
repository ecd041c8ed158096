//! Objects exposing the operand's admission webhook.

use stackable_operator::k8s_openapi::api::{
    admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
    core::v1::Service,
    rbac::v1::RoleBinding,
};

use super::{document, Result};
use crate::external_crd::apiregistration::APIService;

const WEBHOOK: &str = include_str!("manifests/webhook.yaml");

pub const WEBHOOK_NAME: &str = "cert-manager-webhook";
pub const API_SERVICE_NAME: &str = "v1beta1.webhook.certmanager.k8s.io";
pub const AUTH_READER_NAMESPACE: &str = "kube-system";

/// Lets the webhook read `extension-apiserver-authentication` in `kube-system`.
pub fn auth_reader_binding(namespace: &str) -> Result<RoleBinding> {
    document("webhook.yaml", WEBHOOK, namespace)
}

pub fn service(namespace: &str) -> Result<Service> {
    document("webhook.yaml", WEBHOOK, namespace)
}

pub fn api_service(namespace: &str) -> Result<APIService> {
    document("webhook.yaml", WEBHOOK, namespace)
}

pub fn mutating_configuration(namespace: &str) -> Result<MutatingWebhookConfiguration> {
    document("webhook.yaml", WEBHOOK, namespace)
}

pub fn validating_configuration(namespace: &str) -> Result<ValidatingWebhookConfiguration> {
    document("webhook.yaml", WEBHOOK, namespace)
}

#[cfg(test)]
mod test {
    use stackable_operator::k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use super::*;
    use crate::catalog::WEBHOOK_SERVING_SECRET;

    #[test]
    fn test_service() {
        let service = service("cs").unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some(WEBHOOK_NAME));
        assert_eq!(service.metadata.namespace.as_deref(), Some("cs"));
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 443);
        assert_eq!(port.target_port, Some(IntOrString::Int(10250)));
    }

    #[test]
    fn test_api_service() {
        let api_service = api_service("cs").unwrap();
        assert_eq!(api_service.metadata.name.as_deref(), Some(API_SERVICE_NAME));
        assert_eq!(api_service.spec.group_priority_minimum, 1000);
        assert_eq!(api_service.spec.version_priority, 15);
        assert_eq!(api_service.spec.service.unwrap().namespace, "cs");
        assert_eq!(
            api_service.metadata.annotations.unwrap()["certmanager.k8s.io/inject-ca-from-secret"],
            format!("cs/{WEBHOOK_SERVING_SECRET}")
        );
    }

    #[test]
    fn test_configurations() {
        let mutating = mutating_configuration("cs").unwrap();
        let hook = &mutating.webhooks.unwrap()[0];
        assert_eq!(hook.name, "webhook.cert-manager.io");
        assert_eq!(hook.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(hook.side_effects, "None");
        assert_eq!(
            hook.client_config.service.as_ref().unwrap().path.as_deref(),
            Some("/mutate")
        );

        let validating = validating_configuration("cs").unwrap();
        assert_eq!(
            validating.metadata.annotations.unwrap()["cert-manager.io/inject-ca-from-secret"],
            "cs/cert-manager-webhook-ca"
        );
        let hook = &validating.webhooks.unwrap()[0];
        assert_eq!(hook.timeout_seconds, Some(10));
        let expressions = hook
            .namespace_selector
            .as_ref()
            .unwrap()
            .match_expressions
            .as_ref()
            .unwrap();
        assert_eq!(expressions[1].values.as_deref(), Some(&["cs".to_string()][..]));
    }

    #[test]
    fn test_auth_reader_binding() {
        let binding = auth_reader_binding("cs").unwrap();
        assert_eq!(
            binding.metadata.namespace.as_deref(),
            Some(AUTH_READER_NAMESPACE)
        );
        assert_eq!(
            binding.role_ref.name,
            "extension-apiserver-authentication-reader"
        );
    }
}
