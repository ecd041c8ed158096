//! Service accounts and RBAC objects the operand needs before any workload starts.

use stackable_operator::k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};

use super::{document, documents, Result};

const RBAC: &str = include_str!("manifests/rbac.yaml");
const SERVICE_ACCOUNTS: &str = include_str!("manifests/service-accounts.yaml");

pub const CLUSTER_ROLE_NAME: &str = "cert-manager";
pub const SERVICE_ACCOUNT_NAME: &str = "cert-manager";

pub fn cluster_role() -> Result<ClusterRole> {
    document("rbac.yaml", RBAC, "")
}

/// Binds the cluster role to the operand's service accounts in `namespace`.
pub fn cluster_role_binding(namespace: &str) -> Result<ClusterRoleBinding> {
    document("rbac.yaml", RBAC, namespace)
}

pub fn role(namespace: &str) -> Result<Role> {
    document("rbac.yaml", RBAC, namespace)
}

pub fn role_binding(namespace: &str) -> Result<RoleBinding> {
    document("rbac.yaml", RBAC, namespace)
}

pub fn service_accounts(namespace: &str) -> Result<Vec<ServiceAccount>> {
    documents("service-accounts.yaml", SERVICE_ACCOUNTS, namespace)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_subjects_are_namespaced() {
        let binding = cluster_role_binding("cs").unwrap();
        assert_eq!(binding.metadata.name.as_deref(), Some(CLUSTER_ROLE_NAME));
        assert_eq!(binding.role_ref.name, CLUSTER_ROLE_NAME);
        let subjects = binding.subjects.unwrap();
        assert!(subjects
            .iter()
            .all(|subject| subject.namespace.as_deref() == Some("cs")));
        assert!(subjects.iter().any(|s| s.name == SERVICE_ACCOUNT_NAME));

        let role_binding = role_binding("cs").unwrap();
        assert_eq!(role_binding.metadata.namespace.as_deref(), Some("cs"));
        assert_eq!(role_binding.role_ref.kind, "Role");
    }

    #[test]
    fn test_cluster_role_rules() {
        let rules = cluster_role().unwrap().rules.unwrap();
        assert_eq!(rules.len(), 7);
        assert!(rules.iter().any(|rule| {
            rule.api_groups.as_deref() == Some(&["certmanager.k8s.io".to_string()][..])
                && rule.verbs == ["*"]
        }));
    }

    #[test]
    fn test_service_accounts() {
        let accounts = service_accounts("cs").unwrap();
        let names = accounts
            .iter()
            .filter_map(|sa| sa.metadata.name.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "cert-manager",
                "ibm-cert-manager-controller",
                "ibm-cert-manager-cainjector",
                "ibm-cert-manager-webhook"
            ]
        );
        assert!(accounts
            .iter()
            .all(|sa| sa.metadata.namespace.as_deref() == Some("cs")));
    }
}
