//! Mapping of legacy issuers onto the current schema.
//!
//! Secret references that were optional in the legacy API come across as zero values when
//! unset, those are dropped. References the legacy API required are always carried.

use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta, kube::ResourceExt,
};

use super::{twin_owner, Error, OPERATOR_GENERATED_ANNOTATION, TRUE};
use crate::external_crd::cert_manager::{v1, v1alpha1, SecretKeySelector};

/// Builds the current-schema twin of `legacy`.
pub fn twin(legacy: &v1alpha1::Issuer) -> Result<v1::Issuer, Error> {
    let mut annotations = legacy.annotations().clone();
    annotations.insert(OPERATOR_GENERATED_ANNOTATION.to_string(), TRUE.to_string());
    let spec = &legacy.spec;
    Ok(v1::Issuer {
        metadata: ObjectMeta {
            name: legacy.metadata.name.clone(),
            namespace: legacy.metadata.namespace.clone(),
            labels: legacy.metadata.labels.clone(),
            annotations: Some(annotations),
            owner_references: Some(vec![twin_owner(legacy)?]),
            ..ObjectMeta::default()
        },
        spec: v1::IssuerSpec {
            acme: spec.acme.as_ref().map(acme),
            ca: spec.ca.as_ref().map(|ca| v1::CaIssuer {
                secret_name: ca.secret_name.clone(),
                ..v1::CaIssuer::default()
            }),
            vault: spec.vault.as_ref().map(vault),
            self_signed: spec
                .self_signed
                .as_ref()
                .map(|_| v1::SelfSignedIssuer::default()),
            venafi: spec.venafi.as_ref().map(|venafi| v1::VenafiIssuer {
                zone: venafi.zone.clone(),
                tpp: venafi.tpp.clone(),
                cloud: venafi.cloud.clone(),
            }),
        },
        status: None,
    })
}

fn non_zero(selector: &SecretKeySelector) -> Option<SecretKeySelector> {
    (!selector.is_zero()).then(|| selector.clone())
}

fn acme(acme: &v1alpha1::AcmeIssuer) -> v1::AcmeIssuer {
    v1::AcmeIssuer {
        email: acme.email.clone(),
        server: acme.server.clone(),
        skip_tls_verify: acme.skip_tls_verify,
        private_key: acme.private_key.clone(),
        solvers: acme
            .solvers
            .as_ref()
            .map(|solvers| solvers.iter().map(solver).collect()),
    }
}

fn solver(solver: &v1alpha1::AcmeChallengeSolver) -> v1::AcmeChallengeSolver {
    v1::AcmeChallengeSolver {
        selector: solver.selector.clone(),
        http01: solver.http01.clone(),
        dns01: solver.dns01.as_ref().map(dns01),
    }
}

fn dns01(dns01: &v1alpha1::AcmeChallengeSolverDns01) -> v1::AcmeChallengeSolverDns01 {
    v1::AcmeChallengeSolverDns01 {
        cname_strategy: dns01.cname_strategy.clone(),
        akamai: dns01.akamai.clone(),
        cloud_dns: dns01
            .cloud_dns
            .as_ref()
            .map(|p| v1::AcmeIssuerDns01ProviderCloudDns {
                service_account: non_zero(&p.service_account),
                project: p.project.clone(),
            }),
        cloudflare: dns01
            .cloudflare
            .as_ref()
            .map(|p| v1::AcmeIssuerDns01ProviderCloudflare {
                email: p.email.clone(),
                api_key: non_zero(&p.api_key),
                api_token: None,
            }),
        route53: dns01
            .route53
            .as_ref()
            .map(|p| v1::AcmeIssuerDns01ProviderRoute53 {
                access_key_id: p.access_key_id.clone(),
                secret_access_key: non_zero(&p.secret_access_key),
                role: p.role.clone(),
                hosted_zone_id: p.hosted_zone_id.clone(),
                region: p.region.clone(),
            }),
        azure_dns: dns01
            .azure_dns
            .as_ref()
            .map(|p| v1::AcmeIssuerDns01ProviderAzureDns {
                client_id: p.client_id.clone(),
                client_secret: non_zero(&p.client_secret),
                subscription_id: p.subscription_id.clone(),
                tenant_id: p.tenant_id.clone(),
                resource_group_name: p.resource_group_name.clone(),
                hosted_zone_name: p.hosted_zone_name.clone(),
                environment: p.environment.clone(),
            }),
        digital_ocean: dns01.digital_ocean.clone(),
        acme_dns: dns01.acme_dns.clone(),
        rfc2136: dns01
            .rfc2136
            .as_ref()
            .map(|p| v1::AcmeIssuerDns01ProviderRfc2136 {
                nameserver: p.nameserver.clone(),
                tsig_secret: non_zero(&p.tsig_secret),
                tsig_key_name: p.tsig_key_name.clone(),
                tsig_algorithm: p.tsig_algorithm.clone(),
            }),
        webhook: dns01.webhook.clone(),
    }
}

fn vault(vault: &v1alpha1::VaultIssuer) -> v1::VaultIssuer {
    let app_role = &vault.auth.app_role;
    v1::VaultIssuer {
        auth: v1::VaultAuth {
            token_secret_ref: non_zero(&vault.auth.token_secret_ref),
            app_role: (!app_role.is_zero()).then(|| v1::VaultAppRole {
                path: app_role.path.clone(),
                role_id: app_role.role_id.clone(),
                secret_ref: app_role.secret_ref.clone(),
            }),
        },
        server: vault.server.clone(),
        path: vault.path.clone(),
        ca_bundle: (!vault.ca_bundle.is_empty()).then(|| vault.ca_bundle.clone()),
    }
}

/// Translates the twin's status into the legacy shape.
pub fn legacy_status(status: &v1::IssuerStatus) -> v1alpha1::IssuerStatus {
    v1alpha1::IssuerStatus {
        conditions: status.conditions.clone(),
        acme: status.acme.clone(),
    }
}
