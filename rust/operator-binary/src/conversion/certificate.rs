//! Mapping of legacy certificates onto the current schema.

use std::{net::IpAddr, time::Duration};

use stackable_operator::{
    k8s_openapi::{
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
        chrono::{self, DateTime, Utc},
    },
    kube::ResourceExt,
};

use super::{twin_owner, Error, OPERATOR_GENERATED_ANNOTATION, PROPER_V1_LABEL, TRUE};
use crate::external_crd::cert_manager::{
    v1::{self, CertificatePrivateKey, X509Subject},
    v1alpha1, ObjectReference, GROUP,
};

/// How long before `notAfter` the legacy operand would have renewed a certificate.
const RENEWAL_MARGIN_HOURS: i64 = 24;

/// Builds the current-schema twin of `legacy`.
pub fn twin(legacy: &v1alpha1::Certificate) -> Result<v1::Certificate, Error> {
    let mut labels = legacy.labels().clone();
    labels.insert(PROPER_V1_LABEL.to_string(), TRUE.to_string());
    let mut annotations = legacy.annotations().clone();
    annotations.insert(OPERATOR_GENERATED_ANNOTATION.to_string(), TRUE.to_string());

    let spec = &legacy.spec;
    let (dns_names, parsed_ips) = split_dns_names(&spec.dns_names);
    let mut ip_addresses = spec.ip_addresses.clone();
    ip_addresses.extend(parsed_ips);

    Ok(v1::Certificate {
        metadata: ObjectMeta {
            name: legacy.metadata.name.clone(),
            namespace: legacy.metadata.namespace.clone(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![twin_owner(legacy)?]),
            ..ObjectMeta::default()
        },
        spec: v1::CertificateSpec {
            subject: spec.organization.clone().map(|organizations| X509Subject {
                organizations: Some(organizations),
                ..X509Subject::default()
            }),
            common_name: common_name(&spec.common_name, &spec.dns_names),
            duration: spec.duration.clone(),
            renew_before: spec.renew_before.clone(),
            dns_names,
            ip_addresses,
            secret_name: spec.secret_name.clone(),
            issuer_ref: ObjectReference {
                name: spec.issuer_ref.name.clone(),
                kind: spec.issuer_ref.kind.clone(),
                group: Some(GROUP.to_string()),
            },
            is_ca: spec.is_ca,
            usages: spec.usages.clone(),
            private_key: private_key(spec),
            ..v1::CertificateSpec::default()
        },
        status: None,
    })
}

/// The legacy API let the common name default to the first DNS name.
fn common_name(common_name: &str, dns_names: &[String]) -> String {
    if common_name.is_empty() {
        dns_names.first().cloned().unwrap_or_default()
    } else {
        common_name.to_string()
    }
}

/// Separates IP addresses the legacy API accepted as DNS names from the real DNS names.
fn split_dns_names(dns_names: &[String]) -> (Vec<String>, Vec<String>) {
    dns_names
        .iter()
        .cloned()
        .partition(|name| name.parse::<IpAddr>().is_err())
}

fn private_key(spec: &v1alpha1::CertificateSpec) -> Option<CertificatePrivateKey> {
    if spec.key_encoding.is_empty() && spec.key_algorithm.is_empty() && spec.key_size == 0 {
        return None;
    }
    let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_uppercase());
    Some(CertificatePrivateKey {
        encoding: non_empty(&spec.key_encoding),
        algorithm: non_empty(&spec.key_algorithm),
        size: (spec.key_size != 0).then_some(spec.key_size),
        ..CertificatePrivateKey::default()
    })
}

/// The point after which the legacy certificate is treated as expired.
pub fn renewal_deadline(legacy: &v1alpha1::Certificate) -> Option<DateTime<Utc>> {
    let not_after = legacy.status.as_ref()?.not_after.as_ref()?;
    Some(not_after.0 - chrono::Duration::hours(RENEWAL_MARGIN_HOURS))
}

/// How long a legacy certificate stays valid, `None` once it has to be converted.
///
/// Certificates without a recorded `notAfter` or without their secret always need converting.
pub fn remaining_validity(
    legacy: &v1alpha1::Certificate,
    secret_present: bool,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if !secret_present {
        return None;
    }
    let deadline = renewal_deadline(legacy)?;
    if now > deadline {
        return None;
    }
    Some((deadline - now).to_std().unwrap_or_default())
}

/// Translates the twin's status into the legacy shape.
pub fn legacy_status(status: &v1::CertificateStatus) -> v1alpha1::CertificateStatus {
    v1alpha1::CertificateStatus {
        conditions: status.conditions.clone(),
        last_failure_time: status.last_failure_time.clone(),
        not_after: status.not_after.clone(),
    }
}
