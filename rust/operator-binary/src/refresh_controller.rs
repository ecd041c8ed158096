//! Forces leaf certificates to be reissued when the CA that signed them rotates.
//!
//! The operand only renews a leaf when the leaf itself expires, so a leaf can keep presenting a
//! chain to a CA that no longer exists. Whenever a CA secret changes, the secrets of all leaves
//! whose `ca.crt` no longer matches the CA are deleted and the operand issues them again.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret},
    kube::{
        api::DynamicObject,
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Api, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use crate::{
    crd::{CaCertificate, CertManager, CANONICAL_NAME},
    external_crd::cert_manager::{
        v1, v1alpha1, CA_CERT_KEY, CERTIFICATE_NAME_ANNOTATION, LEGACY_ISSUER_NAME_LABEL,
        TLS_CERT_KEY,
    },
    gateway::{self, ClusterGateway, KubeGateway, ListSelector},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "certificaterefresh";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

/// Secrets carrying this label are watched for CA rotations.
pub const WATCH_LABEL: &str = "operator.ibm.com/watched-by-cert-manager";
/// Marks a certificate or its secret as a CA whose leaves are refreshed.
pub const REFRESH_CA_LABEL: &str = "ibm-cert-manager-operator/refresh-ca";

/// Every namespace running this Deployment hosts a Common Services control plane.
pub const ODLM_DEPLOYMENT_NAME: &str = "operand-deployment-lifecycle-manager";
/// CAs every Common Services control plane brings.
pub const DEFAULT_CA_NAMES: [&str; 2] = ["cs-ca-certificate", "mongodb-root-ca-cert"];

/// The Common Services root CA, given a longer lifetime than the operand's default.
pub const CS_CA_CERTIFICATE_NAME: &str = "cs-ca-certificate";
pub const CS_CA_DURATION: &str = "17520h0m0s";
pub const CS_CA_RENEW_BEFORE: &str = "720h0m0s";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to fetch the CA secret"))]
    GetSecret { source: gateway::Error },

    #[snafu(display("failed to fetch the operand configuration"))]
    GetCertManager { source: gateway::Error },

    #[snafu(display("failed to list Common Services control planes"))]
    ListControlPlanes { source: gateway::Error },

    #[snafu(display("failed to fetch certificate {certificate:?}"))]
    GetCertificate {
        source: gateway::Error,
        certificate: String,
    },

    #[snafu(display("failed to extend the lifetime of {CS_CA_CERTIFICATE_NAME}"))]
    ExtendDuration { source: gateway::Error },

    #[snafu(display("failed to restore the lifetime of {CS_CA_CERTIFICATE_NAME}"))]
    RestoreDuration { source: gateway::Error },

    #[snafu(display("failed to delete the secret of {CS_CA_CERTIFICATE_NAME}"))]
    DeleteCaSecret { source: gateway::Error },

    #[snafu(display("failed to list issuers"))]
    ListIssuers { source: gateway::Error },

    #[snafu(display("failed to list leaf certificates"))]
    ListLeaves { source: gateway::Error },

    #[snafu(display("failed to refresh leaf {leaf}"))]
    RefreshLeaf {
        source: gateway::Error,
        leaf: ObjectRef<DynamicObject>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::RefreshLeaf { leaf, .. } => Some(leaf.clone()),
            Error::GetSecret { source }
            | Error::GetCertManager { source }
            | Error::ListControlPlanes { source }
            | Error::GetCertificate { source, .. }
            | Error::ExtendDuration { source }
            | Error::RestoreDuration { source }
            | Error::DeleteCaSecret { source }
            | Error::ListIssuers { source }
            | Error::ListLeaves { source } => source.object(),
        }
    }
}

pub struct Ctx<G> {
    pub gateway: G,
    pub deploy_namespace: String,
}

pub async fn start(client: &stackable_operator::client::Client, deploy_namespace: &str) {
    Controller::new(
        Api::<Secret>::all(client.as_kube_client()),
        watcher::Config::default().labels(WATCH_LABEL),
    )
    .watches(
        Api::<v1::Certificate>::all(client.as_kube_client()),
        watcher::Config::default(),
        |certificate| {
            certificate.spec.is_ca.then(|| {
                ObjectRef::<Secret>::new(&certificate.spec.secret_name)
                    .within(&certificate.namespace().unwrap_or_default())
            })
        },
    )
    .run(
        reconcile::<KubeGateway>,
        error_policy::<KubeGateway>,
        Arc::new(Ctx {
            gateway: KubeGateway::new(client.clone(), FULL_CONTROLLER_NAME),
            deploy_namespace: deploy_namespace.to_string(),
        }),
    )
    .for_each_concurrent(16, |res| async move {
        report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res)
    })
    .await;
}

pub async fn reconcile<G: ClusterGateway>(secret: Arc<Secret>, ctx: Arc<Ctx<G>>) -> Result<Action> {
    let gateway = &ctx.gateway;
    let namespace = secret.namespace().unwrap_or_default();
    let Some(ca_secret) = gateway
        .get::<Secret>(&secret.name_any(), Some(&namespace))
        .await
        .context(GetSecretSnafu)?
    else {
        return Ok(Action::await_change());
    };

    let Some(oc) = gateway
        .get::<CertManager>(CANONICAL_NAME, None)
        .await
        .context(GetCertManagerSnafu)?
    else {
        return Ok(Action::await_change());
    };
    if !oc.spec.cert_refresh_enabled() {
        debug!("certificate refresh is disabled");
        return Ok(Action::await_change());
    }

    let cas = ca_list(gateway, &oc).await?;
    let certificate = match ca_secret.annotations().get(CERTIFICATE_NAME_ANNOTATION) {
        Some(name) => gateway
            .get::<v1::Certificate>(name, Some(&namespace))
            .await
            .context(GetCertificateSnafu { certificate: name })?,
        None => None,
    };
    if !is_refreshed_ca(&ca_secret, certificate.as_ref(), &cas) {
        debug!(secret = %ObjectRef::from_obj(&ca_secret), "secret does not belong to a refreshed CA");
        return Ok(Action::await_change());
    }

    if let Some(certificate) = &certificate {
        if extend_cs_ca_lifetime(gateway, certificate, &ctx.deploy_namespace).await? {
            return Ok(Action::await_change());
        }
    }

    refresh_leaves(gateway, &ca_secret).await?;
    Ok(Action::await_change())
}

pub fn error_policy<G>(_obj: Arc<Secret>, _error: &Error, _ctx: Arc<Ctx<G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// The built-in CAs of every control plane on the cluster plus the ones the user listed.
async fn ca_list<G: ClusterGateway>(gateway: &G, oc: &CertManager) -> Result<Vec<CaCertificate>> {
    let control_planes = gateway
        .list::<Deployment>(
            None,
            &ListSelector::with_field("metadata.name", ODLM_DEPLOYMENT_NAME),
        )
        .await
        .context(ListControlPlanesSnafu)?;
    let mut cas = control_planes
        .iter()
        .flat_map(|deployment| {
            let namespace = deployment.namespace().unwrap_or_default();
            DEFAULT_CA_NAMES.map(|cert_name| CaCertificate {
                cert_name: cert_name.to_string(),
                namespace: namespace.clone(),
            })
        })
        .collect::<Vec<_>>();
    cas.extend(oc.spec.refresh_certs_based_on_ca.iter().cloned());
    Ok(cas)
}

fn has_refresh_label(labels: &std::collections::BTreeMap<String, String>) -> bool {
    labels
        .get(REFRESH_CA_LABEL)
        .is_some_and(|value| value == "true")
}

fn is_refreshed_ca(
    secret: &Secret,
    certificate: Option<&v1::Certificate>,
    cas: &[CaCertificate],
) -> bool {
    has_refresh_label(secret.labels())
        || certificate.is_some_and(|certificate| {
            let listed = cas.iter().any(|ca| {
                Some(ca.cert_name.as_str()) == certificate.metadata.name.as_deref()
                    && Some(ca.namespace.as_str()) == certificate.metadata.namespace.as_deref()
            });
            listed || has_refresh_label(certificate.labels())
        })
}

/// Gives the Common Services root CA a two year lifetime when it has none configured.
///
/// The secret is deleted afterwards so that the operand reissues the CA under the new lifetime,
/// returns whether that happened. The lifetime is restored when the secret cannot be deleted.
async fn extend_cs_ca_lifetime<G: ClusterGateway>(
    gateway: &G,
    certificate: &v1::Certificate,
    deploy_namespace: &str,
) -> Result<bool> {
    if certificate.name_any() != CS_CA_CERTIFICATE_NAME
        || certificate.namespace().as_deref() != Some(deploy_namespace)
        || (certificate.spec.duration.is_some() && certificate.spec.renew_before.is_some())
    {
        return Ok(false);
    }

    let mut extended = certificate.clone();
    extended.spec.duration = Some(CS_CA_DURATION.to_string());
    extended.spec.renew_before = Some(CS_CA_RENEW_BEFORE.to_string());
    gateway
        .patch(&extended, certificate)
        .await
        .context(ExtendDurationSnafu)?;
    info!(
        duration = CS_CA_DURATION,
        renew_before = CS_CA_RENEW_BEFORE,
        "extended the lifetime of {CS_CA_CERTIFICATE_NAME}"
    );

    match gateway
        .delete_named::<Secret>(&certificate.spec.secret_name, Some(deploy_namespace))
        .await
    {
        Ok(_) => Ok(true),
        Err(err) => {
            gateway
                .patch(certificate, &extended)
                .await
                .context(RestoreDurationSnafu)?;
            Err(err).context(DeleteCaSecretSnafu)
        }
    }
}

async fn refresh_leaves<G: ClusterGateway>(gateway: &G, ca_secret: &Secret) -> Result<()> {
    let namespace = ca_secret.namespace().unwrap_or_default();
    let ca_secret_name = ca_secret.name_any();
    let issuers = gateway
        .list::<v1::Issuer>(Some(&namespace), &ListSelector::everything())
        .await
        .context(ListIssuersSnafu)?
        .into_iter()
        .filter(|issuer| {
            issuer
                .spec
                .ca
                .as_ref()
                .is_some_and(|ca| ca.secret_name == ca_secret_name)
        })
        .map(|issuer| issuer.name_any())
        .collect::<BTreeSet<_>>();
    if issuers.is_empty() {
        return Ok(());
    }

    let leaves = gateway
        .list::<v1::Certificate>(Some(&namespace), &ListSelector::everything())
        .await
        .context(ListLeavesSnafu)?
        .into_iter()
        .filter(|leaf| issuers.contains(&leaf.spec.issuer_ref.name))
        .collect::<Vec<_>>();
    let ca_chain = ca_secret.data.as_ref().and_then(|data| data.get(TLS_CERT_KEY));
    for leaf in &leaves {
        if leaf.spec.secret_name == ca_secret_name {
            continue;
        }
        let leaf_ref = ObjectRef::from_obj(leaf).erase();
        let Some(leaf_secret) = gateway
            .get::<Secret>(&leaf.spec.secret_name, Some(&namespace))
            .await
            .context(RefreshLeafSnafu { leaf: leaf_ref.clone() })?
        else {
            continue;
        };
        let issued_by = leaf_secret.data.as_ref().and_then(|data| data.get(CA_CERT_KEY));
        if issued_by != ca_chain
            && gateway
                .delete(&leaf_secret)
                .await
                .context(RefreshLeafSnafu { leaf: leaf_ref })?
        {
            info!(
                secret = %ObjectRef::from_obj(&leaf_secret),
                "deleted leaf secret issued by a previous CA"
            );
        }
    }

    let paired = leaves
        .iter()
        .map(|leaf| leaf.name_any())
        .collect::<BTreeSet<_>>();
    let legacy_leaves = gateway
        .list::<v1alpha1::Certificate>(
            Some(&namespace),
            &ListSelector::with_label_in(LEGACY_ISSUER_NAME_LABEL, issuers),
        )
        .await
        .context(ListLeavesSnafu)?;
    for mut leaf in legacy_leaves
        .into_iter()
        .filter(|leaf| !paired.contains(&leaf.name_any()))
    {
        if leaf.spec.secret_name == ca_secret_name {
            continue;
        }
        let leaf_ref = ObjectRef::from_obj(&leaf).erase();
        if leaf
            .status
            .as_ref()
            .is_some_and(|status| *status != v1alpha1::CertificateStatus::default())
        {
            leaf.status = Some(v1alpha1::CertificateStatus::default());
            gateway
                .update(&leaf)
                .await
                .context(RefreshLeafSnafu { leaf: leaf_ref.clone() })?;
        }
        if gateway
            .delete_named::<Secret>(&leaf.spec.secret_name, Some(&namespace))
            .await
            .context(RefreshLeafSnafu { leaf: leaf_ref })?
        {
            info!(
                certificate = %ObjectRef::from_obj(&leaf),
                "reset legacy leaf issued by a previous CA"
            );
        }
    }
    Ok(())
}
