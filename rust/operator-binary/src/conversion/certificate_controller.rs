//! Converts legacy certificates once they are due for renewal.
//!
//! A legacy certificate that is still valid is left alone and looked at again shortly before it
//! would have been renewed. Converting a CA also removes the secrets of every legacy leaf issued
//! from it so that they are reissued from the new CA.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            admissionregistration::v1::{
                MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
            },
            core::v1::Secret,
        },
        chrono::Utc,
    },
    kube::{
        api::DynamicObject,
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Api, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use super::{
    certificate, CONVERSION_LEAF_REFRESH_LABEL, OPERATOR_GENERATED_ANNOTATION, PROPER_V1_LABEL,
    TRUE,
};
use crate::{
    delegation,
    external_crd::cert_manager::{
        v1, v1alpha1, INJECT_CA_FROM_ANNOTATION, LEGACY_INJECT_CA_FROM_ANNOTATION,
    },
    gateway::{self, ClusterGateway, KubeGateway, ListSelector, Object},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "certificate";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to fetch the legacy certificate"))]
    GetCertificate { source: gateway::Error },

    #[snafu(display("failed to look for a cluster management hub"))]
    CheckHub { source: delegation::Error },

    #[snafu(display("failed to purge twins built by earlier conversion rules"))]
    PurgeTwins { source: gateway::Error },

    #[snafu(display("failed to build the current twin"))]
    BuildTwin { source: super::Error },

    #[snafu(display("failed to fetch secret {secret:?}"))]
    GetSecret {
        source: gateway::Error,
        secret: String,
    },

    #[snafu(display("failed to apply the current twin"))]
    ApplyTwin { source: gateway::Error },

    #[snafu(display("failed to update the legacy certificate status"))]
    UpdateLegacyStatus { source: gateway::Error },

    #[snafu(display("failed to update webhook configurations injecting this CA"))]
    UpdateWebhooks { source: gateway::Error },

    #[snafu(display("failed to refresh leaves of the converted CA"))]
    RefreshLeaves { source: gateway::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetCertificate { source }
            | Error::PurgeTwins { source }
            | Error::GetSecret { source, .. }
            | Error::ApplyTwin { source }
            | Error::UpdateLegacyStatus { source }
            | Error::UpdateWebhooks { source }
            | Error::RefreshLeaves { source } => source.object(),
            Error::CheckHub { source } => source.secondary_object(),
            Error::BuildTwin { .. } => None,
        }
    }
}

pub struct Ctx<G> {
    pub gateway: G,
}

pub async fn start(client: &stackable_operator::client::Client) {
    Controller::new(
        Api::<v1alpha1::Certificate>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .owns(
        Api::<v1::Certificate>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .run(
        reconcile::<KubeGateway>,
        error_policy::<KubeGateway>,
        Arc::new(Ctx {
            gateway: KubeGateway::new(client.clone(), FULL_CONTROLLER_NAME),
        }),
    )
    .for_each_concurrent(16, |res| async move {
        report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res)
    })
    .await;
}

pub async fn reconcile<G: ClusterGateway>(
    legacy: Arc<v1alpha1::Certificate>,
    ctx: Arc<Ctx<G>>,
) -> Result<Action> {
    let gateway = &ctx.gateway;
    let Some(legacy) = gateway
        .get::<v1alpha1::Certificate>(&legacy.name_any(), legacy.namespace().as_deref())
        .await
        .context(GetCertificateSnafu)?
    else {
        return Ok(Action::await_change());
    };
    if delegation::legacy_hub_present(gateway)
        .await
        .context(CheckHubSnafu)?
    {
        debug!("cluster management hub handles legacy certificates");
        return Ok(Action::await_change());
    }

    purge_outdated_twins(gateway).await?;

    let namespace = legacy.namespace().unwrap_or_default();
    let twin = certificate::twin(&legacy).context(BuildTwinSnafu)?;
    let secret_name = legacy.spec.secret_name.clone();
    let secret = gateway
        .get::<Secret>(&secret_name, Some(&namespace))
        .await
        .context(GetSecretSnafu {
            secret: &secret_name,
        })?;
    if let Some(remaining) = certificate::remaining_validity(&legacy, secret.is_some(), Utc::now())
    {
        debug!(
            remaining_secs = remaining.as_secs(),
            "legacy certificate is still valid"
        );
        return Ok(Action::requeue(remaining));
    }

    if let Some(existing) = apply_twin(gateway, twin).await? {
        if let Some(status) = &existing.status {
            let status = certificate::legacy_status(status);
            if legacy.status.as_ref() != Some(&status) {
                let mut legacy = legacy.clone();
                legacy.status = Some(status);
                gateway
                    .update(&legacy)
                    .await
                    .context(UpdateLegacyStatusSnafu)?;
            }
        }
    }

    let ca_reference = format!("{namespace}/{}", legacy.name_any());
    propagate_injection::<_, MutatingWebhookConfiguration>(gateway, &ca_reference).await?;
    propagate_injection::<_, ValidatingWebhookConfiguration>(gateway, &ca_reference).await?;

    if legacy.spec.is_ca {
        refresh_leaves(gateway, &namespace, &secret_name).await?;
    }
    Ok(Action::await_change())
}

pub fn error_policy<G>(
    _obj: Arc<v1alpha1::Certificate>,
    _error: &Error,
    _ctx: Arc<Ctx<G>>,
) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Deletes twins that earlier releases generated without the current conversion rules.
async fn purge_outdated_twins<G: ClusterGateway>(gateway: &G) -> Result<()> {
    let twins = gateway
        .list::<v1::Certificate>(None, &ListSelector::everything())
        .await
        .context(PurgeTwinsSnafu)?;
    for twin in twins {
        let generated = twin
            .annotations()
            .get(OPERATOR_GENERATED_ANNOTATION)
            .is_some_and(|value| value == TRUE);
        let proper = twin
            .labels()
            .get(PROPER_V1_LABEL)
            .is_some_and(|value| value == TRUE);
        if generated && !proper {
            gateway.delete(&twin).await.context(PurgeTwinsSnafu)?;
            info!(certificate = %ObjectRef::from_obj(&twin), "purged outdated twin");
        }
    }
    Ok(())
}

/// Creates the twin, or updates it when its labels or spec drifted.
///
/// Returns the twin as it was found when one already existed.
async fn apply_twin<G: ClusterGateway>(
    gateway: &G,
    mut twin: v1::Certificate,
) -> Result<Option<v1::Certificate>> {
    match gateway.create(&twin).await {
        Ok(_) => {
            info!(certificate = %ObjectRef::from_obj(&twin), "created current twin");
            return Ok(None);
        }
        Err(err) if err.is_already_exists() => {}
        Err(err) => return Err(err).context(ApplyTwinSnafu),
    }
    let Some(existing) = gateway
        .get::<v1::Certificate>(&twin.name_any(), twin.namespace().as_deref())
        .await
        .context(ApplyTwinSnafu)?
    else {
        return Ok(None);
    };
    if twin.metadata.labels != existing.metadata.labels || twin.spec != existing.spec {
        twin.metadata.resource_version = existing.metadata.resource_version.clone();
        twin.metadata.annotations = existing.metadata.annotations.clone();
        gateway.update(&twin).await.context(ApplyTwinSnafu)?;
        info!(certificate = %ObjectRef::from_obj(&twin), "updated current twin");
    }
    Ok(Some(existing))
}

/// Copies the legacy CA injection annotation onto its current-schema counterpart.
async fn propagate_injection<G, K>(gateway: &G, ca_reference: &str) -> Result<()>
where
    G: ClusterGateway,
    K: Object,
{
    let configurations = gateway
        .list::<K>(None, &ListSelector::everything())
        .await
        .context(UpdateWebhooksSnafu)?;
    for mut configuration in configurations {
        let annotations = configuration.annotations_mut();
        if annotations.get(LEGACY_INJECT_CA_FROM_ANNOTATION).map(String::as_str) != Some(ca_reference)
            || annotations.get(INJECT_CA_FROM_ANNOTATION).map(String::as_str) == Some(ca_reference)
        {
            continue;
        }
        annotations.insert(INJECT_CA_FROM_ANNOTATION.to_string(), ca_reference.to_string());
        gateway
            .update(&configuration)
            .await
            .context(UpdateWebhooksSnafu)?;
        info!(
            webhook = %configuration.name_any(),
            ca = %ca_reference,
            "injecting CA through the current annotation"
        );
    }
    Ok(())
}

/// Removes the secrets of every legacy leaf issued from the CA in `ca_secret_name` and marks the
/// leaves for reissuing.
async fn refresh_leaves<G: ClusterGateway>(
    gateway: &G,
    namespace: &str,
    ca_secret_name: &str,
) -> Result<()> {
    if gateway
        .get::<Secret>(ca_secret_name, Some(namespace))
        .await
        .context(GetSecretSnafu {
            secret: ca_secret_name,
        })?
        .is_none()
    {
        return Ok(());
    }
    let issuers = gateway
        .list::<v1alpha1::Issuer>(Some(namespace), &ListSelector::everything())
        .await
        .context(RefreshLeavesSnafu)?
        .into_iter()
        .filter(|issuer| {
            issuer
                .spec
                .ca
                .as_ref()
                .is_some_and(|ca| ca.secret_name == ca_secret_name)
        })
        .map(|issuer| issuer.name_any())
        .collect::<Vec<_>>();
    if issuers.is_empty() {
        return Ok(());
    }

    let leaves = gateway
        .list::<v1alpha1::Certificate>(Some(namespace), &ListSelector::everything())
        .await
        .context(RefreshLeavesSnafu)?
        .into_iter()
        .filter(|leaf| issuers.contains(&leaf.spec.issuer_ref.name));
    for mut leaf in leaves {
        if gateway
            .delete_named::<Secret>(&leaf.spec.secret_name, Some(namespace))
            .await
            .context(RefreshLeavesSnafu)?
        {
            info!(
                certificate = %ObjectRef::from_obj(&leaf),
                "deleted legacy leaf secret for reissuing from the converted CA"
            );
        }
        let labels = leaf.labels_mut();
        if labels.get(CONVERSION_LEAF_REFRESH_LABEL).map(String::as_str) != Some(TRUE) {
            labels.insert(CONVERSION_LEAF_REFRESH_LABEL.to_string(), TRUE.to_string());
            gateway.update(&leaf).await.context(RefreshLeavesSnafu)?;
        }
    }
    Ok(())
}
