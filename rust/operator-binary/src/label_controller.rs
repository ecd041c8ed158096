//! Labels certificate secrets so the refresh loop sees them.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::{future, StreamExt};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        api::DynamicObject,
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Api, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::info;

use crate::{
    external_crd::cert_manager::{v1, v1alpha1},
    gateway::{self, ClusterGateway, KubeGateway},
    refresh_controller::WATCH_LABEL,
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "secretlabel";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);
const LEGACY_CONTROLLER_NAME: &str = concatcp!("legacy", CONTROLLER_NAME, ".", OPERATOR_NAME);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to fetch the certificate"))]
    GetCertificate { source: gateway::Error },

    #[snafu(display("failed to fetch the certificate secret"))]
    GetSecret { source: gateway::Error },

    #[snafu(display("failed to label the certificate secret"))]
    LabelSecret { source: gateway::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetCertificate { source }
            | Error::GetSecret { source }
            | Error::LabelSecret { source } => source.object(),
        }
    }
}

pub struct Ctx<G> {
    pub gateway: G,
}

pub async fn start(client: &stackable_operator::client::Client) {
    let current = Controller::new(
        Api::<v1::Certificate>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .run(
        reconcile::<KubeGateway>,
        error_policy::<v1::Certificate, KubeGateway>,
        Arc::new(Ctx {
            gateway: KubeGateway::new(client.clone(), FULL_CONTROLLER_NAME),
        }),
    )
    .for_each_concurrent(16, |res| async move {
        report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res)
    });
    let legacy = Controller::new(
        Api::<v1alpha1::Certificate>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .run(
        reconcile_legacy::<KubeGateway>,
        error_policy::<v1alpha1::Certificate, KubeGateway>,
        Arc::new(Ctx {
            gateway: KubeGateway::new(client.clone(), LEGACY_CONTROLLER_NAME),
        }),
    )
    .for_each_concurrent(16, |res| async move {
        report_controller_reconciled(client, LEGACY_CONTROLLER_NAME, &res)
    });
    future::join(current, legacy).await;
}

pub async fn reconcile<G: ClusterGateway>(
    certificate: Arc<v1::Certificate>,
    ctx: Arc<Ctx<G>>,
) -> Result<Action> {
    let Some(certificate) = ctx
        .gateway
        .get::<v1::Certificate>(&certificate.name_any(), certificate.namespace().as_deref())
        .await
        .context(GetCertificateSnafu)?
    else {
        return Ok(Action::await_change());
    };
    label_secret(
        &ctx.gateway,
        &certificate.spec.secret_name,
        certificate.namespace().as_deref(),
    )
    .await?;
    Ok(Action::await_change())
}

/// Legacy certificates that already have a current twin are labelled through the twin.
pub async fn reconcile_legacy<G: ClusterGateway>(
    certificate: Arc<v1alpha1::Certificate>,
    ctx: Arc<Ctx<G>>,
) -> Result<Action> {
    let name = certificate.name_any();
    let namespace = certificate.namespace();
    let Some(certificate) = ctx
        .gateway
        .get::<v1alpha1::Certificate>(&name, namespace.as_deref())
        .await
        .context(GetCertificateSnafu)?
    else {
        return Ok(Action::await_change());
    };
    if ctx
        .gateway
        .get::<v1::Certificate>(&name, namespace.as_deref())
        .await
        .context(GetCertificateSnafu)?
        .is_some()
    {
        return Ok(Action::await_change());
    }
    label_secret(&ctx.gateway, &certificate.spec.secret_name, namespace.as_deref()).await?;
    Ok(Action::await_change())
}

pub fn error_policy<K, G>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Ctx<G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

async fn label_secret<G: ClusterGateway>(
    gateway: &G,
    name: &str,
    namespace: Option<&str>,
) -> Result<()> {
    let Some(mut secret) = gateway
        .get::<Secret>(name, namespace)
        .await
        .context(GetSecretSnafu)?
    else {
        return Ok(());
    };
    if secret.labels().contains_key(WATCH_LABEL) {
        return Ok(());
    }
    secret
        .labels_mut()
        .insert(WATCH_LABEL.to_string(), String::new());
    gateway.update(&secret).await.context(LabelSecretSnafu)?;
    info!(secret = %ObjectRef::from_obj(&secret), "labelled certificate secret");
    Ok(())
}
