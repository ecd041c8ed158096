use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    kube::{
        api::DynamicObject,
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Api, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use super::issuer;
use crate::{
    delegation,
    external_crd::cert_manager::{v1, v1alpha1},
    gateway::{self, ClusterGateway, KubeGateway},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "issuer";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to fetch the legacy issuer"))]
    GetIssuer { source: gateway::Error },

    #[snafu(display("failed to look for a cluster management hub"))]
    CheckHub { source: delegation::Error },

    #[snafu(display("failed to build the current twin"))]
    BuildTwin { source: super::Error },

    #[snafu(display("failed to apply the current twin"))]
    ApplyTwin { source: gateway::Error },

    #[snafu(display("failed to update the legacy issuer status"))]
    UpdateLegacyStatus { source: gateway::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetIssuer { source }
            | Error::ApplyTwin { source }
            | Error::UpdateLegacyStatus { source } => source.object(),
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
        Api::<v1alpha1::Issuer>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .owns(
        Api::<v1::Issuer>::all(client.as_kube_client()),
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
    legacy: Arc<v1alpha1::Issuer>,
    ctx: Arc<Ctx<G>>,
) -> Result<Action> {
    let gateway = &ctx.gateway;
    let Some(legacy) = gateway
        .get::<v1alpha1::Issuer>(&legacy.name_any(), legacy.namespace().as_deref())
        .await
        .context(GetIssuerSnafu)?
    else {
        return Ok(Action::await_change());
    };
    if delegation::legacy_hub_present(gateway)
        .await
        .context(CheckHubSnafu)?
    {
        debug!("cluster management hub handles legacy issuers");
        return Ok(Action::await_change());
    }

    let mut twin = issuer::twin(&legacy).context(BuildTwinSnafu)?;
    match gateway.create(&twin).await {
        Ok(_) => {
            info!(issuer = %ObjectRef::from_obj(&twin), "created current twin");
            return Ok(Action::await_change());
        }
        Err(err) if err.is_already_exists() => {}
        Err(err) => return Err(err).context(ApplyTwinSnafu),
    }

    let Some(existing) = gateway
        .get::<v1::Issuer>(&twin.name_any(), twin.namespace().as_deref())
        .await
        .context(ApplyTwinSnafu)?
    else {
        return Ok(Action::await_change());
    };
    if twin.metadata.labels != existing.metadata.labels || twin.spec != existing.spec {
        twin.metadata.resource_version = existing.metadata.resource_version.clone();
        twin.metadata.annotations = existing.metadata.annotations.clone();
        gateway.update(&twin).await.context(ApplyTwinSnafu)?;
        info!(issuer = %ObjectRef::from_obj(&twin), "updated current twin");
    }

    if let Some(status) = &existing.status {
        let status = issuer::legacy_status(status);
        if legacy.status.as_ref() != Some(&status) {
            let mut legacy = legacy.clone();
            legacy.status = Some(status);
            gateway
                .update(&legacy)
                .await
                .context(UpdateLegacyStatusSnafu)?;
        }
    }
    Ok(Action::await_change())
}

pub fn error_policy<G>(_obj: Arc<v1alpha1::Issuer>, _error: &Error, _ctx: Arc<Ctx<G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        external_crd::cert_manager::Condition,
        gateway::memory::{MemoryGateway, Verb},
    };

    fn legacy_issuer() -> v1alpha1::Issuer {
        serde_yaml::from_str(
            "
            apiVersion: certmanager.k8s.io/v1alpha1
            kind: Issuer
            metadata:
              name: cs-ca-issuer
              namespace: ibm-common-services
              labels: {app: cs}
            spec:
              ca: {secretName: cs-ca-certificate-secret}
            ",
        )
        .unwrap()
    }

    async fn run(ctx: &Arc<Ctx<MemoryGateway>>) {
        let legacy = ctx
            .gateway
            .object::<v1alpha1::Issuer>("cs-ca-issuer", Some("ibm-common-services"))
            .unwrap();
        reconcile(Arc::new(legacy), ctx.clone()).await.unwrap();
    }

    fn twin(ctx: &Ctx<MemoryGateway>) -> v1::Issuer {
        ctx.gateway
            .object::<v1::Issuer>("cs-ca-issuer", Some("ibm-common-services"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_twin_lifecycle() {
        let gateway = MemoryGateway::new();
        gateway.seed(legacy_issuer());
        let ctx = Arc::new(Ctx { gateway });
        run(&ctx).await;
        assert_eq!(twin(&ctx).spec.ca.unwrap().secret_name, "cs-ca-certificate-secret");
        assert_eq!(twin(&ctx).labels()["app"], "cs");

        ctx.gateway.clear_history();
        run(&ctx).await;
        assert!(ctx.gateway.writes().is_empty());

        let mut drifted = twin(&ctx);
        drifted.spec.ca.as_mut().unwrap().secret_name = "other".to_string();
        drifted
            .annotations_mut()
            .insert("kept".to_string(), "yes".to_string());
        drifted.status = Some(v1::IssuerStatus {
            conditions: vec![Condition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Condition::default()
            }],
            acme: None,
        });
        ctx.gateway.seed(drifted);
        ctx.gateway.clear_history();
        run(&ctx).await;

        let writes = ctx.gateway.writes();
        assert_eq!(
            writes
                .iter()
                .map(|w| (w.verb, w.namespace.as_deref(), w.name.as_str()))
                .collect::<Vec<_>>(),
            [
                (Verb::Update, Some("ibm-common-services"), "cs-ca-issuer"),
                (Verb::Update, Some("ibm-common-services"), "cs-ca-issuer"),
            ]
        );
        let repaired = twin(&ctx);
        assert_eq!(repaired.spec.ca.unwrap().secret_name, "cs-ca-certificate-secret");
        assert_eq!(repaired.annotations()["kept"], "yes");
        let legacy = ctx
            .gateway
            .object::<v1alpha1::Issuer>("cs-ca-issuer", Some("ibm-common-services"))
            .unwrap();
        assert_eq!(legacy.status.unwrap().conditions[0].type_, "Ready");
    }
}
