//! Finds out whether a cert-manager other than the one this operator installs serves the cluster.
//!
//! A throwaway self-signed [`v1::Issuer`] is created in the deploy namespace. If some controller
//! reconciles it while our controller Deployment is missing, that controller belongs to another
//! installation and the operand must not be deployed next to it.

use std::time::Duration;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
        apps::v1::Deployment,
    },
    kube::{api::DynamicObject, runtime::reflector::ObjectRef, ResourceExt},
};
use tracing::{debug, info, warn};

use crate::{
    catalog::{webhook::WEBHOOK_NAME, workloads::Component},
    external_crd::cert_manager::v1,
    gateway::{self, ClusterGateway},
};

pub const SMOKE_CHECK_ISSUER_NAME: &str = "smoke-check-issuer";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to remove the smoke check issuer"))]
    RemoveIssuer { source: gateway::Error },

    #[snafu(display("failed to create the smoke check issuer"))]
    CreateIssuer { source: gateway::Error },

    #[snafu(display("failed to read the smoke check issuer"))]
    PollIssuer { source: gateway::Error },

    #[snafu(display("failed to look up the webhook configurations"))]
    GetWebhookConfiguration { source: gateway::Error },

    #[snafu(display("failed to look up the operand controller"))]
    GetController { source: gateway::Error },
}

impl Error {
    pub fn object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::RemoveIssuer { source }
            | Error::CreateIssuer { source }
            | Error::PollIssuer { source }
            | Error::GetWebhookConfiguration { source }
            | Error::GetController { source } => source.object(),
        }
    }
}

/// How long to wait for a controller to reconcile the smoke check issuer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            poll_interval: Duration::from_secs(1),
            attempts: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finding {
    /// Issuers are reconciled by our own controller, or not at all.
    Clear,
    /// Another installation reconciled the smoke check issuer.
    Foreign,
    /// The admission webhook of another installation cannot be reached.
    UnreachableForeignWebhook,
}

pub async fn detect<G: ClusterGateway>(
    gateway: &G,
    namespace: &str,
    timing: Timing,
) -> Result<Finding, Error> {
    info!("looking for another cert-manager running on the cluster");
    // A check interrupted earlier may have left its issuer behind.
    gateway
        .delete_named::<v1::Issuer>(SMOKE_CHECK_ISSUER_NAME, Some(namespace))
        .await
        .context(RemoveIssuerSnafu)?;

    match gateway.create(&smoke_check_issuer(namespace)).await {
        Ok(_) => {}
        Err(err) if err.is_already_exists() => {}
        Err(err) if err.is_webhook_unreachable() => {
            return if webhook_is_ours(gateway).await? {
                warn!(
                    error = &err as &dyn std::error::Error,
                    "own cert-manager webhook is unreachable, deploying anyway"
                );
                Ok(Finding::Clear)
            } else {
                Ok(Finding::UnreachableForeignWebhook)
            };
        }
        Err(err) => return Err(err).context(CreateIssuerSnafu),
    }

    let reconciled = wait_for_status(gateway, namespace, timing).await;
    gateway
        .delete_named::<v1::Issuer>(SMOKE_CHECK_ISSUER_NAME, Some(namespace))
        .await
        .context(RemoveIssuerSnafu)?;
    if !reconciled? {
        debug!("no cert-manager reconciled the smoke check issuer");
        return Ok(Finding::Clear);
    }

    let controller = Component::Controller;
    let ours = gateway
        .get::<Deployment>(&controller.deployment_name(), Some(namespace))
        .await
        .context(GetControllerSnafu)?
        .is_some_and(|deployment| {
            deployment.labels().get("app") == Some(&controller.app_label())
        });
    Ok(if ours {
        Finding::Clear
    } else {
        Finding::Foreign
    })
}

fn smoke_check_issuer(namespace: &str) -> v1::Issuer {
    let mut issuer = v1::Issuer::new(
        SMOKE_CHECK_ISSUER_NAME,
        v1::IssuerSpec {
            self_signed: Some(v1::SelfSignedIssuer::default()),
            ..v1::IssuerSpec::default()
        },
    );
    issuer.metadata.namespace = Some(namespace.to_string());
    issuer
}

async fn wait_for_status<G: ClusterGateway>(
    gateway: &G,
    namespace: &str,
    timing: Timing,
) -> Result<bool, Error> {
    for attempt in 0..timing.attempts {
        if attempt > 0 {
            tokio::time::sleep(timing.poll_interval).await;
        }
        let reconciled = gateway
            .get::<v1::Issuer>(SMOKE_CHECK_ISSUER_NAME, Some(namespace))
            .await
            .context(PollIssuerSnafu)?
            .and_then(|issuer| issuer.status)
            .is_some_and(|status| !status.conditions.is_empty());
        if reconciled {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether the webhook configurations in place are the ones this operator installs.
async fn webhook_is_ours<G: ClusterGateway>(gateway: &G) -> Result<bool, Error> {
    let app = Component::Webhook.app_label();
    if let Some(validating) = gateway
        .get::<ValidatingWebhookConfiguration>(WEBHOOK_NAME, None)
        .await
        .context(GetWebhookConfigurationSnafu)?
    {
        return Ok(validating.labels().get("app") == Some(&app));
    }
    Ok(gateway
        .get::<MutatingWebhookConfiguration>(WEBHOOK_NAME, None)
        .await
        .context(GetWebhookConfigurationSnafu)?
        .is_some_and(|mutating| mutating.labels().get("app") == Some(&app)))
}

#[cfg(test)]
mod test {
    use stackable_operator::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::{
        external_crd::cert_manager::Condition,
        gateway::memory::{MemoryGateway, Verb},
    };

    const NAMESPACE: &str = "ibm-common-services";

    fn quick() -> Timing {
        Timing {
            poll_interval: Duration::from_millis(5),
            attempts: 200,
        }
    }

    /// Stands in for a running cert-manager: marks the smoke check issuer ready once it exists.
    async fn reconcile_issuer(gateway: &MemoryGateway) {
        loop {
            if let Some(mut issuer) =
                gateway.object::<v1::Issuer>(SMOKE_CHECK_ISSUER_NAME, Some(NAMESPACE))
            {
                issuer.status = Some(v1::IssuerStatus {
                    conditions: vec![Condition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Condition::default()
                    }],
                    acme: None,
                });
                gateway.seed(issuer);
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn controller(app: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(Component::Controller.deployment_name()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some([("app".to_string(), app.to_string())].into()),
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        }
    }

    #[tokio::test]
    async fn test_idle_cluster_is_clear() {
        let gateway = MemoryGateway::new();
        let timing = Timing {
            poll_interval: Duration::ZERO,
            attempts: 3,
        };
        assert_eq!(
            detect(&gateway, NAMESPACE, timing).await.unwrap(),
            Finding::Clear
        );
        assert!(gateway.objects::<v1::Issuer>().is_empty());
        let verbs = gateway
            .writes_to("Issuer")
            .into_iter()
            .map(|write| write.verb)
            .collect::<Vec<_>>();
        assert_eq!(verbs, [Verb::Create, Verb::Delete]);
    }

    #[tokio::test]
    async fn test_other_controller_is_foreign() {
        let gateway = MemoryGateway::new();
        let (finding, ()) = tokio::join!(detect(&gateway, NAMESPACE, quick()), reconcile_issuer(&gateway));
        assert_eq!(finding.unwrap(), Finding::Foreign);
        assert!(gateway.objects::<v1::Issuer>().is_empty());

        gateway.seed(controller("community-cert-manager"));
        let (finding, ()) = tokio::join!(detect(&gateway, NAMESPACE, quick()), reconcile_issuer(&gateway));
        assert_eq!(finding.unwrap(), Finding::Foreign);
    }

    #[tokio::test]
    async fn test_own_controller_is_clear() {
        let gateway = MemoryGateway::new();
        gateway.seed(controller(&Component::Controller.app_label()));
        let (finding, ()) = tokio::join!(detect(&gateway, NAMESPACE, quick()), reconcile_issuer(&gateway));
        assert_eq!(finding.unwrap(), Finding::Clear);
    }

    #[tokio::test]
    async fn test_leftover_issuer_is_replaced() {
        let gateway = MemoryGateway::new();
        let mut leftover = smoke_check_issuer(NAMESPACE);
        leftover.status = Some(v1::IssuerStatus {
            conditions: vec![Condition::default()],
            acme: None,
        });
        gateway.seed(leftover);
        let timing = Timing {
            poll_interval: Duration::ZERO,
            attempts: 1,
        };
        assert_eq!(
            detect(&gateway, NAMESPACE, timing).await.unwrap(),
            Finding::Clear
        );
    }

    #[tokio::test]
    async fn test_unreachable_webhook() {
        let gateway = MemoryGateway::new();
        gateway.fail_with::<v1::Issuer>(
            Verb::Create,
            "Internal error occurred: failed to call webhook \"webhook.cert-manager.io\"",
        );
        assert_eq!(
            detect(&gateway, NAMESPACE, quick()).await.unwrap(),
            Finding::UnreachableForeignWebhook
        );

        gateway.seed(ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some(WEBHOOK_NAME.to_string()),
                labels: Some([("app".to_string(), Component::Webhook.app_label())].into()),
                ..ObjectMeta::default()
            },
            ..ValidatingWebhookConfiguration::default()
        });
        assert_eq!(
            detect(&gateway, NAMESPACE, quick()).await.unwrap(),
            Finding::Clear
        );

        gateway.fail::<v1::Issuer>(Verb::Create);
        assert!(matches!(
            detect(&gateway, NAMESPACE, quick()).await,
            Err(Error::CreateIssuer { .. })
        ));
    }
}
