//! Detects other cert-manager providers on the cluster and steps aside for them.
//!
//! Two signals are honored. An OLM `OperatorGroup` whose members provide the `cert-manager.io/v1`
//! Certificate API means another operator installed cert-manager, the operand configuration is
//! then removed and the `ibm-cpp-config` map is switched so that it is not recreated. A Red Hat
//! Advanced Cluster Management hub older than 2.3 brings its own cert-manager and only needs the
//! Common Services CA to be shared with it.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta},
    kube::{
        api::DynamicObject,
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Api, Resource,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use crate::{
    crd::{CertManager, CANONICAL_NAME},
    external_crd::{
        olm::OperatorGroup,
        rhacm::{Hub, MultiClusterHub, SecretShare, SecretShareEntry, SecretShareSpec, TargetNamespace},
    },
    gateway::{self, ClusterGateway, KubeGateway, ListSelector},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "postdelegationchecker";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

/// Config map steering whether Common Services operands are deployed.
pub const CPP_CONFIG_NAME: &str = "ibm-cpp-config";
pub const DISABLE_POST_DELEGATION_KEY: &str = "disablePostDelegation";
pub const DEPLOY_OPERANDS_KEY: &str = "deployCSCertManagerOperands";

/// The API another provider has to serve for this operator to step aside.
pub const CERTIFICATE_API: &str = "Certificate.v1.cert-manager.io";

pub const CS_CA_SECRET_NAME: &str = "cs-ca-certificate-secret";
pub const HUB_SECRET_SHARE_NAME: &str = "rhacm-cs-ca-certificate-secret-share";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to read {CPP_CONFIG_NAME}"))]
    ReadCppConfig { source: gateway::Error },

    #[snafu(display("failed to write {CPP_CONFIG_NAME}"))]
    WriteCppConfig { source: gateway::Error },

    #[snafu(display("failed to discover whether {kind} is served"))]
    Discover {
        source: gateway::Error,
        kind: &'static str,
    },

    #[snafu(display("failed to list installer groups"))]
    ListOperatorGroups { source: gateway::Error },

    #[snafu(display("failed to list cluster management hubs"))]
    ListHubs { source: gateway::Error },

    #[snafu(display("failed to share {CS_CA_SECRET_NAME} with the hub"))]
    ShareCaSecret { source: gateway::Error },

    #[snafu(display("failed to delete the operand configuration"))]
    DeleteOperandConfig { source: gateway::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::ReadCppConfig { source }
            | Error::WriteCppConfig { source }
            | Error::Discover { source, .. }
            | Error::ListOperatorGroups { source }
            | Error::ListHubs { source }
            | Error::ShareCaSecret { source }
            | Error::DeleteOperandConfig { source } => source.object(),
        }
    }
}

/// Why the operand must not be deployed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Delegation {
    /// `deployCSCertManagerOperands` is `"false"`.
    #[strum(serialize = "operands disabled by configuration")]
    OperandsDisabled,
    /// An installer group provides the certificate API.
    #[strum(serialize = "certificate API provided by another installer")]
    InstallerProvidesApi,
}

async fn cpp_config<G: ClusterGateway>(gateway: &G, namespace: &str) -> Result<Option<ConfigMap>> {
    gateway
        .get::<ConfigMap>(CPP_CONFIG_NAME, Some(namespace))
        .await
        .context(ReadCppConfigSnafu)
}

fn config_value<'a>(config: Option<&'a ConfigMap>, key: &str) -> Option<&'a str> {
    config?.data.as_ref()?.get(key).map(String::as_str)
}

/// Whether `disablePostDelegation` turns off the installer group check.
pub async fn post_delegation_disabled<G: ClusterGateway>(gateway: &G, namespace: &str) -> Result<bool> {
    let config = cpp_config(gateway, namespace).await?;
    Ok(config_value(config.as_ref(), DISABLE_POST_DELEGATION_KEY) == Some("true"))
}

/// Whether any installer group on the cluster lists the certificate API.
///
/// A cluster without OLM has no installer groups.
pub async fn installer_provides_api<G: ClusterGateway>(gateway: &G) -> Result<bool> {
    let served = gateway
        .kind_exists(&OperatorGroup::api_version(&()), &OperatorGroup::kind(&()))
        .await
        .context(DiscoverSnafu {
            kind: "OperatorGroup",
        })?;
    if !served {
        return Ok(false);
    }
    let groups = gateway
        .list::<OperatorGroup>(None, &ListSelector::everything())
        .await
        .context(ListOperatorGroupsSnafu)?;
    Ok(groups.iter().any(|group| group.provides_api(CERTIFICATE_API)))
}

/// Checks every delegation signal the lifecycle controller has to honor.
///
/// `config_namespace` holds the `ibm-cpp-config` operand toggle, `watch_namespace` the one
/// that can disable the installer group check.
pub async fn detect<G: ClusterGateway>(
    gateway: &G,
    config_namespace: &str,
    watch_namespace: &str,
) -> Result<Option<Delegation>> {
    let config = cpp_config(gateway, config_namespace).await?;
    if config_value(config.as_ref(), DEPLOY_OPERANDS_KEY) == Some("false") {
        return Ok(Some(Delegation::OperandsDisabled));
    }
    if !post_delegation_disabled(gateway, watch_namespace).await?
        && installer_provides_api(gateway).await?
    {
        return Ok(Some(Delegation::InstallerProvidesApi));
    }
    Ok(None)
}

/// The first cluster management hub with a known version, if the hub kind is served at all.
pub async fn find_hub<G: ClusterGateway>(gateway: &G) -> Result<Option<Hub>> {
    let served = gateway
        .kind_exists(
            &MultiClusterHub::api_version(&()),
            &MultiClusterHub::kind(&()),
        )
        .await
        .context(DiscoverSnafu {
            kind: "MultiClusterHub",
        })?;
    if !served {
        return Ok(None);
    }
    let hubs = gateway
        .list::<MultiClusterHub>(None, &ListSelector::everything())
        .await
        .context(ListHubsSnafu)?;
    Ok(hubs.iter().find_map(Hub::from_multi_cluster_hub))
}

/// Whether a hub older than 2.3 takes care of cert-manager.
pub async fn legacy_hub_present<G: ClusterGateway>(gateway: &G) -> Result<bool> {
    Ok(find_hub(gateway).await?.is_some_and(|hub| hub.is_legacy()))
}

/// Shares the Common Services CA from `namespace` with the hub's issuer namespace.
pub async fn share_ca_with_hub<G: ClusterGateway>(gateway: &G, hub: &Hub, namespace: &str) -> Result<()> {
    let share = SecretShare {
        metadata: ObjectMeta {
            name: Some(HUB_SECRET_SHARE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        spec: SecretShareSpec {
            secretshares: vec![SecretShareEntry {
                secretname: CS_CA_SECRET_NAME.to_string(),
                sharewith: vec![TargetNamespace {
                    namespace: hub.issuer_namespace(),
                }],
            }],
        },
    };
    match gateway.create(&share).await {
        Ok(_) => {
            info!(
                target_namespace = %hub.issuer_namespace(),
                "sharing {CS_CA_SECRET_NAME} with the cluster management hub"
            );
            Ok(())
        }
        Err(err) if err.is_already_exists() => Ok(()),
        Err(err) => Err(err).context(ShareCaSecretSnafu),
    }
}

/// Makes the operand stay away for good: the operand toggle is switched off and the operand
/// configuration is deleted.
pub async fn stand_down<G: ClusterGateway>(gateway: &G, namespace: &str) -> Result<()> {
    match cpp_config(gateway, namespace).await? {
        None => {
            let config = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(CPP_CONFIG_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..ObjectMeta::default()
                },
                data: Some([(DEPLOY_OPERANDS_KEY.to_string(), "false".to_string())].into()),
                ..ConfigMap::default()
            };
            gateway.create(&config).await.context(WriteCppConfigSnafu)?;
        }
        Some(config) if config_value(Some(&config), DEPLOY_OPERANDS_KEY) == Some("false") => {}
        Some(mut config) => {
            config
                .data
                .get_or_insert_with(Default::default)
                .insert(DEPLOY_OPERANDS_KEY.to_string(), "false".to_string());
            gateway.update(&config).await.context(WriteCppConfigSnafu)?;
        }
    }
    info!("configured {CPP_CONFIG_NAME} to permanently disable the operand");

    if gateway
        .delete_named::<CertManager>(CANONICAL_NAME, None)
        .await
        .context(DeleteOperandConfigSnafu)?
    {
        info!("deleted the operand configuration to remove the operand");
    }
    Ok(())
}

pub struct Ctx<G> {
    pub gateway: G,
    pub watch_namespace: String,
}

pub async fn start(client: &stackable_operator::client::Client, watch_namespace: &str) {
    Controller::new(
        Api::<OperatorGroup>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .run(
        reconcile::<KubeGateway>,
        error_policy::<KubeGateway>,
        Arc::new(Ctx {
            gateway: KubeGateway::new(client.clone(), FULL_CONTROLLER_NAME),
            watch_namespace: watch_namespace.to_string(),
        }),
    )
    .for_each_concurrent(16, |res| async move {
        report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res)
    })
    .await;
}

pub async fn reconcile<G: ClusterGateway>(
    group: Arc<OperatorGroup>,
    ctx: Arc<Ctx<G>>,
) -> Result<Action> {
    if post_delegation_disabled(&ctx.gateway, &ctx.watch_namespace).await? {
        debug!("post delegation check disabled, skipping");
        return Ok(Action::await_change());
    }
    if !group.provides_api(CERTIFICATE_API) {
        return Ok(Action::await_change());
    }
    info!(
        operator_group = %ObjectRef::from_obj(&*group),
        "removing operands because another installer provides {CERTIFICATE_API}"
    );
    stand_down(&ctx.gateway, &ctx.watch_namespace).await?;
    Ok(Action::await_change())
}

pub fn error_policy<G>(_obj: Arc<OperatorGroup>, _error: &Error, _ctx: Arc<Ctx<G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        crd::CertManagerSpec,
        external_crd::{
            olm::{OperatorGroupSpec, PROVIDED_APIS_ANNOTATION},
            rhacm::{MultiClusterHubSpec, MultiClusterHubStatus},
        },
        gateway::memory::MemoryGateway,
    };

    const NAMESPACE: &str = "ibm-common-services";

    fn operator_group(provided: &str) -> OperatorGroup {
        let mut group = OperatorGroup::new("common-service", OperatorGroupSpec::default());
        group.metadata.namespace = Some("openshift-operators".to_string());
        group.metadata.annotations = Some(BTreeMap::from([(
            PROVIDED_APIS_ANNOTATION.to_string(),
            provided.to_string(),
        )]));
        group
    }

    fn cpp_config(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(CPP_CONFIG_NAME.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ConfigMap::default()
        }
    }

    fn ctx(gateway: MemoryGateway) -> Arc<Ctx<MemoryGateway>> {
        Arc::new(Ctx {
            gateway,
            watch_namespace: NAMESPACE.to_string(),
        })
    }

    fn gateway_with_operand() -> MemoryGateway {
        let gateway = MemoryGateway::new();
        gateway.serve("operators.coreos.com/v1", "OperatorGroup");
        gateway.seed(CertManager::new(CANONICAL_NAME, CertManagerSpec::default()));
        gateway
    }

    #[tokio::test]
    async fn test_takeover_creates_config_and_deletes_operand() {
        let ctx = ctx(gateway_with_operand());
        let group = operator_group("Certificate.v1.cert-manager.io,Issuer.v1.cert-manager.io");
        reconcile(Arc::new(group), ctx.clone()).await.unwrap();

        let config = ctx
            .gateway
            .object::<ConfigMap>(CPP_CONFIG_NAME, Some(NAMESPACE))
            .unwrap();
        assert_eq!(config.data.unwrap()[DEPLOY_OPERANDS_KEY], "false");
        assert!(ctx.gateway.object::<CertManager>(CANONICAL_NAME, None).is_none());
        assert!(ctx.gateway.writes_to("Deployment").is_empty());

        ctx.gateway.clear_history();
        let group = operator_group("Certificate.v1.cert-manager.io");
        reconcile(Arc::new(group), ctx.clone()).await.unwrap();
        assert!(ctx.gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn test_takeover_keeps_existing_keys() {
        let gateway = gateway_with_operand();
        gateway.seed(cpp_config(&[("storageClass", "fast")]));
        let ctx = ctx(gateway);
        reconcile(
            Arc::new(operator_group("Certificate.v1.cert-manager.io")),
            ctx.clone(),
        )
        .await
        .unwrap();
        let data = ctx
            .gateway
            .object::<ConfigMap>(CPP_CONFIG_NAME, Some(NAMESPACE))
            .unwrap()
            .data
            .unwrap();
        assert_eq!(data["storageClass"], "fast");
        assert_eq!(data[DEPLOY_OPERANDS_KEY], "false");
    }

    #[tokio::test]
    async fn test_disabled_check_and_unrelated_groups() {
        let gateway = gateway_with_operand();
        gateway.seed(cpp_config(&[(DISABLE_POST_DELEGATION_KEY, "true")]));
        let ctx = ctx(gateway);
        reconcile(
            Arc::new(operator_group("Certificate.v1.cert-manager.io")),
            ctx.clone(),
        )
        .await
        .unwrap();
        reconcile(
            Arc::new(operator_group("CertManager.v1alpha1.operator.ibm.com")),
            ctx.clone(),
        )
        .await
        .unwrap();
        assert!(ctx.gateway.writes().is_empty());
        assert!(ctx.gateway.object::<CertManager>(CANONICAL_NAME, None).is_some());
    }

    #[tokio::test]
    async fn test_detect() {
        let gateway = gateway_with_operand();
        assert_eq!(detect(&gateway, NAMESPACE, NAMESPACE).await.unwrap(), None);

        gateway.seed(operator_group("Certificate.v1.cert-manager.io"));
        assert_eq!(
            detect(&gateway, NAMESPACE, NAMESPACE).await.unwrap(),
            Some(Delegation::InstallerProvidesApi)
        );

        gateway.seed(cpp_config(&[
            (DISABLE_POST_DELEGATION_KEY, "true"),
            (DEPLOY_OPERANDS_KEY, "true"),
        ]));
        assert_eq!(detect(&gateway, NAMESPACE, NAMESPACE).await.unwrap(), None);

        gateway.seed(cpp_config(&[(DEPLOY_OPERANDS_KEY, "false")]));
        assert_eq!(
            detect(&gateway, NAMESPACE, NAMESPACE).await.unwrap(),
            Some(Delegation::OperandsDisabled)
        );
    }

    #[tokio::test]
    async fn test_hub_discovery_and_sharing() {
        let gateway = MemoryGateway::new();
        assert_eq!(find_hub(&gateway).await.unwrap(), None);

        gateway.serve("operator.open-cluster-management.io/v1", "MultiClusterHub");
        let mut mch = MultiClusterHub::new("multiclusterhub", MultiClusterHubSpec::default());
        mch.metadata.namespace = Some("open-cluster-management".to_string());
        mch.status = Some(MultiClusterHubStatus {
            current_version: Some("2.2.4".to_string()),
            phase: None,
        });
        gateway.seed(mch);
        assert!(legacy_hub_present(&gateway).await.unwrap());

        let hub = find_hub(&gateway).await.unwrap().unwrap();
        share_ca_with_hub(&gateway, &hub, NAMESPACE).await.unwrap();
        share_ca_with_hub(&gateway, &hub, NAMESPACE).await.unwrap();
        let share = gateway
            .object::<SecretShare>(HUB_SECRET_SHARE_NAME, Some(NAMESPACE))
            .unwrap();
        assert_eq!(share.spec.secretshares[0].secretname, CS_CA_SECRET_NAME);
        assert_eq!(
            share.spec.secretshares[0].sharewith[0].namespace,
            "open-cluster-management-issuer"
        );
        assert_eq!(gateway.writes_to("SecretShare").len(), 1);
    }
}
