//! Installs the cert-manager operand described by the `default` [`CertManager`].
//!
//! Every pass converges the operand from scratch: RBAC prerequisites first, then the controller
//! Deployment, then either the webhook stack or its removal. Objects that already match their
//! desired state are not written again, so a settled cluster sees no writes at all.

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
            apps::v1::Deployment,
            core::v1::{Service, ServiceAccount},
            rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
        },
        apimachinery::pkg::apis::meta::v1::OwnerReference,
    },
    kube::{
        api::DynamicObject,
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Api, Resource, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    catalog::{
        self, owner_reference, rbac, webhook,
        workloads::{self, Component, CONFIGMAP_WATCHER_NAME},
    },
    coexistence::{self, Finding},
    config::OperatorEnvironment,
    crd::{CertManager, CertManagerStatus, CANONICAL_NAME, FINALIZER},
    delegation,
    external_crd::apiregistration::APIService,
    gateway::{self, ClusterGateway, KubeGateway, Object, OperandEvent},
    planner::{self, Intent},
    utils::error_full_message,
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "certmanager";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub const STATUS_DEPLOYED: &str = "Successfully deployed cert-manager";
pub const STATUS_PREREQS_FAILED: &str = "Error deploying cert-manager, prereqs not met";
pub const STATUS_DEPLOY_FAILED: &str = "Error deploying cert-manager";
pub const STATUS_SKIPPED: &str =
    "Successfully skipped operand deployment because another cert-manager running on cluster";
pub const STATUS_HUB_IN_USE: &str = "IBM Cloud Platform Common Services cert-manager not installed. Red Hat Advanced Cluster Management for Kubernetes cert-manager is already installed and is in use by Common Services";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to fetch the operand configuration"))]
    GetCertManager { source: gateway::Error },

    #[snafu(display("failed to update the finalizers of the operand configuration"))]
    UpdateFinalizers { source: gateway::Error },

    #[snafu(display("failed to check for other cert-manager providers"))]
    DetectDelegation { source: delegation::Error },

    #[snafu(display("failed to look for another cert-manager installation"))]
    DetectForeignInstall { source: coexistence::Error },

    #[snafu(display("failed to hand over to the cluster management hub"))]
    HandOverToHub { source: delegation::Error },

    #[snafu(display("prerequisites for the operand are not met"))]
    Prerequisites { source: ConvergeError },

    #[snafu(display("failed to deploy the operand"))]
    Workloads { source: ConvergeError },

    #[snafu(display("failed to update the operand configuration status"))]
    UpdateStatus { source: gateway::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetCertManager { source }
            | Error::UpdateFinalizers { source }
            | Error::UpdateStatus { source } => source.object(),
            Error::DetectDelegation { source } | Error::HandOverToHub { source } => {
                source.secondary_object()
            }
            Error::DetectForeignInstall { source } => source.object(),
            Error::Prerequisites { source } | Error::Workloads { source } => source.object(),
        }
    }
}

/// Failure while converging one group of operand objects.
#[derive(Debug, Snafu)]
pub enum ConvergeError {
    #[snafu(display("failed to build the desired {kind}"))]
    BuildObject {
        source: catalog::Error,
        kind: &'static str,
    },

    #[snafu(display("failed to apply {kind}"))]
    ApplyObject { source: gateway::Error, kind: String },

    #[snafu(display("failed to plan the {component} deployment"))]
    PlanDeployment {
        source: planner::Error,
        component: Component,
    },
}

impl ConvergeError {
    fn object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            ConvergeError::ApplyObject { source, .. } => source.object(),
            ConvergeError::PlanDeployment {
                source: planner::Error::SearchDeployments { source, .. },
                ..
            } => source.object(),
            _ => None,
        }
    }

    /// The planner's refusal to install next to an earlier installation, if that is the cause.
    fn duplicate_install(&self) -> Option<&planner::Error> {
        match self {
            ConvergeError::PlanDeployment { source, .. } if source.is_duplicate_install() => {
                Some(source)
            }
            _ => None,
        }
    }
}

pub struct Ctx<G> {
    pub gateway: G,
    pub environment: OperatorEnvironment,
    pub detection: coexistence::Timing,
}

pub async fn start(client: &stackable_operator::client::Client, environment: &OperatorEnvironment) {
    Controller::new(
        Api::<CertManager>::all(client.as_kube_client()),
        watcher::Config::default(),
    )
    .owns(
        Api::<Deployment>::namespaced(client.as_kube_client(), &environment.deploy_namespace),
        watcher::Config::default(),
    )
    .run(
        reconcile::<KubeGateway>,
        error_policy::<KubeGateway>,
        Arc::new(Ctx {
            gateway: KubeGateway::new(client.clone(), FULL_CONTROLLER_NAME),
            environment: environment.clone(),
            detection: coexistence::Timing::default(),
        }),
    )
    .for_each_concurrent(16, |res| async move {
        report_controller_reconciled(client, FULL_CONTROLLER_NAME, &res)
    })
    .await;
}

pub async fn reconcile<G: ClusterGateway>(oc: Arc<CertManager>, ctx: Arc<Ctx<G>>) -> Result<Action> {
    let gateway = &ctx.gateway;
    let env = &ctx.environment;
    let name = oc.name_any();
    let Some(mut oc) = gateway
        .get::<CertManager>(&name, None)
        .await
        .context(GetCertManagerSnafu)?
    else {
        debug!(cert_manager = %name, "operand configuration is gone");
        return Ok(Action::await_change());
    };

    if name != CANONICAL_NAME {
        emit(
            gateway,
            &oc,
            OperandEvent::warning("Not Allowed", "Only one CR named default is allowed"),
        )
        .await;
        return Ok(Action::await_change());
    }

    if oc.meta().deletion_timestamp.is_some() {
        if oc.has_finalizer() {
            oc.finalizers_mut().retain(|finalizer| finalizer != FINALIZER);
            gateway.update(&oc).await.context(UpdateFinalizersSnafu)?;
            info!("released the operand configuration for deletion");
        }
        return Ok(Action::await_change());
    }
    if !oc.has_finalizer() {
        oc.finalizers_mut().push(FINALIZER.to_string());
        oc = gateway.update(&oc).await.context(UpdateFinalizersSnafu)?;
    }

    if let Some(delegation) = delegation::detect(gateway, &env.deploy_namespace, env.watch_namespace())
        .await
        .context(DetectDelegationSnafu)?
    {
        info!(%delegation, "not deploying the operand");
        return Ok(Action::await_change());
    }

    match coexistence::detect(gateway, &env.deploy_namespace, ctx.detection)
        .await
        .context(DetectForeignInstallSnafu)?
    {
        Finding::Clear => {}
        Finding::Foreign => {
            info!("another cert-manager runs on the cluster, not deploying the operand");
            emit(
                gateway,
                &oc,
                OperandEvent::normal(
                    "Skipped",
                    "Found another cert-manager running on cluster, skipping operand deployment",
                ),
            )
            .await;
            write_status(gateway, oc, STATUS_SKIPPED).await?;
            return Ok(Action::await_change());
        }
        Finding::UnreachableForeignWebhook => {
            warn!(
                "the webhook of another cert-manager cannot be reached, \
                 repair that installation and restart this operator"
            );
            return Ok(Action::await_change());
        }
    }

    emit(gateway, &oc, OperandEvent::normal("Initializing", "Instance found")).await;

    if let Some(hub) = delegation::find_hub(gateway)
        .await
        .context(HandOverToHubSnafu)?
        .filter(|hub| hub.is_legacy())
    {
        info!(hub_version = %hub.version, "cluster management hub provides cert-manager");
        delegation::share_ca_with_hub(gateway, &hub, &env.deploy_namespace)
            .await
            .context(HandOverToHubSnafu)?;
        write_status(gateway, oc, STATUS_HUB_IN_USE).await?;
        return Ok(Action::await_change());
    }

    if let Err(err) = converge_prerequisites(gateway, &oc, env).await {
        let oc = write_status(gateway, oc, STATUS_PREREQS_FAILED).await?;
        emit(
            gateway,
            &oc,
            OperandEvent::warning("PrereqsFailed", error_full_message(&err)),
        )
        .await;
        return Err(err).context(PrerequisitesSnafu);
    }
    emit(
        gateway,
        &oc,
        OperandEvent::normal(
            "PrereqsMet",
            "All prerequisites for deploying cert-manager service found",
        ),
    )
    .await;

    if let Err(err) = converge_workloads(gateway, &oc, env).await {
        emit(gateway, &oc, OperandEvent::warning("Failed", error_full_message(&err))).await;
        if let Some(duplicate) = err.duplicate_install() {
            warn!(%duplicate, "refusing to install next to an existing cert-manager");
            write_status(gateway, oc, &duplicate.to_string()).await?;
            return Ok(Action::await_change());
        }
        write_status(gateway, oc, STATUS_DEPLOY_FAILED).await?;
        return Err(err).context(WorkloadsSnafu);
    }

    emit(
        gateway,
        &oc,
        OperandEvent::normal("Deployed", "Deployed cert-manager successfully"),
    )
    .await;
    write_status(gateway, oc, STATUS_DEPLOYED).await?;
    Ok(Action::await_change())
}

pub fn error_policy<G>(_obj: Arc<CertManager>, _error: &Error, _ctx: Arc<Ctx<G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Events are best effort, a failure to publish one never fails the pass.
async fn emit<G: ClusterGateway>(gateway: &G, oc: &CertManager, event: OperandEvent) {
    if let Err(err) = gateway.publish_event(oc, &event).await {
        warn!(
            error = &err as &dyn std::error::Error,
            reason = %event.reason,
            "failed to publish event"
        );
    }
}

async fn write_status<G: ClusterGateway>(
    gateway: &G,
    mut oc: CertManager,
    message: &str,
) -> Result<CertManager> {
    if oc.status_message() == message {
        return Ok(oc);
    }
    oc.status = Some(CertManagerStatus {
        cert_manager_status: message.to_string(),
    });
    gateway.update_status(&oc).await.context(UpdateStatusSnafu)
}

fn owned<K: Resource>(mut obj: K, owner: &OwnerReference) -> K {
    obj.meta_mut().owner_references = Some(vec![owner.clone()]);
    obj
}

/// Creates `desired` when absent, otherwise lets `align` copy the managed fields onto the live
/// object and writes it back if that changed anything.
async fn ensure<G, K>(
    gateway: &G,
    desired: K,
    align: impl FnOnce(&mut K, &K),
) -> Result<(), ConvergeError>
where
    G: ClusterGateway,
    K: Object + PartialEq,
{
    let kind = K::kind(&());
    let existing = gateway
        .get::<K>(&desired.name_any(), desired.meta().namespace.as_deref())
        .await
        .context(ApplyObjectSnafu { kind: kind.as_ref() })?;
    match existing {
        None => {
            gateway
                .create(&desired)
                .await
                .context(ApplyObjectSnafu { kind: kind.as_ref() })?;
            info!(object = %ObjectRef::from_obj(&desired), "created");
        }
        Some(existing) => {
            let mut aligned = existing.clone();
            align(&mut aligned, &desired);
            if aligned != existing {
                gateway
                    .update(&aligned)
                    .await
                    .context(ApplyObjectSnafu { kind: kind.as_ref() })?;
                info!(object = %ObjectRef::from_obj(&aligned), "updated");
            }
        }
    }
    Ok(())
}

/// RBAC and service accounts the operand pods run with.
async fn converge_prerequisites<G: ClusterGateway>(
    gateway: &G,
    oc: &CertManager,
    env: &OperatorEnvironment,
) -> Result<(), ConvergeError> {
    let namespace = env.deploy_namespace.as_str();
    let owner = owner_reference(oc).context(BuildObjectSnafu { kind: "owner reference" })?;

    let cluster_role = rbac::cluster_role().context(BuildObjectSnafu { kind: "ClusterRole" })?;
    ensure(gateway, owned(cluster_role, &owner), |live: &mut ClusterRole, want| {
        live.rules.clone_from(&want.rules)
    })
    .await?;

    let role = rbac::role(namespace).context(BuildObjectSnafu { kind: "Role" })?;
    ensure(gateway, owned(role, &owner), |live: &mut Role, want| {
        live.rules.clone_from(&want.rules)
    })
    .await?;

    let cluster_role_binding = rbac::cluster_role_binding(namespace)
        .context(BuildObjectSnafu { kind: "ClusterRoleBinding" })?;
    ensure(
        gateway,
        owned(cluster_role_binding, &owner),
        |live: &mut ClusterRoleBinding, want| {
            live.role_ref.clone_from(&want.role_ref);
            live.subjects.clone_from(&want.subjects);
        },
    )
    .await?;

    let role_binding =
        rbac::role_binding(namespace).context(BuildObjectSnafu { kind: "RoleBinding" })?;
    ensure(gateway, owned(role_binding, &owner), |live: &mut RoleBinding, want| {
        live.role_ref.clone_from(&want.role_ref);
        live.subjects.clone_from(&want.subjects);
    })
    .await?;

    for account in
        rbac::service_accounts(namespace).context(BuildObjectSnafu { kind: "ServiceAccount" })?
    {
        match gateway.create(&owned(account, &owner)).await {
            Ok(created) => info!(object = %ObjectRef::from_obj(&created), "created"),
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err).context(ApplyObjectSnafu { kind: "ServiceAccount" }),
        }
    }
    Ok(())
}

async fn converge_workloads<G: ClusterGateway>(
    gateway: &G,
    oc: &CertManager,
    env: &OperatorEnvironment,
) -> Result<(), ConvergeError> {
    let namespace = env.deploy_namespace.as_str();
    converge_deployment(gateway, oc, env, Component::Controller).await?;
    if gateway
        .delete_named::<Deployment>(CONFIGMAP_WATCHER_NAME, Some(namespace))
        .await
        .context(ApplyObjectSnafu { kind: "Deployment" })?
    {
        info!("removed the retired {CONFIGMAP_WATCHER_NAME} deployment");
    }

    if oc.spec.enable_webhook {
        converge_webhook_prerequisites(gateway, oc, namespace).await?;
        converge_deployment(gateway, oc, env, Component::Cainjector).await?;
        converge_deployment(gateway, oc, env, Component::Webhook).await?;
    } else {
        remove_webhook(gateway, namespace).await?;
    }
    Ok(())
}

async fn converge_deployment<G: ClusterGateway>(
    gateway: &G,
    oc: &CertManager,
    env: &OperatorEnvironment,
    component: Component,
) -> Result<(), ConvergeError> {
    let desired = workloads::deployment(component, oc, env)
        .context(BuildObjectSnafu { kind: "Deployment" })?;
    match planner::plan(gateway, component, desired)
        .await
        .context(PlanDeploymentSnafu { component })?
    {
        Intent::Create(deployment) => {
            gateway
                .create(deployment.as_ref())
                .await
                .context(ApplyObjectSnafu { kind: "Deployment" })?;
            info!(%component, "created deployment");
        }
        Intent::Update(deployment) => {
            gateway
                .update(deployment.as_ref())
                .await
                .context(ApplyObjectSnafu { kind: "Deployment" })?;
            info!(%component, "updated deployment");
        }
        Intent::Unchanged => debug!(%component, "deployment is up to date"),
    }
    Ok(())
}

/// Creates whatever part of the webhook's API plumbing is missing, existing objects are kept.
async fn converge_webhook_prerequisites<G: ClusterGateway>(
    gateway: &G,
    oc: &CertManager,
    namespace: &str,
) -> Result<(), ConvergeError> {
    let owner = owner_reference(oc).context(BuildObjectSnafu { kind: "owner reference" })?;

    let binding = webhook::auth_reader_binding(namespace)
        .context(BuildObjectSnafu { kind: "RoleBinding" })?;
    ensure::<_, RoleBinding>(gateway, owned(binding, &owner), keep).await?;
    let service = webhook::service(namespace).context(BuildObjectSnafu { kind: "Service" })?;
    ensure::<_, Service>(gateway, owned(service, &owner), keep).await?;
    let api_service =
        webhook::api_service(namespace).context(BuildObjectSnafu { kind: "APIService" })?;
    ensure::<_, APIService>(gateway, owned(api_service, &owner), keep).await?;
    let mutating = webhook::mutating_configuration(namespace).context(BuildObjectSnafu {
        kind: "MutatingWebhookConfiguration",
    })?;
    ensure::<_, MutatingWebhookConfiguration>(gateway, owned(mutating, &owner), keep).await?;
    let validating = webhook::validating_configuration(namespace).context(BuildObjectSnafu {
        kind: "ValidatingWebhookConfiguration",
    })?;
    ensure::<_, ValidatingWebhookConfiguration>(gateway, owned(validating, &owner), keep).await
}

fn keep<K>(_live: &mut K, _desired: &K) {}

async fn remove_webhook<G: ClusterGateway>(gateway: &G, namespace: &str) -> Result<(), ConvergeError> {
    for component in [Component::Webhook, Component::Cainjector] {
        if gateway
            .delete_named::<Deployment>(&component.deployment_name(), Some(namespace))
            .await
            .context(ApplyObjectSnafu { kind: "Deployment" })?
        {
            info!(%component, "removed deployment");
        }
    }
    gateway
        .delete_named::<Service>(webhook::WEBHOOK_NAME, Some(namespace))
        .await
        .context(ApplyObjectSnafu { kind: "Service" })?;
    gateway
        .delete_named::<APIService>(webhook::API_SERVICE_NAME, None)
        .await
        .context(ApplyObjectSnafu { kind: "APIService" })?;
    gateway
        .delete_named::<MutatingWebhookConfiguration>(webhook::WEBHOOK_NAME, None)
        .await
        .context(ApplyObjectSnafu {
            kind: "MutatingWebhookConfiguration",
        })?;
    gateway
        .delete_named::<ValidatingWebhookConfiguration>(webhook::WEBHOOK_NAME, None)
        .await
        .context(ApplyObjectSnafu {
            kind: "ValidatingWebhookConfiguration",
        })?;
    gateway
        .delete_named::<RoleBinding>(webhook::WEBHOOK_NAME, Some(webhook::AUTH_READER_NAMESPACE))
        .await
        .context(ApplyObjectSnafu { kind: "RoleBinding" })?;
    Ok(())
}
