//! Restarts workloads whose certificate was reissued.
//!
//! Once a [`v1::Certificate`] is issued, every Deployment, StatefulSet and DaemonSet in its
//! namespace that reads the certificate's secret gets its pod template relabelled, which rolls
//! the pods onto the new key material. The expiration label records which issuance a workload
//! was last restarted for, so each issuance restarts a workload at most once.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{DaemonSet, Deployment, StatefulSet},
            core::v1::PodTemplateSpec,
        },
        chrono::{DateTime, Utc},
    },
    kube::{
        api::DynamicObject,
        runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
        Api, Resource, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use crate::{
    external_crd::cert_manager::v1,
    gateway::{self, ClusterGateway, KubeGateway, ListSelector, Object},
    OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "podrefresh";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub const RESTART_LABEL: &str = "certmanager.k8s.io/time-restarted";
pub const EXPIRATION_LABEL: &str = "cert-manager.io/expiration";
/// Set to `"true"` on a workload to keep it running across certificate renewals.
pub const DISABLE_AUTO_RESTART_ANNOTATION: &str = "certmanager.k8s.io/disable-auto-restart";

/// Minute precision, without zero padding, so the value is a valid label.
const LABEL_TIME_FORMAT: &str = "%Y-%-m-%-d.%H%M";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to fetch the certificate"))]
    GetCertificate { source: gateway::Error },

    #[snafu(display("failed to list {kind} objects"))]
    ListWorkloads {
        source: gateway::Error,
        kind: String,
    },

    #[snafu(display("failed to restart {workload}"))]
    RestartWorkload {
        source: gateway::Error,
        workload: ObjectRef<DynamicObject>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::GetCertificate { source } | Error::ListWorkloads { source, .. } => {
                source.object()
            }
            Error::RestartWorkload { workload, .. } => Some(workload.clone()),
        }
    }
}

pub struct Ctx<G> {
    pub gateway: G,
}

pub async fn start(client: &stackable_operator::client::Client) {
    Controller::new(
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
    certificate: Arc<v1::Certificate>,
    ctx: Arc<Ctx<G>>,
) -> Result<Action> {
    let gateway = &ctx.gateway;
    let Some(certificate) = gateway
        .get::<v1::Certificate>(&certificate.name_any(), certificate.namespace().as_deref())
        .await
        .context(GetCertificateSnafu)?
    else {
        return Ok(Action::await_change());
    };
    let Some(not_after) = certificate
        .status
        .as_ref()
        .filter(|status| !status.conditions.is_empty())
        .and_then(|status| status.not_after.as_ref())
    else {
        debug!("certificate has not been issued yet");
        return Ok(Action::await_change());
    };

    let restart = Restart {
        namespace: certificate.namespace().unwrap_or_default(),
        secret: certificate.spec.secret_name.clone(),
        expiration: label_time(not_after.0),
        restarted_at: label_time(Utc::now()),
    };
    restart.apply::<_, Deployment>(gateway).await?;
    restart.apply::<_, StatefulSet>(gateway).await?;
    restart.apply::<_, DaemonSet>(gateway).await?;
    Ok(Action::await_change())
}

pub fn error_policy<G>(_obj: Arc<v1::Certificate>, _error: &Error, _ctx: Arc<Ctx<G>>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

fn label_time(time: DateTime<Utc>) -> String {
    time.format(LABEL_TIME_FORMAT).to_string()
}

/// Workload kinds owning a pod template.
trait PodWorkload: Object {
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
}

macro_rules! pod_workload {
    ($($kind:ty),*) => {$(
        impl PodWorkload for $kind {
            fn pod_template(&self) -> Option<&PodTemplateSpec> {
                self.spec.as_ref().map(|spec| &spec.template)
            }

            fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
                self.spec.as_mut().map(|spec| &mut spec.template)
            }
        }
    )*};
}

pod_workload!(Deployment, StatefulSet, DaemonSet);

struct Restart {
    namespace: String,
    secret: String,
    expiration: String,
    restarted_at: String,
}

impl Restart {
    async fn apply<G: ClusterGateway, K: PodWorkload>(&self, gateway: &G) -> Result<()> {
        let workloads = gateway
            .list::<K>(Some(&self.namespace), &ListSelector::everything())
            .await
            .with_context(|_| ListWorkloadsSnafu {
                kind: K::kind(&()),
            })?;
        for mut workload in workloads.into_iter().filter(|w| self.is_due(w)) {
            let labels = [
                (RESTART_LABEL, self.restarted_at.as_str()),
                (EXPIRATION_LABEL, self.expiration.as_str()),
            ];
            for (key, value) in labels {
                workload.labels_mut().insert(key.to_string(), value.to_string());
            }
            if let Some(template) = workload.pod_template_mut() {
                let template_labels = template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .labels
                    .get_or_insert_with(Default::default);
                for (key, value) in labels {
                    template_labels.insert(key.to_string(), value.to_string());
                }
            }
            gateway
                .update(&workload)
                .await
                .with_context(|_| RestartWorkloadSnafu {
                    workload: ObjectRef::from_obj(&workload).erase(),
                })?;
            info!(
                workload = %ObjectRef::from_obj(&workload),
                secret = %self.secret,
                "restarting workload for its renewed certificate"
            );
        }
        Ok(())
    }

    fn is_due<K: PodWorkload>(&self, workload: &K) -> bool {
        if workload.labels().get(EXPIRATION_LABEL) == Some(&self.expiration) {
            return false;
        }
        if workload
            .annotations()
            .get(DISABLE_AUTO_RESTART_ANNOTATION)
            .is_some_and(|value| value == "true")
        {
            return false;
        }
        workload
            .pod_template()
            .is_some_and(|template| mounts_secret(template, &self.secret))
    }
}

/// Whether any container reads `secret` through its environment, or any volume mounts it
/// directly or as part of a projection.
fn mounts_secret(template: &PodTemplateSpec, secret: &str) -> bool {
    let Some(pod) = &template.spec else {
        return false;
    };
    let from_env = pod
        .containers
        .iter()
        .chain(pod.init_containers.iter().flatten())
        .flat_map(|container| container.env.iter().flatten())
        .filter_map(|env| env.value_from.as_ref()?.secret_key_ref.as_ref())
        .any(|selector| selector.name.as_deref() == Some(secret));
    let from_volume = pod.volumes.iter().flatten().any(|volume| {
        let direct = volume
            .secret
            .as_ref()
            .is_some_and(|source| source.secret_name.as_deref() == Some(secret));
        let projected = volume
            .projected
            .iter()
            .flat_map(|projected| projected.sources.iter().flatten())
            .filter_map(|source| source.secret.as_ref())
            .any(|projection| projection.name.as_deref() == Some(secret));
        direct || projected
    });
    from_env || from_volume
}
