//! Resources of Red Hat Advanced Cluster Management (RHACM) and the IBM secret share operator.
//!
//! RHACM ships its own cert-manager. Hubs older than 2.3 expect the Common Services CA to be
//! shared into their issuer namespace instead of a second operand being installed.

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

/// See <https://github.com/stolostron/multiclusterhub-operator>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "operator.open-cluster-management.io",
    version = "v1",
    kind = "MultiClusterHub",
    namespaced,
    status = "MultiClusterHubStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterHubSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_config: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterHubStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Copies secrets and config maps between namespaces, see
/// <https://github.com/IBM/ibm-secretshare-operator>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "ibmcpcs.ibm.com",
    version = "v1",
    kind = "SecretShare",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
pub struct SecretShareSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secretshares: Vec<SecretShareEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretShareEntry {
    pub secretname: String,
    #[serde(default)]
    pub sharewith: Vec<TargetNamespace>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TargetNamespace {
    pub namespace: String,
}

/// Hub release from which RHACM no longer relies on the Common Services CA.
const SELF_SUFFICIENT_HUB: (u64, u64, u64) = (2, 3, 0);

/// A discovered RHACM hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hub {
    pub version: String,
    pub namespace: String,
}

impl Hub {
    pub fn from_multi_cluster_hub(hub: &MultiClusterHub) -> Option<Self> {
        let version = hub.status.as_ref()?.current_version.clone()?;
        if version.is_empty() {
            return None;
        }
        Some(Hub {
            version,
            namespace: hub.metadata.namespace.clone().unwrap_or_default(),
        })
    }

    /// Whether this hub predates 2.3.
    ///
    /// Versions follow semantic versioning, a version that does not parse sorts before every
    /// valid version and is therefore considered old.
    pub fn is_legacy(&self) -> bool {
        match parse_version(&self.version) {
            Some((version, pre_release)) => {
                version < SELF_SUFFICIENT_HUB || (version == SELF_SUFFICIENT_HUB && pre_release)
            }
            None => true,
        }
    }

    /// Namespace the hub's cluster issuer reads its CA from.
    pub fn issuer_namespace(&self) -> String {
        format!("{}-issuer", self.namespace)
    }
}

fn parse_version(version: &str) -> Option<((u64, u64, u64), bool)> {
    let version = version.trim().trim_start_matches('v');
    let version = version.split('+').next()?;
    let (core, pre_release) = match version.split_once('-') {
        Some((core, pre)) => (core, !pre.is_empty()),
        None => (version, false),
    };
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |part| part.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |part| part.parse().ok())?;
    if parts.next().is_some() {
        return None;
    }
    Some(((major, minor, patch), pre_release))
}
