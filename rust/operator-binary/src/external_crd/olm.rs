//! CRDs owned by the [Operator Lifecycle Manager](https://olm.operatorframework.io/).

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

/// Annotation OLM maintains on every `OperatorGroup`, listing the APIs its members provide
/// as a comma separated list of `Kind.version.group`.
pub const PROVIDED_APIS_ANNOTATION: &str = "olm.providedAPIs";

/// See <https://olm.operatorframework.io/docs/concepts/crds/operatorgroup/>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "operators.coreos.com",
    version = "v1",
    kind = "OperatorGroup",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorGroupSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

impl OperatorGroup {
    /// Whether the members of this group provide `api` (formatted as `Kind.version.group`).
    pub fn provides_api(&self, api: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(PROVIDED_APIS_ANNOTATION))
            .is_some_and(|provided| provided.contains(api))
    }
}
