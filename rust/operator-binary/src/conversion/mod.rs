//! Keeps a `cert-manager.io/v1` twin for every legacy `certmanager.k8s.io/v1alpha1` object.
//!
//! The operand only serves the current API. Legacy objects left behind by older releases are
//! mirrored into twins of the same name that they control, and the twins' status is copied back
//! so that tooling reading the legacy API keeps working.

use snafu::{OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    kube::{api::DynamicObject, runtime::reflector::ObjectRef, Resource},
};

pub mod certificate;
pub mod certificate_controller;
pub mod issuer;
pub mod issuer_controller;

/// Marks objects this operator created on behalf of a legacy object.
pub const OPERATOR_GENERATED_ANNOTATION: &str = "ibm-cert-manager-operator-generated";
/// Marks certificate twins built by the current conversion rules.
pub const PROPER_V1_LABEL: &str = "ibm-cert-manager-operator/proper-v1";
/// Put on legacy leaves whose CA was converted, their secrets have been removed for reissuing.
pub const CONVERSION_LEAF_REFRESH_LABEL: &str = "ibm-cert-manager-operator/conversion-leaf-refresh";

const TRUE: &str = "true";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{object} has no name or uid to be referenced as owner"))]
    OwnerReference { object: ObjectRef<DynamicObject> },
}

/// Controller owner reference pointing a twin back at its legacy object.
fn twin_owner<K: Resource<DynamicType = ()>>(legacy: &K) -> Result<OwnerReference, Error> {
    legacy
        .controller_owner_ref(&())
        .with_context(|| OwnerReferenceSnafu {
            object: ObjectRef::from_obj(legacy).erase(),
        })
}
