//! Desired state of every object the operand consists of.
//!
//! Accessors build a fresh value on every call, callers are free to modify what they get.

use serde::{de::DeserializeOwned, Deserialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    kube::Resource,
};

use crate::crd::CertManager;

pub mod rbac;
pub mod webhook;
pub mod workloads;

/// Secret the webhook keeps its self-generated serving CA in.
pub const WEBHOOK_SERVING_SECRET: &str = "cert-manager-webhook-ca";

const NAMESPACE_PLACEHOLDER: &str = "{{ namespace }}";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("embedded manifest {manifest:?} is invalid"))]
    InvalidManifest {
        source: serde_yaml::Error,
        manifest: &'static str,
    },

    #[snafu(display("embedded manifest {manifest:?} has no {kind}"))]
    MissingDocument {
        manifest: &'static str,
        kind: String,
    },

    #[snafu(display("operand configuration has no name or uid to be referenced as owner"))]
    OwnerReference,
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Parses every document of `kind` out of an embedded multi-document manifest.
fn documents<K>(manifest: &'static str, source: &str, namespace: &str) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let rendered = source.replace(NAMESPACE_PLACEHOLDER, namespace);
    let kind = K::kind(&());
    let mut found = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&rendered) {
        let value = serde_yaml::Value::deserialize(document)
            .context(InvalidManifestSnafu { manifest })?;
        if value.get("kind").and_then(serde_yaml::Value::as_str) == Some(kind.as_ref()) {
            found.push(serde_yaml::from_value(value).context(InvalidManifestSnafu { manifest })?);
        }
    }
    Ok(found)
}

fn document<K>(manifest: &'static str, source: &str, namespace: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    documents(manifest, source, namespace)?
        .into_iter()
        .next()
        .with_context(|| MissingDocumentSnafu {
            manifest,
            kind: K::kind(&()),
        })
}

/// Controller owner reference making `owner` the owner of an operand object.
pub fn owner_reference(owner: &CertManager) -> Result<OwnerReference> {
    owner.controller_owner_ref(&()).context(OwnerReferenceSnafu)
}
