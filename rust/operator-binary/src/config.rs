//! Process-wide settings, read once from the command line and the environment at startup.

use std::net::{AddrParseError, SocketAddr};

use stackable_operator::logging::TracingTarget;

pub const DEFAULT_DEPLOY_NAMESPACE: &str = "ibm-cert-manager";

/// Environment variables overriding the operand images.
pub const CONTROLLER_IMAGE_ENV: &str = "ICP_CERT_MANAGER_CONTROLLER_IMAGE";
pub const WEBHOOK_IMAGE_ENV: &str = "ICP_CERT_MANAGER_WEBHOOK_IMAGE";
pub const CAINJECTOR_IMAGE_ENV: &str = "ICP_CERT_MANAGER_CAINJECTOR_IMAGE";
pub const ACMESOLVER_IMAGE_ENV: &str = "ICP_CERT_MANAGER_ACMESOLVER_IMAGE";

#[derive(clap::Parser, Debug)]
pub struct CertManagerOperatorRun {
    /// Address the health and readiness probes are served on.
    #[arg(long, default_value = ":8081", value_parser = parse_bind_address)]
    pub health_probe_bind_address: SocketAddr,

    /// Only run the controllers while holding the leader lease.
    #[arg(long, default_value_t = false)]
    pub leader_elect: bool,

    #[command(flatten)]
    pub environment: OperatorEnvironment,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

/// Accepts `host:port` as well as the `:port` shorthand, which binds every interface.
fn parse_bind_address(value: &str) -> Result<SocketAddr, AddrParseError> {
    match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}").parse(),
        None => value.parse(),
    }
}

/// Namespaces and image overrides, shared read-only by every controller.
#[derive(clap::Args, Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorEnvironment {
    /// Namespace the operator pod runs in, holds the leader lease.
    #[arg(long, env = "POD_NAMESPACE", default_value = "")]
    pub pod_namespace: String,

    /// Namespace the operand is installed into.
    #[arg(long = "deployed-namespace", env = "DEPLOYED_NAMESPACE", default_value = DEFAULT_DEPLOY_NAMESPACE)]
    pub deploy_namespace: String,

    /// Namespace holding the installer group and the `ibm-cpp-config` map, defaults to the
    /// deploy namespace.
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    #[arg(long, env = CONTROLLER_IMAGE_ENV)]
    pub controller_image: Option<String>,
    #[arg(long, env = WEBHOOK_IMAGE_ENV)]
    pub webhook_image: Option<String>,
    #[arg(long, env = CAINJECTOR_IMAGE_ENV)]
    pub cainjector_image: Option<String>,
    #[arg(long, env = ACMESOLVER_IMAGE_ENV)]
    pub acmesolver_image: Option<String>,
}

impl OperatorEnvironment {
    pub fn watch_namespace(&self) -> &str {
        self.watch_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.deploy_namespace)
    }

    /// The namespace the leader lease lives in.
    pub fn lease_namespace(&self) -> &str {
        if self.pod_namespace.is_empty() {
            &self.deploy_namespace
        } else {
            &self.pod_namespace
        }
    }

    #[cfg(test)]
    pub fn for_namespace(namespace: &str) -> Self {
        OperatorEnvironment {
            pod_namespace: namespace.to_string(),
            deploy_namespace: namespace.to_string(),
            ..Self::default()
        }
    }
}
