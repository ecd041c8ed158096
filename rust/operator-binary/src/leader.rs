//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Ownership is transferred with resourceVersion guarded writes, so two replicas racing for an
//! expired lease cannot both win. Losing the lease ends [`LeaderElector::hold`], which stops
//! the process.

use std::time::Duration;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::coordination::v1::{Lease, LeaseSpec},
        apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
        chrono::{self, DateTime, Utc},
    },
    kube::ResourceExt,
};
use tracing::{debug, info, warn};

use crate::gateway::{self, ClusterGateway};

pub const LEASE_NAME: &str = "1557e857.ibm.com";

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the leader lease"))]
    ReadLease { source: gateway::Error },

    #[snafu(display("failed to write the leader lease"))]
    WriteLease { source: gateway::Error },

    #[snafu(display("lost the leader lease {LEASE_NAME:?} to {holder:?}"))]
    LeaseLost { holder: Option<String> },
}
type Result<T, E = Error> = std::result::Result<T, E>;

pub struct LeaderElector<'a, G> {
    gateway: &'a G,
    namespace: String,
    identity: String,
}

impl<'a, G: ClusterGateway> LeaderElector<'a, G> {
    pub fn new(gateway: &'a G, namespace: &str, identity: &str) -> Self {
        LeaderElector {
            gateway,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Waits until this replica holds the lease.
    pub async fn acquire(&self) {
        info!(identity = %self.identity, lease = LEASE_NAME, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired leadership");
                    return;
                }
                Ok(false) => debug!(identity = %self.identity, "lease is held by another replica"),
                Err(err) => warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to acquire the leader lease"
                ),
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    /// Keeps renewing the lease, returns once it cannot be renewed within the renew deadline.
    pub async fn hold(&self) -> Error {
        let mut last_renewal = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(RETRY_PERIOD).await;
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => last_renewal = tokio::time::Instant::now(),
                Ok(false) => {
                    return Error::LeaseLost {
                        holder: self.holder().await,
                    }
                }
                Err(err) if last_renewal.elapsed() > RENEW_DEADLINE => return err,
                Err(err) => warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to renew the leader lease"
                ),
            }
        }
    }

    async fn holder(&self) -> Option<String> {
        let lease = self
            .gateway
            .get::<Lease>(LEASE_NAME, Some(&self.namespace))
            .await
            .ok()??;
        lease.spec?.holder_identity
    }

    /// Takes the lease when it is free or expired and renews it when already held.
    pub async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(lease) = self
            .gateway
            .get::<Lease>(LEASE_NAME, Some(&self.namespace))
            .await
            .context(ReadLeaseSnafu)?
        else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(self.namespace.clone()),
                    ..ObjectMeta::default()
                },
                spec: Some(self.held_spec(now, now, 0)),
            };
            return match self.gateway.create(&lease).await {
                Ok(_) => Ok(true),
                Err(err) if err.is_already_exists() => Ok(false),
                Err(err) => Err(err).context(WriteLeaseSnafu),
            };
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let transitions = spec.lease_transitions.unwrap_or(0);
        let renewed = if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
            let acquired = spec.acquire_time.map_or(now, |time| time.0);
            self.held_spec(acquired, now, transitions)
        } else if expired(&spec, now) {
            info!(
                identity = %self.identity,
                previous = ?spec.holder_identity,
                "taking over expired lease"
            );
            self.held_spec(now, now, transitions + 1)
        } else {
            return Ok(false);
        };

        let mut lease = lease;
        lease.spec = Some(renewed);
        match self.gateway.update(&lease).await {
            Ok(_) => Ok(true),
            Err(gateway::Error::Conflict { .. }) => {
                debug!(lease = %lease.name_any(), "lease changed concurrently");
                Ok(false)
            }
            Err(err) => Err(err).context(WriteLeaseSnafu),
        }
    }

    fn held_spec(&self, acquired: DateTime<Utc>, renewed: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(MicroTime(acquired)),
            renew_time: Some(MicroTime(renewed)),
            lease_transitions: Some(transitions),
            ..LeaseSpec::default()
        }
    }
}

fn expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.holder_identity, &spec.renew_time, spec.lease_duration_seconds) {
        (None, _, _) => true,
        (Some(holder), _, _) if holder.is_empty() => true,
        (_, Some(renewed), Some(seconds)) => {
            now > renewed.0 + chrono::Duration::seconds(i64::from(seconds))
        }
        _ => true,
    }
}

/// Identity of this replica, unique across restarts of the same pod.
pub fn identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "cert-manager-operator".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gateway::memory::{MemoryGateway, Verb};

    const NAMESPACE: &str = "ibm-cert-manager";

    fn lease(ctx: &MemoryGateway) -> LeaseSpec {
        ctx.object::<Lease>(LEASE_NAME, Some(NAMESPACE))
            .unwrap()
            .spec
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_holder() {
        let gateway = MemoryGateway::new();
        let first = LeaderElector::new(&gateway, NAMESPACE, "first");
        let second = LeaderElector::new(&gateway, NAMESPACE, "second");
        let now = Utc::now();

        assert!(first.try_acquire_or_renew(now).await.unwrap());
        assert!(!second.try_acquire_or_renew(now).await.unwrap());
        assert!(first
            .try_acquire_or_renew(now + chrono::Duration::seconds(5))
            .await
            .unwrap());
        assert_eq!(lease(&gateway).holder_identity.as_deref(), Some("first"));
        assert_eq!(lease(&gateway).lease_transitions, Some(0));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let gateway = MemoryGateway::new();
        let first = LeaderElector::new(&gateway, NAMESPACE, "first");
        let second = LeaderElector::new(&gateway, NAMESPACE, "second");
        let now = Utc::now();
        assert!(first.try_acquire_or_renew(now).await.unwrap());

        let later = now + chrono::Duration::seconds(16);
        assert!(second.try_acquire_or_renew(later).await.unwrap());
        assert_eq!(lease(&gateway).holder_identity.as_deref(), Some("second"));
        assert_eq!(lease(&gateway).lease_transitions, Some(1));
        assert!(!first.try_acquire_or_renew(later).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failures_surface() {
        let gateway = MemoryGateway::new();
        gateway.fail::<Lease>(Verb::Get);
        let elector = LeaderElector::new(&gateway, NAMESPACE, "first");
        assert!(matches!(
            elector.try_acquire_or_renew(Utc::now()).await,
            Err(Error::ReadLease { .. })
        ));
    }
}
