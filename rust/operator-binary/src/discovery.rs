//! Waits for the API server to serve the kinds a loop depends on.

use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tracing::{info, warn};

use crate::gateway::{self, ClusterGateway};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{group_version} {kind} was not served within {timeout:?}"))]
    Timeout {
        group_version: String,
        kind: String,
        timeout: Duration,
    },

    #[snafu(display("failed to query {group_version}"))]
    Query {
        source: gateway::Error,
        group_version: String,
    },
}

/// Polls discovery until every kind in `kinds` is served under `group_version`.
///
/// Transient discovery failures are retried until the timeout runs out, the last one is
/// reported if it never clears.
pub async fn wait_for_kinds<G: ClusterGateway>(
    gateway: &G,
    group_version: &str,
    kinds: &[&str],
    interval: Duration,
    timeout: Duration,
) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    for kind in kinds {
        loop {
            let last_error = match gateway.kind_exists(group_version, kind).await {
                Ok(true) => break,
                Ok(false) => None,
                Err(err) => {
                    warn!(error = &err as &dyn std::error::Error, group_version, kind, "discovery failed");
                    Some(err)
                }
            };
            if tokio::time::Instant::now() + interval > deadline {
                return match last_error {
                    Some(err) => Err(err).context(QuerySnafu { group_version }),
                    None => TimeoutSnafu {
                        group_version,
                        kind: *kind,
                        timeout,
                    }
                    .fail(),
                };
            }
            info!(group_version, kind, "waiting for the kind to be served");
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}
