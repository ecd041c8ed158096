//! Liveness and readiness probes.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use axum::{extract::State, http::StatusCode, routing::get, Router};
use snafu::{ResultExt, Snafu};
use tracing::info;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind the probe listener to {address}"))]
    Bind {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("probe server failed"))]
    Serve { source: std::io::Error },
}

/// Flipped once every controller has been started.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_started(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Drives `controllers`, marking readiness right after their first poll has started their
    /// watches.
    pub async fn run_started<F: Future>(&self, controllers: F) -> F::Output {
        let (output, ()) = futures::future::join(controllers, async {
            self.mark_started();
            info!("controllers started");
        })
        .await;
        output
    }
}

async fn probe(State(readiness): State<Readiness>) -> StatusCode {
    if readiness.is_started() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn routes(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(probe))
        .route("/readyz", get(probe))
        .with_state(readiness)
}

pub async fn serve(address: SocketAddr, readiness: Readiness) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;
    info!(%address, "serving health probes");
    axum::serve(listener, routes(readiness))
        .await
        .context(ServeSnafu)
}
