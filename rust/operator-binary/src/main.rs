use anyhow::Context;
use clap::{crate_description, crate_version, Parser};
use futures::future;
use stackable_operator::CustomResourceExt;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::{config::CertManagerOperatorRun, gateway::KubeGateway, health::Readiness};

mod catalog;
mod coexistence;
mod config;
mod conversion;
mod crd;
mod delegation;
mod discovery;
mod external_crd;
mod gateway;
mod health;
mod label_controller;
mod leader;
mod lifecycle_controller;
mod planner;
mod pod_refresh_controller;
mod refresh_controller;
mod utils;

pub const APP_NAME: &str = "ibm-cert-manager-operator";
pub const OPERATOR_NAME: &str = "operator.ibm.com";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<CertManagerOperatorRun>,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            crd::CertManager::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(run) => {
            stackable_operator::logging::initialize_logging(
                "CERT_MANAGER_OPERATOR_LOG",
                APP_NAME,
                run.tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;
            let mut sigterm = signal(SignalKind::terminate())?;

            let readiness = Readiness::default();
            let probes = health::serve(run.health_probe_bind_address, readiness.clone());
            let operator = run_operator(&client, &run, &readiness);
            tokio::select! {
                result = operator => result?,
                result = probes => result.context("health probes stopped")?,
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
    }
    Ok(())
}

/// Runs every controller, behind the leader lease when leader election is enabled.
///
/// Only returns on failure, including the loss of the lease.
async fn run_operator(
    client: &stackable_operator::client::Client,
    run: &CertManagerOperatorRun,
    readiness: &Readiness,
) -> anyhow::Result<()> {
    let environment = &run.environment;
    let gateway = KubeGateway::new(client.clone(), OPERATOR_NAME);
    let elector = leader::LeaderElector::new(
        &gateway,
        environment.lease_namespace(),
        &leader::identity(),
    );
    if run.leader_elect {
        elector.acquire().await;
    }

    discovery::wait_for_kinds(
        &gateway,
        external_crd::cert_manager::GROUP_VERSION,
        &["Certificate", "Issuer"],
        discovery::POLL_INTERVAL,
        discovery::POLL_TIMEOUT,
    )
    .await
    .context("cert-manager API is not served")?;

    let controllers = readiness.run_started(future::join3(
        future::join3(
            lifecycle_controller::start(client, environment),
            delegation::start(client, environment.watch_namespace()),
            refresh_controller::start(client, &environment.deploy_namespace),
        ),
        future::join3(
            conversion::certificate_controller::start(client),
            conversion::issuer_controller::start(client),
            label_controller::start(client),
        ),
        pod_refresh_controller::start(client),
    ));

    if run.leader_elect {
        tokio::select! {
            _ = controllers => anyhow::bail!("controllers stopped"),
            err = elector.hold() => Err(err).context("leadership lost"),
        }
    } else {
        controllers.await;
        anyhow::bail!("controllers stopped")
    }
}
