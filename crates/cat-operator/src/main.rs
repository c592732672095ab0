use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cat_operator::admission::webhook::run_webhook_server;
use cat_operator::controllers::{self, ControllerContext};
use cat_operator::health::{run_health_server, HealthState};
use cat_operator::leader::{LeaderElection, LeaderElectionConfig};
use cat_operator::OperatorConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("cat-operator starting");
    cat_operator::init_crypto_provider();

    let config = OperatorConfig::from_env().context("Invalid operator configuration")?;
    let election =
        LeaderElectionConfig::from_env().context("Invalid leader election configuration")?;

    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        webhook_port = config.webhook_port,
        webhook_tls = config.webhook_tls.is_some(),
        health_port = config.health_port,
        leader_election = election.enabled(),
        "Loaded configuration"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    // Every replica serves probes and admission requests; only the leader reconciles
    let health = Arc::new(HealthState::new(Arc::new(client.clone())));
    let health_server = tokio::spawn(run_health_server(health, config.health_port));
    let webhook_server = tokio::spawn(run_webhook_server(
        config.webhook_port,
        config.webhook_tls.clone(),
    ));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    select! {
        result = run_controller(client, config.watch_namespace.clone(), election) => {
            return result.context("Controller failure");
        }
        result = health_server => {
            return handle_server_exit("Health server", result);
        }
        result = webhook_server => {
            return handle_server_exit("Admission webhook", result);
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for leadership if enabled, then run the Cat controller
///
/// Returns an error if the controller stops or leadership is lost, which
/// should restart the pod.
async fn run_controller(
    client: Client,
    namespace: Option<String>,
    election: LeaderElectionConfig,
) -> Result<()> {
    let leader = if election.enabled() {
        let leader = LeaderElection::new(client.clone(), &election);
        leader.acquire().await;
        Some(leader)
    } else {
        info!("Leader election disabled");
        None
    };

    let ctx = Arc::new(ControllerContext::new(client.clone()));
    let controller = tokio::spawn(controllers::cat::run(client, ctx, namespace));

    let Some(leader) = leader else {
        return handle_controller_exit("Cat", controller.await);
    };

    select! {
        result = controller => handle_controller_exit("Cat", result),
        result = leader.keep_renewing() => match result {
            Ok(()) => bail!("Lease renewal stopped"),
            Err(e) => {
                error!(error = %e, "Leadership lost");
                Err(e.context("Leadership lost"))
            }
        },
    }
}

fn handle_controller_exit(name: &str, result: std::result::Result<(), JoinError>) -> Result<()> {
    match result {
        Ok(()) => {
            error!(controller = name, "Controller exited unexpectedly");
            bail!("{} controller exited unexpectedly", name)
        }
        Err(e) if e.is_panic() => {
            error!(controller = name, "Controller panicked");
            bail!("{} controller panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(controller = name, "Controller was cancelled");
            bail!("{} controller was cancelled", name)
        }
        Err(e) => {
            error!(controller = name, error = ?e, "Controller task failed");
            bail!("{} controller task failed: {}", name, e)
        }
    }
}

fn handle_server_exit<E>(
    name: &str,
    result: std::result::Result<std::result::Result<(), E>, JoinError>,
) -> Result<()>
where
    E: Into<anyhow::Error>,
{
    match result {
        Ok(Ok(())) => {
            error!(server = name, "Server exited unexpectedly");
            bail!("{} exited unexpectedly", name)
        }
        Ok(Err(e)) => {
            let err: anyhow::Error = e.into();
            error!(server = name, error = %err, "Server failed");
            Err(err.context(format!("{name} failed")))
        }
        Err(e) => {
            error!(server = name, error = ?e, "Server task failed");
            bail!("{} task failed: {}", name, e)
        }
    }
}
