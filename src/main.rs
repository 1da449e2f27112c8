//! CLI entry point for the resilience probe.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use resilience_probe::cluster::{
    ControlPlane, DirectorClient, DirectorConfig, FaultInjector, GatewayStore, RemoteExecutor,
    SshExecutor, SshOpts, StoreClient, TlsMaterial, TurbulenceClient, TurbulenceConfig,
};
use resilience_probe::experiment::{
    NodeOps, NodeTarget, Orchestrator, RunSettings, ScenarioSettings, StoreSet,
};
use resilience_probe::polling::DEFAULT_POLL_INTERVAL;
use resilience_probe::FileConfig;
use tracing::{debug, error, info};
use url::Url;

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = FileConfig::load(&args.config)?;
    info!(
        deployment = %config.deployment_name,
        endpoints = config.endpoints.len(),
        "Resilience probe starting"
    );

    let stores = build_stores(&config)?;
    stores
        .cluster
        .get("/", config.operation_timeout())
        .await
        .with_context(|| format!("initial read against {} failed", stores.cluster.describe()))?;

    let control_plane: Arc<dyn ControlPlane> = Arc::new(DirectorClient::new(&DirectorConfig {
        director_url: config.director_url.clone(),
        uaa_url: config.uaa_url.clone(),
        client: config.director_client.clone(),
        client_secret: config.director_client_secret.clone(),
        ca_cert: config.director_ca.clone(),
    })?);
    let faults: Arc<dyn FaultInjector> = Arc::new(TurbulenceClient::new(&TurbulenceConfig {
        host: config.turbulence_host.clone(),
        port: config.turbulence_port,
        username: config.turbulence_user.clone(),
        password: config.turbulence_password.clone(),
        ca_cert: config.turbulence_ca_cert.clone(),
    })?);

    let scenario_settings =
        ScenarioSettings::from_operation_timeout(config.operation_timeout(), config.hold());

    let ssh = SshOpts::generate()
        .await
        .context("cannot generate an ssh key pair")?;
    let remote: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new());
    let nodes = NodeOps::new(
        Arc::clone(&control_plane),
        remote,
        NodeTarget {
            deployment: config.deployment_name.clone(),
            instance_group: config.instance_group.clone(),
            ssh_port: config.ssh_port,
        },
        ssh,
    )
    .with_restart_within(scenario_settings.restart_within);

    let settings = RunSettings {
        deployment: config.deployment_name.clone(),
        zones: config.zones.clone(),
        read_tolerance: config.read_tolerance,
        probe_interval: config.probe_interval(),
        operation_timeout: config.operation_timeout(),
        gate_poll_interval: DEFAULT_POLL_INTERVAL,
        client_ip: config.client_ip.clone(),
        acceptance_deployment: config.acceptance_deployment.clone(),
        route_probe: route_probe(&config.endpoints[0])?,
    };

    let orchestrator = Orchestrator::new(stores, faults, control_plane, nodes, settings);

    let mut failed = Vec::new();
    for kind in args.scenarios() {
        let experiment = kind.build(&scenario_settings);
        match orchestrator.run(&experiment).await {
            Ok(report) => {
                for check in &report.verdicts {
                    info!(
                        experiment = report.name,
                        phase = check.phase,
                        slot = check.slot,
                        "{}",
                        check.verdict
                    );
                }
                info!(experiment = report.name, elapsed = ?report.elapsed, "Experiment passed");
            }
            Err(err) => {
                error!(experiment = kind.name(), error = %err, "Experiment failed");
                failed.push(kind.name());
            }
        }
    }

    if !failed.is_empty() {
        bail!("{} experiment(s) failed: {}", failed.len(), failed.join(", "));
    }

    info!("All experiments passed");
    Ok(())
}

/// Builds the whole-cluster, isolated-node and survivors clients.
fn build_stores(config: &FileConfig) -> Result<StoreSet> {
    let tls = config
        .tls_paths()
        .map(|(ca, cert, key)| TlsMaterial::load(ca, cert, key))
        .transpose()
        .context("cannot load store TLS material")?;

    let cluster = GatewayStore::new(&config.endpoints, &config.gateway_prefix, tls.as_ref())?;
    let isolated = cluster.targeted(0..1)?;
    let survivors = cluster.targeted(1..config.endpoints.len())?;

    let to_dyn = |store: GatewayStore| -> Arc<dyn StoreClient> { Arc::new(store) };
    Ok(StoreSet {
        isolated: to_dyn(isolated),
        survivors: to_dyn(survivors),
        cluster: to_dyn(cluster),
    })
}

/// `host:port` of a store endpoint, used to find the local route to the cluster.
fn route_probe(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint).with_context(|| format!("invalid endpoint {endpoint}"))?;
    let Some(host) = url.host_str() else {
        bail!("endpoint {endpoint} has no host");
    };
    let port = url.port_or_known_default().unwrap_or(2379);
    Ok(format!("{host}:{port}"))
}
