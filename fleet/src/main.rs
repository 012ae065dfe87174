//! Commonware Fleet CLI

use clap::{Arg, ArgAction, Command};
use commonware_fleet::{
    client::{http, Dialer as _, Endpoint},
    config::Config,
    container::Docker,
    monitor,
    network::Network,
    subnet::Registry,
    vault, Fleet,
};
use commonware_runtime::{tokio, Metrics, Runner};
use std::{
    error::Error,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};
use tracing::{error, info, warn};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Provision a fleet, check liveness and tear everything down
const SMOKE_CMD: &str = "smoke";

/// Watch already running nodes
const MONITOR_CMD: &str = "monitor";

/// Entrypoint for the Commonware Fleet CLI
fn main() -> ExitCode {
    // Define application
    let matches = Command::new("fleetctl")
        .version(crate_version())
        .about("Provision fleets of blockchain node containers and check that consensus makes progress.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(SMOKE_CMD)
                .about("Start a fleet described by a YAML configuration file, monitor it and tear it down.")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .help("Path to YAML config file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(MONITOR_CMD)
                .about("Monitor the heads of running nodes until the timeout elapses or one stops making progress.")
                .arg(
                    Arg::new("endpoint")
                        .long("endpoint")
                        .required(true)
                        .action(ArgAction::Append)
                        .help("RPC endpoint of a node (e.g. http://172.18.0.2:8545)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("60")
                        .help("How long to monitor in seconds")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    let executor = tokio::Runner::default();
    executor.start(|context| async move {
        match matches.subcommand() {
            Some((SMOKE_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                if let Err(e) = smoke(context, config_path).await {
                    error!(error=?e, "smoke test failed");
                } else {
                    return ExitCode::SUCCESS;
                }
            }
            Some((MONITOR_CMD, matches)) => {
                let endpoints = matches
                    .get_many::<String>("endpoint")
                    .unwrap()
                    .cloned()
                    .collect();
                let timeout = *matches.get_one::<u64>("timeout").unwrap();
                if let Err(e) = watch(context, endpoints, Duration::from_secs(timeout)).await {
                    error!(error=?e, "consensus not working");
                } else {
                    return ExitCode::SUCCESS;
                }
            }
            Some((cmd, _)) => error!(cmd, "invalid subcommand"),
            None => error!("no subcommand provided"),
        }
        ExitCode::FAILURE
    })
}

async fn smoke(context: tokio::Context, config_path: &Path) -> Result<(), Box<dyn Error>> {
    let config = Config::load(config_path)?;
    let runtime = Docker::default();
    let dialer = http::Dialer::new(context.with_label("rpc"), http::Config::default())?;

    // Create the network every container is attached to
    let registry = Registry::new();
    let network = Network::create(&context, runtime.clone(), &registry).await?;
    let subnet = network.subnet().clone();
    let mut cfg = config.fleet(Some(network.name().to_string()));

    // Start vaults before the nodes they are paired with
    let mut vaults = None;
    if config.vaults {
        let mut rng = context.clone();
        let mut paired = vault::Network::new(
            &mut rng,
            runtime.clone(),
            &subnet,
            Some(network.name().to_string()),
            vault::NetworkConfig {
                count: config.fullnodes + config.faulty,
                scratch: cfg.workdir.clone(),
                ..vault::NetworkConfig::default()
            },
        )
        .await?;
        paired.start().await?;
        cfg.pairings = paired.pairings();
        vaults = Some(paired);
    }

    let result = exercise(context, runtime, dialer, subnet, cfg, &config).await;

    // Tear down regardless of the outcome
    if let Some(mut vaults) = vaults {
        if let Err(err) = vaults.stop().await {
            warn!(?err, "failed to stop vaults");
        }
        vaults.finalize();
    }
    if let Err(err) = network.remove().await {
        warn!(?err, "failed to remove network");
    }
    result
}

async fn exercise(
    context: tokio::Context,
    runtime: Docker,
    dialer: http::Dialer<tokio::Context>,
    subnet: commonware_fleet::subnet::Subnet,
    cfg: commonware_fleet::controller::Config,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    let mut fleet = Fleet::new(context, runtime, dialer, subnet, cfg).await?;
    let duration = Duration::from_secs(config.monitor.duration);
    let result = match fleet.start(config.strong).await {
        Ok(()) => {
            info!(fullnodes = fleet.fullnodes().len(), ?duration, "monitoring fleet");
            fleet
                .ensure_consensus_working(fleet.fullnodes(), duration)
                .await
        }
        Err(err) => Err(err),
    };
    fleet.stop(true).await?;
    fleet.finalize();
    Ok(result?)
}

async fn watch(
    context: tokio::Context,
    endpoints: Vec<String>,
    timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let dialer = http::Dialer::new(context.with_label("rpc"), http::Config::default())?;
    let mut targets = Vec::with_capacity(endpoints.len());
    for raw in endpoints {
        let endpoint: Endpoint = raw.parse()?;
        targets.push((endpoint.to_string(), dialer.dial(&endpoint).await?));
    }
    monitor::ensure_progress(
        context.with_label("liveness"),
        targets,
        monitor::Config::default(),
        timeout,
    )
    .await?;
    info!(?timeout, "consensus working");
    Ok(())
}
