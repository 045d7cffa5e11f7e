// zpa-relay: receives ZPA LSS log streams over TCP/TLS, stores them to
// day-rotated local files, and forwards them to Splunk HEC.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use tracing::info;
use zpa_relay::config::{self, RelayConfig};
use zpa_relay::hec::HecForwarder;
use zpa_relay::metrics::RelayMetrics;
use zpa_relay::supervisor::Supervisor;

fn config_arg() -> Arg {
    Arg::new("config")
        .help("Path to the YAML configuration file")
        .short('c')
        .long("config")
        .value_name("PATH")
        .required(true)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn config_path(matches: &ArgMatches) -> PathBuf {
    PathBuf::from(
        matches
            .get_one::<String>("config")
            .expect("config is required"),
    )
}

#[tokio::main]
async fn main() {
    let matches = Command::new("zpa-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relays ZPA LSS log streams to local storage and Splunk HEC")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Run the relay until SIGINT/SIGTERM")
                .arg(config_arg()),
        )
        .subcommand(Command::new("template").about("Print a starter configuration to stdout"))
        .subcommand(
            Command::new("check")
                .about("Health-check every configured HEC target and exit")
                .arg(config_arg()),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("run", sub)) => run(config_path(sub)).await,
        Some(("template", _)) => print!("{}", config::template()),
        Some(("check", sub)) => check(config_path(sub)).await,
        _ => unreachable!("subcommand is required"),
    }
}

async fn run(config_path: PathBuf) {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "zpa-relay starting");

    let config = match RelayConfig::load(&config_path) {
        Ok(cfg) => {
            info!(
                listeners = cfg.listeners.len(),
                path = %config_path.display(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let supervisor = match Supervisor::build(config_path, config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.run().await {
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}

/// Smoke-test every configured HEC target; exit non-zero if any fails.
async fn check(config_path: PathBuf) {
    init_tracing();

    let config = match RelayConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = std::sync::Arc::new(RelayMetrics::new());
    let mut failed = false;

    for listener in &config.listeners {
        // Health checks never batch; drop the flush workers.
        let mut fwd_cfg = listener.forwarder.clone();
        for target in &mut fwd_cfg.targets {
            target.batch.enabled = false;
        }
        let forwarder = match HecForwarder::new(&fwd_cfg, None, metrics.clone()) {
            Ok(f) => f,
            Err(e) => {
                println!("{}: FAIL ({})", listener.name, e);
                failed = true;
                continue;
            }
        };
        for (target, result) in forwarder.health_check().await {
            match result {
                Ok(()) => println!("{}/{}: ok", listener.name, target),
                Err(e) => {
                    println!("{}/{}: FAIL ({})", listener.name, target, e);
                    failed = true;
                }
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
}
