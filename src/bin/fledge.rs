//! fledge - run a pod on containers and OSv unikernels
//!
//! ## Usage
//!
//! ```sh
//! fledge run <pod.yaml> [--config <path>]
//! fledge version
//! fledge help
//! ```
//!
//! `run` creates and starts the pod, prints its report and status as JSON,
//! then waits for Ctrl-C and deletes it.

use fledge::config::{Config, default_root_dir};
use fledge::pod::PodSpec;
use fledge::provider::Provider;
use fledge::resources::StaticResources;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run { manifest: PathBuf, config: PathBuf },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "run" => {
            let manifest = args
                .get(2)
                .filter(|a| !a.starts_with('-'))
                .map(PathBuf::from)
                .ok_or_else(|| "run requires <pod.yaml>".to_string())?;
            let mut config = default_root_dir().join("config.json");
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--config" | "-c" => {
                        let path = args
                            .get(i + 1)
                            .ok_or_else(|| "--config requires a path".to_string())?;
                        config = PathBuf::from(path);
                        i += 2;
                    }
                    other => return Err(format!("unknown option: {}", other)),
                }
            }
            Ok(Command::Run { manifest, config })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_run(manifest: PathBuf, config: PathBuf) -> Result<(), String> {
    let config = Config::load(&config).map_err(|e| e.to_string())?;
    init_tracing(&config.log_level)?;

    let yaml = std::fs::read(&manifest)
        .map_err(|e| format!("failed to read {}: {}", manifest.display(), e))?;
    let pod = PodSpec::from_yaml(&yaml).map_err(|e| e.to_string())?;

    let provider = Provider::from_config(config, Arc::new(StaticResources::new()))
        .map_err(|e| e.to_string())?;

    let report = provider.create_pod(&pod).await.map_err(|e| e.to_string())?;
    print_json(&report)?;

    let status = provider
        .pod_status(&pod.namespace, &pod.name)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&status)?;

    info!(pod = %pod.name, "pod is up, press Ctrl-C to delete it");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for Ctrl-C");
    }

    let deleted = provider.delete_pod(&pod.namespace, &pod.name).await;
    provider.shutdown().await.map_err(|e| e.to_string())?;
    deleted.map_err(|e| e.to_string())
}

fn cmd_version() -> Result<(), String> {
    println!("fledge {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn cmd_help() {
    println!(
        r#"fledge - run Kubernetes pods on containers and OSv unikernels

USAGE:
    fledge <command> [options]

COMMANDS:
    run <pod.yaml>      Create and start a pod, delete it on Ctrl-C
    version             Print version
    help                Print this help

OPTIONS:
    -c, --config <path> Configuration file (default: ~/.fledge/config.json)

ENVIRONMENT:
    FLEDGE_ROOT_DIR, FLEDGE_BACKENDS, FLEDGE_DEFAULT_BACKEND, FLEDGE_LOG_LEVEL
    and FLEDGE_QEMU_* / FLEDGE_VIRTIOFS_* override the configuration file."#
    );
}

fn init_tracing(level: &str) -> Result<(), String> {
    let level: Level = level
        .parse()
        .map_err(|_| format!("invalid log level: {}", level))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to set tracing subscriber: {}", e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| format!("serialize: {}", e))?;
    println!("{}", json);
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    match parse_args() {
        Ok(cmd) => {
            let result = match cmd {
                Command::Run { manifest, config } => cmd_run(manifest, config).await,
                Command::Version => cmd_version(),
                Command::Help => {
                    cmd_help();
                    Ok(())
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
