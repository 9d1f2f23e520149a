// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use logrelay::agent::Agent;
use logrelay::config::{
    Config, Paths, DEFAULT_CONFIG_PATH, DEFAULT_DEVICE_ID_PATH, DEFAULT_INPUTS_DIR,
    DEFAULT_STATE_PATH,
};
use logrelay::licensing::{spawn_monitor, LicenseClient};
use logrelay::logger::Formatter;
use logrelay::registry::load_inputs;
use logrelay::status;
use logrelay::store::{CheckpointStore, StoreError};

#[derive(Debug, Parser)]
#[command(name = "logrelay-agent", version, about = "Rotates local log files and ships them to a collector")]
struct Cli {
    /// Agent configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory of input descriptor files.
    #[arg(long, global = true, default_value = DEFAULT_INPUTS_DIR)]
    inputs_dir: PathBuf,

    /// Checkpoint database.
    #[arg(long, global = true, default_value = DEFAULT_STATE_PATH)]
    state_path: PathBuf,

    #[arg(long, global = true, default_value = DEFAULT_DEVICE_ID_PATH)]
    device_id_path: PathBuf,

    /// Append logs to this file instead of stdout.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent until SIGINT or SIGTERM. SIGHUP reloads.
    Run,
    /// Rotate every input once, regardless of thresholds.
    Rotate,
    /// Ship one chunk of every input.
    Ship,
    /// Print checkpoints and backlog as JSON.
    Status,
    /// Check configuration and inputs.
    Validate,
}

impl Cli {
    fn paths(&self) -> Paths {
        Paths {
            config_file: self.config.clone(),
            inputs_dir: self.inputs_dir.clone(),
            state_path: self.state_path.clone(),
            device_id_path: self.device_id_path.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let paths = cli.paths();

    let config = Config::load(&paths.config_file);
    let log_level = config
        .as_ref()
        .map(|c| c.log_level.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    if let Err(e) = init_logging(&log_level, cli.log_file.as_deref()) {
        eprintln!("failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Run => run(paths, &config).await,
        Command::Rotate => with_agent(paths, |agent| async move {
            let rotated = agent.rotate_pass(true).await;
            info!("Rotated {rotated} files");
        })
        .await,
        Command::Ship => with_agent(paths, |agent| async move {
            let shipped = agent.ship_pass().await;
            info!("Ship pass done, {shipped} inputs up to date");
        })
        .await,
        Command::Status => print_status(&paths, &config),
        Command::Validate => validate(&paths, &config),
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> std::io::Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,sled=off,{level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter);

    let result = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing::subscriber::set_global_default(builder.with_writer(Mutex::new(file)).finish())
        }
        None => tracing::subscriber::set_global_default(builder.finish()),
    };
    result.map_err(std::io::Error::other)
}

async fn with_agent<F, Fut>(paths: Paths, pass: F) -> ExitCode
where
    F: FnOnce(Agent) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    match Agent::load(paths) {
        Ok(agent) => {
            pass(agent).await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to start: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(paths: Paths, config: &Config) -> ExitCode {
    let agent = match Agent::load(paths) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();

    if config.enabled && config.license.enabled {
        let client = match LicenseClient::from_config(&config.license) {
            Ok(client) => client,
            Err(e) => {
                error!("License check unavailable: {e}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = client.check(&config.license.package).await {
            error!("License check failed: {e}");
            return ExitCode::FAILURE;
        }
        info!("License check passed");
        spawn_monitor(
            client,
            config.license.package.clone(),
            Duration::from_secs(config.license.check_interval_secs),
            shutdown.clone(),
        );
    }

    let (reload_tx, reload_rx) = mpsc::channel(1);
    if let Err(e) = trap_signals(reload_tx, shutdown.clone()) {
        error!("Failed to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    match agent.run(reload_rx, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Agent stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

fn trap_signals(reload: mpsc::Sender<()>, shutdown: CancellationToken) -> std::io::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading");
                    // A reload already queued covers this one.
                    let _ = reload.try_send(());
                }
                _ = interrupt.recv() => break,
                _ = terminate.recv() => break,
            }
        }
        shutdown.cancel();
    });
    Ok(())
}

fn print_status(paths: &Paths, config: &Config) -> ExitCode {
    let inputs = match load_inputs(&paths.inputs_dir) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("Failed to load inputs: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = match CheckpointStore::open_read_only(&paths.state_path) {
        Ok(store) => Some(store),
        Err(StoreError::Locked(path)) => {
            warn!("{} is in use by a running agent, checkpoints unavailable", path.display());
            None
        }
        Err(e) => {
            error!("Failed to open checkpoints: {e}");
            return ExitCode::FAILURE;
        }
    };

    let snapshot = status::build(config, &inputs, store.as_ref(), &Local::now());
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to encode status: {e}");
            ExitCode::FAILURE
        }
    }
}

fn validate(paths: &Paths, config: &Config) -> ExitCode {
    let mut problems = config.problems();
    match load_inputs(&paths.inputs_dir) {
        Ok(inputs) => {
            if inputs.is_empty() {
                warn!("No inputs registered in {}", paths.inputs_dir.display());
            }
            for input in &inputs {
                let source = input
                    .source
                    .as_deref()
                    .map_or_else(String::new, |p| format!("{}: ", p.display()));
                if input.package.trim().is_empty() || input.log_id.trim().is_empty() {
                    problems.push(format!("{source}input without package or log_id"));
                }
                if !input.path.is_absolute() {
                    problems.push(format!(
                        "{source}path {} is not absolute",
                        input.path.display()
                    ));
                }
            }
        }
        Err(e) => problems.push(e.to_string()),
    }

    if problems.is_empty() {
        println!("configuration ok");
        return ExitCode::SUCCESS;
    }
    for problem in &problems {
        println!("{problem}");
    }
    ExitCode::FAILURE
}
