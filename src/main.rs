//! kubeadm-provisioner - converge a machine into a kubeadm cluster
//!
//! This is the CLI entry point.

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use kubeadm_provisioner::config::{resolve, ExecutionSettings, OptionsParser, Plan};
use kubeadm_provisioner::error::ProvisionError;
use kubeadm_provisioner::remote::{LocalExecutor, RemoteExecutor, SshExecutor, SshTarget};
use kubeadm_provisioner::retry::RetryPolicy;
use kubeadm_provisioner::{ApplyOutcome, Provisioner};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when the apply ran but failed
const EXIT_FAILURE: u8 = 1;

/// Exit status for invalid options
const EXIT_CONFIG: u8 = 2;

/// kubeadm node provisioner
#[derive(Parser)]
#[command(name = "kubeadm-provisioner")]
#[command(version)]
#[command(about = "Install kubeadm and converge a node into a Kubernetes cluster", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the options and print the resulting plan
    Plan {
        /// Options file (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Provision a node
    #[command(group(ArgGroup::new("target").required(true).args(["host", "local"])))]
    Apply {
        /// Options file (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,
        /// Node to provision over ssh
        #[arg(long)]
        host: Option<String>,
        /// ssh user
        #[arg(short, long, requires = "host")]
        user: Option<String>,
        /// ssh port
        #[arg(short, long, default_value = "22")]
        port: u16,
        /// ssh private key
        #[arg(short, long, requires = "host")]
        identity: Option<PathBuf>,
        /// Provision this machine
        #[arg(long)]
        local: bool,
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
        /// Timeout for a single remote command, in seconds
        #[arg(long, default_value = "600")]
        command_timeout: u64,
        /// Attempts at joining a control plane that is not reachable yet
        #[arg(long, default_value = "5")]
        join_attempts: u32,
        /// Linear backoff step between join attempts, in seconds
        #[arg(long, default_value = "10")]
        join_backoff: u64,
    },
}

fn load_plan(path: &Path) -> Result<Plan, ProvisionError> {
    let raw = OptionsParser::parse_file(path).map_err(|e| match e {
        ProvisionError::Config(errors) => ProvisionError::Config(errors),
        other => ProvisionError::Config(vec![format!("{}: {}", path.display(), other)]),
    })?;
    resolve(&raw)
}

async fn apply_with<E: RemoteExecutor>(
    executor: &E,
    plan: &Plan,
    settings: ExecutionSettings,
    cancel: CancellationToken,
) -> ApplyOutcome {
    Provisioner::new(executor, settings).apply(plan, cancel).await
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Plan { config, output } => {
            let plan = load_plan(&config)?;
            match output {
                OutputFormat::Text => print!("{}", serde_yaml::to_string(&plan)?),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Apply {
            config,
            host,
            user,
            port,
            identity,
            local,
            output,
            command_timeout,
            join_attempts,
            join_backoff,
        } => {
            let plan = load_plan(&config)?;
            let settings = ExecutionSettings {
                command_timeout: Duration::from_secs(command_timeout),
                join_retry: RetryPolicy::new(join_attempts, Duration::from_secs(join_backoff)),
                ..ExecutionSettings::default()
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing the current command");
                    on_signal.cancel();
                }
            });

            let outcome = match (host, local) {
                (Some(host), _) => {
                    let mut target = SshTarget::new(&host);
                    target.user = user;
                    target.port = port;
                    target.identity = identity;
                    info!(node = %target.destination(), "Provisioning over ssh");
                    apply_with(&SshExecutor::new(target), &plan, settings, cancel).await
                }
                (None, true) => {
                    info!("Provisioning the local machine");
                    apply_with(&LocalExecutor::new(), &plan, settings, cancel).await
                }
                (None, false) => anyhow::bail!("either --host or --local is required"),
            };

            match output {
                OutputFormat::Text => println!("{}", outcome.render()),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome).context("serializing outcome")?
                ),
            }

            if outcome.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_FAILURE))
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for the report
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            match e.downcast_ref::<ProvisionError>() {
                Some(ProvisionError::Config(_)) => ExitCode::from(EXIT_CONFIG),
                _ => ExitCode::from(EXIT_FAILURE),
            }
        }
    }
}
