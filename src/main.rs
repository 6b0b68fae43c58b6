use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{Environment, LogFormat, RatekeeperConfig};
use ratekeeper::ratelimit::{Identity, PolicySummary, RateLimitRuntime, RequestContext};

#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about = "Per-identity, per-policy request admission")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured environment
    #[arg(long, value_enum, global = true)]
    environment: Option<Environment>,

    /// Override the configured log format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy table as JSON
    Policies,
    /// Run a burst of requests against one policy and print each decision
    Simulate(SimulateArgs),
    /// Start the limiter runtime and sweep until interrupted
    Run,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Policy to evaluate
    #[arg(short, long)]
    policy: String,

    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,

    /// Role of the authenticated user
    #[arg(long)]
    role: Option<String>,

    /// Forwarded-address chain, e.g. "1.2.3.4, 10.0.0.1"
    #[arg(long)]
    forwarded_for: Option<String>,

    /// Transport peer address
    #[arg(long)]
    peer: Option<IpAddr>,

    /// Request path recorded in audit events
    #[arg(long, default_value = "/")]
    path: String,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 1)]
    requests: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Loaded configuration file");
    }

    let table = config.policy_table()?;
    let sweep_interval = config.sweep_interval(&table)?;

    match cli.command {
        Command::Policies => {
            let summaries: Vec<PolicySummary> = table.iter().map(|p| p.summary()).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        Command::Simulate(args) => {
            let policy = table.require(&args.policy)?;
            let runtime = RateLimitRuntime::start(sweep_interval);
            let limiter = runtime.limiter(config.environment);
            let request = simulated_request(&args);

            for n in 1..=args.requests {
                let decision = limiter.check(&policy, &request);
                println!(
                    "{}",
                    serde_json::json!({ "request": n, "decision": decision })
                );
            }

            runtime.shutdown().await;
        }
        Command::Run => {
            info!("Starting Ratekeeper");
            info!("Version: {}", env!("CARGO_PKG_VERSION"));
            info!(
                environment = %config.environment,
                policies = table.len(),
                "Configuration loaded"
            );

            let runtime = RateLimitRuntime::start(sweep_interval);
            shutdown_signal().await;
            runtime.shutdown().await;

            info!("Ratekeeper stopped");
        }
    }

    Ok(())
}

fn init_tracing(config: &RatekeeperConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Pretty => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn simulated_request(args: &SimulateArgs) -> RequestContext {
    let mut request = RequestContext::new(args.path.clone());

    if args.user.is_some() || args.role.is_some() {
        request = request.with_identity(Identity {
            id: args.user.clone(),
            role: args.role.clone(),
        });
    }
    if let Some(chain) = &args.forwarded_for {
        request = request.with_forwarded_for(chain);
    }
    if let Some(peer) = args.peer {
        request = request.with_peer(peer);
    }

    request
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
