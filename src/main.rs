use std::process::ExitCode;

use accessbridge_config::Config;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "accessbridge", about = "Mirrors access requests into GitLab issues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print an example configuration file.
    Configure,
    /// Print the version.
    Version,
    /// Run the bridge.
    Start {
        #[arg(long, env = "ACCESSBRIDGE_CONFIG", default_value = "./config/example-config.yaml")]
        config: String,
        /// Log at debug level regardless of the configured severity.
        #[arg(long)]
        debug: bool,
        /// Accept a plain-http public address for the webhook endpoint.
        #[arg(long)]
        insecure_no_tls: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Configure => {
            print!("{}", accessbridge_config::example_config());
            ExitCode::SUCCESS
        }
        Command::Version => {
            println!("accessbridge {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Command::Start {
            config,
            debug,
            insecure_no_tls,
        } => start(&config, debug, insecure_no_tls).await,
    }
}

async fn start(config_path: &str, debug: bool, insecure_no_tls: bool) -> ExitCode {
    let cfg = match accessbridge_config::load_and_validate(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&cfg, debug);

    if let Err(message) = check_public_addr(&cfg, insecure_no_tls) {
        error!("{message}");
        return ExitCode::FAILURE;
    }
    if insecure_no_tls {
        warn!("running without TLS on the public webhook address");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        on_signal.cancel();
    });

    match accessbridge_server::run(cfg, cancel).await {
        Ok(()) => {
            info!("accessbridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "accessbridge exited with error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cfg: &Config, debug: bool) {
    let env_filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.severity))
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn check_public_addr(cfg: &Config, insecure_no_tls: bool) -> Result<(), String> {
    if insecure_no_tls || cfg.http.public_addr.starts_with("https://") {
        return Ok(());
    }
    Err(format!(
        "http.public_addr {} must use https unless --insecure-no-tls is set",
        cfg.http.public_addr
    ))
}
