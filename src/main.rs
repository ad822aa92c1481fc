use clap::Parser;
use tracing_subscriber::EnvFilter;

use walletauth::cli::{Cli, Command, SimulateOptions};
use walletauth::config::AuthConfig;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("walletauth=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate {
            wallet,
            backend,
            chain,
        } => walletauth::cli::run_validate(wallet, backend, chain),
        Command::Simulate {
            safe,
            reject_signature,
            backend,
            wallet_key,
            chain,
        } => {
            let config = AuthConfig::from_env_with_toml(cli.config.as_deref())?;
            walletauth::cli::run_simulate(
                config,
                SimulateOptions {
                    safe,
                    reject_signature,
                    backend,
                    wallet_key,
                    chain,
                },
            )
            .await
        }
        Command::Config => {
            let config = AuthConfig::from_env_with_toml(cli.config.as_deref())?;
            walletauth::cli::run_config(&config)
        }
        Command::Doctor { strict } => {
            walletauth::cli::run_doctor_command(cli.config.as_deref(), strict).await
        }
    }
}
