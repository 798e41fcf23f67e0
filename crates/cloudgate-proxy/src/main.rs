mod auth;
mod config;
mod connector;
mod forwarder;
mod handler;
mod server;
mod startup;
mod telemetry;


use clap::Parser;
use config::Config;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "cloudgate-proxy", about = "CQL proxy writing to origin and target clusters")]
struct Args {
    /// Path of the TOML configuration file.
    #[arg(long, default_value = "config.example.toml")]
    config: String,
    /// Maximum log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_path(&args.config)?;
    server::run(config).await?;
    Ok(())
}
