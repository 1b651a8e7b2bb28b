//! rtusrv entry point

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use rtusrv::config::DEFAULT_CONFIG_PATH;
use rtusrv::{logging, shutdown, CallReply, Service, ServiceCall, ServiceConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "rtusrv - Modbus RTU service for RS-485 hubs")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "RTUSRV_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, overrides RUST_LOG and the configured level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Directory for daily log files
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Disable colored console output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check the configuration and exit
    Validate,
    /// Run a single JSON call and print the reply
    Call {
        /// e.g. '{"service":"write_register","unit":1,"address":10,"value":42}'
        json: String,
    },
    /// Answer JSON calls from stdin, one per line (default)
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let directive = logging::filter_directive(args.log_level.as_deref(), &config.log.level);
    let log_dir = args.log_dir.clone().or_else(|| config.log.dir.clone());
    let _guard = logging::init(&directive, log_dir.as_deref(), !args.no_color)?;

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Validate => {
            let rejected = config.rtu().rejected();
            for (position, hub) in config.hubs.iter().enumerate() {
                match rejected.iter().find(|(at, _)| *at == position) {
                    Some((_, err)) => warn!("Hub '{}' skipped: {}", hub.name, err),
                    None => info!(
                        "Hub '{}': {} {} baud {}{}{}",
                        hub.name, hub.port, hub.baudrate, hub.bytesize, hub.parity, hub.stopbits
                    ),
                }
            }
            println!(
                "Configuration OK: {} of {} hub(s) usable",
                config.hubs.len() - rejected.len(),
                config.hubs.len()
            );
            Ok(())
        },
        Commands::Call { json } => run_call(&config, &json).await,
        Commands::Serve => run_service(&config).await,
    }
}

async fn run_call(config: &ServiceConfig, json: &str) -> anyhow::Result<()> {
    let call = ServiceCall::from_json(json)?;
    let service = Service::from_config(config)?;
    service.start().await?;

    let result = service.call(call).await;
    let reply = CallReply::from_result(&result);
    println!("{}", reply.to_json());
    service.stop().await;

    if let Err(e) = result {
        anyhow::bail!(e);
    }
    Ok(())
}

async fn run_service(config: &ServiceConfig) -> anyhow::Result<()> {
    info!("Starting rtusrv v{}", env!("CARGO_PKG_VERSION"));
    let service = Service::from_config(config)?;
    service.start().await?;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = service.serve_lines(stdin, stdout) => match result {
            Ok(answered) => info!("Input closed after {} call(s)", answered),
            Err(e) => error!("Call loop failed: {}", e),
        },
        signal = shutdown::wait_for_shutdown() => {
            info!("{} received, stopping", signal);
        },
    }

    service.stop().await;
    Ok(())
}
