use clap::Parser;

use gantry::components;
use gantry::config;
use gantry::connector::Connector;
use gantry::logging;

/// Gantry - an event-driven broker-to-pipeline connector
#[derive(Parser)]
#[command(name = "gantry")]
#[command(version = "0.1.0")]
#[command(about = "Gantry: bridge pub/sub brokers to configured processing pipelines")]
#[command(
    long_about = "Gantry hosts one or more apps, each bridging a pub/sub broker \
(durable queues, wildcard subscriptions, per-message ACK/NACK) to staged \
processing pipelines defined in a TOML configuration file."
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "./config/gantry.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// List available component kinds
    #[arg(short = 'L', long)]
    list_components: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    logging::init_logging(&cli.log_level);

    if cli.list_components {
        println!("Available component kinds:");
        for (kind, description) in components::list_components() {
            println!("  - {kind}: {description}");
        }
        return;
    }

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config from '{}': {e}", cli.config);
            std::process::exit(1);
        }
    };

    if let Err(e) = config::validate_config(&config) {
        tracing::error!("configuration error: {e}");
        std::process::exit(1);
    }
    tracing::info!("configuration loaded and validated");

    if let Err(e) = Connector::new(config).run().await {
        tracing::error!("connector failed: {e}");
        std::process::exit(1);
    }
}
