use clap::{Parser, Subcommand};
use tracing::info;

mod bootstrap;
mod commands;

#[derive(Parser)]
#[command(name = "ferrous-forward")]
#[command(version)]
#[command(about = "Ferrous Forward - DNS upstream forwarding and load balancing")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build every upstream and print the start order
    Check,

    /// Send one query through an upstream and print the answers
    Query {
        /// Domain name to resolve
        name: String,

        /// Record type
        #[arg(long, default_value = "A")]
        qtype: String,

        /// Tag of the upstream to ask
        #[arg(short = 'u', long)]
        upstream: String,

        /// Print upstream statistics after the answer
        #[arg(long)]
        stats: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = bootstrap::load_config(cli.config.as_deref(), cli.log_level.as_deref())?;
    bootstrap::init_logging(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        upstreams = config.upstreams.len(),
        "Ferrous Forward starting"
    );

    match cli.command {
        Command::Check => commands::check(&config),
        Command::Query {
            name,
            qtype,
            upstream,
            stats,
        } => commands::query(&config, &name, &qtype, &upstream, stats).await,
    }
}
