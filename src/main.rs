use std::path::PathBuf;

use clap::Parser;

/// Real-time AKI alerting service: HL7/MLLP in, pages out.
#[derive(Parser, Debug)]
#[command(name = "aki-alert", version, about)]
struct Cli {
    /// Creatinine history CSV used to seed a fresh store
    /// (defaults to $HISTORY_PATH)
    #[arg(long)]
    history: Option<PathBuf>,

    /// Log latency statistics and write predicted positives to
    /// aki_predicted.csv on shutdown
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = aki_alert::config::Config::from_env(cli.history, cli.debug)?;
    aki_alert::run(config).await?;
    Ok(())
}
