#![allow(dead_code)]

mod client;
mod config;
mod db;
mod fees;
mod rebalancer;
mod routes;
mod state;
mod types;

use clap::{Args, Parser, Subcommand};
use config::Config;
use log::{error, info};
use rebalancer::history;
use rebalancer::RebalanceArgs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lnd-rebalance", about = "Circular channel rebalancing for LND")]
struct Cli {
    /// Path to rebalance.toml config file
    #[arg(short, long, default_value = "rebalance.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move funds out of one channel and back in through another
    Rebalance(RebalanceCommand),
    /// List channels with their ratio and what they can be used for
    List {
        /// Target local ratio in percent (default from config)
        #[arg(long)]
        ratio: Option<f64>,
    },
    /// Print past rebalance sessions
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Args)]
struct RebalanceCommand {
    /// Channel to send from: channel id or peer pubkey
    #[arg(short, long)]
    from: Option<String>,
    /// Channel to receive through: channel id or peer pubkey
    #[arg(short, long)]
    to: Option<String>,
    /// Amount in sat (default: whatever reaches the target ratio)
    #[arg(short, long)]
    amount: Option<i64>,
    /// Target local ratio in percent
    #[arg(long)]
    ratio: Option<f64>,
    /// Never send out through this channel (repeatable)
    #[arg(short, long = "exclude")]
    exclude: Vec<u64>,
    /// Multiple of the reference fee a route may cost
    #[arg(long)]
    max_fee_factor: Option<f64>,
    /// Bound fees by the income the rebalance unlocks
    #[arg(long)]
    econ_fee: bool,
    /// Scale the economic fee bound
    #[arg(long)]
    econ_fee_factor: Option<f64>,
}

impl From<RebalanceCommand> for RebalanceArgs {
    fn from(cmd: RebalanceCommand) -> Self {
        Self {
            from: cmd.from,
            to: cmd.to,
            amount: cmd.amount,
            ratio_percent: cmd.ratio,
            excluded: cmd.exclude,
            max_fee_factor: cmd.max_fee_factor,
            econ_fee: cmd.econ_fee,
            econ_fee_factor: cmd.econ_fee_factor,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    let db = db::Database::open(&config.general.database_path)?;

    match cli.command {
        Commands::Rebalance(cmd) => run_rebalance(&config, &db, cmd.into()).await,
        Commands::List { ratio } => list_candidates(&config, ratio).await,
        Commands::History { limit } => print_history(&db, limit),
    }
}

async fn run_rebalance(config: &Config, db: &db::Database, args: RebalanceArgs) -> anyhow::Result<()> {
    let client = client::LndRestClient::new(config)?;
    let outcome = rebalancer::run(config, &client, db, &args).await?;

    if outcome.success {
        info!(
            "Rebalance done after {} attempt(s), fee {} sat",
            outcome.attempts.len(),
            outcome.fee_paid_sats
        );
        Ok(())
    } else {
        error!(
            "Could not find any suitable route ({} attempt(s))",
            outcome.attempts.len()
        );
        anyhow::bail!("Rebalance failed")
    }
}

async fn list_candidates(config: &Config, ratio_percent: Option<f64>) -> anyhow::Result<()> {
    let ratio = ratio_percent
        .map(|p| p / 100.0)
        .unwrap_or(config.rebalance.channel_ratio);
    if !(0.0..=1.0).contains(&ratio) {
        anyhow::bail!("Ratio must be between 0 and 100 percent");
    }

    let client = client::LndRestClient::new(config)?;
    let node = state::NodeState::collect(&client).await?;
    let candidates = node.candidates(&client, ratio).await?;

    println!("Channels of {} (target ratio {:.0}%)", node.own_identity, ratio * 100.0);
    println!(
        "{:>18} | {:>12} | {:>12} | {:>6} | {:>8} | {:>12} | alias",
        "channel", "local", "remote", "ratio", "use as", "amount"
    );
    for c in &candidates {
        let role = match c.role {
            state::Role::Source => "--from",
            state::Role::Target => "--to",
            state::Role::Balanced => "-",
        };
        println!(
            "{:>18} | {:>12} | {:>12} | {:>5.1}% | {:>8} | {:>12} | {}",
            c.channel.chan_id,
            c.channel.local_balance,
            c.channel.remote_balance,
            c.ratio * 100.0,
            role,
            c.amount,
            c.alias
        );
    }
    println!("Total capacity: {} sat", node.total_capacity_sats());
    Ok(())
}

fn print_history(db: &db::Database, limit: usize) -> anyhow::Result<()> {
    let summary = history::summary(db)?;
    let sessions = history::recent(db, limit)?;

    println!("Rebalance History");
    println!("=================");
    println!("Sessions:               {}", summary.sessions);
    println!("Successful:             {}", summary.successes);
    println!("Amount moved:           {} sat", summary.amount_moved_sats);
    println!(
        "Fees paid:              {} sat ({:.0} ppm)",
        summary.fees_paid_sats,
        summary.effective_ppm()
    );

    for s in &sessions {
        let channel = |id: Option<u64>| id.map(|i| i.to_string()).unwrap_or_else(|| "any".to_string());
        println!(
            "{}  {} -> {}  {} sat  {}  {} attempt(s)  fee {} sat",
            format_timestamp(s.finished_at),
            channel(s.first_hop_chan_id),
            channel(s.last_hop_chan_id),
            s.amount_sats,
            if s.success { "ok    " } else { "failed" },
            s.attempts,
            s.fee_paid_sats
        );
    }
    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}
