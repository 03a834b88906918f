use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use feedbrew::{Brewer, Command, Config, MemoryStore};

#[derive(Parser)]
#[command(name = "feedbrew", about = "Curated, AI-summarized feed aggregation")]
struct Cli {
    /// Config file path; FEEDBREW_CONFIG overrides the default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Fetch sources and ingest new articles.
    Update {
        /// Only this processed feed.
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Generate due digests.
    Digest {
        #[arg(short, long)]
        name: Option<String>,
        /// Generate even when the staleness window has not elapsed.
        #[arg(long)]
        force: bool,
    },
    /// Prune stored articles beyond each source's keep limit.
    Clean {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Run the cron schedules from the config until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var("FEEDBREW_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("feedbrew.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    info!(
        "loaded {} processed feeds from {}",
        config.feeds.len(),
        config_path.display()
    );

    let store = Arc::new(MemoryStore::new());
    let brewer = Brewer::new(
        config.fetch.clone(),
        &config.ai,
        store,
        config.webhook_url.clone(),
    )?;
    let mut feeds = config.feeds.clone();

    match cli.command {
        CliCommand::Update { name } => {
            brewer.run(&mut feeds, Command::Update { name }).await?;
        }
        CliCommand::Digest { name, force } => {
            brewer.run(&mut feeds, Command::Digest { name, force }).await?;
        }
        CliCommand::Clean { name } => {
            brewer.run(&mut feeds, Command::Clean { name }).await?;
        }
        CliCommand::Schedule => {
            run_schedules(&brewer, &config, &mut feeds).await?;
        }
    }

    Ok(())
}

/// Thin trigger loop: wake once a minute and run whichever operation's cron
/// expression matches. The pipeline itself stays ignorant of scheduling.
async fn run_schedules(
    brewer: &Brewer,
    config: &Config,
    feeds: &mut [feedbrew::ProcessedFeed],
) -> anyhow::Result<()> {
    let update_schedule = config.update_schedule()?;
    let digest_schedule = config.digest_schedule()?;
    info!(
        "scheduling update at {:?} and digest at {:?}",
        config.update_schedule, config.digest_schedule
    );

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        if update_schedule.matches(now) {
            if let Err(e) = brewer.run(feeds, Command::Update { name: None }).await {
                error!("scheduled update failed: {}", e);
            }
            if let Err(e) = brewer.run(feeds, Command::Clean { name: None }).await {
                error!("scheduled cleanup failed: {}", e);
            }
        }
        if digest_schedule.matches(now) {
            if let Err(e) = brewer
                .run(
                    feeds,
                    Command::Digest {
                        name: None,
                        force: false,
                    },
                )
                .await
            {
                error!("scheduled digest failed: {}", e);
            }
        }
    }
}
