use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vacmon_adapters::AbcClient;
use vacmon_engine::{run_pass, MonitorConfig};
use vacmon_notify::EmailNotifier;
use vacmon_storage::NotifiedStore;

#[derive(Debug, Parser)]
#[command(name = "vacmon")]
#[command(about = "ABC teaching vacancy monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single check-and-notify pass (invoke periodically via cron).
    Once,
    /// Show counts from the persisted state.
    Stats,
    /// Send a probe email to verify SMTP settings.
    TestEmail,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Once => {
            let store = NotifiedStore::new(&config.state_file);
            let client = AbcClient::new(config.api.clone()).context("building api client")?;
            let notifier = EmailNotifier::new(config.email.clone());
            let summary = run_pass(&config, &store, &client, &notifier).await?;
            println!(
                "pass complete: run_id={} fetched={} eligible={} new={} status={}",
                summary.run_id,
                summary.total_fetched,
                summary.eligible,
                summary.new_notified,
                summary.status
            );
        }
        Commands::Stats => {
            let store = NotifiedStore::new(&config.state_file);
            let stats = store.stats().await.context("reading persisted state")?;
            println!("total notified: {}", stats.total_notified);
            println!("total polls:    {}", stats.total_polls);
            match stats.last_poll {
                Some(poll) => println!(
                    "last poll:      {} ({}, {} found, {} new)",
                    poll.at, poll.status, poll.total_found, poll.new_notified
                ),
                None => println!("last poll:      never"),
            }
        }
        Commands::TestEmail => {
            let to = config.email.to_address.clone();
            let notifier = EmailNotifier::new(config.email.clone());
            notifier.send_test().await.context("sending test email")?;
            println!("test email sent to {to}");
        }
    }

    Ok(())
}
