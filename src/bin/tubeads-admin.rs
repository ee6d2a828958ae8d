use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tubeads::config::Config;
use tubeads::engine::AdServer;
use tubeads::models::BreakdownDimension;
use tubeads::storage;

#[derive(Parser)]
#[command(name = "tubeads-admin")]
#[command(about = "Tubeads operations CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one budget reconciliation pass
    Reconcile,
    /// Show statistics for an ad
    Stats {
        /// Ad ID
        ad_id: i64,
        /// Number of days to roll up, today included
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Pause an ad
    Pause {
        /// Ad ID
        ad_id: i64,
    },
    /// Put an ad back into rotation
    Activate {
        /// Ad ID
        ad_id: i64,
    },
    /// Evaluate an A/B test and store its winner
    EvaluateAb {
        /// A/B test ID
        test_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let storage = storage::connect(&config.database).await?;

    // Ensure database is initialized
    storage.init().await?;

    let server = AdServer::new(storage, &config.engine);

    match cli.command {
        Commands::Reconcile => {
            let report = server.reconciler().run_once(Utc::now()).await?;
            println!(
                "✓ Reconciled: {} ads completed, {} campaigns completed, {} pending recordings applied",
                report.ads_completed, report.campaigns_completed, report.pending_applied
            );
        }
        Commands::Stats { ad_id, days } => {
            let Some(ad) = server.storage().find_ad(ad_id).await? else {
                bail!("Ad {} not found", ad_id);
            };
            let summary = server.statistics(ad_id, days).await?;

            println!("Ad {} '{}' ({})", ad.id, ad.name, ad.status.as_str());
            println!("Last {} days ({} with traffic):", days.max(1), summary.days);
            println!("{:<20} {}", "Impressions", summary.impressions);
            println!("{:<20} {}", "Unique impressions", summary.unique_impressions);
            println!("{:<20} {}", "Clicks", summary.clicks);
            println!("{:<20} {}", "Unique clicks", summary.unique_clicks);
            println!("{:<20} {:.2}%", "CTR", summary.ctr());
            println!("{:<20} {}", "Conversions", summary.conversions);
            println!("{:<20} {:.2}", "Spent", summary.spent.units());
            println!("{:<20} {:.2}", "Revenue", summary.revenue.units());

            let today = Utc::now().date_naive();
            for dimension in [
                BreakdownDimension::Hour,
                BreakdownDimension::Country,
                BreakdownDimension::Device,
            ] {
                let entries = server.breakdown(ad_id, today, dimension).await?;
                if entries.is_empty() {
                    continue;
                }
                println!();
                println!("Today by {}:", dimension.as_str());
                println!("{:<20} {:>12} {:>12}", "Bucket", "Impressions", "Clicks");
                println!("{}", "-".repeat(46));
                for entry in entries {
                    println!(
                        "{:<20} {:>12} {:>12}",
                        entry.bucket, entry.impressions, entry.clicks
                    );
                }
            }
        }
        Commands::Pause { ad_id } => {
            if server.pause_ad(ad_id).await? {
                println!("✓ Paused ad {}", ad_id);
            } else {
                println!("⚠ Ad {} not found", ad_id);
            }
        }
        Commands::Activate { ad_id } => {
            if server.activate_ad(ad_id).await? {
                println!("✓ Activated ad {}", ad_id);
            } else {
                println!("⚠ Ad {} not found", ad_id);
            }
        }
        Commands::EvaluateAb { test_id } => {
            let Some(outcome) = server.evaluate_ab_test(test_id).await? else {
                bail!("A/B test {} not found", test_id);
            };

            println!("A/B test {} on {}", test_id, outcome.metric.as_str());
            println!("{:<12} {}", "Variant A", outcome.value_a);
            println!("{:<12} {}", "Variant B", outcome.value_b);
            match outcome.p_value {
                Some(p) => println!("{:<12} {:.4}", "p-value", p),
                None => println!("{:<12} n/a", "p-value"),
            }
            match outcome.winner {
                Some(winner) => println!("✓ Winner: variant {}", winner.as_str()),
                None => println!("⚠ No significant winner yet"),
            }
        }
    }

    Ok(())
}
