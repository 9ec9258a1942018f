use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rla_dedup::{DedupEngine, ResolveDecision};
use rla_storage::PgListingStore;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rla-cli")]
#[command(about = "RLA command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the duplicate-engine JSON API.
    Serve,
    /// Apply pending database migrations.
    Migrate,
    /// List scored duplicate candidates for one listing.
    Candidates { id: Uuid },
    /// Record an operator decision for one listing.
    Resolve {
        id: Uuid,
        decision: String,
        #[arg(long)]
        master: Option<Uuid>,
    },
    /// Merge listings into one master record.
    Merge {
        keep: Uuid,
        #[arg(required = true)]
        merge: Vec<Uuid>,
    },
    /// List confirmed duplicates, or purge them with --purge.
    Duplicates {
        #[arg(long)]
        purge: bool,
    },
}

async fn engine_from_env() -> Result<DedupEngine> {
    let store = PgListingStore::connect_from_env().await?;
    Ok(DedupEngine::new(Arc::new(store)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            rla_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let store = PgListingStore::connect_from_env().await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Candidates { id } => {
            let engine = engine_from_env().await?;
            let candidates = engine.find_candidates(id).await?;
            if candidates.is_empty() {
                println!("no candidates above the interest threshold");
            }
            for candidate in candidates {
                println!(
                    "{}  score={}  price={:?}  {}",
                    candidate.listing.id,
                    candidate.score,
                    candidate.listing.price,
                    candidate.listing.title
                );
            }
        }
        Commands::Resolve { id, decision, master } => {
            let Some(decision) = ResolveDecision::parse(&decision) else {
                bail!("invalid decision {decision:?}: expected unique, duplicate or review");
            };
            let engine = engine_from_env().await?;
            let listing = engine.resolve(id, decision, master).await?;
            println!(
                "resolved {} -> {}",
                listing.id,
                listing
                    .duplicate_status
                    .map(|s| s.as_str())
                    .unwrap_or("unset")
            );
        }
        Commands::Merge { keep, merge } => {
            let engine = engine_from_env().await?;
            let outcome = engine.merge(keep, &merge).await?;
            println!(
                "merged {} listings into master {}",
                outcome.merged_count, outcome.master_id
            );
        }
        Commands::Duplicates { purge } => {
            let engine = engine_from_env().await?;
            if purge {
                let deleted = engine.purge_confirmed_duplicates().await?;
                println!("deleted {deleted} duplicate listings");
            } else {
                let duplicates = engine.confirmed_duplicates().await?;
                println!("{} confirmed duplicates", duplicates.len());
                for listing in duplicates {
                    println!(
                        "{}  master={:?}  score={:?}  {}",
                        listing.id, listing.master_listing_id, listing.duplicate_score,
                        listing.title
                    );
                }
            }
        }
    }

    Ok(())
}
