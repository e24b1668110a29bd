//! casefile: headless sync client for case records.
//!
//! Keeps an encrypted local copy of an organisation's collections in sync with
//! the server and answers point-in-time questions from it.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use casefile_core::temporal::CohortQuery;
use casefile_core::{Collection, SyncStatus};
use casefile_daemon::{CaseClient, Config, HttpApi};
use chrono::NaiveDate;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "casefile")]
#[command(about = "Encrypted case record sync client")]
struct Args {
    /// Directory holding config.json and the local store
    #[arg(short, long, env = "CASEFILE_DATA_DIR", default_value = ".casefile")]
    data_dir: PathBuf,

    /// Server API base URL (overrides config.json)
    #[arg(long, env = "CASEFILE_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the server API
    #[arg(long, env = "CASEFILE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Organisation secret the encryption key is derived from
    #[arg(long, env = "CASEFILE_SECRET", hide_env_values = true)]
    secret: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync pass
    Sync {
        /// Refetch every collection from the beginning
        #[arg(long)]
        full: bool,
    },
    /// Sync periodically until interrupted
    Watch,
    /// Print an entity as it stood at the end of a day
    Snapshot {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        id: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
    },
    /// How many entities holding one value at START had moved to another by END
    Cohort {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        field: String,
        /// JSON value; bare words are taken as strings
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Set one field of an entity through a guarded write
    Set {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        field: String,
        /// JSON value; bare words are taken as strings, null removes the field
        #[arg(long)]
        value: String,
    },
    /// Move a node of a person's document tree under another folder
    MoveDocument {
        #[arg(long)]
        person: String,
        #[arg(long)]
        node: String,
        /// Target folder id, or "root"
        #[arg(long, default_value = "root")]
        parent: String,
    },
    /// Check every history log against its entity
    Verify,
    /// Wipe local data for the organisation
    Logout,
}

fn parse_collection(raw: &str) -> Result<Collection> {
    raw.parse::<Collection>().map_err(|e| anyhow!(e))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,casefile=debug,casefile_core=debug"
    } else {
        "info,casefile=info,casefile_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(&args.data_dir)?;
    if let Some(api_url) = &args.api_url {
        config.api_url = api_url.clone();
    }
    info!("Data directory: {:?}", args.data_dir);
    info!("Server: {}", config.api_url);

    let api = Arc::new(
        HttpApi::new(&config.api_url, args.token.clone()).context("Failed to build HTTP client")?,
    );
    let mut client = CaseClient::open(api, &config, &args.data_dir, &args.secret).await?;

    let organisation_id = client.session()?.organisation_id().to_string();
    if config.organisation_id.as_deref() != Some(organisation_id.as_str()) {
        if let Some(previous) = &config.organisation_id {
            warn!("Switching organisation from {} to {}", previous, organisation_id);
        }
        config.organisation_id = Some(organisation_id);
        config.save(&args.data_dir)?;
    }

    match args.command {
        Command::Sync { full } => {
            let report = client.sync(full).await?;
            if report.status != SyncStatus::Completed {
                return Err(anyhow!("Sync did not complete: {:?}", report.status));
            }
        }
        Command::Watch => {
            let mut interval = tokio::time::interval(Duration::from_secs(config.sync_interval_secs.max(1)));
            info!("Watching. Press Ctrl+C to stop.");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        client.sync(false).await?;
                        if !client.is_active() {
                            warn!("Session ended, stopping");
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }
        Command::Snapshot {
            collection,
            id,
            date,
        } => {
            let collection = parse_collection(&collection)?;
            client.sync(false).await?;
            match client.snapshot(collection, &id, date)? {
                Some(entity) => println!("{}", serde_json::to_string_pretty(&entity)?),
                None => println!("{} {} was not tracked on {}", collection, id, date),
            }
        }
        Command::Cohort {
            collection,
            field,
            from,
            to,
            start,
            end,
        } => {
            let collection = parse_collection(&collection)?;
            client.sync(false).await?;
            let query = CohortQuery {
                field,
                from_value: parse_value(&from),
                to_value: parse_value(&to),
                start,
                end,
            };
            let transition = client
                .cohort(collection, &query)?
                .ok_or_else(|| anyhow!("Empty window: start must be before end"))?;
            println!("{}", serde_json::to_string_pretty(&transition)?);
        }
        Command::Set {
            collection,
            id,
            field,
            value,
        } => {
            let collection = parse_collection(&collection)?;
            let entity = client
                .set_field(collection, &id, &field, parse_value(&value))
                .await
                .with_context(|| format!("Could not update {} {}", collection, id))?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
        }
        Command::MoveDocument { person, node, parent } => {
            let entity = client
                .move_document(&person, &node, &parent)
                .await
                .with_context(|| format!("Could not move {} of person {}", node, person))?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
        }
        Command::Verify => {
            client.sync(false).await?;
            let issues = client.verify()?;
            for issue in &issues {
                println!("{}", issue);
            }
            info!("{} history inconsistencies", issues.len());
        }
        Command::Logout => {
            client.logout().await?;
            config.organisation_id = None;
            config.save(&args.data_dir)?;
            info!("Local data wiped");
        }
    }

    Ok(())
}
