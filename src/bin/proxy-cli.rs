//! Operator tool for inspecting and pruning the quarantine store without
//! going through the running daemon's HTTP surface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use mqtt_governance_proxy::config::{self, ConfigSnapshot};
use mqtt_governance_proxy::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use mqtt_governance_proxy::domain_types::QuarantineId;
use mqtt_governance_proxy::quarantine::{
    BlobStore, MetadataStore, QuarantinePage, QuarantineReason, QuarantineStore, RecordFilter,
};

#[derive(Debug, Parser)]
#[command(name = "proxy-cli", version, about)]
struct Cli {
    /// Path to the same YAML configuration document the daemon runs with,
    /// used to locate the quarantine database and payload store.
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lists quarantined messages, most recent first.
    List {
        /// Restrict to a single quarantine reason.
        #[arg(long)]
        reason: Option<ReasonArg>,

        /// Restrict to rows quarantined at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Maximum rows to return.
        #[arg(long, default_value_t = 50)]
        limit: u32,

        /// Rows to skip before the returned page.
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Prints a single quarantined record's metadata.
    Show {
        /// The quarantine record's id.
        id: String,
    },
    /// Deletes quarantine rows older than the given age, reclaiming any
    /// payload blobs left with no referring row. Defaults to
    /// `storage.quarantine.cleanup_days` and `max_size` from the
    /// configuration when not given.
    Purge {
        /// Delete rows quarantined more than this many days ago.
        #[arg(long)]
        older_than_days: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ReasonArg {
    TopicNotAllowed,
    NoSchemaBound,
    SchemaCompileError,
    SchemaValidationError,
    PayloadTooLarge,
    RateLimited,
    UpstreamUnavailable,
    InternalError,
}

impl From<ReasonArg> for QuarantineReason {
    fn from(value: ReasonArg) -> Self {
        match value {
            ReasonArg::TopicNotAllowed => QuarantineReason::TopicNotAllowed,
            ReasonArg::NoSchemaBound => QuarantineReason::NoSchemaBound,
            ReasonArg::SchemaCompileError => QuarantineReason::SchemaCompileError,
            ReasonArg::SchemaValidationError => QuarantineReason::SchemaValidationError,
            ReasonArg::PayloadTooLarge => QuarantineReason::PayloadTooLarge,
            ReasonArg::RateLimited => QuarantineReason::RateLimited,
            ReasonArg::UpstreamUnavailable => QuarantineReason::UpstreamUnavailable,
            ReasonArg::InternalError => QuarantineReason::InternalError,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    let store = open_quarantine_store(&config).await?;

    match cli.command {
        Command::List {
            reason,
            since,
            limit,
            offset,
        } => list(&store, reason, since, limit, offset).await,
        Command::Show { id } => show(&store, &id).await,
        Command::Purge { older_than_days } => purge(&store, &config, older_than_days).await,
    }
}

async fn load_config(path: &PathBuf) -> Result<ConfigSnapshot> {
    let document = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading configuration from {}", path.display()))?;
    config::parse_yaml(&document).context("parsing configuration")
}

async fn open_quarantine_store(config: &ConfigSnapshot) -> Result<QuarantineStore> {
    let db_path = DatabasePath::new(config.storage.quarantine.database_path.clone())
        .map_err(|e| anyhow::anyhow!("invalid quarantine database path: {e}"))?;
    let db_config =
        DatabaseConfig::new(db_path).with_pool_size(config.storage.quarantine.pool_size);
    let connection = DatabaseConnection::initialize(db_config)
        .await
        .context("opening quarantine metadata store")?;
    let metadata = MetadataStore::new(connection.pool().clone());
    let blobs = BlobStore::new(
        config.storage.payloads.root.clone(),
        config.storage.payloads.compression,
    )
    .await
    .context("opening quarantine payload store")?;
    Ok(QuarantineStore::new(metadata, blobs))
}

async fn list(
    store: &QuarantineStore,
    reason: Option<ReasonArg>,
    since: Option<DateTime<Utc>>,
    limit: u32,
    offset: u32,
) -> Result<()> {
    let filter = RecordFilter {
        reason: reason.map(Into::into),
        since,
    };
    let page = QuarantinePage { limit, offset };
    let records = store.list(&filter, page).await.context("listing quarantine records")?;

    if records.is_empty() {
        println!("no quarantine records match");
        return Ok(());
    }

    for record in records {
        println!(
            "{}  {}  {:<24}  {:<22}  {} bytes  {}",
            record.id,
            record.quarantined_at.to_rfc3339(),
            record.topic,
            record.reason,
            record.payload_size,
            record.detail.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn show(store: &QuarantineStore, id: &str) -> Result<()> {
    let uuid = Uuid::parse_str(id).with_context(|| format!("{id:?} is not a valid quarantine id"))?;
    let target = QuarantineId::from(uuid);

    let filter = RecordFilter::default();
    let mut offset = 0;
    loop {
        let page = QuarantinePage {
            limit: 100,
            offset,
        };
        let records = store.list(&filter, page).await.context("searching quarantine records")?;
        if records.is_empty() {
            anyhow::bail!("no quarantine record with id {id}");
        }
        if let Some(record) = records.iter().find(|r| r.id == target) {
            println!("id:              {}", record.id);
            println!("topic:           {}", record.topic);
            println!("client_id:       {}", record.client_id);
            println!("reason:          {}", record.reason);
            println!("detail:          {}", record.detail.as_deref().unwrap_or("-"));
            println!("received_at:     {}", record.received_at.to_rfc3339());
            println!("quarantined_at:  {}", record.quarantined_at.to_rfc3339());
            println!("payload_size:    {} bytes", record.payload_size);
            return Ok(());
        }
        offset += 100;
    }
}

async fn purge(store: &QuarantineStore, config: &ConfigSnapshot, older_than_days: Option<i64>) -> Result<()> {
    let days = older_than_days.unwrap_or(i64::from(config.storage.quarantine.cleanup_days.into_inner()));
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let purged = store
        .purge(cutoff, config.storage.quarantine.max_size)
        .await
        .context("purging quarantine records")?;
    println!("purged {purged} record(s) older than {days} day(s)");
    Ok(())
}
