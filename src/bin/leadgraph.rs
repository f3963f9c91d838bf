//! leadgraph - identity resolution over a local data directory
//!
//! # Usage
//!
//! ```bash
//! # Ingest JSON lines ({"type": "click" | "lead" | "event", ...})
//! leadgraph ingest events.jsonl
//! cat events.jsonl | leadgraph ingest
//!
//! # Look up a customer and their journey
//! leadgraph lookup --type email --value ada@example.com
//! leadgraph journey --customer 6f1c...
//!
//! # Fold the WAL into a snapshot
//! leadgraph compact
//! ```
//!
//! The CLI always uses the persistent backend at `storage.data_dir`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadgraph::config::{Config, LogFormat, StorageBackend};
use leadgraph::storage::persistent::{PersistentConfig, PersistentStores};
use leadgraph::{CustomerId, IdentifierType, IngestPayload, IngestService};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// leadgraph - identity resolution for marketing attribution
#[derive(Parser, Debug)]
#[command(name = "leadgraph")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory. Overrides `storage.data_dir`.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest JSON-lines payloads from a file or stdin
    Ingest {
        /// Input file; stdin if omitted or "-"
        input: Option<PathBuf>,

        /// Stop at the first line that fails
        #[arg(long)]
        strict: bool,
    },

    /// Find the customer owning an identifier
    Lookup {
        /// Identifier type (email, phone, click_id, device_id, session_id, fingerprint)
        #[arg(long = "type")]
        identifier_type: IdentifierType,

        #[arg(long)]
        value: String,
    },

    /// Print a customer's interactions, oldest first
    Journey {
        #[arg(long)]
        customer: CustomerId,
    },

    /// Mark an email or phone as verified
    Verify {
        #[arg(long = "type")]
        identifier_type: IdentifierType,

        #[arg(long)]
        value: String,
    },

    /// Delete a customer with its identifiers and interactions
    Delete {
        #[arg(long)]
        customer: CustomerId,
    },

    /// Write a snapshot and truncate the WAL
    Compact,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    let level = cli
        .log_level
        .unwrap_or_else(|| config.log.level.as_str().to_string());
    init_logging(&level, config.log.format)?;

    if cli.config.is_some() && config.storage.backend == StorageBackend::Memory {
        warn!("storage.backend = \"memory\" is ignored by the CLI; using the persistent backend");
    }

    let stores = PersistentStores::open(
        &config.storage.data_dir,
        PersistentConfig::from(&config.storage).validate()?,
    )
    .with_context(|| format!("failed to open {}", config.storage.data_dir.display()))?;
    let service = stores.service(config.resolver.clone());

    let mut out = io::stdout().lock();
    match cli.command {
        Command::Ingest { input, strict } => {
            ingest(&service, input.as_deref(), strict, &mut out)?;
            if stores.needs_compaction() {
                stores.compact()?;
            }
        }
        Command::Lookup {
            identifier_type,
            value,
        } => match service.find_customer(identifier_type, &value)? {
            Some(customer) => {
                let identifiers = service.identifiers(customer.id)?;
                writeln!(
                    out,
                    "{}",
                    json!({ "customer": customer, "identifiers": identifiers })
                )?;
            }
            None => anyhow::bail!("no customer owns {identifier_type}:{value}"),
        },
        Command::Journey { customer } => {
            for interaction in service.journey(customer)? {
                writeln!(out, "{}", serde_json::to_string(&interaction)?)?;
            }
        }
        Command::Verify {
            identifier_type,
            value,
        } => {
            let identifier = service.verify_identifier(identifier_type, &value)?;
            writeln!(out, "{}", serde_json::to_string(&identifier)?)?;
        }
        Command::Delete { customer } => {
            let deleted = service.delete_customer(customer)?;
            info!(customer_id = %deleted.id, "customer deleted");
        }
        Command::Compact => {
            let result = stores.compact()?;
            writeln!(
                out,
                "{}",
                json!({
                    "sequence": result.sequence,
                    "rows": result.rows,
                    "walSizeBefore": result.wal_size_before,
                    "walSizeAfter": result.wal_size_after,
                })
            )?;
        }
    }
    Ok(())
}

fn ingest(
    service: &IngestService,
    input: Option<&Path>,
    strict: bool,
    out: &mut impl Write,
) -> Result<()> {
    let reader: Box<dyn BufRead> = match input {
        None => Box::new(io::stdin().lock()),
        Some(path) if path == Path::new("-") => Box::new(io::stdin().lock()),
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
    };

    let (mut ingested, mut created, mut failed) = (0u64, 0u64, 0u64);
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = n + 1;

        let outcome = serde_json::from_str::<IngestPayload>(&line)
            .with_context(|| format!("line {line_no}: invalid payload"))
            .and_then(|payload| {
                service
                    .ingest(payload)
                    .with_context(|| format!("line {line_no}: ingestion failed"))
            });

        match outcome {
            Ok(result) => {
                ingested += 1;
                if result.created {
                    created += 1;
                }
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                failed += 1;
                warn!(line = line_no, error = %format!("{e:#}"), "skipping line");
            }
        }
    }

    writeln!(
        out,
        "{}",
        json!({ "ingested": ingested, "created": created, "failed": failed })
    )?;
    Ok(())
}

/// Initialize the tracing subscriber. Logs go to stderr; stdout carries results.
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Console => registry
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
    }

    Ok(())
}
