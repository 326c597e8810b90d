use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sangha_registry::{
    seed_reference, Attributes, EntityKind, EntityRef, NewRegistration, ReferenceTable, Registry, RegistryConfig,
    RegistryError, TransitionRequest, WorkflowEvent,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "sangha-registry", version, about = "Registration numbers and approval workflow for clergy records")]
struct Cli {
    /// Config file (defaults to $SANGHA_REGISTRY_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and schema
    Init,

    /// Add or revive a reference row (division, nikaya, status)
    Seed {
        table: String,
        code: String,
        name: String,
    },

    /// Load a legacy CSV export (id,code,display_name,workflow_state,attributes)
    Import {
        kind: EntityKind,
        csv: PathBuf,
        #[arg(long, default_value = "importer")]
        actor: String,
    },

    /// Allocate a code and create a record
    Register {
        kind: EntityKind,
        display_name: String,
        /// key=value; the value is read as JSON when it parses, else as text
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, serde_json::Value)>,
        #[arg(long)]
        actor: String,
    },

    /// Show one record by id or code, with the workflow events it accepts
    Show { kind: EntityKind, reference: EntityRef },

    Approve {
        kind: EntityKind,
        reference: EntityRef,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        notes: Option<String>,
    },

    Reject {
        kind: EntityKind,
        reference: EntityRef,
        #[arg(long)]
        actor: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Mark as printed
    Print {
        kind: EntityKind,
        reference: EntityRef,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Mark as scanned
    Scan {
        kind: EntityKind,
        reference: EntityRef,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        notes: Option<String>,
    },

    Complete {
        kind: EntityKind,
        reference: EntityRef,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Workflow transitions and audit events for one record
    History { kind: EntityKind, reference: EntityRef },

    /// Code and id high-water marks per kind
    Status { kind: Option<EntityKind> },

    /// Move the id sequence past existing rows
    Resync { kind: EntityKind },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<RegistryError>() {
                Some(registry_err) => {
                    tracing::debug!(error = %registry_err, "request failed");
                    eprintln!("❌ {} [{}]", registry_err.user_message(), registry_err.status_code());
                }
                None => eprintln!("❌ {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "sangha_registry=debug,info" } else { "info" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut config = RegistryConfig::resolve(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(path) = cli.db {
        config.database.path = path;
    }

    let mut registry = Registry::open(config)?;

    match cli.command {
        Command::Init => {
            println!("✓ Database ready at {}", registry.config().database.path.display());
        }

        Command::Seed { table, code, name } => {
            let table = match table.as_str() {
                "division" | "divisional_secretariat" => ReferenceTable::DivisionalSecretariat,
                "nikaya" => ReferenceTable::Nikaya,
                "status" | "status_code" => ReferenceTable::StatusCode,
                other => bail!("Unknown reference table '{}' (expected division, nikaya or status)", other),
            };
            seed_reference(registry.store().connection(), table, &code, &name)?;
            println!("✓ {} {} = {}", table.table(), code, name);
        }

        Command::Import { kind, csv, actor } => {
            println!("📂 Importing {} records from {}", kind, csv.display());
            let summary = registry.import_csv(kind, &csv, &actor)?;
            println!("✓ Inserted: {}", summary.inserted);
            println!("✓ Duplicates skipped: {}", summary.duplicates);

            let status = registry.sequence_status(kind)?;
            if status.desynced {
                println!("⚠️  Id sequence is behind (next {}, max {}); the next registration will resync it", status.next_id, status.max_id);
            }
        }

        Command::Register { kind, display_name, attrs, actor } => {
            let draft = NewRegistration {
                display_name,
                attributes: attrs.into_iter().collect::<Attributes>(),
            };
            let registration = registry.register(kind, draft, &actor)?;
            print_json(&registration)?;
        }

        Command::Show { kind, reference } => {
            let record = registry.get(kind, &reference)?;
            let available = registry.available_events(kind, &reference)?;
            print_json(&serde_json::json!({
                "record": record,
                "available_events": available,
            }))?;
        }

        Command::Approve { kind, reference, actor, notes } => {
            transition(&mut registry, kind, &reference, request(WorkflowEvent::Approve, actor, notes))?;
        }

        Command::Reject { kind, reference, actor, reason, notes } => {
            let mut req = request(WorkflowEvent::Reject, actor, notes);
            req.rejection_reason = Some(reason);
            transition(&mut registry, kind, &reference, req)?;
        }

        Command::Print { kind, reference, actor, notes } => {
            transition(&mut registry, kind, &reference, request(WorkflowEvent::MarkPrinted, actor, notes))?;
        }

        Command::Scan { kind, reference, actor, notes } => {
            transition(&mut registry, kind, &reference, request(WorkflowEvent::MarkScanned, actor, notes))?;
        }

        Command::Complete { kind, reference, actor, notes } => {
            transition(&mut registry, kind, &reference, request(WorkflowEvent::Complete, actor, notes))?;
        }

        Command::History { kind, reference } => {
            let transitions = registry.history(kind, &reference)?;
            let events = registry.events(kind, &reference)?;
            print_json(&serde_json::json!({
                "transitions": transitions,
                "events": events,
            }))?;
        }

        Command::Status { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => EntityKind::ALL.to_vec(),
            };
            let statuses = kinds
                .into_iter()
                .map(|kind| registry.sequence_status(kind))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&statuses)?;
        }

        Command::Resync { kind } => {
            let before = registry.sequence_status(kind)?;
            let next = registry.resync_sequence(kind)?;
            println!("✓ {}: next id {} → {}", before.table, before.next_id, next);
        }
    }

    Ok(())
}

fn request(event: WorkflowEvent, actor: String, notes: Option<String>) -> TransitionRequest {
    TransitionRequest {
        notes,
        ..TransitionRequest::new(event, actor)
    }
}

fn transition(registry: &mut Registry, kind: EntityKind, reference: &EntityRef, request: TransitionRequest) -> Result<()> {
    let outcome = registry.transition(kind, reference, &request)?;
    println!("✓ {}", outcome.message);
    print_json(&outcome.entity)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_attr(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty attribute name in '{}'", raw));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
