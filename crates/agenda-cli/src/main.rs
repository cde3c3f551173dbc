//! `agenda` CLI: create, list and edit appointments stored in a SQLite file.
//!
//! ## Usage
//!
//! ```sh
//! # A weekly series of four sessions
//! agenda --db agenda.db --tenant 1 create --kind session --date 2025-01-06 \
//!     --start 09:00 --end 10:00 --responsible "Dr. Lima" --repeat weekly --count 4
//!
//! # Everything in January, series expanded
//! agenda --db agenda.db --tenant 1 list --from 2025-01-01 --to 2025-01-31
//!
//! # Move one occurrence, or this one and every later one
//! agenda --tenant 1 update virt-1-2025-01-20 --start 15:00 --end 16:00
//! agenda --tenant 1 update virt-1-2025-01-20 --scope future --responsible "Dr. Souza"
//!
//! # Drop one occurrence
//! agenda --tenant 1 delete virt-1-2025-01-13
//!
//! # Store-less helpers
//! agenda rule --date 2025-01-31 --repeat monthly --count 6
//! agenda expand --rule "FREQ=WEEKLY;BYDAY=MO,WE" --date 2025-01-06 \
//!     --from 2025-01-01 --to 2025-01-31
//! ```
//!
//! Results are printed to stdout as JSON. Logs go to stderr; set `RUST_LOG`
//! to see more than warnings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agenda_engine::expander::{occurrence_dates, DateRange};
use agenda_engine::model::{EventFields, EventPatch, EventStatus, PatientId, TenantId};
use agenda_engine::notify::TracingSink;
use agenda_engine::{
    build_rule_string, CreateEvent, EngineConfig, EventQueryService, Recurrence, RepeatFrequency,
    RepeatSpec, Scope, SqliteEventStore,
};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agenda", version, about = "Recurring appointment agenda")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file
    #[arg(long, env = "AGENDA_DB", default_value = "agenda.db", global = true)]
    db: PathBuf,

    /// Tenant the request acts for
    #[arg(long, env = "AGENDA_TENANT", global = true)]
    tenant: Option<i64>,

    /// TOML file with engine settings (timezone, max_range_days, default_scope)
    #[arg(long, env = "AGENDA_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a standalone event or a recurring series
    Create {
        #[command(flatten)]
        event: EventArgs,
        #[command(flatten)]
        repeat: RepeatArgs,
        /// Raw RRULE body, instead of --repeat
        #[arg(long)]
        rule: Option<String>,
        #[arg(long)]
        patient: Option<i64>,
    },
    /// List events and expanded occurrences in a date range
    List {
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: String,
        /// Last day (inclusive), YYYY-MM-DD
        #[arg(long)]
        to: String,
        #[arg(long)]
        patient: Option<i64>,
    },
    /// Edit an event or an occurrence (`virt-<id>-<date>`)
    Update {
        id: String,
        /// single, future or all
        #[arg(long)]
        scope: Option<Scope>,
        #[command(flatten)]
        patch: PatchArgs,
    },
    /// Delete an event or an occurrence
    Delete {
        id: String,
        #[arg(long)]
        scope: Option<Scope>,
    },
    /// Print the rule string a set of repeat parameters produces
    Rule {
        /// First date of the series
        #[arg(long)]
        date: NaiveDate,
        #[command(flatten)]
        repeat: RepeatArgs,
    },
    /// Print the dates a rule generates in a range
    Expand {
        #[arg(long)]
        rule: String,
        /// First date of the series
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, value_parser = parse_time, default_value = "00:00")]
        time: NaiveTime,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
}

#[derive(Args)]
struct EventArgs {
    #[arg(long)]
    kind: String,
    #[arg(long, default_value = "pending")]
    status: EventStatus,
    #[arg(long)]
    date: NaiveDate,
    /// HH:MM
    #[arg(long, value_parser = parse_time)]
    start: NaiveTime,
    /// HH:MM
    #[arg(long, value_parser = parse_time)]
    end: NaiveTime,
    #[arg(long)]
    responsible: String,
}

#[derive(Args)]
struct RepeatArgs {
    /// none, daily, weekly or monthly
    #[arg(long)]
    repeat: Option<RepeatFrequency>,
    /// Total number of occurrences
    #[arg(long)]
    count: Option<u32>,
    /// Last date (inclusive), ignored with --count
    #[arg(long)]
    until: Option<NaiveDate>,
    /// Weekly only: 0 = Monday .. 6 = Sunday, comma separated
    #[arg(long, value_delimiter = ',')]
    weekdays: Vec<u8>,
    #[arg(long, default_value_t = 1)]
    interval: u32,
}

impl RepeatArgs {
    fn spec(&self) -> Option<RepeatSpec> {
        let frequency = self.repeat?;
        Some(RepeatSpec {
            frequency,
            count: self.count,
            weekdays: self.weekdays.clone(),
            interval: self.interval,
            until: self.until,
        })
    }
}

#[derive(Args)]
struct PatchArgs {
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    status: Option<EventStatus>,
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long, value_parser = parse_time)]
    start: Option<NaiveTime>,
    #[arg(long, value_parser = parse_time)]
    end: Option<NaiveTime>,
    #[arg(long)]
    responsible: Option<String>,
}

impl From<PatchArgs> for EventPatch {
    fn from(args: PatchArgs) -> Self {
        EventPatch {
            kind: args.kind,
            status: args.status,
            date: args.date,
            start_time: args.start,
            end_time: args.end,
            responsible: args.responsible,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Rule { date, repeat } => {
            let spec = repeat.spec().unwrap_or_else(|| RepeatSpec::new(RepeatFrequency::None));
            let rule = build_rule_string(&spec, date).context("Failed to build rule")?;
            print_json(&serde_json::json!({ "rule": rule }))
        }
        Commands::Expand {
            rule,
            date,
            time,
            from,
            to,
        } => {
            let range = DateRange::new(from, to)?;
            anyhow::ensure!(
                range.days() <= i64::from(config.max_range_days),
                "Range covers {} days, at most {} allowed",
                range.days(),
                config.max_range_days
            );
            let parsed: Recurrence = rule.parse().context("Failed to parse rule")?;
            let dates = occurrence_dates(&parsed, date, time, range, config.tz()?)
                .context("Failed to expand rule")?;
            print_json(&dates)
        }
        Commands::Create {
            event,
            repeat,
            rule,
            patient,
        } => {
            let (service, tenant) = connect(&cli.db, cli.tenant, config)?;
            let created = service
                .create(CreateEvent {
                    tenant,
                    patient: patient.map(PatientId),
                    fields: EventFields {
                        kind: event.kind,
                        status: event.status,
                        date: event.date,
                        start_time: event.start,
                        end_time: event.end,
                        responsible: event.responsible,
                    },
                    repeat: repeat.spec(),
                    rule,
                })
                .context("Failed to create event")?;
            print_json(&created)
        }
        Commands::List { from, to, patient } => {
            let (service, tenant) = connect(&cli.db, cli.tenant, config)?;
            let occurrences = service
                .query(tenant, patient.map(PatientId), Some(&from), Some(&to))
                .context("Failed to list events")?;
            print_json(&occurrences)
        }
        Commands::Update { id, scope, patch } => {
            let (service, tenant) = connect(&cli.db, cli.tenant, config)?;
            let applied = service
                .update_occurrence(tenant, &id, scope, patch.into())
                .with_context(|| format!("Failed to update {id}"))?;
            print_json(&applied)
        }
        Commands::Delete { id, scope } => {
            let (service, tenant) = connect(&cli.db, cli.tenant, config)?;
            let applied = service
                .delete_occurrence(tenant, &id, scope)
                .with_context(|| format!("Failed to delete {id}"))?;
            print_json(&applied)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.validate().context("Invalid config")?;
    Ok(config)
}

/// Open the store behind a service; every store-backed command needs a tenant.
fn connect(
    db: &Path,
    tenant: Option<i64>,
    config: EngineConfig,
) -> Result<(EventQueryService, TenantId)> {
    let tenant = tenant.context("--tenant (or AGENDA_TENANT) is required for this command")?;
    let store = SqliteEventStore::open(db)
        .with_context(|| format!("Failed to open database: {}", db.display()))?;
    let service = EventQueryService::new(Arc::new(store), config)?;
    Ok((service.with_sink(Arc::new(TracingSink)), TenantId(tenant)))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| format!("'{raw}' is not HH:MM"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{out}");
    Ok(())
}
