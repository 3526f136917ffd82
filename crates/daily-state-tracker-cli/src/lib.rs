//! Command-line surface for the daily state tracker.
//!
//! Embedding hosts can use [`run_cli`] for parsed CLI execution against a
//! `SQLite` file, or [`run_command`] against any [`DailyStateStore`].

use std::fmt::Write as _;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use daily_state_tracker_core::{
    date_key, parse_date_key, previous_day, record_field_names, EditDebouncer, FixedClock,
    RatingField, Record, CSV_EXPORT_FILE_NAME, DEFAULT_STORAGE_KEY, JSON_BACKUP_FILE_NAME,
    MEMO_FIELD, SCHEMA_VERSION,
};
use daily_state_tracker_store_sqlite::{DailyStateStore, SlotBackend, StoreConfig};
use serde_json::{Map, Value};
use time::Date;

pub const LOG_ENV: &str = "DAILY_STATE_LOG";

#[derive(Debug, Parser)]
#[command(name = "dst")]
#[command(about = "Daily State Tracker CLI")]
pub struct Cli {
    #[arg(long, env = "DAILY_STATE_DB", default_value = "./daily_state_tracker.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = DEFAULT_STORAGE_KEY)]
    storage_key: String,

    /// Overrides the local calendar date used as "today" (YYYY-MM-DD).
    #[arg(long, env = "DAILY_STATE_TODAY", hide = true)]
    today: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List record fields in column order.
    Fields(FieldsArgs),
    Today {
        #[command(subcommand)]
        command: Box<TodayCommand>,
    },
    Day {
        #[command(subcommand)]
        command: Box<DayCommand>,
    },
    Export {
        #[command(subcommand)]
        command: Box<ExportCommand>,
    },
    Import {
        #[command(subcommand)]
        command: Box<ImportCommand>,
    },
}

#[derive(Debug, Args)]
pub struct FieldsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum TodayCommand {
    Show(ShowArgs),
    Rate(RateArgs),
    Clear(ClearArgs),
    Memo(MemoArgs),
    /// Append stdin lines to today's memo, saving after each quiet period.
    MemoStream(MemoStreamArgs),
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RateArgs {
    #[arg(value_parser = parse_rating_field)]
    field: RatingField,
    value: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ClearArgs {
    #[arg(value_parser = parse_rating_field)]
    field: RatingField,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct MemoArgs {
    text: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct MemoStreamArgs {
    #[arg(long, default_value_t = 400)]
    quiet_period_ms: u64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum DayCommand {
    /// Show a past day's record (read-only). Defaults to yesterday.
    Show(DayShowArgs),
}

#[derive(Debug, Args)]
pub struct DayShowArgs {
    #[arg(long, conflicts_with = "days_ago")]
    date: Option<String>,
    #[arg(long)]
    days_ago: Option<u32>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ExportCommand {
    Csv(ExportArgs),
    Json(ExportArgs),
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long, conflicts_with = "stdout")]
    output: Option<PathBuf>,
    #[arg(long)]
    stdout: bool,
}

#[derive(Debug, Subcommand)]
pub enum ImportCommand {
    /// Replace all stored records with a JSON backup.
    Json(ImportArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    path: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct DayView {
    pub contract_version: String,
    pub date: String,
    pub writable: bool,
    pub record: Record,
}

#[derive(Debug, Clone, serde::Serialize, PartialEq, Eq)]
pub struct ImportReport {
    pub contract_version: String,
    pub schema_version: u32,
    pub records: usize,
}

/// Installs the stderr log subscriber, filtered by `DAILY_STATE_LOG`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    if let Command::Fields(args) = &cli.command {
        print!("{}", render_fields(args.json)?);
        return Ok(());
    }

    let config = StoreConfig {
        storage_key: cli.storage_key,
        schema_version: SCHEMA_VERSION,
    };
    let store = match cli.today.as_deref() {
        Some(raw) => {
            let today = parse_date_key(raw).context("invalid --today value")?;
            DailyStateStore::open_sqlite_with_clock(&cli.db, config, FixedClock(today))?
        }
        None => DailyStateStore::open_sqlite(&cli.db, config)?,
    };
    tracing::debug!(db = %cli.db.display(), today = %store.today_key(), "opened store");

    run_command(cli.command, &store)
}

/// Executes a parsed command against an existing store.
///
/// # Errors
/// Returns an error when argument values are invalid, persistence fails, or
/// an export/import file cannot be read or written.
pub fn run_command<B: SlotBackend>(command: Command, store: &DailyStateStore<B>) -> Result<()> {
    match command {
        Command::Fields(args) => {
            print!("{}", render_fields(args.json)?);
            Ok(())
        }
        Command::Today { command } => run_today(*command, store),
        Command::Day { command } => run_day(*command, store),
        Command::Export { command } => run_export(*command, store),
        Command::Import { command } => run_import(*command, store),
    }
}

fn run_today<B: SlotBackend>(command: TodayCommand, store: &DailyStateStore<B>) -> Result<()> {
    let (record, json) = match command {
        TodayCommand::Show(args) => (store.get_today_record(), args.json),
        TodayCommand::Rate(args) => {
            let record = store.save_today_record(&single_field(
                args.field.as_str(),
                Value::String(args.value.clone()),
            ))?;
            if record.rating(args.field).is_none() {
                tracing::warn!(
                    field = %args.field,
                    value = %args.value,
                    "rating is not an integer in 1..=5; field cleared"
                );
            }
            (record, args.json)
        }
        TodayCommand::Clear(args) => (
            store.save_today_record(&single_field(
                args.field.as_str(),
                Value::String(String::new()),
            ))?,
            args.json,
        ),
        TodayCommand::Memo(args) => (
            store.save_today_record(&single_field(MEMO_FIELD, Value::String(args.text)))?,
            args.json,
        ),
        TodayCommand::MemoStream(args) => {
            let lines = spawn_stdin_lines();
            let record = stream_memo(
                store,
                &lines,
                Duration::from_millis(args.quiet_period_ms),
            )?;
            (record, args.json)
        }
    };

    print_day(&day_view(store.today(), true, record), json)
}

fn run_day<B: SlotBackend>(command: DayCommand, store: &DailyStateStore<B>) -> Result<()> {
    match command {
        DayCommand::Show(args) => print_day(&resolve_day_view(&args, store)?, args.json),
    }
}

fn resolve_day_view<B: SlotBackend>(
    args: &DayShowArgs,
    store: &DailyStateStore<B>,
) -> Result<DayView> {
    let today = store.today();
    let date = match (args.date.as_deref(), args.days_ago) {
        (Some(raw), _) => parse_date_key(raw).context("invalid --date value")?,
        (None, Some(days)) => days_before(today, days)?,
        (None, None) => previous_day(today)?,
    };
    Ok(day_view(date, date == today, store.get_record(date)))
}

fn run_export<B: SlotBackend>(command: ExportCommand, store: &DailyStateStore<B>) -> Result<()> {
    let (content, args, default_name) = match command {
        ExportCommand::Csv(args) => (store.export_csv(), args, CSV_EXPORT_FILE_NAME),
        ExportCommand::Json(args) => (store.export_json()?, args, JSON_BACKUP_FILE_NAME),
    };

    if args.stdout {
        println!("{content}");
        return Ok(());
    }

    let path = args
        .output
        .unwrap_or_else(|| PathBuf::from(default_name));
    write_export(&path, &content)?;
    tracing::info!(path = %path.display(), bytes = content.len(), "export written");
    println!("wrote {}", path.display());
    Ok(())
}

fn run_import<B: SlotBackend>(command: ImportCommand, store: &DailyStateStore<B>) -> Result<()> {
    match command {
        ImportCommand::Json(args) => {
            let text = std::fs::read_to_string(&args.path)
                .with_context(|| format!("failed to read backup file {}", args.path.display()))?;
            let payload = store.import_json(&text)?;
            let report = ImportReport {
                contract_version: "import_report.v1".to_string(),
                schema_version: payload.schema_version,
                records: payload.records.len(),
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "imported {} records (schema_version={})",
                    report.records, report.schema_version
                );
            }
            Ok(())
        }
    }
}

/// Appends each received line to today's memo and persists through an
/// [`EditDebouncer`]. Pending text is flushed when the sender hangs up.
///
/// # Errors
/// Returns an error when a debounced write fails.
pub fn stream_memo<B: SlotBackend>(
    store: &DailyStateStore<B>,
    lines: &mpsc::Receiver<String>,
    quiet_period: Duration,
) -> Result<Record> {
    let mut memo = store.get_today_record().memo().to_string();
    let mut debouncer = EditDebouncer::new(quiet_period);
    let mut latest = None;

    loop {
        let received = match debouncer.time_until_due(Instant::now()) {
            Some(wait) => lines.recv_timeout(wait),
            None => lines.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(line) => {
                if !memo.is_empty() {
                    memo.push('\n');
                }
                memo.push_str(&line);
                debouncer.push(
                    single_field(MEMO_FIELD, Value::String(memo.clone())),
                    Instant::now(),
                );
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(batch) = debouncer.poll(Instant::now()) {
            latest = Some(store.save_today_record(&batch)?);
        }
    }

    if let Some(batch) = debouncer.flush() {
        latest = Some(store.save_today_record(&batch)?);
    }

    Ok(latest.unwrap_or_else(|| store.get_today_record()))
}

fn spawn_stdin_lines() -> mpsc::Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "stopped reading stdin");
                    break;
                }
            }
        }
    });
    receiver
}

fn parse_rating_field(raw: &str) -> std::result::Result<RatingField, String> {
    RatingField::parse(raw).ok_or_else(|| {
        let names = RatingField::ALL
            .into_iter()
            .map(RatingField::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        format!("unknown rating field {raw:?}; expected one of: {names}")
    })
}

fn single_field(name: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(name.to_string(), value);
    map
}

fn days_before(today: Date, days: u32) -> Result<Date> {
    today
        .checked_sub(time::Duration::days(i64::from(days)))
        .ok_or_else(|| anyhow!("date out of range: {days} days before {}", date_key(today)))
}

fn day_view(date: Date, writable: bool, record: Record) -> DayView {
    DayView {
        contract_version: "day_view.v1".to_string(),
        date: date_key(date),
        writable,
        record,
    }
}

fn write_export(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("failed to write export file {}", path.display()))
}

fn print_day(view: &DayView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(view)?);
    } else {
        print!("{}", render_day_table(view));
    }
    Ok(())
}

fn render_fields(json: bool) -> Result<String> {
    let names = record_field_names().collect::<Vec<_>>();
    if json {
        return Ok(format!("{}\n", serde_json::to_string_pretty(&names)?));
    }
    Ok(names.iter().map(|name| format!("{name}\n")).collect())
}

/// Renders a record as a star table, one field per line.
#[must_use]
pub fn render_day_table(view: &DayView) -> String {
    let mut out = String::new();
    let mode = if view.writable { "editable" } else { "read-only" };
    let _ = writeln!(out, "date: {} ({mode})", view.date);
    let _ = writeln!(out, "{}", "-".repeat(40));

    for field in RatingField::ALL {
        let cell = view.record.rating(field).map_or_else(
            || "-".to_string(),
            |rating| {
                let filled = usize::from(rating.get());
                format!(
                    "{}{} {}",
                    "★".repeat(filled),
                    "☆".repeat(5 - filled),
                    rating
                )
            },
        );
        let _ = writeln!(out, "{:<22} {}", field.label(), cell);
    }

    let memo = view.record.memo();
    let _ = writeln!(out, "{:<22} {}", "Memo", if memo.is_empty() { "-" } else { memo });
    out
}
