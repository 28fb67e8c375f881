mod config;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use cohort_engine::{
    BitField, CohortEngine, CohortRequest, Column, Credentials, EngineConfig, Label,
    MAX_BIT_POSITIONS,
};
use cohort_storage::{Dataset, QueryService, ServiceConfig, Storage, StorageConfig};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "cohort")]
#[command(about = "Import cohort records into SQLite and run bitmask cohort queries, emitting JSON.")]
struct Cli {
    /// JSON settings file; explicit flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load records, labels and users from a JSON dataset file.
    Import(ImportArgs),
    /// List the label catalog.
    Labels(LabelsArgs),
    /// List distinct values of a filter column.
    Values(ValuesArgs),
    /// Run a cohort query and print the chart series.
    Query(QueryArgs),
}

#[derive(Debug, clap::Args)]
struct ImportArgs {
    /// Dataset JSON (`{"records": [...], "labels": [...], "users": [...]}`), or `-` for stdin.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, clap::Args)]
struct LabelsArgs {
    /// Only list labels of this bit-field (`medical_condition` or `treatment`).
    #[arg(long)]
    field: Option<BitField>,
}

#[derive(Debug, clap::Args)]
struct ValuesArgs {
    /// `state`, `paytyp` (or `paytype`) or `pop` (or `cohort`).
    column: String,
}

#[derive(Debug, clap::Args)]
struct QueryArgs {
    /// Request JSON file, or `-` for stdin.
    #[arg(long)]
    request: PathBuf,

    /// Bit-field to aggregate.
    #[arg(long, default_value = "medical_condition")]
    field: BitField,

    /// Per-request deadline in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Maximum number of labels one request may extract.
    #[arg(long)]
    max_labels: Option<usize>,

    /// Check these credentials against the user table before querying.
    #[arg(long, requires = "auth_token")]
    userid: Option<String>,

    #[arg(long, requires = "userid")]
    auth_token: Option<String>,
}

/// Effective settings after merging the config file with flags.
#[derive(Debug)]
struct Settings {
    database: PathBuf,
    storage: StorageConfig,
    request_timeout: Duration,
    max_requested_labels: usize,
}

impl Settings {
    fn resolve(cli: &Cli, file: &CliConfig) -> Result<Self> {
        let database = cli
            .db
            .clone()
            .or_else(|| file.database.clone())
            .ok_or_else(|| anyhow!("no database given (use --db or `database` in --config)"))?;

        let mut storage = StorageConfig::default();
        if let Some(ms) = file.busy_timeout_ms {
            storage.busy_timeout = Duration::from_millis(ms);
        }

        let (timeout_flag, labels_flag) = match &cli.command {
            Command::Query(args) => (args.timeout_ms, args.max_labels),
            _ => (None, None),
        };

        Ok(Self {
            database,
            storage,
            request_timeout: timeout_flag
                .or(file.request_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_requested_labels: labels_flag
                .or(file.max_requested_labels)
                .unwrap_or(MAX_BIT_POSITIONS as usize),
        })
    }

    fn open(&self) -> Result<Storage> {
        Storage::open_path_with_config(&self.database, self.storage.clone())
            .with_context(|| format!("open database {}", self.database.display()))
    }
}

fn init_tracing(default_directive: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.unwrap_or("warn")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .context("read stdin")?;
        return Ok(buf);
    }
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

/// Print `value` as pretty JSON. A closed stdout is not an error.
fn print_json(value: &impl Serialize) -> Result<()> {
    let mut out = io::stdout().lock();
    let written = serde_json::to_writer_pretty(&mut out, value)
        .map_err(io::Error::from)
        .and_then(|()| writeln!(out))
        .and_then(|()| out.flush());
    match written {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err).context("write output"),
    }
}

#[derive(Debug, Serialize)]
struct LabelListing {
    #[serde(skip_serializing_if = "Option::is_none")]
    medical_conditions: Option<Vec<Label>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    treatments: Option<Vec<Label>>,
}

fn engine(settings: &Settings, storage: Storage) -> Result<CohortEngine<Storage>> {
    let config = EngineConfig {
        default_query_timeout: None,
        max_requested_labels: settings.max_requested_labels,
    };
    CohortEngine::new(storage.clone(), &storage, config).context("load label catalog")
}

fn run_import(settings: &Settings, args: &ImportArgs) -> Result<()> {
    let bytes = read_input(&args.input)?;
    let dataset = Dataset::from_reader(bytes.as_slice())
        .with_context(|| format!("parse dataset {}", args.input.display()))?;
    let storage = settings.open()?;
    let summary = storage.import(&dataset).context("import dataset")?;
    print_json(&summary)
}

fn run_labels(settings: &Settings, args: &LabelsArgs) -> Result<()> {
    let engine = engine(settings, settings.open()?)?;
    let wanted = |field: BitField| args.field.map_or(true, |f| f == field);
    let listing = LabelListing {
        medical_conditions: wanted(BitField::MedicalCondition)
            .then(|| engine.labels_for(BitField::MedicalCondition)),
        treatments: wanted(BitField::Treatment).then(|| engine.labels_for(BitField::Treatment)),
    };
    print_json(&listing)
}

fn run_values(settings: &Settings, args: &ValuesArgs) -> Result<()> {
    let Some(column) = Column::from_name(&args.column) else {
        bail!(
            "unknown column `{}` (expected state, paytyp or pop)",
            args.column
        );
    };
    let engine = engine(settings, settings.open()?)?;
    let values = engine
        .distinct_values(column)
        .with_context(|| format!("list {column} values"))?;
    print_json(&values)
}

fn run_query(settings: &Settings, args: &QueryArgs) -> Result<()> {
    let bytes = read_input(&args.request)?;
    let text = String::from_utf8(bytes).context("request is not UTF-8")?;
    let request = CohortRequest::from_json(&text)?;

    let storage = settings.open()?;
    let engine = Arc::new(engine(settings, storage.clone())?);
    let service = QueryService::new(
        engine,
        ServiceConfig {
            request_timeout: settings.request_timeout,
        },
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("start runtime")?;

    let response = runtime.block_on(async {
        match (&args.userid, &args.auth_token) {
            (Some(userid), Some(token)) => {
                service
                    .view_authorized(
                        Arc::new(storage),
                        Credentials::new(userid.as_str(), token.as_str()),
                        request,
                        args.field,
                    )
                    .await
            }
            _ => service.view(request, args.field).await,
        }
    });

    match response {
        Ok(response) => print_json(&response),
        Err(err) => {
            let category = err.category();
            Err(anyhow::Error::new(err).context(format!("{} query failed ({category})", args.field)))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let file_config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };
    init_tracing(file_config.log.as_deref());

    let settings = Settings::resolve(&cli, &file_config)?;
    match &cli.command {
        Command::Import(args) => run_import(&settings, args),
        Command::Labels(args) => run_labels(&settings, args),
        Command::Values(args) => run_values(&settings, args),
        Command::Query(args) => run_query(&settings, args),
    }
}
