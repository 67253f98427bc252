//! perfstore CLI: inspect a profiling datastore on disk.
//!
//! Every command opens the namespaces under the data directory, reads or
//! initializes them, and prints JSON on stdout. Logs go to stderr.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use perfstore_core::DataStore;
use perfstore_core::config::{Config, LogFormat};
use perfstore_core::executor::ManualExecutor;
use perfstore_core::logging::{LogConfig, init_logging};
use perfstore_core::storage::SqliteConnectionProvider;
use perfstore_core::types::profiler::SessionMetaData;
use perfstore_core::types::{DumpStatus, Session, TimeRange};

#[derive(Parser)]
#[command(name = "perfstore")]
#[command(version, about = "Inspect a host-side profiling datastore", long_about = None)]
struct Cli {
    /// Config file (defaults to $PERFSTORE_CONFIG, then the per-user config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding storage.data_dir
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format for stderr (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the namespace databases and their tables
    Init,

    /// List stored sessions with their metadata
    Sessions,

    /// List every device ever seen
    Devices,

    /// CPU usage samples of a session
    Cpu {
        #[command(flatten)]
        window: Window,
    },

    /// Memory samples and artifact descriptors of a session
    Memory {
        #[command(flatten)]
        window: Window,
    },

    /// Write a stored heap dump to a file
    HeapDump {
        /// Session id
        #[arg(long)]
        session: i64,

        /// Dump start time
        #[arg(long)]
        time: i64,

        /// Output file
        #[arg(long)]
        out: PathBuf,
    },

    /// Write a stored CPU trace to a file
    Trace {
        /// Session id
        #[arg(long)]
        session: i64,

        /// Trace id
        #[arg(long)]
        trace_id: i64,

        /// Output file
        #[arg(long)]
        out: PathBuf,
    },
}

/// Session and `(from, to]` window shared by the range queries
#[derive(clap::Args)]
struct Window {
    /// Session id
    #[arg(long)]
    session: i64,

    /// Exclusive lower bound
    #[arg(long, default_value_t = i64::MIN)]
    from: i64,

    /// Inclusive upper bound
    #[arg(long, default_value_t = i64::MAX)]
    to: i64,
}

#[derive(Serialize)]
struct NamespaceReport {
    name: &'static str,
    path: PathBuf,
}

#[derive(Serialize)]
struct InitReport {
    data_dir: PathBuf,
    namespaces: Vec<NamespaceReport>,
}

#[derive(Serialize)]
struct SessionReport {
    #[serde(flatten)]
    session: Session,
    meta: SessionMetaData,
}

#[derive(Serialize)]
struct ArtifactReport {
    status: DumpStatus,
    bytes: usize,
    out: PathBuf,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.display().to_string();
    }
    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<(DataStore, SqliteConnectionProvider)> {
    let provider = SqliteConnectionProvider::from_config(&config.storage);
    let store = DataStore::new(config, &provider, Arc::new(ManualExecutor::new()))
        .with_context(|| format!("opening datastore in {}", provider.data_dir().display()))?;
    Ok((store, provider))
}

fn find_session(store: &DataStore, session_id: i64) -> Result<Session> {
    match store.profiler().get_session_by_id(session_id)? {
        Some(session) => Ok(session),
        None => bail!("session {session_id} not found"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_artifact(out: &Path, status: DumpStatus, data: &[u8], what: &str) -> Result<()> {
    if status != DumpStatus::Success {
        bail!("{what} is not available (status: {status:?})");
    }
    std::fs::write(out, data).with_context(|| format!("writing {}", out.display()))?;
    print_json(&ArtifactReport {
        status,
        bytes: data.len(),
        out: out.to_path_buf(),
    })
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    // A second init in the same process is harmless for a one-shot CLI.
    if let Err(err) = init_logging(&LogConfig::from(&config.general)) {
        eprintln!("warning: logging disabled: {err}");
    }
    let (store, provider) = open_store(&config)?;
    debug!(data_dir = %provider.data_dir().display(), "datastore opened");

    match &cli.command {
        Commands::Init => print_json(&InitReport {
            data_dir: provider.data_dir().to_path_buf(),
            namespaces: store
                .namespaces()
                .iter()
                .map(|ns| NamespaceReport {
                    name: ns.name,
                    path: provider.database_path(ns),
                })
                .collect(),
        }),
        Commands::Sessions => {
            let profiler = store.profiler();
            let sessions = profiler
                .get_sessions()?
                .sessions
                .into_iter()
                .map(|session| {
                    Ok(SessionReport {
                        meta: profiler.get_session_meta_data(session.session_id)?,
                        session,
                    })
                })
                .collect::<perfstore_core::Result<Vec<_>>>()?;
            print_json(&sessions)
        }
        Commands::Devices => print_json(&store.profiler().get_devices()?.devices),
        Commands::Cpu { window } => {
            let session = find_session(&store, window.session)?;
            let range = TimeRange::new(window.from, window.to);
            print_json(&store.cpu().get_data(&session, range)?.data)
        }
        Commands::Memory { window } => {
            let session = find_session(&store, window.session)?;
            let range = TimeRange::new(window.from, window.to);
            print_json(&store.memory().get_data(&session, range)?)
        }
        Commands::HeapDump { session, time, out } => {
            let session = find_session(&store, *session)?;
            let dump = store.memory().get_heap_dump(&session, *time)?;
            write_artifact(out, dump.status, &dump.data, &format!("heap dump {time}"))
        }
        Commands::Trace {
            session,
            trace_id,
            out,
        } => {
            let session = find_session(&store, *session)?;
            let trace = store.cpu().get_trace(&session, *trace_id)?;
            write_artifact(out, trace.status, &trace.data, &format!("trace {trace_id}"))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<perfstore_core::Error>()
                .and_then(perfstore_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}
