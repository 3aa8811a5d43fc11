use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use super::{ArchiverMode, StatusKeyword};

#[derive(Parser)]
#[command(name = "archiver-audit")]
#[command(about = "Audit archiver status of the PVs listed in IOC archive manifests", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file (JSON). Defaults to $ARCHIVER_AUDIT_CONFIG or ./archiver-audit.json
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub(crate) log_file: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Where to read manifests from. Exactly one must be given.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub(crate) struct ManifestArgs {
    /// Subsystem tag used in the IOC wildcard search, e.g. bp for *-*-bp*
    #[arg(short = 's', long)]
    pub(crate) subsystem: Option<String>,

    /// A single manifest (.archive) file
    #[arg(short = 'f', long)]
    pub(crate) file: Option<PathBuf>,

    /// A directory containing .archive files
    #[arg(short = 'd', long)]
    pub(crate) directory: Option<PathBuf>,

    /// A text file listing manifest paths, one per line
    #[arg(long)]
    pub(crate) path_list: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum ExtractFilter {
    Paused,
    Unarchived,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Check archiver status for manifest PVs and merge findings into a report.
    Report {
        #[command(flatten)]
        manifests: ManifestArgs,

        /// Restrict subsystem discovery to an area, e.g. li24 for *-li24*-bp*
        #[arg(long, requires = "subsystem")]
        area: Option<String>,

        /// Archiver deployment to query (overrides config)
        #[arg(short, long, value_enum)]
        archiver: Option<ArchiverMode>,

        /// Status keyword to report on
        #[arg(short, long, value_enum, default_value = "All")]
        keyword: StatusKeyword,

        /// Keep only PVs whose live channel does not connect
        #[arg(long)]
        disconnected_only: bool,

        /// Keep only PVs whose last event contains this text, e.g. 3/27/25
        #[arg(long)]
        last_event: Option<String>,

        /// Keep only PVs whose archiver connection state matches
        #[arg(long)]
        connection_state: Option<bool>,

        /// Record the last event time in each finding
        #[arg(long)]
        show_last_event: bool,

        /// Record the archiver connection state in each finding
        #[arg(long)]
        show_connection_state: bool,

        /// Report file (YAML) to merge findings into
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Print the resolved manifest paths and stop
        #[arg(long)]
        list_paths: bool,

        /// Also write the resolved manifest paths to this file
        #[arg(long)]
        save_paths: Option<PathBuf>,
    },

    /// Extract PV names from a report into a plain list.
    Extract {
        /// Report file (YAML)
        #[arg(short, long)]
        report: PathBuf,
        /// Output text file, one PV per line
        #[arg(short, long)]
        out: PathBuf,
        /// Keep only findings with this status
        #[arg(long, value_enum)]
        filter: Option<ExtractFilter>,
    },

    /// Run the daily subsystem schedule.
    Schedule {
        /// Run today's subsystems once and exit
        #[arg(long)]
        once: bool,
        /// Day to run instead of today (with --once)
        #[arg(long, requires = "once")]
        day: Option<String>,
        /// Overlap up to this many subsystems (overrides config)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Run at this local hour (overrides config)
        #[arg(long)]
        hour: Option<u32>,
        /// Run at this local minute (overrides config)
        #[arg(long)]
        minute: Option<u32>,
    },

    /// List PVs paused on the archiver appliance.
    Paused {
        #[arg(short, long, value_enum)]
        archiver: Option<ArchiverMode>,
    },

    /// List PVs the archiver currently sees as disconnected.
    Disconnected {
        #[arg(short, long, value_enum)]
        archiver: Option<ArchiverMode>,
    },

    /// Pause archiving for every PV in a manifest.
    Pause {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long, value_enum)]
        archiver: Option<ArchiverMode>,
    },

    /// Resume archiving for every PV in a manifest.
    Resume {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long, value_enum)]
        archiver: Option<ArchiverMode>,
    },

    /// Change sampling period and method for every PV in a manifest. Without
    /// --period/--method each line's own `name scan method` values are used.
    Resample {
        #[arg(short, long)]
        file: PathBuf,
        /// Sampling period in seconds
        #[arg(long, requires = "method")]
        period: Option<f64>,
        /// MONITOR or SCAN
        #[arg(long, requires = "period")]
        method: Option<String>,
        #[arg(short, long, value_enum)]
        archiver: Option<ArchiverMode>,
    },
}
