use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use super::{env_optional, ArchiverMode, AuditError, AuditResult};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "archiver-audit.json";
pub(crate) const DEFAULT_MANIFEST_BASE: &str = "/mccfs2/u1/lcls/epics/ioc/data";
pub(crate) const DEFAULT_REPORT_DIR: &str = "./reports";
pub(crate) const DEFAULT_SCHEDULER_LOG: &str = "/var/log/lcls-archiver-qa.log";
pub(crate) const DEFAULT_PROBE_COMMAND: &str = "caget";
pub(crate) const DEFAULT_PROBE_TIMEOUT_MS: u64 = 250;

/// Subsystem abbreviations as they appear in IOC names.
pub(crate) const SUBSYSTEM_NAMES: &[(&str, &str)] = &[
    ("ky", "Klystron"),
    ("bp", "BPM"),
    ("mp", "Machine Protection System"),
    ("tr", "Feedback"),
    ("ws", "WireScanner"),
    ("im", "Toroid"),
    ("mg", "Magnet"),
    ("pp", "Personnel Protection"),
    ("bc", "Beam Containment"),
    ("va", "Vacuum"),
    ("ls", "Laser"),
    ("uc", "Undulator Control"),
    ("mc", "Motion Control"),
    ("rf", "All RF"),
    ("tm", "Temperature"),
    ("pm", "Profile Monitors"),
    ("sp", "Shared Platform"),
    ("cf", "Facilities"),
    ("ex", "ex"),
    ("cv", "cv"),
    ("gd", "gd"),
    ("bl", "bl"),
];

pub(crate) const SUBSYSTEMS_BY_DAY: &[(Weekday, &[&str])] = &[
    (Weekday::Mon, &["bp", "mp", "tr", "bl"]),
    (Weekday::Tue, &["ws", "im", "mg", "gd"]),
    (Weekday::Wed, &["pp", "bc", "va"]),
    (Weekday::Thu, &["ls", "uc", "mc"]),
    (Weekday::Fri, &["rf", "tm", "pm"]),
    (Weekday::Sat, &["ky", "sp", "cf"]),
    (Weekday::Sun, &["rd", "rc", "cv", "ex"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ScheduleConfig {
    pub(crate) hour: u32,
    pub(crate) minute: u32,
    pub(crate) max_parallel: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hour: 1,
            minute: 0,
            max_parallel: 1,
        }
    }
}

/// On-disk configuration. Every field is optional in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct FileConfig {
    pub(crate) manifest_base: Option<PathBuf>,
    pub(crate) archiver: Option<String>,
    pub(crate) archiver_url: Option<String>,
    pub(crate) report_dir: Option<PathBuf>,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) probe_command: Option<String>,
    pub(crate) probe_timeout_ms: Option<u64>,
    pub(crate) request_timeout_ms: Option<u64>,
    pub(crate) schedule: Option<ScheduleConfig>,
    pub(crate) subsystem_names: BTreeMap<String, String>,
    pub(crate) subsystems_by_day: BTreeMap<String, Vec<String>>,
}

/// Resolved configuration, immutable after startup.
#[derive(Debug, Clone)]
pub(crate) struct AuditConfig {
    pub(crate) manifest_base: PathBuf,
    pub(crate) archiver: ArchiverMode,
    pub(crate) archiver_url: Option<String>,
    pub(crate) report_dir: PathBuf,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) probe_command: String,
    pub(crate) probe_timeout_ms: u64,
    pub(crate) request_timeout_ms: Option<u64>,
    pub(crate) schedule: ScheduleConfig,
    subsystem_names: BTreeMap<String, String>,
    subsystems_by_day: HashMap<Weekday, Vec<String>>,
}

impl AuditConfig {
    pub(crate) fn from_file_config(file: FileConfig) -> AuditResult<Self> {
        let mode_name = env_optional("ARCHIVER_AUDIT_MODE")
            .or(file.archiver)
            .unwrap_or_else(|| "lcls".to_string());
        let archiver = ArchiverMode::from_str(&mode_name)?;

        let manifest_base = file
            .manifest_base
            .or_else(|| env_optional("IOC_DATA").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_BASE));
        let report_dir = env_optional("ARCHIVER_AUDIT_REPORT_DIR")
            .map(PathBuf::from)
            .or(file.report_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR));

        let schedule = file.schedule.unwrap_or_default();
        if schedule.hour > 23 || schedule.minute > 59 {
            return Err(AuditError::Config(format!(
                "invalid schedule time {:02}:{:02}",
                schedule.hour, schedule.minute
            )));
        }

        let probe_timeout_ms = file.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS);
        if probe_timeout_ms == 0 {
            return Err(AuditError::Config("probe_timeout_ms must be positive".into()));
        }

        let mut subsystem_names: BTreeMap<String, String> = SUBSYSTEM_NAMES
            .iter()
            .map(|(tag, name)| (tag.to_string(), name.to_string()))
            .collect();
        subsystem_names.extend(file.subsystem_names);

        let mut subsystems_by_day: HashMap<Weekday, Vec<String>> = SUBSYSTEMS_BY_DAY
            .iter()
            .map(|(day, tags)| (*day, tags.iter().map(|t| t.to_string()).collect()))
            .collect();
        for (day_name, tags) in file.subsystems_by_day {
            let day = Weekday::from_str(&day_name).map_err(|_| {
                AuditError::Config(format!("unknown weekday '{day_name}' in subsystems_by_day"))
            })?;
            subsystems_by_day.insert(day, tags);
        }

        Ok(Self {
            manifest_base,
            archiver,
            archiver_url: file.archiver_url,
            report_dir,
            log_file: file.log_file,
            probe_command: file
                .probe_command
                .unwrap_or_else(|| DEFAULT_PROBE_COMMAND.to_string()),
            probe_timeout_ms,
            request_timeout_ms: file.request_timeout_ms,
            schedule,
            subsystem_names,
            subsystems_by_day,
        })
    }

    /// Human-readable subsystem name, falling back to the raw tag.
    pub(crate) fn subsystem_name<'a>(&'a self, tag: &'a str) -> &'a str {
        self.subsystem_names
            .get(tag)
            .map(String::as_str)
            .unwrap_or(tag)
    }

    pub(crate) fn subsystems_for(&self, day: Weekday) -> &[String] {
        self.subsystems_by_day
            .get(&day)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn report_path_for(&self, subsystem: &str) -> PathBuf {
        self.report_dir
            .join(format!("{}_archiver_report.yaml", subsystem.to_lowercase()))
    }
}

pub(crate) fn resolve_config_path(cli: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Some(value) = env_optional("ARCHIVER_AUDIT_CONFIG") {
        return PathBuf::from(value);
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// A missing file yields defaults; a present but unreadable one is an error.
pub(crate) fn load_file_config(path: &Path) -> AuditResult<FileConfig> {
    match std::fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data)
            .map_err(|e| AuditError::Config(format!("{}: {e}", path.display()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(err) => Err(AuditError::Config(format!("{}: {err}", path.display()))),
    }
}

pub(crate) fn load_config(cli: Option<PathBuf>) -> AuditResult<AuditConfig> {
    let path = resolve_config_path(cli);
    AuditConfig::from_file_config(load_file_config(&path)?)
}
