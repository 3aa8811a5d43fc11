// Module declarations
mod archiver;
mod audit;
mod cli;
mod config;
mod error;
mod filter;
mod logging;
mod manifest;
mod probe;
mod report;
mod scheduler;
mod types;
mod util;

// Re-export module items at crate root so cross-module references stay short.
#[allow(unused_imports)]
pub(crate) use archiver::*;
#[allow(unused_imports)]
pub(crate) use audit::*;
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use error::*;
#[allow(unused_imports)]
pub(crate) use filter::*;
#[allow(unused_imports)]
pub(crate) use logging::*;
#[allow(unused_imports)]
pub(crate) use manifest::*;
#[allow(unused_imports)]
pub(crate) use probe::*;
#[allow(unused_imports)]
pub(crate) use report::*;
#[allow(unused_imports)]
pub(crate) use scheduler::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, Local, Weekday};
use clap::Parser;
use tracing::{error, info, warn};

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!(error = %err, "fatal");
            eprintln!("error: {err}");
            std::process::exit(if err.is_configuration() { 2 } else { 1 });
        }
    }
}

fn archiver_client(
    config: &AuditConfig,
    mode: Option<ArchiverMode>,
) -> AuditResult<ArchiverClient> {
    let timeout = config.request_timeout_ms.map(Duration::from_millis);
    // An explicit mode on the command line wins over a configured URL.
    match (mode, config.archiver_url.as_deref()) {
        (Some(mode), _) => ArchiverClient::new(mode, timeout),
        (None, Some(url)) => ArchiverClient::with_base(url, timeout),
        (None, None) => ArchiverClient::new(config.archiver, timeout),
    }
}

fn manifest_source(args: ManifestArgs, area: Option<String>) -> AuditResult<ManifestSource> {
    match (args.subsystem, args.file, args.directory, args.path_list) {
        (Some(tag), None, None, None) => Ok(ManifestSource::Subsystem { tag, area }),
        (None, Some(file), None, None) => Ok(ManifestSource::File(file)),
        (None, None, Some(dir), None) => Ok(ManifestSource::Directory(dir)),
        (None, None, None, Some(list)) => Ok(ManifestSource::PathList(list)),
        _ => Err(AuditError::InvalidCriteria(
            "exactly one of --subsystem, --file, --directory or --path-list is required".into(),
        )),
    }
}

/// A run that could not read one of its manifests is incomplete and exits 1,
/// even though the findings it did gather were merged.
fn report_exit_status(summary: &AuditSummary) -> i32 {
    if summary.has_manifest_failures() { 1 } else { 0 }
}

/// Apply a per-PV archiver operation, continuing past failures. Returns the
/// exit status: 1 if any PV failed.
fn apply_per_pv<T, F>(items: &[T], op_name: &str, pv_of: fn(&T) -> &str, op: F) -> i32
where
    F: Fn(&T) -> AuditResult<String>,
{
    let mut failed = 0usize;
    for item in items {
        let pv = pv_of(item);
        match op(item) {
            Ok(body) => println!("{pv}: {}", body.trim()),
            Err(err) => {
                failed += 1;
                warn!(pv = %pv, operation = op_name, error = %err, "archiver operation failed");
            }
        }
    }
    info!(operation = op_name, total = items.len(), failed, "archiver operation finished");
    if failed == 0 { 0 } else { 1 }
}

fn for_each_manifest_pv<F>(file: &Path, op_name: &str, op: F) -> AuditResult<i32>
where
    F: Fn(&str) -> AuditResult<String>,
{
    let pvs = parse_manifest(file)?;
    Ok(apply_per_pv(&pvs, op_name, String::as_str, |pv| op(pv)))
}

fn entry_pv(entry: &ManifestEntry) -> &str {
    &entry.pv_name
}

/// Resample each PV to the `scan method` pair on its own manifest line.
fn resample_from_manifest(client: &ArchiverClient, file: &Path) -> AuditResult<i32> {
    let entries = parse_manifest_entries(file)?;
    Ok(apply_per_pv(
        &entries,
        "resample",
        entry_pv,
        |entry| {
            let period: f64 = entry.scan.parse().map_err(|_| {
                AuditError::Config(format!("scan period '{}' is not a number", entry.scan))
            })?;
            let method = SamplingMethod::from_str(&entry.method)?;
            client.change_archival_parameters(&entry.pv_name, period, method)
        },
    ))
}

fn run(cli: Cli) -> AuditResult<i32> {
    let mut config = load_config(cli.config)?;
    if cli.log_file.is_some() {
        config.log_file = cli.log_file;
    }

    match cli.command {
        Command::Report {
            manifests,
            area,
            archiver,
            keyword,
            disconnected_only,
            last_event,
            connection_state,
            show_last_event,
            show_connection_state,
            out,
            list_paths,
            save_paths: save_paths_to,
        } => {
            init_logging(config.log_file.as_deref(), cli.verbose)?;
            let source = manifest_source(manifests, area)?;
            let criteria = FilterCriteria::new(
                keyword.statuses(),
                last_event,
                connection_state,
                disconnected_only,
                FindingFields {
                    last_event: show_last_event,
                    connection_state: show_connection_state,
                },
            )?;

            if list_paths || save_paths_to.is_some() {
                let paths = resolve_manifests(&source, &config.manifest_base)?;
                if let Some(target) = &save_paths_to {
                    save_paths(target, &paths).map_err(|e| {
                        AuditError::Config(format!("cannot write {}: {e}", target.display()))
                    })?;
                }
                if list_paths {
                    for path in &paths {
                        println!("{}", path.display());
                    }
                    return Ok(0);
                }
            }

            let client = archiver_client(&config, archiver)?;
            info!(archiver = %client.base(), "using archiver");
            let probe = if criteria.disconnected_only() {
                Some(CommandProbe::new(
                    &config.probe_command,
                    Duration::from_millis(config.probe_timeout_ms),
                )?)
            } else {
                None
            };

            let request = AuditRequest {
                source,
                manifest_base: config.manifest_base.clone(),
                criteria,
                report_path: out,
            };
            let summary = run_audit(
                &request,
                &client,
                probe.as_ref().map(|p| p as &dyn ConnectivityProbe),
            )?;
            print!("{}", render_table(&summary));
            println!("{summary}");
            Ok(report_exit_status(&summary))
        }

        Command::Extract {
            report,
            out,
            filter,
        } => {
            init_logging(config.log_file.as_deref(), cli.verbose)?;
            let loaded = load_report(&report)?;
            let needle = filter.map(|f| match f {
                ExtractFilter::Paused => STATUS_PAUSED,
                ExtractFilter::Unarchived => STATUS_NOT_BEING_ARCHIVED,
            });
            let pvs = extract_pvs(&loaded, needle);
            write_pv_list(&out, &pvs)?;
            println!("Filtered PV list ({} PVs) written to {}", pvs.len(), out.display());
            Ok(0)
        }

        Command::Schedule {
            once,
            day,
            max_parallel,
            hour,
            minute,
        } => {
            if let Some(max_parallel) = max_parallel {
                config.schedule.max_parallel = max_parallel;
            }
            if let Some(hour) = hour {
                config.schedule.hour = hour;
            }
            if let Some(minute) = minute {
                config.schedule.minute = minute;
            }
            if config.schedule.hour > 23 || config.schedule.minute > 59 {
                return Err(AuditError::Config(format!(
                    "invalid schedule time {:02}:{:02}",
                    config.schedule.hour, config.schedule.minute
                )));
            }
            let log_file = config
                .log_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCHEDULER_LOG));
            init_logging(Some(&log_file), cli.verbose)?;

            let client = archiver_client(&config, None)?;
            let runner = |tag: &str| -> AuditResult<AuditSummary> {
                let request = subsystem_request(&config, tag)?;
                run_audit(&request, &client, None)
            };

            if once {
                let day = match day {
                    Some(name) => Weekday::from_str(&name)
                        .map_err(|_| AuditError::Config(format!("unknown weekday '{name}'")))?,
                    None => Local::now().weekday(),
                };
                let outcomes = run_day(&config, day, &runner);
                for outcome in &outcomes {
                    let status = match &outcome.status {
                        RunStatus::Success => "success".to_string(),
                        RunStatus::Failed(msg) => format!("error: {msg}"),
                    };
                    println!(
                        "{:<4} {:<28} {:>5} findings  {:>8.2}s  {status}",
                        outcome.subsystem,
                        outcome.name,
                        outcome.findings,
                        outcome.duration.as_secs_f64()
                    );
                }
                let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
                return Ok(if failed == 0 { 0 } else { 1 });
            }

            scheduler_loop(&config, &runner)?;
            Ok(0)
        }

        Command::Paused { archiver } => {
            init_logging(config.log_file.as_deref(), cli.verbose)?;
            let client = archiver_client(&config, archiver)?;
            for pv in client.paused_pvs()? {
                println!("{pv}");
            }
            Ok(0)
        }

        Command::Disconnected { archiver } => {
            init_logging(config.log_file.as_deref(), cli.verbose)?;
            let client = archiver_client(&config, archiver)?;
            for pv in client.disconnected_pvs()? {
                println!("{pv}");
            }
            Ok(0)
        }

        Command::Pause { file, archiver } => {
            init_logging(config.log_file.as_deref(), cli.verbose)?;
            let client = archiver_client(&config, archiver)?;
            for_each_manifest_pv(&file, "pause", |pv| client.pause_pv(pv))
        }

        Command::Resume { file, archiver } => {
            init_logging(config.log_file.as_deref(), cli.verbose)?;
            let client = archiver_client(&config, archiver)?;
            for_each_manifest_pv(&file, "resume", |pv| client.resume_pv(pv))
        }

        Command::Resample {
            file,
            period,
            method,
            archiver,
        } => {
            init_logging(config.log_file.as_deref(), cli.verbose)?;
            let (Some(period), Some(method)) = (period, method) else {
                let client = archiver_client(&config, archiver)?;
                return resample_from_manifest(&client, &file);
            };
            let method = SamplingMethod::from_str(&method)?;
            if !(period.is_finite() && period > 0.0) {
                return Err(AuditError::Config(format!(
                    "sampling period must be positive, got {period}"
                )));
            }
            let client = archiver_client(&config, archiver)?;
            for_each_manifest_pv(&file, "resample", |pv| {
                client.change_archival_parameters(pv, period, method)
            })
        }
    }
}
