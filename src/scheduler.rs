use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Local, TimeZone, Weekday};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use rayon::ThreadPoolBuilder;
use tracing::{error, info, warn};

use super::{
    AuditConfig, AuditRequest, AuditResult, AuditSummary, FilterCriteria, FindingFields,
    ManifestSource, STATUS_BEING_ARCHIVED,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RunStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct SubsystemOutcome {
    pub(crate) subsystem: String,
    pub(crate) name: String,
    pub(crate) status: RunStatus,
    pub(crate) duration: Duration,
    pub(crate) findings: usize,
}

impl SubsystemOutcome {
    pub(crate) fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// The fixed request the daily job runs for one subsystem: everything that is
/// not "Being archived", with the last event recorded, merged into the
/// subsystem's own report file.
pub(crate) fn subsystem_request(config: &AuditConfig, tag: &str) -> AuditResult<AuditRequest> {
    let criteria = FilterCriteria::new(
        Vec::new(),
        None,
        None,
        false,
        FindingFields {
            last_event: true,
            connection_state: false,
        },
    )?
    .excluding(vec![STATUS_BEING_ARCHIVED.to_string()])?;
    Ok(AuditRequest {
        source: ManifestSource::Subsystem {
            tag: tag.to_string(),
            area: None,
        },
        manifest_base: config.manifest_base.clone(),
        criteria,
        report_path: Some(config.report_path_for(tag)),
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one subsystem, converting errors and panics into an outcome. Never
/// unwinds into the caller.
pub(crate) fn check_subsystem<F>(tag: &str, name: &str, runner: &F) -> SubsystemOutcome
where
    F: Fn(&str) -> AuditResult<AuditSummary> + Sync,
{
    let start = Instant::now();
    info!(subsystem = tag, subsystem_name = name, started = %Local::now().to_rfc3339(), "starting archiver checks");

    let (status, findings) = match catch_unwind(AssertUnwindSafe(|| runner(tag))) {
        Ok(Ok(summary)) if summary.has_manifest_failures() => {
            let message = format!(
                "{} manifest(s) could not be read",
                summary.manifest_failures.len()
            );
            error!(subsystem = tag, subsystem_name = name, error = %message, "archiver checks incomplete");
            (RunStatus::Failed(message), summary.finding_count())
        }
        Ok(Ok(summary)) => {
            if !summary.pv_failures.is_empty() {
                warn!(
                    subsystem = tag,
                    pvs = summary.pv_failures.len(),
                    "checks completed with PV query failures"
                );
            }
            (RunStatus::Success, summary.finding_count())
        }
        Ok(Err(err)) => {
            error!(subsystem = tag, subsystem_name = name, error = %err, "archiver checks failed");
            (RunStatus::Failed(err.to_string()), 0)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(subsystem = tag, subsystem_name = name, panic = %message, "archiver checks panicked");
            (RunStatus::Failed(format!("panic: {message}")), 0)
        }
    };

    let duration = start.elapsed();
    info!(
        subsystem = tag,
        subsystem_name = name,
        status = if status == RunStatus::Success { "success" } else { "error" },
        duration_s = duration.as_secs_f64(),
        "archiver checks finished"
    );
    SubsystemOutcome {
        subsystem: tag.to_string(),
        name: name.to_string(),
        status,
        duration,
        findings,
    }
}

/// Run the given subsystems, sequentially when `max_parallel <= 1`, otherwise
/// on a pool of at most `max_parallel` threads. Outcomes keep input order.
pub(crate) fn run_subsystems<F>(
    subsystems: &[String],
    max_parallel: usize,
    config: &AuditConfig,
    runner: &F,
) -> Vec<SubsystemOutcome>
where
    F: Fn(&str) -> AuditResult<AuditSummary> + Sync,
{
    let check = |tag: &String| check_subsystem(tag, config.subsystem_name(tag), runner);

    if max_parallel <= 1 || subsystems.len() <= 1 {
        return subsystems.iter().map(check).collect();
    }

    ThreadPoolBuilder::new()
        .num_threads(max_parallel.min(subsystems.len()))
        .thread_name(|i| format!("audit-worker-{i}"))
        .build()
        .map(|pool| pool.install(|| subsystems.par_iter().map(check).collect()))
        .unwrap_or_else(|err| {
            warn!(error = %err, "worker pool unavailable, running sequentially");
            subsystems.iter().map(check).collect()
        })
}

pub(crate) fn run_day<F>(config: &AuditConfig, day: Weekday, runner: &F) -> Vec<SubsystemOutcome>
where
    F: Fn(&str) -> AuditResult<AuditSummary> + Sync,
{
    let subsystems = config.subsystems_for(day);
    if subsystems.is_empty() {
        info!(day = %day, "no subsystems scheduled");
        return Vec::new();
    }
    info!(day = %day, subsystems = ?subsystems, "scheduled subsystems");
    let outcomes = run_subsystems(subsystems, config.schedule.max_parallel, config, runner);
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.succeeded())
        .map(|o| o.subsystem.as_str())
        .collect();
    info!(
        day = %day,
        succeeded = outcomes.len() - failed.len(),
        failed = ?failed,
        "daily run summary"
    );
    outcomes
}

/// First `hour:minute` strictly after `now`, in `now`'s time zone. Skips a
/// day when the wall-clock time does not exist (DST gap).
pub(crate) fn next_run_time<Tz: TimeZone>(
    now: &DateTime<Tz>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();
    (0..=2).find_map(|offset| {
        let date = today.checked_add_days(chrono::Days::new(offset))?;
        let naive = date.and_hms_opt(hour, minute, 0)?;
        let candidate = tz.from_local_datetime(&naive).earliest()?;
        (candidate > *now).then_some(candidate)
    })
}

/// Sleep until the configured time each day, then run that day's subsystems.
pub(crate) fn scheduler_loop<F>(config: &AuditConfig, runner: &F) -> AuditResult<()>
where
    F: Fn(&str) -> AuditResult<AuditSummary> + Sync,
{
    let (hour, minute) = (config.schedule.hour, config.schedule.minute);
    info!("scheduler started, will run at {hour:02}:{minute:02} local time");
    loop {
        let now = Local::now();
        let Some(run_at) = next_run_time(&now, hour, minute) else {
            return Err(crate::AuditError::Config(format!(
                "cannot compute next run time for {hour:02}:{minute:02}"
            )));
        };
        let sleep_for = (run_at - now).to_std().unwrap_or_default();
        info!(next_run = %run_at.to_rfc3339(), sleep_s = sleep_for.as_secs(), "waiting for next run");
        std::thread::sleep(sleep_for);

        let started = Local::now();
        info!(at = %started.to_rfc3339(), "daily run triggered");
        run_day(config, started.weekday(), runner);
        info!(at = %Local::now().to_rfc3339(), "daily run completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuditError, FileConfig};
    use chrono::{FixedOffset, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn config(max_parallel: usize) -> AuditConfig {
        let mut file = FileConfig::default();
        file.schedule = Some(crate::ScheduleConfig {
            hour: 1,
            minute: 0,
            max_parallel,
        });
        AuditConfig::from_file_config(file).unwrap()
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn ok_summary() -> AuditResult<AuditSummary> {
        Ok(AuditSummary::default())
    }

    #[test]
    fn failures_and_panics_are_captured() {
        let cfg = config(1);
        let runner = |tag: &str| -> AuditResult<AuditSummary> {
            match tag {
                "mp" => Err(AuditError::Discovery("base missing".into())),
                "tr" => panic!("boom"),
                _ => ok_summary(),
            }
        };
        let outcomes = run_subsystems(&tags(&["bp", "mp", "tr", "bl"]), 1, &cfg, &runner);
        let statuses: Vec<bool> = outcomes.iter().map(|o| o.succeeded()).collect();
        assert_eq!(statuses, vec![true, false, false, true]);
        assert_eq!(outcomes[0].name, "BPM");
        assert!(matches!(&outcomes[2].status, RunStatus::Failed(msg) if msg.contains("boom")));
    }

    #[test]
    fn unreadable_manifests_fail_the_subsystem() {
        let runner = |_: &str| -> AuditResult<AuditSummary> {
            Ok(AuditSummary {
                manifest_failures: vec![crate::ManifestFailure {
                    path: "/nonexistent/x.archive".into(),
                    message: "cannot read manifest".into(),
                }],
                ..AuditSummary::default()
            })
        };
        let outcome = check_subsystem("bp", "BPM", &runner);
        assert!(!outcome.succeeded());
        assert!(matches!(&outcome.status, RunStatus::Failed(msg) if msg.contains("1 manifest")));
    }

    #[test]
    fn parallel_runs_are_bounded_and_ordered() {
        let cfg = config(2);
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let seen = Mutex::new(Vec::new());
        let runner = |tag: &str| -> AuditResult<AuditSummary> {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            seen.lock().unwrap().push(tag.to_string());
            active.fetch_sub(1, Ordering::SeqCst);
            ok_summary()
        };
        let input = tags(&["ws", "im", "mg", "gd", "pp"]);
        let outcomes = run_subsystems(&input, 2, &cfg, &runner);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(seen.lock().unwrap().len(), 5);
        let order: Vec<&str> = outcomes.iter().map(|o| o.subsystem.as_str()).collect();
        assert_eq!(order, vec!["ws", "im", "mg", "gd", "pp"]);
    }

    #[test]
    fn run_day_uses_the_day_table() {
        let mut file = FileConfig::default();
        let mut days = BTreeMap::new();
        days.insert("Wednesday".to_string(), tags(&["va"]));
        days.insert("Thursday".to_string(), vec![]);
        file.subsystems_by_day = days;
        let cfg = AuditConfig::from_file_config(file).unwrap();
        let calls = Mutex::new(Vec::new());
        let runner = |tag: &str| -> AuditResult<AuditSummary> {
            calls.lock().unwrap().push(tag.to_string());
            ok_summary()
        };
        assert_eq!(run_day(&cfg, Weekday::Wed, &runner).len(), 1);
        assert!(run_day(&cfg, Weekday::Thu, &runner).is_empty());
        assert_eq!(*calls.lock().unwrap(), vec!["va"]);
    }

    #[test]
    fn next_run_is_later_today_or_tomorrow() {
        let tz = FixedOffset::west_opt(8 * 3600).unwrap();
        let before = tz.with_ymd_and_hms(2025, 3, 3, 0, 30, 0).unwrap();
        assert_eq!(
            next_run_time(&before, 1, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 3, 3, 1, 0, 0).unwrap()
        );
        let exactly = tz.with_ymd_and_hms(2025, 3, 3, 1, 0, 0).unwrap();
        assert_eq!(
            next_run_time(&exactly, 1, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 3, 4, 1, 0, 0).unwrap()
        );
        let late = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(
            next_run_time(&late, 1, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn daily_request_targets_failure_complement() {
        let cfg = config(1);
        let request = subsystem_request(&cfg, "bp").unwrap();
        assert!(request.criteria.statuses().is_empty());
        assert_eq!(request.criteria.excluded_statuses(), ["Being archived"]);
        assert!(request.criteria.fields().last_event);
        let record = |status: &str| crate::StatusRecord {
            pv_name: "PV:A".into(),
            status: Some(status.into()),
            ..crate::StatusRecord::default()
        };
        for status in ["Appliance assigned", "Initial sampling", "Paused", "Not being archived"] {
            assert!(crate::record_matches(&record(status), &request.criteria), "{status}");
        }
        assert!(!crate::record_matches(&record("Being archived"), &request.criteria));
        assert_eq!(request.report_path, Some(cfg.report_path_for("bp")));
        assert!(matches!(
            request.source,
            ManifestSource::Subsystem { ref tag, area: None } if tag == "bp"
        ));
    }
}
