use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info};

use super::{AuditError, AuditResult, Finding, Report};

/// Read a persisted report. A missing file is an empty report; an unreadable
/// or unparseable one is an error so that it is never overwritten.
pub(crate) fn load_report(path: &Path) -> AuditResult<Report> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Report::new()),
        Err(source) => {
            return Err(AuditError::ReportRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if text.trim().is_empty() {
        return Ok(Report::new());
    }
    serde_yaml::from_str::<Option<Report>>(&text)
        .map(Option::unwrap_or_default)
        .map_err(|e| AuditError::ReportParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Append-by-key: existing findings keep their position, new ones go after
/// them, unseen keys are inserted. Nothing is removed or deduplicated.
pub(crate) fn merge_reports(existing: &mut Report, new: Report) {
    for (key, findings) in new {
        existing.entry(key).or_default().extend(findings);
    }
}

/// Write the whole report through a temporary file and rename it into place.
pub(crate) fn save_report(path: &Path, report: &Report) -> AuditResult<()> {
    let write_err = |source: std::io::Error| AuditError::ReportWrite {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let yaml = serde_yaml::to_string(report).map_err(|e| {
        write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    let tmp = path.with_extension("yaml.tmp");
    let mut file = fs::File::create(&tmp).map_err(write_err)?;
    file.write_all(yaml.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

/// Read-modify-write merge of `new` into the report at `path`. Not safe
/// against concurrent writers to the same path.
pub(crate) fn merge_report_file(path: &Path, new: Report) -> AuditResult<Report> {
    let mut report = load_report(path)?;
    let before = report.values().map(Vec::len).sum::<usize>();
    merge_reports(&mut report, new);
    let after = report.values().map(Vec::len).sum::<usize>();
    save_report(path, &report)?;
    info!(
        report = %path.display(),
        keys = report.len(),
        added = after - before,
        total = after,
        "report merged"
    );
    Ok(report)
}

/// PV names across the whole report, in key order then list order. Names
/// containing `?` are skipped; with `status_filter`, only findings whose
/// status contains it are kept.
pub(crate) fn extract_pvs(report: &Report, status_filter: Option<&str>) -> Vec<String> {
    report
        .values()
        .flatten()
        .filter(|finding: &&Finding| !finding.pv_name.contains('?'))
        .filter(|finding| status_filter.is_none_or(|needle| finding.status().contains(needle)))
        .map(|finding| finding.pv_name.clone())
        .collect()
}

pub(crate) fn write_pv_list(path: &Path, pvs: &[String]) -> AuditResult<()> {
    let write_err = |source: std::io::Error| AuditError::ReportWrite {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::create(path).map_err(write_err)?;
    for pv in pvs {
        writeln!(file, "{pv}").map_err(write_err)?;
    }
    debug!(path = %path.display(), count = pvs.len(), "PV list written");
    Ok(())
}
