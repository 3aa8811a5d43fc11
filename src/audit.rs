use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info};

use super::{
    filter_all, manifest_key, merge_report_file, parse_manifest, resolve_manifests,
    AuditResult, AuditSummary, ConnectivityProbe, FilterCriteria, ManifestFailure,
    ManifestSource, StatusSource,
};

/// Everything one pipeline run needs besides its remote collaborators.
#[derive(Debug, Clone)]
pub(crate) struct AuditRequest {
    pub(crate) source: ManifestSource,
    pub(crate) manifest_base: PathBuf,
    pub(crate) criteria: FilterCriteria,
    pub(crate) report_path: Option<PathBuf>,
}

/// Locate, parse, query, filter and merge.
///
/// A manifest that cannot be read is recorded and skipped; a PV whose query
/// fails is recorded and skipped. Discovery and report errors abort the run.
pub(crate) fn run_audit(
    request: &AuditRequest,
    archiver: &dyn StatusSource,
    probe: Option<&dyn ConnectivityProbe>,
) -> AuditResult<AuditSummary> {
    let paths = resolve_manifests(&request.source, &request.manifest_base)?;
    info!(manifests = paths.len(), "starting audit");
    let summary = audit_manifests(&paths, &request.criteria, archiver, probe);

    if let Some(report_path) = &request.report_path {
        merge_report_file(report_path, summary.findings.clone())?;
    }
    info!(%summary, "audit finished");
    Ok(summary)
}

pub(crate) fn audit_manifests(
    paths: &[PathBuf],
    criteria: &FilterCriteria,
    archiver: &dyn StatusSource,
    probe: Option<&dyn ConnectivityProbe>,
) -> AuditSummary {
    let mut summary = AuditSummary::default();
    for (index, path) in paths.iter().enumerate() {
        let key = manifest_key(path);
        let pvs = match parse_manifest(path) {
            Ok(pvs) => pvs,
            Err(err) => {
                error!(manifest = %path.display(), error = %err, "manifest skipped");
                summary.manifest_failures.push(ManifestFailure {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        let started = Instant::now();
        info!(
            manifest = %key,
            position = index + 1,
            of = paths.len(),
            pvs = pvs.len(),
            "checking manifest"
        );
        let outcome = filter_all(&pvs, criteria, archiver, probe);
        info!(
            manifest = %key,
            findings = outcome.findings.len(),
            failures = outcome.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "manifest checked"
        );

        summary.manifests += 1;
        summary.pvs_queried += outcome.queried;
        summary.pv_failures.extend(outcome.failures);
        // Same file name under two IOC directories shares one key.
        summary
            .findings
            .entry(key)
            .or_default()
            .extend(outcome.findings);
    }
    summary
}

/// Render findings as the fixed-width table operators read on the console.
pub(crate) fn render_table(summary: &AuditSummary) -> String {
    let mut out = String::new();
    for (key, findings) in &summary.findings {
        out.push_str(&format!("--- {key} ---\n"));
        for finding in findings {
            out.push_str(&format!(
                "{:<35}  {:<18}  {:<28}  {}\n",
                finding.pv_name,
                finding.status(),
                finding.last_event().unwrap_or(""),
                finding.connection_state().unwrap_or("")
            ));
        }
    }
    for failure in &summary.pv_failures {
        out.push_str(&format!("!! {:<32}  query failed: {}\n", failure.pv_name, failure.message));
    }
    for failure in &summary.manifest_failures {
        out.push_str(&format!(
            "!! {}  manifest skipped: {}\n",
            failure.path.display(),
            failure.message
        ));
    }
    out
}

pub(crate) fn save_paths(path: &Path, manifests: &[PathBuf]) -> std::io::Result<()> {
    let text: String = manifests
        .iter()
        .map(|p| format!("{}\n", p.display()))
        .collect();
    std::fs::write(path, text)
}
