use tracing::{debug, warn};

use super::{
    ConnectivityProbe, FilterCriteria, FilterOutcome, Finding, PvFailure, StatusRecord,
    StatusSource,
};

/// Record-level predicate: status set, excluded statuses, lastEvent
/// substring and archiver connection state, ANDed. The live probe is applied separately.
pub(crate) fn record_matches(record: &StatusRecord, criteria: &FilterCriteria) -> bool {
    let statuses = criteria.statuses();
    if !statuses.is_empty() {
        let Some(status) = record.status.as_deref() else {
            return false;
        };
        if !statuses.iter().any(|wanted| wanted == status) {
            return false;
        }
    }

    if let Some(status) = record.status.as_deref() {
        if criteria.excluded_statuses().iter().any(|skip| skip == status) {
            return false;
        }
    }

    if let Some(needle) = criteria.last_event() {
        match record.last_event.as_deref() {
            Some(last_event) if last_event.contains(needle) => {}
            _ => return false,
        }
    }

    if let Some(wanted) = criteria.connection_state() {
        if record.is_connected() != Some(wanted) {
            return false;
        }
    }

    true
}

/// Query every PV in order and keep the ones that pass the criteria.
///
/// Each occurrence of a PV name is queried and filtered on its own, so
/// duplicates in the input show up as duplicate findings. A failed query is
/// recorded in `failures` and the remaining PVs are still processed.
pub(crate) fn filter_all(
    pv_names: &[String],
    criteria: &FilterCriteria,
    source: &dyn StatusSource,
    probe: Option<&dyn ConnectivityProbe>,
) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();

    for pv in pv_names {
        outcome.queried += 1;
        let record = match source.pv_status(pv) {
            Ok(record) => record,
            Err(err) => {
                warn!(pv = %pv, error = %err, "status query failed");
                outcome.failures.push(PvFailure {
                    pv_name: pv.clone(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        if !record_matches(&record, criteria) {
            continue;
        }

        if criteria.disconnected_only() {
            let Some(probe) = probe else {
                outcome.failures.push(PvFailure {
                    pv_name: pv.clone(),
                    message: "disconnected-only filter requested without a probe".into(),
                });
                continue;
            };
            match probe.is_connected(pv) {
                Ok(true) => {
                    debug!(pv = %pv, "live PV is connected, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(pv = %pv, error = %err, "connectivity probe failed");
                    outcome.failures.push(PvFailure {
                        pv_name: pv.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            }
        }

        outcome
            .findings
            .push(Finding::from_record(pv, &record, criteria.fields()));
    }

    outcome
}
