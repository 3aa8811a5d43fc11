use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use super::{AuditError, AuditResult};

pub(crate) const STATUS_BEING_ARCHIVED: &str = "Being archived";
pub(crate) const STATUS_PAUSED: &str = "Paused";
pub(crate) const STATUS_NOT_BEING_ARCHIVED: &str = "Not being archived";

/// One element of the `getPVStatus` response array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StatusRecord {
    #[serde(rename = "pvName", default)]
    pub(crate) pv_name: String,
    #[serde(default)]
    pub(crate) status: Option<String>,
    #[serde(rename = "lastEvent", default)]
    pub(crate) last_event: Option<String>,
    #[serde(
        rename = "connectionState",
        default,
        deserialize_with = "deserialize_loose_string"
    )]
    pub(crate) connection_state: Option<String>,
}

impl StatusRecord {
    /// The archiver reports connection state as "true"/"false" text.
    pub(crate) fn is_connected(&self) -> Option<bool> {
        self.connection_state
            .as_deref()
            .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            })
    }
}

fn deserialize_loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Operator-facing status keyword, expanded into a status set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum StatusKeyword {
    #[value(name = "Archived")]
    Archived,
    #[value(name = "Unarchived")]
    Unarchived,
    #[value(name = "Paused")]
    Paused,
    #[value(name = "UnarchivedPaused", alias = "UP")]
    UnarchivedPaused,
    #[value(name = "All")]
    All,
}

impl StatusKeyword {
    pub(crate) fn statuses(self) -> Vec<String> {
        let names: &[&str] = match self {
            StatusKeyword::Archived => &[STATUS_BEING_ARCHIVED],
            StatusKeyword::Unarchived => &[STATUS_NOT_BEING_ARCHIVED],
            StatusKeyword::Paused => &[STATUS_PAUSED],
            StatusKeyword::UnarchivedPaused => &[STATUS_PAUSED, STATUS_NOT_BEING_ARCHIVED],
            StatusKeyword::All => &[
                STATUS_BEING_ARCHIVED,
                STATUS_PAUSED,
                STATUS_NOT_BEING_ARCHIVED,
            ],
        };
        names.iter().map(|s| s.to_string()).collect()
    }
}

/// Which optional record fields are copied into each Finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FindingFields {
    pub(crate) last_event: bool,
    pub(crate) connection_state: bool,
}

impl FindingFields {
    pub(crate) fn any(&self) -> bool {
        self.last_event || self.connection_state
    }
}

/// Immutable filter configuration for one run. Unset optional fields mean
/// "don't filter on this"; an empty status set matches every status.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FilterCriteria {
    statuses: Vec<String>,
    excluded_statuses: Vec<String>,
    last_event: Option<String>,
    connection_state: Option<bool>,
    disconnected_only: bool,
    fields: FindingFields,
}

impl FilterCriteria {
    pub(crate) fn new(
        statuses: Vec<String>,
        last_event: Option<String>,
        connection_state: Option<bool>,
        disconnected_only: bool,
        fields: FindingFields,
    ) -> AuditResult<Self> {
        if statuses.iter().any(|s| s.trim().is_empty()) {
            return Err(AuditError::InvalidCriteria(
                "status names must not be blank".into(),
            ));
        }
        if last_event.as_deref().is_some_and(str::is_empty) {
            return Err(AuditError::InvalidCriteria(
                "lastEvent filter must not be empty".into(),
            ));
        }
        let fields = FindingFields {
            last_event: fields.last_event || last_event.is_some(),
            connection_state: fields.connection_state || connection_state.is_some(),
        };
        Ok(Self {
            statuses,
            excluded_statuses: Vec::new(),
            last_event,
            connection_state,
            disconnected_only,
            fields,
        })
    }

    /// Reject records whose status is one of `statuses`, e.g. everything
    /// except "Being archived". A status may not be both kept and excluded.
    pub(crate) fn excluding(mut self, statuses: Vec<String>) -> AuditResult<Self> {
        if statuses.iter().any(|s| s.trim().is_empty()) {
            return Err(AuditError::InvalidCriteria(
                "excluded status names must not be blank".into(),
            ));
        }
        if let Some(both) = statuses.iter().find(|s| self.statuses.contains(*s)) {
            return Err(AuditError::InvalidCriteria(format!(
                "status '{both}' is both selected and excluded"
            )));
        }
        self.excluded_statuses = statuses;
        Ok(self)
    }

    pub(crate) fn statuses(&self) -> &[String] {
        &self.statuses
    }

    pub(crate) fn excluded_statuses(&self) -> &[String] {
        &self.excluded_statuses
    }

    pub(crate) fn last_event(&self) -> Option<&str> {
        self.last_event.as_deref()
    }

    pub(crate) fn connection_state(&self) -> Option<bool> {
        self.connection_state
    }

    pub(crate) fn disconnected_only(&self) -> bool {
        self.disconnected_only
    }

    pub(crate) fn fields(&self) -> FindingFields {
        self.fields
    }
}

/// Detail half of a Finding. Plain form is `{pv: status}`; the detailed form
/// keeps unknown keys so that older reports survive a merge untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum FindingDetail {
    Status(String),
    Fields(FindingRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct FindingRecord {
    pub(crate) status: String,
    #[serde(rename = "lastEvent", default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_event: Option<String>,
    #[serde(
        rename = "connectionState",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) connection_state: Option<String>,
    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Finding {
    pub(crate) pv_name: String,
    pub(crate) detail: FindingDetail,
}

impl Finding {
    pub(crate) fn from_record(pv: &str, record: &StatusRecord, fields: FindingFields) -> Self {
        let status = record.status.clone().unwrap_or_default();
        let detail = if fields.any() {
            FindingDetail::Fields(FindingRecord {
                status,
                last_event: fields
                    .last_event
                    .then(|| record.last_event.clone())
                    .flatten(),
                connection_state: fields
                    .connection_state
                    .then(|| record.connection_state.clone())
                    .flatten(),
                extra: BTreeMap::new(),
            })
        } else {
            FindingDetail::Status(status)
        };
        Self {
            pv_name: pv.to_string(),
            detail,
        }
    }

    pub(crate) fn status(&self) -> &str {
        match &self.detail {
            FindingDetail::Status(status) => status,
            FindingDetail::Fields(record) => &record.status,
        }
    }

    pub(crate) fn last_event(&self) -> Option<&str> {
        match &self.detail {
            FindingDetail::Status(_) => None,
            FindingDetail::Fields(record) => record.last_event.as_deref(),
        }
    }

    pub(crate) fn connection_state(&self) -> Option<&str> {
        match &self.detail {
            FindingDetail::Status(_) => None,
            FindingDetail::Fields(record) => record.connection_state.as_deref(),
        }
    }
}

impl Serialize for Finding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.pv_name, &self.detail)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Finding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = BTreeMap::<String, FindingDetail>::deserialize(deserializer)?;
        if entries.len() != 1 {
            return Err(de::Error::custom(format!(
                "finding must be a single-key mapping, found {} keys",
                entries.len()
            )));
        }
        let Some((pv_name, detail)) = entries.into_iter().next() else {
            return Err(de::Error::custom("empty finding"));
        };
        Ok(Self { pv_name, detail })
    }
}

/// Manifest key (source file name) to the findings recorded under it.
pub(crate) type Report = BTreeMap<String, Vec<Finding>>;

/// A query that failed for one PV; recorded instead of a Finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PvFailure {
    pub(crate) pv_name: String,
    pub(crate) message: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FilterOutcome {
    pub(crate) findings: Vec<Finding>,
    pub(crate) failures: Vec<PvFailure>,
    pub(crate) queried: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ManifestFailure {
    pub(crate) path: PathBuf,
    pub(crate) message: String,
}

#[derive(Debug, Default)]
pub(crate) struct AuditSummary {
    pub(crate) manifests: usize,
    pub(crate) pvs_queried: usize,
    pub(crate) findings: Report,
    pub(crate) pv_failures: Vec<PvFailure>,
    pub(crate) manifest_failures: Vec<ManifestFailure>,
}

impl AuditSummary {
    pub(crate) fn finding_count(&self) -> usize {
        self.findings.values().map(Vec::len).sum()
    }

    /// Some manifest in the run could not be read, so the audit is incomplete.
    pub(crate) fn has_manifest_failures(&self) -> bool {
        !self.manifest_failures.is_empty()
    }
}

impl fmt::Display for AuditSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} manifests, {} PVs queried, {} findings, {} PV failures, {} manifest failures",
            self.manifests,
            self.pvs_queried,
            self.finding_count(),
            self.pv_failures.len(),
            self.manifest_failures.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_record_parses_archiver_payload() {
        let raw = r#"{"pvName":"BPM:X1:RBV","status":"Paused","lastEvent":"Mar/01/2025 10:00:00 -08:00","connectionState":"false"}"#;
        let record: StatusRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.pv_name, "BPM:X1:RBV");
        assert_eq!(record.status.as_deref(), Some("Paused"));
        assert_eq!(record.is_connected(), Some(false));
    }

    #[test]
    fn status_record_accepts_boolean_connection_state() {
        let raw = r#"{"pvName":"A","status":"Being archived","connectionState":true}"#;
        let record: StatusRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.connection_state.as_deref(), Some("true"));
        assert_eq!(record.is_connected(), Some(true));
    }

    #[test]
    fn keyword_expansion() {
        assert_eq!(StatusKeyword::Paused.statuses(), vec!["Paused"]);
        assert_eq!(
            StatusKeyword::UnarchivedPaused.statuses(),
            vec!["Paused", "Not being archived"]
        );
        assert_eq!(StatusKeyword::All.statuses().len(), 3);
    }

    #[test]
    fn criteria_rejects_blank_status() {
        let err = FilterCriteria::new(vec![" ".into()], None, None, false, FindingFields::default());
        assert!(matches!(err, Err(AuditError::InvalidCriteria(_))));
    }

    #[test]
    fn criteria_filters_select_their_fields() {
        let criteria = FilterCriteria::new(
            vec![],
            Some("3/1/25".into()),
            Some(false),
            false,
            FindingFields::default(),
        )
        .unwrap();
        assert!(criteria.fields().last_event);
        assert!(criteria.fields().connection_state);
    }

    #[test]
    fn exclusion_is_validated() {
        let base = || {
            FilterCriteria::new(
                StatusKeyword::Paused.statuses(),
                None,
                None,
                false,
                FindingFields::default(),
            )
            .unwrap()
        };
        assert!(matches!(
            base().excluding(vec!["Paused".into()]),
            Err(AuditError::InvalidCriteria(_))
        ));
        assert!(matches!(
            base().excluding(vec!["".into()]),
            Err(AuditError::InvalidCriteria(_))
        ));
        let criteria = base().excluding(vec![STATUS_BEING_ARCHIVED.into()]).unwrap();
        assert_eq!(criteria.excluded_statuses(), ["Being archived"]);
    }

    #[test]
    fn plain_finding_serializes_as_single_key_map() {
        let record = StatusRecord {
            pv_name: "PV:A".into(),
            status: Some("Paused".into()),
            ..StatusRecord::default()
        };
        let finding = Finding::from_record("PV:A", &record, FindingFields::default());
        let value = serde_yaml::to_value(&finding).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("PV:A").and_then(|v| v.as_str()), Some("Paused"));
    }

    #[test]
    fn detailed_finding_keeps_unknown_keys() {
        let yaml = "PV:A:\n  status: Paused\n  lastEvent: yesterday\n  connected pv: false\n";
        let finding: Finding = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(finding.status(), "Paused");
        assert_eq!(finding.last_event(), Some("yesterday"));
        let FindingDetail::Fields(record) = &finding.detail else {
            panic!("expected detailed finding");
        };
        assert!(record.extra.contains_key("connected pv"));
        let again: Finding = serde_yaml::from_str(&serde_yaml::to_string(&finding).unwrap()).unwrap();
        assert_eq!(again, finding);
    }

    #[test]
    fn finding_with_two_keys_is_rejected() {
        let yaml = "PV:A: Paused\nPV:B: Paused\n";
        assert!(serde_yaml::from_str::<Finding>(yaml).is_err());
    }
}
