use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{AuditError, AuditResult, StatusRecord};

/// Named archiver deployments. The endpoint table is closed; anything else is
/// a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum ArchiverMode {
    Dev,
    Lcls,
    Cryo,
    Facet,
}

impl ArchiverMode {
    pub(crate) fn host(self) -> &'static str {
        match self {
            ArchiverMode::Dev => "http://dev-archapp.slac.stanford.edu",
            ArchiverMode::Lcls => "http://lcls-archapp.slac.stanford.edu",
            ArchiverMode::Cryo => "http://cryo-archapp.slac.stanford.edu:17665",
            ArchiverMode::Facet => "http://facet-archapp.slac.stanford.edu",
        }
    }

    pub(crate) fn management_url(self) -> String {
        format!("{}/mgmt/bpl/", self.host())
    }
}

impl fmt::Display for ArchiverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiverMode::Dev => "dev",
            ArchiverMode::Lcls => "lcls",
            ArchiverMode::Cryo => "cryo",
            ArchiverMode::Facet => "facet",
        };
        f.write_str(name)
    }
}

impl FromStr for ArchiverMode {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(ArchiverMode::Dev),
            "lcls" => Ok(ArchiverMode::Lcls),
            "cryo" => Ok(ArchiverMode::Cryo),
            "facet" => Ok(ArchiverMode::Facet),
            _ => Err(AuditError::UnknownArchiverMode(s.to_string())),
        }
    }
}

/// Source of live archiver status for a single PV.
pub(crate) trait StatusSource: Sync {
    fn pv_status(&self, pv: &str) -> AuditResult<StatusRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SamplingMethod {
    Monitor,
    Scan,
}

impl SamplingMethod {
    fn as_str(self) -> &'static str {
        match self {
            SamplingMethod::Monitor => "MONITOR",
            SamplingMethod::Scan => "SCAN",
        }
    }
}

impl FromStr for SamplingMethod {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MONITOR" => Ok(SamplingMethod::Monitor),
            "SCAN" => Ok(SamplingMethod::Scan),
            other => Err(AuditError::Config(format!(
                "sampling method must be MONITOR or SCAN, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DisconnectedEntry {
    #[serde(rename = "pvName")]
    pv_name: String,
}

/// Blocking client for the archiver management API (`/mgmt/bpl/`).
pub(crate) struct ArchiverClient {
    base: Url,
    agent: ureq::Agent,
}

impl ArchiverClient {
    pub(crate) fn new(mode: ArchiverMode, timeout: Option<Duration>) -> AuditResult<Self> {
        Self::with_base(&mode.management_url(), timeout)
    }

    pub(crate) fn with_base(base: &str, timeout: Option<Duration>) -> AuditResult<Self> {
        let mut normalized = base.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized)
            .map_err(|e| AuditError::Config(format!("invalid archiver url '{base}': {e}")))?;
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base,
            agent: builder.build(),
        })
    }

    pub(crate) fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, name: &str) -> AuditResult<Url> {
        self.base
            .join(name)
            .map_err(|e| AuditError::Config(format!("invalid endpoint {name}: {e}")))
    }

    /// One GET against a management endpoint, with the subject PV (or the
    /// endpoint name) used to label errors.
    fn get(&self, name: &str, subject: &str, params: &[(&str, &str)]) -> AuditResult<ureq::Response> {
        let url = self.endpoint(name)?;
        let mut request = self.agent.get(url.as_str());
        for (key, value) in params {
            request = request.query(key, value);
        }
        debug!(endpoint = name, subject = %subject, "archiver request");
        match request.call() {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(AuditError::HttpStatus {
                    pv: subject.to_string(),
                    code,
                    body: body.trim().to_string(),
                })
            }
            Err(err) => Err(AuditError::Transport {
                pv: subject.to_string(),
                message: err.to_string(),
            }),
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        subject: &str,
        params: &[(&str, &str)],
    ) -> AuditResult<T> {
        self.get(name, subject, params)?
            .into_json::<T>()
            .map_err(|e| AuditError::MalformedResponse {
                pv: subject.to_string(),
                message: e.to_string(),
            })
    }

    pub(crate) fn paused_pvs(&self) -> AuditResult<Vec<String>> {
        let values: Vec<serde_json::Value> =
            self.get_json("getPausedPVsForThisAppliance", "getPausedPVsForThisAppliance", &[])?;
        Ok(values
            .into_iter()
            .filter_map(|value| match value {
                serde_json::Value::String(name) => Some(name),
                other => other
                    .get("pvName")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
            .collect())
    }

    pub(crate) fn disconnected_pvs(&self) -> AuditResult<Vec<String>> {
        let entries: Vec<DisconnectedEntry> =
            self.get_json("getCurrentlyDisconnectedPVs", "getCurrentlyDisconnectedPVs", &[])?;
        let mut names: Vec<String> = entries.into_iter().map(|e| e.pv_name).collect();
        names.sort();
        Ok(names)
    }

    pub(crate) fn pause_pv(&self, pv: &str) -> AuditResult<String> {
        let resp = self.get("pauseArchivingPV", pv, &[("pv", pv)])?;
        Ok(resp.into_string().unwrap_or_default())
    }

    pub(crate) fn resume_pv(&self, pv: &str) -> AuditResult<String> {
        let resp = self.get("resumeArchivingPV", pv, &[("pv", pv)])?;
        Ok(resp.into_string().unwrap_or_default())
    }

    pub(crate) fn change_archival_parameters(
        &self,
        pv: &str,
        sampling_period: f64,
        method: SamplingMethod,
    ) -> AuditResult<String> {
        if !(sampling_period.is_finite() && sampling_period > 0.0) {
            return Err(AuditError::Config(format!(
                "sampling period must be positive, got {sampling_period}"
            )));
        }
        let period = sampling_period.to_string();
        let resp = self.get(
            "changeArchivalParameters",
            pv,
            &[
                ("pv", pv),
                ("samplingperiod", period.as_str()),
                ("samplingmethod", method.as_str()),
            ],
        )?;
        Ok(resp.into_string().unwrap_or_default())
    }
}

impl StatusSource for ArchiverClient {
    fn pv_status(&self, pv: &str) -> AuditResult<StatusRecord> {
        let records: Vec<StatusRecord> = self.get_json("getPVStatus", pv, &[("pv", pv)])?;
        let Some(mut record) = records.into_iter().next() else {
            warn!(pv = %pv, "archiver returned an empty status array");
            return Err(AuditError::MalformedResponse {
                pv: pv.to_string(),
                message: "empty status array".into(),
            });
        };
        if record.pv_name.is_empty() {
            record.pv_name = pv.to_string();
        }
        Ok(record)
    }
}
