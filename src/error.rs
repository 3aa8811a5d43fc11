use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub(crate) type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub(crate) enum AuditError {
    #[error("cannot read manifest {path}: {source}")]
    ManifestIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed manifest {path} line {line}: {reason}")]
    MalformedManifest {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("manifest discovery failed: {0}")]
    Discovery(String),

    #[error("status request for {pv} failed: {message}")]
    Transport { pv: String, message: String },

    #[error("archiver returned HTTP {code} for {pv}: {body}")]
    HttpStatus { pv: String, code: u16, body: String },

    #[error("unreadable archiver response for {pv}: {message}")]
    MalformedResponse { pv: String, message: String },

    #[error("cannot read report {path}: {source}")]
    ReportRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("report {path} is not a valid report: {message}")]
    ReportParse { path: PathBuf, message: String },

    #[error("cannot write report {path}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown archiver mode '{0}' (expected dev, lcls, cryo or facet)")]
    UnknownArchiverMode(String),

    #[error("invalid filter criteria: {0}")]
    InvalidCriteria(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AuditError {
    /// Configuration problems are detected before any network call and map to
    /// a distinct exit status.
    pub(crate) fn is_configuration(&self) -> bool {
        matches!(
            self,
            AuditError::UnknownArchiverMode(_)
                | AuditError::InvalidCriteria(_)
                | AuditError::Config(_)
                | AuditError::Discovery(_)
        )
    }
}
