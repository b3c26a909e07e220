//! # Nsx module
//!
//! This module provide the fabric-side crud layer, its object model, the
//! tagged-query api, the indexed store and the garbage collector

use std::time::Duration;

pub mod client;
pub mod gc;
pub mod model;
pub mod path;
pub mod policy;
pub mod query;
pub mod store;
pub mod subnet;
pub mod tag;
pub mod vpc;

// -----------------------------------------------------------------------------
// Constants

/// minimum supported fabric version, compared on the first three numeric
/// components
pub const MINIMUM_VERSION: [u64; 3] = [4, 1, 0];

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute request on the fabric, {0}")]
    Http(hyper::Error),
    #[error("failed to build request for the fabric, {0}")]
    Request(hyper::http::Error),
    #[error("failed to parse fabric endpoint '{0}', {1}")]
    Endpoint(String, hyper::http::uri::InvalidUri),
    #[error("failed to serialize payload for the fabric, {0}")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize payload from the fabric, {0}")]
    Deserialize(serde_json::Error),
    #[error("request to the fabric timed out after {0:?}")]
    Timeout(Duration),
    #[error("fabric answered with status {status}, {body}")]
    Status { status: u16, body: String },
    #[error("failed to read certificate authority file, {0}")]
    CertificateAuthority(std::io::Error),
    #[error("fabric version '{0}' is below the minimum supported '{1}'")]
    UnsupportedVersion(String, String),
    #[error("failed to parse fabric version '{0}'")]
    MalformedVersion(String),
    #[error("no fabric endpoint configured")]
    NoEndpoint,
    #[error("failed to parse fabric object path, {0}")]
    Path(path::Error),
}

impl From<path::Error> for Error {
    fn from(err: path::Error) -> Self {
        Self::Path(err)
    }
}

// -----------------------------------------------------------------------------
// ErrorKind enumeration

/// classification of a request result, reconcilers translate these kinds to
/// requeue decisions
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum ErrorKind {
    /// timeouts, 5xx, dropped connections and throttling, retried with
    /// backoff
    Transient,
    /// revision mismatch, the caller re-reads and re-applies
    StaleRevision,
    /// object absent, a success on delete
    NotFound,
    /// 401/403, terminal and surfaced to status
    Auth,
    /// the fabric rejected the request, terminal and surfaced to status
    InvalidRequest,
    /// programmer invariant violation, logged and retried but never panics
    /// across the reconcile boundary
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(_) | Self::Timeout(_) => ErrorKind::Transient,
            Self::Status { status, .. } => match status {
                404 => ErrorKind::NotFound,
                401 | 403 => ErrorKind::Auth,
                408 | 429 => ErrorKind::Transient,
                409 | 412 => ErrorKind::StaleRevision,
                400..=499 => ErrorKind::InvalidRequest,
                500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            Self::UnsupportedVersion(_, _)
            | Self::MalformedVersion(_)
            | Self::NoEndpoint
            | Self::CertificateAuthority(_) => ErrorKind::InvalidRequest,
            Self::Request(_) | Self::Endpoint(_, _) | Self::Serialize(_) | Self::Deserialize(_) | Self::Path(_) => {
                ErrorKind::Fatal
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

// -----------------------------------------------------------------------------
// Version gate

/// parse the first three numeric components of a fabric version string
pub fn version_components(version: &str) -> Result<[u64; 3], Error> {
    let numbers: Vec<u64> = version
        .split(['.', '-', '+'])
        .take(3)
        .map(|component| component.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| Error::MalformedVersion(version.to_string()))?;

    match numbers.as_slice() {
        [major, minor, patch] => Ok([*major, *minor, *patch]),
        _ => Err(Error::MalformedVersion(version.to_string())),
    }
}

/// refuse to run against fabric nodes below the minimum supported version
pub fn check_version(version: &str) -> Result<(), Error> {
    if version_components(version)? < MINIMUM_VERSION {
        return Err(Error::UnsupportedVersion(
            version.to_string(),
            MINIMUM_VERSION.map(|n| n.to_string()).join("."),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_should_follow_status_codes() {
        let kind = |status: u16| {
            Error::Status {
                status,
                body: String::new(),
            }
            .kind()
        };

        assert_eq!(kind(429), ErrorKind::Transient);
        assert_eq!(kind(503), ErrorKind::Transient);
        assert_eq!(kind(409), ErrorKind::StaleRevision);
        assert_eq!(kind(412), ErrorKind::StaleRevision);
        assert_eq!(kind(404), ErrorKind::NotFound);
        assert_eq!(kind(401), ErrorKind::Auth);
        assert_eq!(kind(403), ErrorKind::Auth);
        assert_eq!(kind(400), ErrorKind::InvalidRequest);
    }

    #[test]
    fn timeouts_should_be_transient() {
        assert_eq!(Error::Timeout(REQUEST_TIMEOUT).kind(), ErrorKind::Transient);
    }

    #[test]
    fn version_gate_should_compare_first_three_components() {
        assert!(check_version("4.1.0").is_ok());
        assert!(check_version("4.1.2.0.17832784").is_ok());
        assert!(check_version("5.0.0").is_ok());
        assert!(check_version("4.0.9").is_err());
        assert!(check_version("3.9.9").is_err());
    }

    #[test]
    fn malformed_versions_should_be_rejected() {
        assert!(matches!(
            check_version("four.one.zero"),
            Err(Error::MalformedVersion(_))
        ));
        assert!(matches!(check_version("4.1"), Err(Error::MalformedVersion(_))));
    }
}
