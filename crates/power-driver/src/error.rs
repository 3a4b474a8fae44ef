//! Power driver errors

use thiserror::Error;

/// Errors that can occur while talking to a management controller
#[derive(Debug, Error)]
pub enum PowerError {
    /// The BMC answered but could not act right now (busy, 5xx, timeout)
    #[error("transient BMC failure: {0}")]
    Transient(String),

    /// The BMC could not be reached at all
    #[error("BMC unreachable: {0}")]
    Unreachable(String),

    /// The BMC rejected the credentials, or none were available
    #[error("BMC authentication failed: {0}")]
    Unauthorized(String),

    /// The mechanism cannot perform the requested operation
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// The BMC answered with something we do not understand
    #[error("BMC protocol error: {0}")]
    Protocol(String),

    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Socket or subprocess error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the caller should treat a failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with backoff, within a retry budget
    Transient,
    /// Retry while the BMC grace period lasts
    Connectivity,
    /// Give up immediately
    Terminal,
}

impl PowerError {
    pub fn class(&self) -> FailureClass {
        match self {
            PowerError::Transient(_) => FailureClass::Transient,
            PowerError::Unreachable(_) | PowerError::Unauthorized(_) => FailureClass::Connectivity,
            PowerError::Unsupported(_) | PowerError::Protocol(_) => FailureClass::Terminal,
            PowerError::Http(e) => {
                if e.is_connect() {
                    FailureClass::Connectivity
                } else if e.is_decode() || e.is_builder() {
                    FailureClass::Terminal
                } else {
                    FailureClass::Transient
                }
            }
            PowerError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::HostUnreachable
                | std::io::ErrorKind::NetworkUnreachable
                | std::io::ErrorKind::AddrNotAvailable => FailureClass::Connectivity,
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => FailureClass::Terminal,
                _ => FailureClass::Transient,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(PowerError::Transient("busy".into()).class(), FailureClass::Transient);
        assert_eq!(PowerError::Unreachable("no route".into()).class(), FailureClass::Connectivity);
        assert_eq!(PowerError::Unauthorized("401".into()).class(), FailureClass::Connectivity);
        assert_eq!(PowerError::Unsupported("wol off".into()).class(), FailureClass::Terminal);
        assert_eq!(PowerError::Protocol("bad json".into()).class(), FailureClass::Terminal);
    }

    #[test]
    fn test_io_classification() {
        let missing = PowerError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.class(), FailureClass::Terminal);
        let refused = PowerError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.class(), FailureClass::Connectivity);
        let interrupted = PowerError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert_eq!(interrupted.class(), FailureClass::Transient);
    }
}
