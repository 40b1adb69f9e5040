//! Server error taxonomy
//!
//! One flat error enum shared by sessions, factories and the manager.
//! `first_error` handling requires errors to be cloned and compared, so the
//! I/O variant carries the kind rather than the full `std::io::Error`.

/// Error codes surfaced through session and manager completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    /// Operation issued in a state that does not permit it.
    #[error("invalid state")]
    InvalidState,

    /// Operation canceled because the owner was stopped.
    #[error("operation aborted")]
    OperationAborted,

    /// Session saw no transfer for the configured inactivity window.
    #[error("inactivity timeout")]
    InactivityTimeout,

    /// Session storage could not be allocated.
    #[error("no memory")]
    NoMemory,

    /// Manager ran out of work (accept budget exhausted, all sessions done).
    #[error("run out of work")]
    OutOfWork,

    /// Peer half-closed the connection.
    #[error("end of stream")]
    EndOfStream,

    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_kind() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(
            ServerError::from(err),
            ServerError::Io(std::io::ErrorKind::ConnectionReset)
        );
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(ServerError::InvalidState.to_string(), "invalid state");
        assert_eq!(ServerError::OutOfWork.to_string(), "run out of work");
    }
}
