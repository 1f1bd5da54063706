use serde::Serialize;

/// Failures specific to the portal transfer protocol.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("requested {requested} portal connections, at most {max} are allowed")]
    TooManyThreads { requested: usize, max: usize },
    #[error("moved {actual} bytes but the object is {expected} bytes")]
    TransferLengthMismatch { expected: u64, actual: u64 },
    #[error("bad transfer framing: {0}")]
    FramingError(String),
    #[error("portal connection to {addr} failed: {reason}")]
    ConnectionError {
        addr: std::net::SocketAddr,
        reason: String,
    },
    #[error("portal peer presented cookie {received:#010x}, expected {expected:#010x}")]
    CookieMismatch { expected: u32, received: u32 },
    #[error("chunk encryption failed: {0}")]
    Crypto(String),
}

/// Coarse error class reported to callers of the transfer API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    TooManyThreads,
    TransferLengthMismatch,
    FramingError,
    ConnectionError,
    RestartCorrupt,
    Crypto,
    Other,
}

impl ErrorKind {
    fn of(err: &TransferError) -> Self {
        match err {
            TransferError::TooManyThreads { .. } => Self::TooManyThreads,
            TransferError::TransferLengthMismatch { .. } => Self::TransferLengthMismatch,
            TransferError::FramingError(_) => Self::FramingError,
            TransferError::ConnectionError { .. } | TransferError::CookieMismatch { .. } => {
                Self::ConnectionError
            }
            TransferError::Crypto(_) => Self::Crypto,
        }
    }
}

/// Byte and chunk accounting for one transfer, kept even when the transfer fails.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub bytes_transferred: u64,
    pub chunks: u64,
    pub workers: usize,
    pub failed_workers: usize,
}

impl std::ops::Add for TransferSummary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            chunks: self.chunks + other.chunks,
            workers: self.workers + other.workers,
            failed_workers: self.failed_workers + other.failed_workers,
        }
    }
}

impl std::fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            chunks: {}\n\
            workers: {} ({} failed)\n",
            bytesize::ByteSize(self.bytes_transferred),
            self.chunks,
            self.workers,
            self.failed_workers,
        )
    }
}

/// Error returned by the transfer API.
///
/// Carries the first failure observed across all workers plus the accounting totals gathered
/// before the transfer stopped. Use `{:#}` or `{:?}` when logging to keep the whole context chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: TransferSummary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: TransferSummary) -> Self {
        Error { source, summary }
    }

    /// Classify the failure by looking through the whole cause chain.
    pub fn kind(&self) -> ErrorKind {
        for cause in self.source.chain() {
            if let Some(err) = cause.downcast_ref::<TransferError>() {
                return ErrorKind::of(err);
            }
            if let Some(common::RestartError::Corrupt { .. }) =
                cause.downcast_ref::<common::RestartError>()
            {
                return ErrorKind::RestartCorrupt;
            }
        }
        let is_io = self.source.chain().any(|cause| {
            cause.is::<std::io::Error>() || cause.is::<tokio::time::error::Elapsed>()
        });
        if is_io {
            ErrorKind::ConnectionError
        } else {
            ErrorKind::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_finds_typed_error_under_context() {
        let source = Err::<(), _>(TransferError::TransferLengthMismatch {
            expected: 10,
            actual: 9,
        })
        .context("put of /zone/obj failed")
        .unwrap_err();
        let err = Error::new(source, TransferSummary::default());
        assert_eq!(err.kind(), ErrorKind::TransferLengthMismatch);
        assert!(err.to_string().contains("moved 9 bytes"));
    }

    #[test]
    fn io_failures_are_connection_errors() {
        let source = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .context("failed to send chunk");
        let err = Error::new(source, TransferSummary::default());
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
        let err = Error::new(anyhow::anyhow!("something else"), TransferSummary::default());
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn summaries_add_up() {
        let a = TransferSummary {
            bytes_transferred: 10,
            chunks: 1,
            workers: 1,
            failed_workers: 0,
        };
        let b = TransferSummary {
            bytes_transferred: 5,
            chunks: 2,
            workers: 1,
            failed_workers: 1,
        };
        let total = a + b;
        assert_eq!(total.bytes_transferred, 15);
        assert_eq!(total.chunks, 3);
        assert_eq!(total.failed_workers, 1);
        assert!(total.to_string().contains("2 (1 failed)"));
    }
}
