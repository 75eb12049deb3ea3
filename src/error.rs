//! Error types for FILEIO backend operations

use crate::scsi::SenseReason;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// FILEIO backend errors
#[derive(Debug, Error)]
pub enum FileIoError {
    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Activation error: {0}")]
    Activation(#[from] ActivationError),

    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Registry error: {0}")]
    Registry(String),
}

/// Failures while bringing a configured device into the active state
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("missing dev_name= parameter")]
    MissingPath,

    #[error("missing dev_size= parameter, and no backing block device")]
    MissingSize,

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve geometry: {0}")]
    Geometry(#[source] io::Error),

    #[error("host context was detached before activation")]
    HostDetached,

    #[error("transport core rejected device: {0}")]
    Registration(String),
}

/// Failures of vectored I/O and cache flushes
#[derive(Debug, Error)]
pub enum IoError {
    #[error("transferred {actual} bytes, expected {expected}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("{0}")]
    Os(#[from] io::Error),

    #[error("flush failed: {0}")]
    Flush(#[source] io::Error),

    #[error("byte offset overflows for lba {lba} with block size {block_size}")]
    OffsetOverflow { lba: u64, block_size: u32 },

    #[error("command carries no data direction")]
    NoDataDirection,
}

impl FileIoError {
    /// Sense reason the framework should attach to the failed command
    pub fn sense_reason(&self) -> Option<SenseReason> {
        match self {
            FileIoError::Io(_) => Some(SenseReason::LogicalUnitCommunicationFailure),
            _ => None,
        }
    }

    /// Negative errno following the framework's return-code convention
    pub fn errno(&self) -> i32 {
        let raw = match self {
            FileIoError::Allocation(_) => libc::ENOMEM,
            FileIoError::Parse(_) | FileIoError::Validation(_) | FileIoError::Registry(_) => {
                libc::EINVAL
            }
            FileIoError::Activation(ActivationError::Open { source, .. })
            | FileIoError::Activation(ActivationError::Geometry(source)) => {
                source.raw_os_error().unwrap_or(libc::EINVAL)
            }
            FileIoError::Activation(_) => libc::EINVAL,
            FileIoError::Io(IoError::Os(err)) | FileIoError::Io(IoError::Flush(err)) => {
                err.raw_os_error().unwrap_or(libc::EIO)
            }
            FileIoError::Io(IoError::ShortTransfer { .. }) => libc::EINVAL,
            FileIoError::Io(_) => libc::EIO,
        };
        -raw
    }
}

/// Result type for FILEIO backend operations
pub type FileIoResult<T> = Result<T, FileIoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_to_communication_failure() {
        let err = FileIoError::from(IoError::ShortTransfer {
            expected: 4096,
            actual: 512,
        });
        assert_eq!(
            err.sense_reason(),
            Some(SenseReason::LogicalUnitCommunicationFailure)
        );
        assert_eq!(err.errno(), -libc::EINVAL);
    }

    #[test]
    fn test_errno_prefers_os_error() {
        let err = FileIoError::from(IoError::Os(io::Error::from_raw_os_error(libc::ENOSPC)));
        assert_eq!(err.errno(), -libc::ENOSPC);

        let err = FileIoError::Allocation("iovec".into());
        assert_eq!(err.errno(), -libc::ENOMEM);
        assert!(err.sense_reason().is_none());
    }
}
