use std::path::PathBuf;

use droplet_blocking::Cancelled;
use droplet_resource_pool::PoolError;

use crate::descriptor::FileMode;
use crate::extractor::ExtractionError;
use crate::path_guard::EscapeError;
use crate::quota::QuotaError;
use crate::repack::PackagingError;
use crate::skeleton::SkeletonError;

/// The broad category of an [`IntakeError`], for callers that map failures to responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntakeErrorKind {
    /// A path supplied by the client tried to leave the sandbox.
    Escape,
    /// The uploaded archive could not be listed or extracted.
    Extraction,
    /// The package is larger than the configured budget.
    QuotaExceeded,
    /// The application could not be repacked.
    Packaging,
    /// A referenced resource is not in the pool.
    NotFound,
    /// The request itself is malformed.
    InvalidInput,
    /// The operation was cancelled before it completed.
    Cancelled,
    /// Reading or writing the sandbox or the pool failed.
    Io,
}

/// An error returned by [`crate::PackageIntake`].
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Escape(#[from] EscapeError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("the package is too large")]
    QuotaExceeded(#[source] QuotaError),

    #[error(transparent)]
    Packaging(#[from] PackagingError),

    #[error("resource {0} was referenced but is not in the resource pool")]
    ResourceNotFound(String),

    #[error("resource '{path}' has mode {mode}, files must be readable and writable by their owner")]
    InvalidResourceMode { path: String, mode: FileMode },

    #[error("could not prepare the destination of a resource")]
    Skeleton(#[source] SkeletonError),

    #[error("resource pool failure")]
    Pool(#[source] PoolError),

    #[error("failed to access '{}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl IntakeError {
    pub fn kind(&self) -> IntakeErrorKind {
        match self {
            IntakeError::Escape(_) => IntakeErrorKind::Escape,
            IntakeError::Extraction(ExtractionError::Cancelled(_)) => IntakeErrorKind::Cancelled,
            IntakeError::Extraction(_) => IntakeErrorKind::Extraction,
            IntakeError::QuotaExceeded(_) => IntakeErrorKind::QuotaExceeded,
            IntakeError::Packaging(PackagingError::Cancelled(_)) => IntakeErrorKind::Cancelled,
            IntakeError::Packaging(_) => IntakeErrorKind::Packaging,
            IntakeError::ResourceNotFound(_) => IntakeErrorKind::NotFound,
            IntakeError::InvalidResourceMode { .. } | IntakeError::Skeleton(_) => {
                IntakeErrorKind::InvalidInput
            }
            IntakeError::Pool(_) | IntakeError::Io { .. } => IntakeErrorKind::Io,
            IntakeError::Cancelled(_) => IntakeErrorKind::Cancelled,
        }
    }
}

impl From<PoolError> for IntakeError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NotFound(hash) => IntakeError::ResourceNotFound(hash),
            err => IntakeError::Pool(err),
        }
    }
}

impl From<QuotaError> for IntakeError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Pool(err) => err.into(),
            err => IntakeError::QuotaExceeded(err),
        }
    }
}

impl From<SkeletonError> for IntakeError {
    fn from(err: SkeletonError) -> Self {
        match err {
            SkeletonError::Escape(err) => IntakeError::Escape(err),
            err => IntakeError::Skeleton(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_pool_misses_are_not_found() {
        let err = IntakeError::from(QuotaError::Pool(PoolError::NotFound("abc".to_string())));
        assert_eq!(err.kind(), IntakeErrorKind::NotFound);
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_skeleton_escape_is_an_escape() {
        let err = IntakeError::from(SkeletonError::Escape(EscapeError::AbsolutePath(
            Path::new("/etc").to_path_buf(),
        )));
        assert_eq!(err.kind(), IntakeErrorKind::Escape);

        let err = IntakeError::from(SkeletonError::NotADirectory(PathBuf::from("a")));
        assert_eq!(err.kind(), IntakeErrorKind::InvalidInput);
    }

    #[test]
    fn test_cancellation_is_reported_as_such() {
        let err = IntakeError::from(ExtractionError::from(Cancelled));
        assert_eq!(err.kind(), IntakeErrorKind::Cancelled);
        let err = IntakeError::from(PackagingError::from(Cancelled));
        assert_eq!(err.kind(), IntakeErrorKind::Cancelled);
    }

    #[test]
    fn test_quota_message() {
        let err = IntakeError::from(QuotaError::Exceeded {
            total: 11,
            budget: 10,
        });
        assert_eq!(err.kind(), IntakeErrorKind::QuotaExceeded);
        assert_eq!(
            std::error::Error::source(&err).unwrap().to_string(),
            "package size 11 bytes exceeds the limit of 10 bytes"
        );
    }
}
