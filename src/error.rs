//! Error taxonomy for volume lifecycle operations.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::provider::{BlockDeviceId, ProviderError, ResourceKind};

/// Errors raised by the attachment manager, waiter and device resolver.
///
/// The first four variants are the lifecycle taxonomy callers branch on.
/// Provider failures are passed through untouched so transport retry policy
/// stays with the caller.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BlockDeviceError {
    /// Raised when a volume stayed in a transient state past the timeout.
    #[error("timed out after {elapsed:?} waiting on volume {volume_id}")]
    Timeout {
        /// Volume being waited on.
        volume_id: String,
        /// Time spent waiting, measured on the injected clock.
        elapsed: Duration,
    },
    /// Raised when a volume left the expected path of states.
    #[error("volume {volume_id} reached unexpected state {observed}")]
    UnexpectedState {
        /// Volume being waited on.
        volume_id: String,
        /// Status that was neither desired nor transient.
        observed: String,
    },
    /// Raised when an operation needs an attachment and there is none.
    #[error("volume {volume_id} is not attached")]
    UnattachedVolume {
        /// Volume identifier.
        volume_id: String,
    },
    /// Raised when the provider does not know the volume, or it belongs to
    /// another cluster.
    #[error("unknown volume {volume_id}")]
    UnknownVolume {
        /// Volume identifier.
        volume_id: String,
    },
    /// Raised when this node cannot be matched to exactly one compute
    /// instance.
    #[error("cannot identify the local compute instance: {reason}")]
    UnknownInstance {
        /// Why discovery failed.
        reason: String,
    },
    /// Raised when the caller supplies an unusable argument.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when the local device namespace cannot be read.
    #[error("failed to inspect {path}: {message}")]
    Device {
        /// Path being inspected.
        path: Utf8PathBuf,
        /// I/O error message.
        message: String,
    },
    /// Provider failure other than a missing resource.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl BlockDeviceError {
    /// Returns `true` for the "already absent" conditions that best-effort
    /// cleanup treats as success.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        matches!(
            self,
            Self::UnattachedVolume { .. } | Self::UnknownVolume { .. }
        )
    }
}

/// Maps a provider failure on a volume lookup, turning a missing volume into
/// [`BlockDeviceError::UnknownVolume`].
pub(crate) fn volume_lookup_error(volume_id: &BlockDeviceId, err: ProviderError) -> BlockDeviceError {
    match err {
        ProviderError::NotFound {
            resource: ResourceKind::Volume,
            ..
        } => BlockDeviceError::UnknownVolume {
            volume_id: volume_id.to_string(),
        },
        other => BlockDeviceError::Provider(other),
    }
}

/// Swallows [`BlockDeviceError::UnattachedVolume`] and
/// [`BlockDeviceError::UnknownVolume`], propagating every other error.
///
/// # Errors
///
/// Returns the original error when it is not an absent-resource condition.
pub fn ignore_absent<T>(result: Result<T, BlockDeviceError>) -> Result<Option<T>, BlockDeviceError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_absent() => {
            tracing::warn!(error = %err, "ignoring absent resource during cleanup");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
