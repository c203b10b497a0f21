//! Polling loops that drive a volume to a desired provider state.
//!
//! Every poll re-fetches the volume; nothing is cached between iterations.
//! A status outside the accepted path ends the wait immediately so a genuine
//! failure is never retried into a timeout. Transient states are ordered: a
//! volume that falls back to an earlier stage after reaching a later one has
//! left the path too.

use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::error::{BlockDeviceError, volume_lookup_error};
use crate::provider::{BlockDeviceId, BlockStorageApi, ProviderError, ProviderVolume, VolumeStatus};
use crate::volume::status;

/// Describes an acceptable convergence path for a single wait.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateQuery {
    /// Status that ends the wait successfully.
    pub desired: VolumeStatus,
    /// Statuses that are normal steps on the way to `desired`, in the order
    /// the provider moves through them.
    pub transient: Vec<VolumeStatus>,
    /// Upper bound on time spent in transient states.
    pub timeout: Duration,
}

impl StateQuery {
    /// Builds a query from status names.
    #[must_use]
    pub fn new(desired: &str, transient: &[&str], timeout: Duration) -> Self {
        Self {
            desired: VolumeStatus::from(desired),
            transient: transient.iter().copied().map(VolumeStatus::from).collect(),
            timeout,
        }
    }

    /// A freshly created volume becoming usable.
    #[must_use]
    pub fn created(timeout: Duration) -> Self {
        Self::new(status::AVAILABLE, &[status::CREATING], timeout)
    }

    /// An attach call converging on `in-use`.
    #[must_use]
    pub fn attached(timeout: Duration) -> Self {
        Self::new(
            status::IN_USE,
            &[status::AVAILABLE, status::ATTACHING],
            timeout,
        )
    }

    /// A detach call converging back on `available`.
    #[must_use]
    pub fn detached(timeout: Duration) -> Self {
        Self::new(
            status::AVAILABLE,
            &[status::IN_USE, status::DETACHING],
            timeout,
        )
    }

    fn stage(&self, observed: &VolumeStatus) -> Option<usize> {
        self.transient.iter().position(|candidate| candidate == observed)
    }
}

/// Polls the block-storage plane until a volume converges.
#[derive(Clone, Debug)]
pub struct VolumeStateWaiter<K: Clock> {
    clock: K,
    poll_interval: Duration,
}

impl<K: Clock> VolumeStateWaiter<K> {
    /// Creates a waiter sleeping `poll_interval` between polls.
    #[must_use]
    pub const fn new(clock: K, poll_interval: Duration) -> Self {
        Self {
            clock,
            poll_interval,
        }
    }

    /// Returns the clock driving this waiter.
    #[must_use]
    pub const fn clock(&self) -> &K {
        &self.clock
    }

    /// Returns the interval slept between polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Waits until the volume reports `query.desired`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::UnexpectedState`] as soon as a status
    /// outside the query, or a regression to an earlier transient stage, is
    /// observed, [`BlockDeviceError::Timeout`] when the
    /// volume is still transient once `query.timeout` has elapsed,
    /// [`BlockDeviceError::UnknownVolume`] when the volume disappears, and
    /// [`BlockDeviceError::Provider`] for any other provider failure.
    pub async fn wait_for_state<B>(
        &self,
        api: &B,
        volume_id: &BlockDeviceId,
        query: &StateQuery,
    ) -> Result<ProviderVolume, BlockDeviceError>
    where
        B: BlockStorageApi + ?Sized,
    {
        let start = self.clock.now();
        let mut furthest = 0;
        loop {
            let volume = api
                .get(volume_id)
                .await
                .map_err(|err| volume_lookup_error(volume_id, err))?;
            let elapsed = self.elapsed_since(start);
            debug!(
                volume_id = %volume_id,
                status = %volume.status,
                desired = %query.desired,
                elapsed_ms = elapsed.as_millis(),
                "polled volume state"
            );

            if volume.status == query.desired {
                return Ok(volume);
            }
            match query.stage(&volume.status) {
                Some(stage) if stage >= furthest => furthest = stage,
                _ => {
                    return Err(BlockDeviceError::UnexpectedState {
                        volume_id: volume_id.to_string(),
                        observed: volume.status.to_string(),
                    });
                }
            }
            if elapsed >= query.timeout {
                return Err(BlockDeviceError::Timeout {
                    volume_id: volume_id.to_string(),
                    elapsed,
                });
            }
            self.clock.sleep(self.poll_interval).await;
        }
    }

    /// Waits until the provider no longer knows the volume.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::Timeout`] when the volume is still listed
    /// after `timeout`, [`BlockDeviceError::UnexpectedState`] when the
    /// provider reports a failed deletion, and [`BlockDeviceError::Provider`]
    /// for other provider failures.
    pub async fn wait_until_gone<B>(
        &self,
        api: &B,
        volume_id: &BlockDeviceId,
        timeout: Duration,
    ) -> Result<(), BlockDeviceError>
    where
        B: BlockStorageApi + ?Sized,
    {
        let start = self.clock.now();
        loop {
            let volume = match api.get(volume_id).await {
                Ok(volume) => volume,
                Err(ProviderError::NotFound { .. }) => return Ok(()),
                Err(err) => return Err(BlockDeviceError::Provider(err)),
            };
            let elapsed = self.elapsed_since(start);
            debug!(
                volume_id = %volume_id,
                status = %volume.status,
                elapsed_ms = elapsed.as_millis(),
                "volume still present after delete"
            );

            if volume.status == status::ERROR_DELETING {
                return Err(BlockDeviceError::UnexpectedState {
                    volume_id: volume_id.to_string(),
                    observed: volume.status.to_string(),
                });
            }
            if elapsed >= timeout {
                return Err(BlockDeviceError::Timeout {
                    volume_id: volume_id.to_string(),
                    elapsed,
                });
            }
            self.clock.sleep(self.poll_interval).await;
        }
    }

    fn elapsed_since(&self, start: Duration) -> Duration {
        self.clock.now().saturating_sub(start)
    }
}
