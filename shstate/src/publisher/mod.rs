use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::{trace, warn};

use crate::codec;
use crate::sync::{sleep_with_stop, EngineShared};
use crate::ShstateError;

/// Writes snapshots of the local record into the region.
///
/// One instance runs as the auto-publish worker; the engine holds another
/// for explicit publishes. Both funnel through [`install`], which is the
/// only place the region is written.
///
/// [`install`]: Publisher::install
pub(crate) struct Publisher<T> {
    shared: Arc<EngineShared<T>>,
}

impl<T: Serialize> Publisher<T> {
    pub(crate) fn new(shared: Arc<EngineShared<T>>) -> Publisher<T> {
        Publisher { shared }
    }

    /// Explicit publish: encode the current record and install it as a new
    /// version, whether or not it changed since the last publish.
    pub(crate) fn publish(&self) -> Result<u32, ShstateError> {
        let encoded = {
            let record = self.shared.record.lock()?;
            codec::encode(&*record)?
        };
        self.install(&encoded)
    }

    /// One auto-publish tick. Encoding and hashing happen without the
    /// advisory lock; an unchanged digest means no write at all. Mutations
    /// between two ticks coalesce into a single publish of the latest
    /// snapshot.
    fn tick(&self) -> Result<(), ShstateError> {
        let encoded = {
            let record = self.shared.record.lock()?;
            codec::encode(&*record)?
        };
        let current = codec::digest(&encoded);
        if self.shared.last_digest.lock()?.as_ref() == Some(&current) {
            trace!("record unchanged since last publish; skipping tick");
            return Ok(());
        }
        self.install(&encoded)?;
        Ok(())
    }

    /// Installs `encoded` under the advisory lock: payload bytes first, then
    /// the version bump with release ordering, then a flush of the mapping.
    /// A peer that observes the new version is guaranteed the matching
    /// payload bytes.
    fn install(&self, encoded: &[u8]) -> Result<u32, ShstateError> {
        let mut region_guard = self.shared.region.lock()?;
        let region = region_guard.as_mut().ok_or(ShstateError::Closed)?;
        let _lock = region.lock_exclusive()?;

        region.write_payload(encoded)?;
        // The version read under the exclusive lock is authoritative. Basing
        // the bump on it keeps the counter strictly monotonic even when this
        // engine has not yet polled a peer's publish.
        let next = region.version().wrapping_add(1);
        region.set_version(next);
        region.flush()?;

        self.shared.local_version.store(next, Ordering::Release);
        *self.shared.last_digest.lock()? = Some(codec::digest(encoded));
        trace!(version = next, bytes = encoded.len(), "published snapshot");
        Ok(next)
    }

    /// Auto-publish worker loop. Tick errors are logged and retried on the
    /// next tick; the loop exits only on shutdown.
    pub(crate) fn run(self) {
        loop {
            sleep_with_stop(&self.shared.stop, &self.shared.publish_interval_ms);
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }
            if let Err(err) = self.tick() {
                warn!(error = %err, "auto-publish tick failed");
            }
        }
    }
}
