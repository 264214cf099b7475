use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread;

use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::codec;
use crate::sync::{sleep_with_stop, EngineShared};
use crate::ShstateError;

/// Polls the region for version changes and applies accepted snapshots to
/// the local record.
///
/// Reads never take the advisory lock; correctness rests on the acquire
/// load of the version word and on the codec rejecting a torn payload.
pub(crate) struct Subscriber<T> {
    shared: Arc<EngineShared<T>>,
    updates: mpsc::Sender<T>,
}

impl<T> Subscriber<T>
where
    T: Clone + DeserializeOwned,
{
    pub(crate) fn new(shared: Arc<EngineShared<T>>, updates: mpsc::Sender<T>) -> Subscriber<T> {
        Subscriber { shared, updates }
    }

    fn tick(&self) -> Result<(), ShstateError> {
        let (region_version, payload) = {
            let region_guard = self.shared.region.lock()?;
            let region = match region_guard.as_ref() {
                Some(region) => region,
                None => return Ok(()),
            };
            let region_version = region.version();
            // Publishing advances local_version, so our own writes show up
            // here as equal and are never redelivered.
            if region_version == self.shared.local_version.load(Ordering::Acquire) {
                return Ok(());
            }
            // Commit the version before decoding, inside the region critical
            // section: a publish on this engine also stores local_version
            // under this mutex, so the two stores cannot interleave and the
            // counter only ever moves forward. A torn or corrupt payload is
            // skipped, and the next bump triggers another attempt.
            self.shared
                .local_version
                .store(region_version, Ordering::Release);
            (region_version, region.payload().to_vec())
        };

        match codec::decode::<T>(&payload) {
            Ok(value) => {
                {
                    let mut record = self.shared.record.lock()?;
                    *record = value.clone();
                }
                // The dispatcher is already gone during shutdown; dropping
                // the snapshot then is fine.
                let _ = self.updates.send(value);
                trace!(version = region_version, "applied peer snapshot");
                Ok(())
            }
            Err(err) => {
                warn!(
                    version = region_version,
                    error = %err,
                    "payload did not decode; waiting for the next publish"
                );
                Ok(())
            }
        }
    }

    /// Detection worker loop. Tick errors are logged and retried; the loop
    /// exits only on shutdown.
    pub(crate) fn run(self) {
        loop {
            sleep_with_stop(&self.shared.stop, &self.shared.detect_interval_ms);
            if self.shared.stop.load(Ordering::Acquire) {
                break;
            }
            if let Err(err) = self.tick() {
                warn!(error = %err, "subscriber tick failed");
            }
        }
    }
}

/// Fans accepted snapshots out to the registered callbacks.
///
/// Runs on its own worker so a slow callback cannot block detection, and
/// every callback invocation gets its own thread so a blocking callback
/// cannot starve the others either. The callback list lock is released
/// before any callback runs, and a panicking callback is caught and logged
/// rather than tearing anything down.
pub(crate) struct Dispatcher<T> {
    shared: Arc<EngineShared<T>>,
    updates: mpsc::Receiver<T>,
}

impl<T> Dispatcher<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(shared: Arc<EngineShared<T>>, updates: mpsc::Receiver<T>) -> Dispatcher<T> {
        Dispatcher { shared, updates }
    }

    /// Drains snapshots until the subscriber hangs up at shutdown.
    pub(crate) fn run(self) {
        for value in self.updates.iter() {
            let callbacks = match self.shared.callbacks.lock() {
                Ok(guard) => guard.clone(),
                Err(_) => {
                    warn!("callback list mutex poisoned; dispatch worker exiting");
                    return;
                }
            };
            for callback in callbacks {
                let snapshot = value.clone();
                thread::spawn(move || {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                        warn!("change callback panicked");
                    }
                });
            }
        }
    }
}
