use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::{self, PayloadDigest};
use crate::core::{self, Region, SyncConfig, VERSION_HEADER_SIZE};
use crate::publisher::Publisher;
use crate::subscriber::{Dispatcher, Subscriber};
use crate::ShstateError;

/// Callback registered with [`StateSync::on_change`]. Each accepted change
/// hands every callback its own clone of the decoded snapshot.
pub type ChangeCallback<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

/// Engine lifecycle. Publish and subscribe are valid only in `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Fresh = 0,
    Running = 1,
    Stopping = 2,
    Closed = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> EngineState {
        match value {
            0 => EngineState::Fresh,
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Closed,
        }
    }
}

/// State shared between the engine handle and its background workers.
pub(crate) struct EngineShared<T> {
    /// The caller-owned record; the engine holds a second handle. Locked
    /// only while encoding a snapshot or applying a decoded one.
    pub(crate) record: Arc<Mutex<T>>,
    /// `None` once the engine has been closed and the mapping dropped.
    pub(crate) region: Mutex<Option<Region>>,
    /// Last version observed or written by this engine. Advancing it on
    /// publish is what keeps our own subscriber from redelivering it.
    pub(crate) local_version: AtomicU32,
    /// Digest of the last successfully published payload.
    pub(crate) last_digest: Mutex<Option<PayloadDigest>>,
    pub(crate) callbacks: Mutex<Vec<ChangeCallback<T>>>,
    pub(crate) stop: AtomicBool,
    pub(crate) state: AtomicU8,
    pub(crate) publish_interval_ms: AtomicU64,
    pub(crate) detect_interval_ms: AtomicU64,
}

/// Sleeps until the next tick, waking early when the shutdown flag is
/// raised. The interval is re-read every slice so that `close` never waits
/// out a long interval and `auto_publish` takes effect within one slice.
pub(crate) fn sleep_with_stop(stop: &AtomicBool, interval_ms: &AtomicU64) {
    const SLICE: Duration = Duration::from_millis(10);
    let start = Instant::now();
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let interval = Duration::from_millis(interval_ms.load(Ordering::Acquire).max(1));
        let elapsed = start.elapsed();
        if elapsed >= interval {
            return;
        }
        thread::sleep(SLICE.min(interval - elapsed));
    }
}

/// Cross-process synchronization engine for a record of type `T`.
///
/// Every participating process constructs one engine over its own copy of
/// the record; the engines meet at a memory-mapped region file derived from
/// the record's type identity. Mutations in any process reach the others
/// within one auto-publish interval plus one detection interval.
///
/// The caller keeps its `Arc<Mutex<T>>` handle and mutates the record
/// through it; the engine publishes snapshots and applies peer snapshots
/// through its own handle. Drop the engine (or call [`close`]) before
/// discarding the record.
///
/// [`close`]: StateSync::close
pub struct StateSync<T> {
    shared: Arc<EngineShared<T>>,
    publisher: Publisher<T>,
    workers: Vec<JoinHandle<()>>,
}

impl<T> StateSync<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Constructs an engine with the default configuration: the region path
    /// derived from `T`'s type identity, a 64 KiB region, 100 ms intervals.
    pub fn new(record: Arc<Mutex<T>>) -> Result<StateSync<T>, ShstateError> {
        StateSync::with_config(record, SyncConfig::default())
    }

    /// Constructs an engine with an explicit configuration.
    ///
    /// The record must be record-shaped: scalars and containers fail with
    /// [`ShstateError::InvalidType`]. If the region already carries a
    /// published payload, it is decoded into the caller's record before the
    /// workers start; a payload that does not decode is logged and the
    /// record keeps its initial value.
    pub fn with_config(
        record: Arc<Mutex<T>>,
        config: SyncConfig,
    ) -> Result<StateSync<T>, ShstateError> {
        {
            let current = record.lock()?;
            codec::ensure_record(&*current)?;
        }
        if config.region_size <= VERSION_HEADER_SIZE {
            return Err(ShstateError::Config(format!(
                "region_size ({}) must exceed the {}-byte version header",
                config.region_size, VERSION_HEADER_SIZE
            )));
        }

        let path = core::region_path::<T>(&config)?;
        let region = Region::open(&path, config.region_size)?;

        let region_version = region.version();
        if region_version != 0 {
            match codec::decode::<T>(region.payload()) {
                Ok(value) => {
                    *record.lock()? = value;
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        version = region_version,
                        error = %err,
                        "existing region payload did not decode; keeping the initial record"
                    );
                }
            }
        }
        debug!(
            path = %path.display(),
            version = region_version,
            "sync engine attached to region"
        );

        let shared = Arc::new(EngineShared {
            record,
            region: Mutex::new(Some(region)),
            local_version: AtomicU32::new(region_version),
            last_digest: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            state: AtomicU8::new(EngineState::Fresh as u8),
            publish_interval_ms: AtomicU64::new(config.publish_interval_ms),
            detect_interval_ms: AtomicU64::new(config.detect_interval_ms),
        });

        let (updates_tx, updates_rx) = mpsc::channel();
        let subscriber = Subscriber::new(Arc::clone(&shared), updates_tx);
        let dispatcher = Dispatcher::new(Arc::clone(&shared), updates_rx);
        let auto_publisher = Publisher::new(Arc::clone(&shared));
        let workers = vec![
            thread::spawn(move || subscriber.run()),
            thread::spawn(move || dispatcher.run()),
            thread::spawn(move || auto_publisher.run()),
        ];
        shared.state.store(EngineState::Running as u8, Ordering::Release);

        Ok(StateSync {
            publisher: Publisher::new(Arc::clone(&shared)),
            shared,
            workers,
        })
    }

    /// Encodes the current record and installs it as a new version, whether
    /// or not the record changed since the last publish.
    pub fn publish(&self) -> Result<(), ShstateError> {
        if self.state() != EngineState::Running {
            return Err(ShstateError::Closed);
        }
        self.publisher.publish()?;
        Ok(())
    }

    /// Adjusts the auto-publish interval. The worker picks the new interval
    /// up at its next tick.
    pub fn auto_publish(&self, interval: Duration) {
        self.shared
            .publish_interval_ms
            .store((interval.as_millis() as u64).max(1), Ordering::Release);
    }

    /// Registers a callback invoked with a snapshot of every accepted peer
    /// change. Each invocation runs on its own thread, so a slow or
    /// blocking callback stalls neither detection nor the other callbacks;
    /// a panicking callback is caught and logged. This engine's own
    /// publishes are never delivered back to it.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        match self.shared.callbacks.lock() {
            Ok(mut callbacks) => callbacks.push(Arc::new(callback)),
            Err(_) => warn!("callback list mutex poisoned; on_change registration dropped"),
        }
    }

    /// Last version observed or written by this engine.
    pub fn version(&self) -> u32 {
        self.shared.local_version.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Shuts the engine down: raises the shutdown flag, joins the workers
    /// (bounded by one sleep slice plus any in-flight tick) and drops the
    /// region mapping. Idempotent; a publish racing with close either
    /// completes before the mapping is dropped or fails with `Closed`.
    pub fn close(&mut self) {
        self.close_inner();
    }
}

impl<T> Drop for StateSync<T> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

impl<T> StateSync<T> {
    // Shared by `close` and `Drop`; free of the `T` bounds the public API
    // carries so that `Drop` can stay unconditional.
    fn close_inner(&mut self) {
        if self
            .shared
            .state
            .compare_exchange(
                EngineState::Running as u8,
                EngineState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // An in-flight publish holds the region mutex; taking it here means
        // the mapping is dropped only after that publish completes.
        if let Ok(mut region) = self.shared.region.lock() {
            region.take();
        }
        self.shared.state.store(EngineState::Closed as u8, Ordering::Release);
        debug!("sync engine closed");
    }
}
