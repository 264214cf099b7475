use std::any::{self, TypeId};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use fs2::FileExt;
use memmap2::MmapMut;
use serde_derive::{Deserialize, Serialize};

use crate::ShstateError;

/// Default size of the backing region file.
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024;

/// Bytes reserved at the head of the region for the version counter.
pub const VERSION_HEADER_SIZE: usize = 4;

/// Default interval for both the auto-publish worker and the change poller.
pub const DEFAULT_INTERVAL_MS: u64 = 100;

/// Directory component under the user cache dir holding all region files.
pub const PRODUCT_DIR: &str = "shstate";

/// Configuration for one sync engine.
///
/// `data_dir` and `region_file_name` default to the per-type derivation of
/// [`region_path`]; overriding them is meant for tests and tooling, since
/// peers only see each other when they resolve the same path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub data_dir: Option<PathBuf>,
    pub region_file_name: Option<String>,
    pub region_size: usize,
    pub publish_interval_ms: u64,
    pub detect_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            data_dir: None,
            region_file_name: None,
            region_size: DEFAULT_REGION_SIZE,
            publish_interval_ms: DEFAULT_INTERVAL_MS,
            detect_interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder {
            config: SyncConfig::default(),
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms.max(1))
    }

    pub fn detect_interval(&self) -> Duration {
        Duration::from_millis(self.detect_interval_ms.max(1))
    }
}

pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn region_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.region_file_name = Some(name.into());
        self
    }

    pub fn region_size(mut self, size: usize) -> Self {
        self.config.region_size = size;
        self
    }

    pub fn publish_interval(mut self, interval: Duration) -> Self {
        self.config.publish_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn detect_interval(mut self, interval: Duration) -> Self {
        self.config.detect_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn build(self) -> Result<SyncConfig, ShstateError> {
        if self.config.region_size <= VERSION_HEADER_SIZE {
            return Err(ShstateError::Config(format!(
                "region_size ({}) must exceed the {}-byte version header",
                self.config.region_size, VERSION_HEADER_SIZE
            )));
        }
        Ok(self.config)
    }
}

// Process-wide registry of type identifiers, interned once per record type.
// Two processes loading the same record type land on the same file name, so
// the identifier is the single coordination key between them.
static TYPE_IDENTIFIERS: OnceLock<Mutex<HashMap<TypeId, &'static str>>> = OnceLock::new();

/// Returns the path-safe identifier for `T`, interning it on first use.
pub fn type_identifier<T: 'static>() -> &'static str {
    let registry = TYPE_IDENTIFIERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().unwrap_or_else(|e| e.into_inner());
    map.entry(TypeId::of::<T>())
        .or_insert_with(|| Box::leak(sanitize_identifier(any::type_name::<T>()).into_boxed_str()))
}

fn sanitize_identifier(name: &str) -> String {
    name.replace("::", "_")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Resolves the region file path for record type `T` under `config`.
///
/// Defaults to `<user-cache-dir>/shstate/<type-identifier>.mmap`.
pub fn region_path<T: 'static>(config: &SyncConfig) -> Result<PathBuf, ShstateError> {
    let file_name = match &config.region_file_name {
        Some(name) => name.clone(),
        None => format!("{}.mmap", type_identifier::<T>()),
    };
    let dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::cache_dir()
            .ok_or_else(|| {
                ShstateError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "user cache directory could not be resolved",
                ))
            })?
            .join(PRODUCT_DIR),
    };
    Ok(dir.join(file_name))
}

fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// The fixed-size memory-mapped file backing one record's shared state.
///
/// Layout: a little-endian `u32` version counter at offset 0, the encoded
/// payload from offset [`VERSION_HEADER_SIZE`], zero padding to the end.
/// Version 0 means "never published" and the payload must not be decoded.
///
/// Dropping the region unmaps it and closes both file handles.
pub struct Region {
    file: File,
    map: MmapMut,
    lock_file: File,
    path: PathBuf,
}

impl Region {
    /// Opens or creates the region file at `path` with exactly `size` bytes.
    ///
    /// Missing parent directories are created. A newly created file is
    /// extended with zeros. An existing file larger than `size` is refused:
    /// shrinking would invalidate the layout peers already mapped.
    pub fn open(path: &Path, size: usize) -> Result<Region, ShstateError> {
        debug_assert!(size > VERSION_HEADER_SIZE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let file = options.open(path)?;

        let existing = file.metadata()?.len();
        if existing > size as u64 {
            return Err(ShstateError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "existing region {} holds {} bytes, larger than the requested {}",
                    path.display(),
                    existing,
                    size
                ),
            )));
        }
        file.set_len(size as u64)?;

        let map = unsafe { MmapMut::map_mut(&file)? };
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path(path))?;

        Ok(Region {
            file,
            map,
            lock_file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    // The mapping is page-aligned, so offset 0 is suitably aligned for u32.
    fn version_word(&self) -> &AtomicU32 {
        debug_assert_eq!(self.map.as_ptr() as usize % std::mem::align_of::<AtomicU32>(), 0);
        unsafe { &*(self.map.as_ptr() as *const AtomicU32) }
    }

    /// Acquire-loads the version counter. A reader that observes a new
    /// version through this load is guaranteed to see the payload bytes the
    /// publisher wrote before its release store.
    pub fn version(&self) -> u32 {
        u32::from_le(self.version_word().load(Ordering::Acquire))
    }

    /// Release-stores the version counter. Call only after the payload copy;
    /// the byte image in the file is little-endian on every architecture.
    pub fn set_version(&self, version: u32) {
        self.version_word().store(version.to_le(), Ordering::Release);
    }

    /// The payload bytes after the version header. May carry zero padding or
    /// the tail of a previous, larger payload; the codec ignores both.
    pub fn payload(&self) -> &[u8] {
        &self.map[VERSION_HEADER_SIZE..]
    }

    /// Copies `data` into the payload area. Refused without touching the
    /// region when it does not fit.
    pub fn write_payload(&mut self, data: &[u8]) -> Result<(), ShstateError> {
        let required = data.len() + VERSION_HEADER_SIZE;
        let available = self.map.len();
        if required > available {
            return Err(ShstateError::TooLarge {
                required,
                available,
            });
        }
        self.map[VERSION_HEADER_SIZE..required].copy_from_slice(data);
        Ok(())
    }

    /// Flushes the mapping to the backing file.
    pub fn flush(&self) -> Result<(), ShstateError> {
        self.map.flush()?;
        Ok(())
    }

    /// Takes the OS advisory lock on the companion `.lock` file in exclusive
    /// mode. Blocks until the lock is available; released when the returned
    /// guard drops. Reads never take this lock.
    pub fn lock_exclusive(&self) -> Result<RegionLock, ShstateError> {
        let file = self.lock_file.try_clone()?;
        file.lock_exclusive()?;
        Ok(RegionLock { file })
    }
}

/// RAII guard for the exclusive advisory lock.
pub struct RegionLock {
    file: File,
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
