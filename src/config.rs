use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative shutdown flag, set once (typically from a signal handler in
/// the embedding binary) and polled by every worker and the dry run.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminate(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn terminated(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Configuration for one export run.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Directories containing the SSTable component files.
    pub dirs: Vec<PathBuf>,

    /// Target namespace; defaults to the keyspace read from the tables.
    pub namespace: Option<String>,

    /// Target set name; defaults to the table name read from the tables.
    pub set_name: Option<String>,

    /// Verify per-chunk checksums while reading (default: true).
    pub verify_checksums: bool,

    /// Number of writer workers, one per client event loop (default: 4).
    pub event_loops: usize,

    /// Maximum asynchronous upserts in flight per worker (default: 100).
    pub max_in_flight: usize,

    /// Resume the export from this partition key.
    pub start_key: Option<Vec<u8>>,

    /// Records with less than this many seconds left to live are dropped
    /// instead of written (default: 1).
    pub minimum_ttl: u32,

    /// Give never-expiring rows the namespace's default TTL instead
    /// (default: false).
    pub prohibit_eternal_records: bool,

    /// Expire a record at its nearest-expiring column rather than its
    /// farthest (default: false).
    pub use_nearest_expiry: bool,

    /// Cooperative cancellation, checked before every upsert.
    pub shutdown: ShutdownFlag,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            namespace: None,
            set_name: None,
            verify_checksums: true,
            event_loops: 4,
            max_in_flight: 100,
            start_key: None,
            minimum_ttl: 1,
            prohibit_eternal_records: false,
            use_nearest_expiry: false,
            shutdown: ShutdownFlag::default(),
        }
    }
}

impl ExportConfig {
    /// Create a new config for the given SSTable directories.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs, ..Default::default() }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn set_name(mut self, set_name: impl Into<String>) -> Self {
        self.set_name = Some(set_name.into());
        self
    }

    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn event_loops(mut self, event_loops: usize) -> Self {
        self.event_loops = event_loops;
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn start_key(mut self, key: Vec<u8>) -> Self {
        self.start_key = Some(key);
        self
    }

    pub fn minimum_ttl(mut self, seconds: u32) -> Self {
        self.minimum_ttl = seconds;
        self
    }

    pub fn prohibit_eternal_records(mut self, prohibit: bool) -> Self {
        self.prohibit_eternal_records = prohibit;
        self
    }

    pub fn use_nearest_expiry(mut self, nearest: bool) -> Self {
        self.use_nearest_expiry = nearest;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }
}
