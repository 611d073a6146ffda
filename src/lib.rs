pub mod buffer;
pub mod config;
pub mod dryrun;
pub mod error;
pub mod merge;
pub mod partitioner;
pub mod schema;
pub mod sstable;
#[cfg(test)]
pub(crate) mod testutil;
pub mod tmpfs;
pub mod util;
pub mod writer;

pub use config::{ExportConfig, ShutdownFlag};
pub use error::{Error, Result};
pub use merge::{MergeIterator, RowSink, TableSet};
pub use writer::{run_export, ExportSummary, RecordStore, RecordTtl, RowSource, Upsert, UpsertStatus};
