//! Streaming cursors over individual SSTable files.
//!
//! One [`SsTable`] reads one `-Data.db` file as a cursor: position at a
//! partition, step through its columns, lazily materialize column values.
//! The merge layer drives many cursors at once and only ever looks at each
//! cursor's current partition key/token and current column.
//!
//! Two on-disk generations share the cursor surface:
//!
//! - formats before `ma` ([`old`]): self-describing cells with names and
//!   sizes inline in the data stream;
//! - `ma` and beyond ([`new`]): schema-described rows where cells are laid
//!   out positionally against the serialization header in `-Statistics.db`.
//!
//! A cursor holds no open file until [`SsTable::open`]; the merge activates
//! cursors as their partition range is reached and closes them again when
//! they are exhausted, so only tables overlapping the current position own
//! file descriptors.

pub mod new;
pub mod old;

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, NativeEndian};
use tracing::warn;

use crate::buffer::{Buffer, ChecksumKind, ChunkedSource, DataSource, FileSource};
use crate::error::Result;
use crate::partitioner::{Partitioner, Token};
use crate::schema::TableSchema;

const DATA_SUFFIX: &str = "-Data.db";
const INDEX_SUFFIX: &str = "-Index.db";
const SUMMARY_SUFFIX: &str = "-Summary.db";
const COMPRESSION_INFO_SUFFIX: &str = "-CompressionInfo.db";
pub(crate) const STATISTICS_SUFFIX: &str = "-Statistics.db";

/// Sentinel for "no row-level deletion".
pub const STILL_ACTIVE: i64 = i64::MIN;

/// SSTable format versions, encoded as `(a - 'a') * 26 + (b - 'a')`.
pub const fn version_code(a: u8, b: u8) -> i32 {
    (a - b'a') as i32 * 26 + (b - b'a') as i32
}

pub const VERSION_MA: i32 = version_code(b'm', b'a');
pub const VERSION_LA: i32 = version_code(b'l', b'a');
pub const VERSION_KA: i32 = version_code(b'k', b'a');
pub const VERSION_JB: i32 = version_code(b'j', b'b');
pub const VERSION_JA: i32 = version_code(b'j', b'a');
pub const VERSION_IB: i32 = version_code(b'i', b'b');
pub const VERSION_HD: i32 = version_code(b'h', b'd');
pub const VERSION_HC: i32 = version_code(b'h', b'c');
pub const VERSION_D: i32 = version_code(b'd', b'a');

/// Everything fixed about one SSTable: its component-file prefix, format
/// version, and (for `ma`+) the schema read from `-Statistics.db`.
#[derive(Clone, Debug)]
pub struct TableConfig {
    /// Path prefix shared by the component files, e.g.
    /// `/data/ks/tbl/ma-1-big`.
    pub path: String,
    pub version: i32,
    pub schema: TableSchema,
    pub verify_checksums: bool,
}

impl TableConfig {
    pub(crate) fn component(&self, suffix: &str) -> String {
        format!("{}{}", self.path, suffix)
    }
}

/// One column (cell) as the cursor currently sees it. `data` is only
/// populated lazily through [`SsTable::read_column_data`], except for old
/// format range tombstones where it carries the range end key.
#[derive(Clone, Debug, Default)]
pub struct ColumnInfo {
    pub name: Vec<u8>,
    pub ts: i64,
    pub deleted: bool,
    pub expiring: bool,
    pub range_tombstone: bool,
    pub extra: ColumnExtra,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColumnExtra {
    #[default]
    None,
    /// Counter columns are read past but their values are not reconstructed.
    Counter(i64),
    /// TTL duration plus the absolute expiration deadline in epoch seconds.
    Expiration { ttl: u32, expiration: u32 },
}

impl ColumnInfo {
    pub(crate) fn clear_flags(&mut self) {
        self.deleted = false;
        self.expiring = false;
        self.range_tombstone = false;
        self.extra = ColumnExtra::None;
    }
}

/// Parsing state machine position within the data stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fsm {
    ReadRow,
    ReadColumn,
    ReadColumnData,
}

/// Cursor state shared by both format generations.
pub(crate) struct CursorCore {
    pub data: Option<DataSource>,
    pub next_key: Vec<u8>,
    pub next_token: Token,
    pub row_marked_for_deletion: i64,
    pub start_offset: u64,
    pub column: ColumnInfo,
    pub fsm: Fsm,
}

enum FormatState {
    Old(old::OldState),
    New(new::NewState),
}

pub struct SsTable {
    config: Arc<TableConfig>,
    core: CursorCore,
    state: FormatState,
}

impl SsTable {
    pub fn new(config: Arc<TableConfig>) -> Self {
        let state = if config.version >= VERSION_MA {
            FormatState::New(new::NewState::new())
        } else {
            FormatState::Old(old::OldState::new())
        };
        Self {
            config,
            core: CursorCore {
                data: None,
                next_key: Vec::new(),
                next_token: [0; 16],
                row_marked_for_deletion: 0,
                start_offset: 0,
                column: ColumnInfo::default(),
                fsm: Fsm::ReadRow,
            },
            state,
        }
    }

    pub fn next_key(&self) -> &[u8] {
        &self.core.next_key
    }

    pub fn next_token(&self) -> &Token {
        &self.core.next_token
    }

    pub fn next_column(&self) -> &ColumnInfo {
        &self.core.column
    }

    pub fn marked_for_deletion(&self) -> i64 {
        self.core.row_marked_for_deletion
    }

    /// Opens the data file and positions the cursor at `start_offset`.
    pub fn open(&mut self) -> Result<()> {
        let version = self.config.version;
        let checksum = if (VERSION_JB..VERSION_MA).contains(&version) {
            ChecksumKind::Adler32
        } else {
            ChecksumKind::Crc32
        };
        let verify_compressed = version >= VERSION_JB;

        let data_path = self.config.component(DATA_SUFFIX);
        let info_path = self.config.component(COMPRESSION_INFO_SUFFIX);
        let mut data = if Path::new(&info_path).exists() {
            DataSource::Chunked(ChunkedSource::open(
                Path::new(&data_path),
                Path::new(&info_path),
                checksum,
                verify_compressed,
                self.config.verify_checksums,
            )?)
        } else {
            DataSource::Plain(FileSource::open(Path::new(&data_path))?)
        };
        data.seek(self.core.start_offset);
        self.core.data = Some(data);
        self.core.fsm = Fsm::ReadRow;
        match &mut self.state {
            FormatState::Old(state) => state.reset(),
            FormatState::New(state) => state.reset(),
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.core.data = None;
    }

    /// Peeks this table's first partition so the merge can sort cursors
    /// before any of them hold open data files.
    pub fn init(&mut self, partitioner: &Partitioner) -> Result<()> {
        self.open()?;
        self.read_row(partitioner);
        self.close();
        Ok(())
    }

    /// Positions the cursor at the first partition at or after the requested
    /// key, via the summary (when present) and the index. Returns false when
    /// every partition in this table sorts before the requested key.
    pub fn init_at_key(
        &mut self,
        partitioner: &Partitioner,
        first_token: &Token,
        first_key: &[u8],
    ) -> Result<bool> {
        let mut index = FileSource::open(Path::new(&self.config.component(INDEX_SUFFIX)))?;

        if let Some(found) = self.find_partition_in_summary(partitioner, first_token, first_key)? {
            index.seek(found);
        }

        // Scan the index for the first entry at or past the requested key.
        while !index.is_eof() {
            let entry_key = index.read_short_string();
            let offset = if self.config.version >= VERSION_MA {
                index.read_unsigned_vint()
            } else {
                index.read_i64() as u64
            };
            if index.is_eof() {
                break;
            }

            let entry_token = partitioner.assign_token(&entry_key);
            if partitioner.compare(first_token, first_key, &entry_token, &entry_key) != Ordering::Greater {
                self.core.next_key = entry_key;
                self.core.next_token = entry_token;
                self.core.start_offset = offset;
                return Ok(true);
            }

            let to_skip = if self.config.version >= VERSION_MA {
                index.read_unsigned_vint()
            } else {
                index.read_i32().max(0) as u64
            };
            index.skip_bytes(to_skip);
        }
        Ok(false)
    }

    /// Binary-searches `-Summary.db` for the index offset of the greatest
    /// summarized key at or below the target. The summary is optional;
    /// without one the index scan starts at offset 0.
    ///
    /// The packed summary blob is memory-image data: its internal offset
    /// table and index offsets are host-endian, unlike every other component.
    fn find_partition_in_summary(
        &self,
        partitioner: &Partitioner,
        first_token: &Token,
        first_key: &[u8],
    ) -> Result<Option<u64>> {
        let Ok(mut summary) = FileSource::open(Path::new(&self.config.component(SUMMARY_SUFFIX)))
        else {
            return Ok(None);
        };

        summary.skip_bytes(4);
        let size = summary.read_i32() as i64;
        let mem_size = summary.read_i64();
        if self.config.version >= VERSION_KA {
            summary.skip_bytes(8);
        }
        if size <= 0 || mem_size <= 0 {
            return Ok(None);
        }

        let Some(packed) = summary.read_bytes(mem_size as usize) else {
            return Ok(None);
        };
        let entry_offset = |i: i64| -> i64 {
            if i == size {
                mem_size
            } else {
                NativeEndian::read_i32(&packed[i as usize * 4..]) as i64
            }
        };

        let mut lower_bounds = None;
        let mut bottom: i64 = 0;
        let mut top: i64 = size - 1;
        while bottom < top {
            let middle = bottom + (top - bottom) / 2;
            let offset = entry_offset(middle) as usize;
            let next_offset = entry_offset(middle + 1) as usize;
            let len = next_offset - offset - 8;

            let entry_key = &packed[offset..offset + len];
            let entry_token = partitioner.assign_token(entry_key);
            match partitioner.compare(first_token, first_key, &entry_token, entry_key) {
                Ordering::Less => top = middle - 1,
                Ordering::Greater => {
                    lower_bounds =
                        Some(NativeEndian::read_i64(&packed[offset + len..]) as u64);
                    bottom = middle + 1;
                }
                Ordering::Equal => {
                    lower_bounds =
                        Some(NativeEndian::read_i64(&packed[offset + len..]) as u64);
                    break;
                }
            }
        }

        Ok(lower_bounds)
    }

    /// Advances to the next partition (or for `ma`+, the next unfiltered
    /// item). Returns true once the data stream is exhausted.
    pub fn read_row(&mut self, partitioner: &Partitioner) -> bool {
        let Self { config, core, state } = self;
        match state {
            FormatState::Old(state) => state.read_row(core, config, partitioner),
            FormatState::New(state) => state.read_row(core, config, partitioner),
        }
    }

    /// Advances to the next column within the current row. Returns false at
    /// the end of the row.
    pub fn read_column(&mut self) -> bool {
        let Self { config, core, state } = self;
        match state {
            FormatState::Old(state) => state.read_column(core, config),
            FormatState::New(state) => state.read_column(core, config),
        }
    }

    /// Materializes the current column's value bytes.
    pub fn read_column_data(&mut self, out: &mut Vec<u8>) -> bool {
        let Self { config, core, state } = self;
        match state {
            FormatState::Old(state) => state.read_column_data(core, out),
            FormatState::New(state) => state.read_column_data(core, config, out),
        }
    }
}

/// Parses an SSTable format version out of a `-Data.db` filename.
///
/// `la`+ names start with the version (`ma-1-big-Data.db`); older names
/// carry it in the third dash-separated field
/// (`keyspace-table-ka-1-Data.db`); ancient versions used a single letter
/// `a`..`d` there.
pub fn version_from_filename(name: &str) -> Option<i32> {
    fn is_version(bytes: &[u8], lower_bound: u8) -> bool {
        bytes.len() >= 3
            && (lower_bound..=b'z').contains(&bytes[0])
            && bytes[1].is_ascii_lowercase()
            && bytes[2] == b'-'
    }

    let bytes = name.as_bytes();
    if is_version(bytes, b'l') {
        return Some(version_code(bytes[0], bytes[1]));
    }

    let rest = &bytes[bytes.iter().position(|&b| b == b'-')? + 1..];
    let rest = &rest[rest.iter().position(|&b| b == b'-')? + 1..];

    if is_version(rest, b'a') {
        return Some(version_code(rest[0], rest[1]));
    }
    // Ancient single-letter versions.
    if rest.len() >= 2 && rest[1] == b'-' && (b'a'..=b'd').contains(&rest[0]) {
        return Some(version_code(rest[0], b'a'));
    }
    None
}

/// Extracts the keyspace and table name: from the filename for pre-`la`
/// formats, from the last two directory components for `la`+.
pub fn keyspace_and_table(version: i32, file_name: &str, dir: &Path) -> Option<(String, String)> {
    if version < VERSION_LA {
        let mut parts = file_name.split('-');
        let keyspace = parts.next()?;
        let table = parts.next()?;
        parts.next()?;
        Some((keyspace.to_string(), table.to_string()))
    } else {
        let table = dir.file_name()?.to_str()?.to_string();
        let keyspace = dir.parent()?.file_name()?.to_str()?.to_string();
        Some((keyspace, table))
    }
}

fn skip_histogram(src: &mut dyn Buffer) {
    let buckets = src.read_i32().max(0) as u64;
    src.skip_bytes(buckets * 2 * 8);
}

/// Reads the partitioner (and for `ka`+ the schema) out of a
/// `-Statistics.db` stream. Returns None when the partitioner class is
/// unknown or the format predates partitioner metadata entirely.
pub fn read_table_metadata(
    src: &mut dyn Buffer,
    version: i32,
    schema: &mut TableSchema,
) -> Option<Partitioner> {
    const METADATA_VALIDATION: i32 = 0;
    const METADATA_HEADER: i32 = 3;

    let class_name = if version >= VERSION_KA {
        let component_count = src.read_i32();
        let mut validation_offset = -1;
        let mut header_offset = -1;
        for _ in 0..component_count.max(0) {
            let this_type = src.read_i32();
            let this_offset = src.read_i32();
            if this_type == METADATA_VALIDATION {
                validation_offset = this_offset;
            } else if this_type == METADATA_HEADER {
                header_offset = this_offset;
            }
        }

        if header_offset >= 0 {
            src.seek(header_offset as u64);
            schema.parse(src);
        }

        if validation_offset < 0 {
            return None;
        }
        src.seek(validation_offset as u64);
        src.read_short_string()
    } else if version >= VERSION_JA {
        skip_histogram(src);
        skip_histogram(src);
        src.skip_bytes(5 * 8 + 2 * 4);
        src.read_short_string()
    } else if version >= VERSION_HC {
        skip_histogram(src);
        skip_histogram(src);
        src.skip_bytes(8 + 4);
        if version >= VERSION_IB {
            src.skip_bytes(8);
        }
        if version >= VERSION_HD {
            src.skip_bytes(8);
        }
        src.skip_bytes(8);
        src.read_short_string()
    } else {
        return Some(Partitioner::default_for_missing_metadata());
    };

    let class_name = String::from_utf8_lossy(&class_name).into_owned();
    let partitioner = Partitioner::from_class_name(&class_name);
    if partitioner.is_none() {
        warn!("unknown partitioner {class_name:?}");
    }
    partitioner
}
