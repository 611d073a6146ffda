//! Row/column stream for SSTable format `ma` and beyond.
//!
//! A partition is a header (key + deletion) followed by a sequence of
//! *unfiltered* items — rows and range-tombstone markers — terminated by an
//! end-of-partition flag byte. Rows no longer spell out their cells: the
//! cell list is positional against the table schema, encoded either as
//! "all columns" or as a subset bitmap, and integer fields are unsigned
//! vint deltas against the per-table minimums in the serialization header.

use crate::buffer::Buffer;
use crate::partitioner::Partitioner;
use crate::schema::{ColumnFormat, TableSchema};
use crate::sstable::{ColumnExtra, CursorCore, Fsm, TableConfig};

// Unfiltered flags.
const END_OF_PARTITION: u8 = 0x01;
const IS_MARKER: u8 = 0x02;
const HAS_TIMESTAMP: u8 = 0x04;
const HAS_TTL: u8 = 0x08;
const HAS_DELETION: u8 = 0x10;
const HAS_ALL_COLUMNS: u8 = 0x20;
const EXTENSION_FLAG: u8 = 0x80;

// Extended flags.
const IS_STATIC: u8 = 0x01;

// Cell flags.
const IS_DELETED_MASK: u8 = 0x01;
const IS_EXPIRING_MASK: u8 = 0x02;
const HAS_EMPTY_VALUE_MASK: u8 = 0x04;
const USE_ROW_TIMESTAMP_MASK: u8 = 0x08;
const USE_ROW_TTL_MASK: u8 = 0x10;

// Marker types carrying a second deletion time.
const EXCL_END_INCL_START_BOUNDARY: u8 = 2;
const INCL_END_EXCL_START_BOUNDARY: u8 = 5;

pub(crate) struct NewState {
    at_end_of_partition: bool,
    partition_marked_for_deletion: i64,
    row_timestamp: u64,
    row_ttl: u64,
    /// Absolute expiration of the row-level TTL, for cells that reference it.
    row_expiration: u64,
    columns_present: Vec<bool>,
    this_column_index: usize,
    is_static: bool,
}

impl NewState {
    pub fn new() -> Self {
        Self {
            at_end_of_partition: true,
            partition_marked_for_deletion: 0,
            row_timestamp: 0,
            row_ttl: u64::MAX,
            row_expiration: u64::MAX,
            columns_present: Vec::new(),
            this_column_index: 0,
            is_static: false,
        }
    }

    pub fn reset(&mut self) {
        self.at_end_of_partition = true;
    }

    fn columns<'a>(&self, config: &'a TableConfig) -> &'a [(Vec<u8>, ColumnFormat)] {
        if self.is_static {
            &config.schema.static_columns
        } else {
            &config.schema.regular_columns
        }
    }

    pub fn read_row(
        &mut self,
        core: &mut CursorCore,
        config: &TableConfig,
        partitioner: &Partitioner,
    ) -> bool {
        if self.at_end_of_partition {
            let Some(data) = core.data.as_mut() else { return true };
            core.next_key = data.read_short_string();
            if data.is_eof() {
                return true;
            }
            data.skip_bytes(4); // local deletion
            self.partition_marked_for_deletion = data.read_i64();
            core.next_token = partitioner.assign_token(&core.next_key);
            self.at_end_of_partition = false;
        }

        let Some(data) = core.data.as_mut() else { return true };
        let flags = data.read_u8();
        if flags & END_OF_PARTITION != 0 {
            self.at_end_of_partition = true;
            return self.read_row(core, config, partitioner);
        }

        let extended_flags = if flags & EXTENSION_FLAG != 0 { data.read_u8() } else { 0 };
        self.is_static = extended_flags & IS_STATIC != 0;

        if flags & IS_MARKER != 0 {
            self.read_marker(core, config)
        } else {
            self.read_normal_row(core, config, flags)
        }
    }

    /// Range tombstone markers surface as a pseudo-column: empty name,
    /// `range_tombstone` set, and the marker's deletion time as the row
    /// deletion. Their clustering bounds are not representable in the
    /// name-keyed column stream and are skipped.
    fn read_marker(&mut self, core: &mut CursorCore, config: &TableConfig) -> bool {
        let Some(data) = core.data.as_mut() else { return true };
        let marker_type = data.read_u8();
        let size = data.read_i16().max(0) as usize;
        if !self.is_static {
            read_clustering_columns(core, config, size);
        }
        let Some(data) = core.data.as_mut() else { return true };

        data.read_unsigned_vint(); // row size
        data.read_unsigned_vint(); // previous unfiltered size

        core.row_marked_for_deletion = data.read_i64();
        data.skip_bytes(4); // local deletion
        if marker_type == EXCL_END_INCL_START_BOUNDARY || marker_type == INCL_END_EXCL_START_BOUNDARY {
            // Boundary markers carry a second deletion time, unused here.
            data.skip_bytes(12);
        }

        core.column.clear_flags();
        core.column.name.clear();
        core.column.data.clear();
        core.column.range_tombstone = true;
        core.fsm = Fsm::ReadColumn;
        self.columns_present.clear();
        self.this_column_index = 0;
        core.data.as_ref().is_some_and(|d| d.is_eof())
    }

    fn read_normal_row(&mut self, core: &mut CursorCore, config: &TableConfig, flags: u8) -> bool {
        if !self.is_static {
            read_clustering_columns(core, config, config.schema.clustering.len());
        }
        let Some(data) = core.data.as_mut() else { return true };

        data.read_unsigned_vint(); // row size
        data.read_unsigned_vint(); // previous unfiltered size

        self.row_ttl = u64::MAX;
        self.row_expiration = u64::MAX;
        self.row_timestamp = 0;
        if flags & HAS_TIMESTAMP != 0 {
            self.row_timestamp = data.read_unsigned_vint().wrapping_add(config.schema.min_timestamp);
            if flags & HAS_TTL != 0 {
                self.row_ttl = data.read_unsigned_vint().wrapping_add(config.schema.min_ttl);
                self.row_expiration = data
                    .read_unsigned_vint()
                    .wrapping_add(config.schema.min_local_deletion_time);
            }
        }

        if flags & HAS_DELETION != 0 {
            core.row_marked_for_deletion =
                data.read_unsigned_vint().wrapping_add(config.schema.min_timestamp) as i64;
            data.read_unsigned_vint(); // local deletion time
        } else {
            core.row_marked_for_deletion = self.partition_marked_for_deletion;
        }

        let n_columns = self.columns(config).len();
        if flags & HAS_ALL_COLUMNS != 0 {
            self.columns_present.clear();
            self.columns_present.resize(n_columns, true);
        } else {
            decode_column_subset(data, &mut self.columns_present, n_columns);
        }

        self.this_column_index = 0;
        self.advance_to_present(core);

        self.read_column(core, config);
        core.data.as_ref().is_some_and(|d| d.is_eof())
    }

    pub fn read_column(&mut self, core: &mut CursorCore, config: &TableConfig) -> bool {
        if core.fsm == Fsm::ReadColumnData {
            let mut ignore = Vec::new();
            self.read_column_data(core, config, &mut ignore);
        }

        debug_assert_eq!(core.fsm, Fsm::ReadColumn);
        core.column.clear_flags();

        if self.this_column_index >= self.columns_present.len() {
            core.fsm = Fsm::ReadRow;
            core.column.name.clear();
            return false;
        }

        core.column.name = self.columns(config)[self.this_column_index].0.clone();

        let schema = &config.schema;
        let Some(data) = core.data.as_mut() else { return false };
        let flags = data.read_u8();

        if flags & USE_ROW_TIMESTAMP_MASK != 0 {
            core.column.ts = self.row_timestamp as i64;
        } else {
            core.column.ts = data.read_unsigned_vint().wrapping_add(schema.min_timestamp) as i64;
        }

        core.column.deleted = flags & IS_DELETED_MASK != 0;
        core.column.expiring = flags & IS_EXPIRING_MASK != 0;
        if flags & USE_ROW_TTL_MASK != 0 {
            core.column.expiring = self.row_ttl != u64::MAX;
            core.column.extra = ColumnExtra::Expiration {
                ttl: self.row_ttl as u32,
                expiration: self.row_expiration as u32,
            };
        } else {
            let mut local_deletion = 0u64;
            if core.column.expiring || core.column.deleted {
                local_deletion = data
                    .read_unsigned_vint()
                    .wrapping_add(schema.min_local_deletion_time);
            }
            if core.column.expiring {
                let ttl = data.read_unsigned_vint().wrapping_add(schema.min_ttl);
                core.column.extra = ColumnExtra::Expiration {
                    ttl: ttl as u32,
                    expiration: local_deletion as u32,
                };
            }
        }

        if flags & HAS_EMPTY_VALUE_MASK == 0 {
            core.fsm = Fsm::ReadColumnData;
        } else {
            // No value bytes follow; step to the next present column now so
            // the following cell parses under the right name.
            self.this_column_index += 1;
            self.advance_to_present(core);
        }
        true
    }

    pub fn read_column_data(
        &mut self,
        core: &mut CursorCore,
        config: &TableConfig,
        out: &mut Vec<u8>,
    ) -> bool {
        if core.fsm == Fsm::ReadColumn {
            // Cell with an empty value: nothing in the stream.
            out.clear();
            return true;
        }

        let format = self.columns(config)[self.this_column_index].1;
        let Some(data) = core.data.as_mut() else { return false };
        let size = TableSchema::column_size(format, data);
        out.clear();
        if let Some(bytes) = data.read_bytes(size) {
            out.extend_from_slice(bytes);
        }

        self.this_column_index += 1;
        self.advance_to_present(core);
        true
    }

    fn advance_to_present(&mut self, core: &mut CursorCore) {
        while self.this_column_index < self.columns_present.len()
            && !self.columns_present[self.this_column_index]
        {
            self.this_column_index += 1;
        }
        core.fsm = Fsm::ReadColumn;
    }
}

/// Skips the clustering values prefixed to a row or marker. They come in
/// groups of up to 32 columns behind a bit-pair header vint; pair value 0
/// means a value of the column's schema size follows, any other value is a
/// null/empty variant with no bytes.
fn read_clustering_columns(core: &mut CursorCore, config: &TableConfig, size: usize) {
    let Some(data) = core.data.as_mut() else { return };
    let mut column = 0;
    while column < size {
        let limit = config.schema.clustering.len().min(column + 32);
        if column >= limit {
            break;
        }
        let header = data.read_unsigned_vint();
        let mut shift = 0u32;
        while column < limit {
            if (header >> shift) & 3 == 0 {
                let skip = TableSchema::column_size(config.schema.clustering[column], data);
                data.skip_bytes(skip as u64);
            }
            column += 1;
            shift += 2;
        }
    }
}

/// Decodes the present-columns encoding: 0 means every column, otherwise
/// for wide schemas (>= 64 columns) a count plus explicit indices of the
/// rarer polarity, and for narrow schemas a plain bitmap, LSB first.
fn decode_column_subset(data: &mut dyn Buffer, subset: &mut Vec<bool>, n_columns: usize) {
    let mut encoded = data.read_unsigned_vint();
    subset.clear();
    if encoded == 0 {
        subset.resize(n_columns, true);
    } else if n_columns >= 64 {
        let column_count = n_columns.saturating_sub(encoded as usize);
        let is_positive = column_count < n_columns / 2;
        subset.resize(n_columns, !is_positive);
        for _ in 0..column_count {
            let index = data.read_unsigned_vint() as usize;
            if index < n_columns {
                subset[index] = is_positive;
            }
        }
    } else {
        subset.reserve(n_columns);
        for _ in 0..n_columns {
            subset.push(encoded & 1 != 0);
            encoded >>= 1;
        }
    }
}
