//! Row/column stream for SSTable formats before `ma`.
//!
//! Cells in these formats are self-describing: every column carries its name
//! and value length inline. Versions below `ja` prefix each row with a
//! column count; `ja` and later end the row with an empty column name.

use crate::buffer::Buffer;
use crate::partitioner::Partitioner;
use crate::sstable::{ColumnExtra, CursorCore, Fsm, TableConfig, VERSION_D, VERSION_JA};

const DELETION_MASK: u8 = 0x01;
const EXPIRATION_MASK: u8 = 0x02;
const COUNTER_MASK: u8 = 0x04;
const RANGE_TOMBSTONE_MASK: u8 = 0x10;

pub(crate) struct OldState {
    /// Columns left in the current row. Only meaningful below `ja`.
    remaining_columns: usize,
}

impl OldState {
    pub fn new() -> Self {
        Self { remaining_columns: 0 }
    }

    pub fn reset(&mut self) {}

    pub fn read_row(
        &mut self,
        core: &mut CursorCore,
        config: &TableConfig,
        partitioner: &Partitioner,
    ) -> bool {
        debug_assert_eq!(core.fsm, Fsm::ReadRow);
        let Some(data) = core.data.as_mut() else { return true };

        core.next_key = data.read_short_string();
        if data.is_eof() {
            return true;
        }
        core.next_token = partitioner.assign_token(&core.next_key);

        if config.version < VERSION_D {
            data.skip_bytes(4); // row size
        } else if config.version < VERSION_JA {
            data.skip_bytes(8); // row size
        }

        data.skip_bytes(4); // local deletion
        core.row_marked_for_deletion = data.read_i64();

        if config.version < VERSION_JA {
            self.remaining_columns = data.read_i32().max(0) as usize;
        }

        core.fsm = Fsm::ReadColumn;
        self.read_column(core, config);
        core.data.as_ref().is_some_and(|d| d.is_eof())
    }

    pub fn read_column(&mut self, core: &mut CursorCore, config: &TableConfig) -> bool {
        // A row with no columns (deletion-only) is already back at the row
        // boundary; there is nothing to consume.
        if core.fsm == Fsm::ReadRow {
            return false;
        }
        if core.fsm == Fsm::ReadColumnData {
            if let Some(data) = core.data.as_mut() {
                data.skip_data();
            }
            core.fsm = Fsm::ReadColumn;
        }

        debug_assert_eq!(core.fsm, Fsm::ReadColumn);
        core.column.clear_flags();

        // Below ja, rows are delimited by a column count.
        if config.version < VERSION_JA {
            if self.remaining_columns > 0 {
                self.remaining_columns -= 1;
            } else {
                core.column.name.clear();
                core.fsm = Fsm::ReadRow;
                return false;
            }
        }

        let Some(data) = core.data.as_mut() else { return false };

        // ja and above use an empty column name to terminate the row.
        core.column.name = data.read_short_string();
        if core.column.name.is_empty() {
            core.fsm = Fsm::ReadRow;
            return false;
        }

        peel_compound_path(&mut core.column.name);

        let flags = data.read_u8();
        core.column.deleted = flags & DELETION_MASK != 0;
        if flags & RANGE_TOMBSTONE_MASK != 0 {
            // The column name is the range start; `data` carries the end.
            core.column.data = data.read_short_string();
            data.skip_bytes(4); // local deletion
            core.column.ts = data.read_i64();
            core.column.range_tombstone = true;
            // No value follows; stay in ReadColumn.
        } else {
            if flags & COUNTER_MASK != 0 {
                core.column.extra = ColumnExtra::Counter(data.read_i64());
            } else if flags & EXPIRATION_MASK != 0 {
                let ttl = data.read_i32() as u32;
                let expiration = data.read_i32() as u32;
                core.column.extra = ColumnExtra::Expiration { ttl, expiration };
                core.column.expiring = true;
            }
            core.column.ts = data.read_i64();
            core.fsm = Fsm::ReadColumnData;
        }
        true
    }

    pub fn read_column_data(&mut self, core: &mut CursorCore, out: &mut Vec<u8>) -> bool {
        debug_assert_eq!(core.fsm, Fsm::ReadColumnData);
        let Some(data) = core.data.as_mut() else { return false };
        let result = data.read_data(out);
        core.fsm = Fsm::ReadColumn;
        result
    }
}

/// Composite column names wrap the interesting element in a sequence of
/// length-prefixed path segments, each followed by an end-of-component
/// byte. Clustering paths are not reconstructed; only the final element
/// survives as the column name.
fn peel_compound_path(name: &mut Vec<u8>) {
    let total = name.len();
    let mut remaining = total;
    while remaining >= 2 {
        let advanced = total - remaining;
        let len = ((name[advanced] as usize) << 8) | name[advanced + 1] as usize;
        if remaining > len + 3 {
            remaining -= len + 3;
        } else {
            if remaining == len + 3 {
                *name = name[advanced + 2..advanced + 2 + len].to_vec();
            }
            break;
        }
    }
}
