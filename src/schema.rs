//! Table schema from the `-Statistics.db` serialization header.
//!
//! SSTable format `ma` and above stopped writing column names and sizes into
//! the data stream; cells are laid out positionally against the table schema
//! and integer fields are vint deltas against per-table minimums. This
//! module parses just enough of the serialization header to size and name
//! every cell: the minimum timestamp / local-deletion-time / TTL, the key
//! and clustering column formats, and the static and regular column lists.

use crate::buffer::Buffer;

/// How one column's values are laid out in the cell stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnFormat {
    Text,
    Int32,
    Uuid,
    Float,
    Long,
    Bool,
    Empty,
    Timestamp,
    /// Unrecognized marshal class; length-prefixed like text.
    Unknown,
}

const MARSHAL_PREFIX: &[u8] = b"org.apache.cassandra.db.marshal.";

#[derive(Clone, Debug, Default)]
pub struct TableSchema {
    pub min_timestamp: u64,
    pub min_local_deletion_time: u64,
    pub min_ttl: u64,
    pub key_type: Option<ColumnFormat>,
    pub clustering: Vec<ColumnFormat>,
    pub static_columns: Vec<(Vec<u8>, ColumnFormat)>,
    pub regular_columns: Vec<(Vec<u8>, ColumnFormat)>,
}

impl TableSchema {
    pub fn parse(&mut self, src: &mut dyn Buffer) {
        self.min_timestamp = src.read_unsigned_vint();
        self.min_local_deletion_time = src.read_unsigned_vint();
        self.min_ttl = src.read_unsigned_vint();

        self.key_type = Some(read_column_format(src));
        let clustering_count = src.read_unsigned_vint();
        for _ in 0..clustering_count {
            self.clustering.push(read_column_format(src));
        }

        read_columns(src, &mut self.static_columns);
        read_columns(src, &mut self.regular_columns);
    }

    /// Bytes occupied by one value of the given format. Variable-length
    /// formats carry an unsigned vint length in the stream, which this
    /// consumes.
    pub fn column_size(format: ColumnFormat, src: &mut dyn Buffer) -> usize {
        match format {
            ColumnFormat::Text | ColumnFormat::Unknown => src.read_unsigned_vint() as usize,
            ColumnFormat::Int32 | ColumnFormat::Float => 4,
            ColumnFormat::Long | ColumnFormat::Timestamp => 8,
            ColumnFormat::Uuid => 16,
            ColumnFormat::Bool => 1,
            ColumnFormat::Empty => 0,
        }
    }
}

fn read_columns(src: &mut dyn Buffer, columns: &mut Vec<(Vec<u8>, ColumnFormat)>) {
    let count = src.read_unsigned_vint();
    for _ in 0..count {
        let name = src.read_vint_string();
        columns.push((name, read_column_format(src)));
    }
}

fn read_column_format(src: &mut dyn Buffer) -> ColumnFormat {
    let identifier = src.read_vint_string();
    let Some(class_name) = identifier.strip_prefix(MARSHAL_PREFIX) else {
        return ColumnFormat::Unknown;
    };
    match class_name {
        b"UTF8Type" | b"AsciiType" => ColumnFormat::Text,
        b"LongType" => ColumnFormat::Long,
        b"Int32Type" => ColumnFormat::Int32,
        b"BoolType" => ColumnFormat::Bool,
        b"FloatType" => ColumnFormat::Float,
        b"EmptyType" => ColumnFormat::Empty,
        b"TimestampType" => ColumnFormat::Timestamp,
        b"UUIDType" | b"TimeUUIDType" | b"LexicalUUIDType" => ColumnFormat::Uuid,
        _ => ColumnFormat::Unknown,
    }
}
