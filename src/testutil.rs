//! Shared test fixtures: encoders and on-disk SSTable builders.
//!
//! The builders write real component files (`-Data.db`, `-Index.db`,
//! `-Statistics.db`, optionally `-Summary.db`) so tests exercise the same
//! read paths production does.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::merge::RowSink;
use crate::schema::{ColumnFormat, TableSchema};
use crate::sstable::STILL_ACTIVE;

/// Encodes a Cassandra unsigned vint, inverse of the decoder in `buffer`.
pub fn push_unsigned_vint(buf: &mut Vec<u8>, value: u64) {
    if value < 0x80 {
        buf.push(value as u8);
        return;
    }
    let mut extra = 1;
    while extra < 8 && value >= 1u64 << (7 * (extra + 1)) {
        extra += 1;
    }
    if extra == 8 {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_be_bytes());
        return;
    }
    buf.push((0xffu16 << (8 - extra)) as u8 | (value >> (8 * extra)) as u8);
    for i in (0..extra).rev() {
        buf.push((value >> (8 * i)) as u8);
    }
}

pub fn push_vint_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    push_unsigned_vint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn push_short_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as i16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// A schema of text columns with zeroed minimums, the common test shape.
pub fn text_schema(names: &[&str]) -> TableSchema {
    TableSchema {
        min_timestamp: 0,
        min_local_deletion_time: 0,
        min_ttl: 0,
        key_type: Some(ColumnFormat::Text),
        clustering: Vec::new(),
        static_columns: Vec::new(),
        regular_columns: names
            .iter()
            .map(|name| (name.as_bytes().to_vec(), ColumnFormat::Text))
            .collect(),
    }
}

/// Sink that collects everything it is fed.
#[derive(Default)]
pub struct TestSink {
    pub rows: Vec<SinkRow>,
}

#[derive(Default)]
pub struct SinkRow {
    pub key: Vec<u8>,
    pub columns: Vec<SinkColumn>,
}

pub struct SinkColumn {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub ts: i64,
    pub ttl: Option<(u32, u32)>,
}

impl RowSink for TestSink {
    fn new_row(&mut self, key: &[u8]) {
        self.rows.push(SinkRow { key: key.to_vec(), columns: Vec::new() });
    }

    fn new_column(&mut self, name: &[u8], value: &[u8], ts: i64) {
        self.rows.last_mut().unwrap().columns.push(SinkColumn {
            name: name.to_vec(),
            value: value.to_vec(),
            ts,
            ttl: None,
        });
    }

    fn new_column_with_ttl(
        &mut self,
        name: &[u8],
        value: &[u8],
        ts: i64,
        ttl: u32,
        expiration_secs: u32,
    ) {
        self.rows.last_mut().unwrap().columns.push(SinkColumn {
            name: name.to_vec(),
            value: value.to_vec(),
            ts,
            ttl: Some((ttl, expiration_secs)),
        });
    }
}

fn marshal_class(format: ColumnFormat) -> Vec<u8> {
    let name = match format {
        ColumnFormat::Text => "UTF8Type",
        ColumnFormat::Int32 => "Int32Type",
        ColumnFormat::Uuid => "UUIDType",
        ColumnFormat::Float => "FloatType",
        ColumnFormat::Long => "LongType",
        ColumnFormat::Bool => "BoolType",
        ColumnFormat::Empty => "EmptyType",
        ColumnFormat::Timestamp => "TimestampType",
        ColumnFormat::Unknown => return b"com.example.UnknownType".to_vec(),
    };
    format!("org.apache.cassandra.db.marshal.{name}").into_bytes()
}

fn serialize_schema(schema: &TableSchema) -> Vec<u8> {
    let mut buf = Vec::new();
    push_unsigned_vint(&mut buf, schema.min_timestamp);
    push_unsigned_vint(&mut buf, schema.min_local_deletion_time);
    push_unsigned_vint(&mut buf, schema.min_ttl);
    push_vint_string(&mut buf, &marshal_class(schema.key_type.unwrap_or(ColumnFormat::Text)));
    push_unsigned_vint(&mut buf, schema.clustering.len() as u64);
    for &format in &schema.clustering {
        push_vint_string(&mut buf, &marshal_class(format));
    }
    for columns in [&schema.static_columns, &schema.regular_columns] {
        push_unsigned_vint(&mut buf, columns.len() as u64);
        for (name, format) in columns {
            push_vint_string(&mut buf, name);
            push_vint_string(&mut buf, &marshal_class(*format));
        }
    }
    buf
}

/// Writes a `ka`-layout `-Statistics.db`: a component TOC with validation
/// metadata (the partitioner class) and, when given, a serialization
/// header.
pub fn write_statistics_ka(path: &Path, partitioner_class: &str, schema: Option<&TableSchema>) {
    let header = schema.map(serialize_schema);
    let component_count = 1 + usize::from(header.is_some());
    let toc_len = 4 + 8 * component_count;

    let mut validation = Vec::new();
    push_short_string(&mut validation, partitioner_class.as_bytes());

    let mut buf = Vec::new();
    buf.extend_from_slice(&(component_count as i32).to_be_bytes());
    buf.extend_from_slice(&0i32.to_be_bytes()); // validation metadata
    buf.extend_from_slice(&(toc_len as i32).to_be_bytes());
    if let Some(header) = &header {
        let header_offset = toc_len + validation.len();
        buf.extend_from_slice(&3i32.to_be_bytes()); // serialization header
        buf.extend_from_slice(&(header_offset as i32).to_be_bytes());
        buf.extend_from_slice(&validation);
        buf.extend_from_slice(header);
    } else {
        buf.extend_from_slice(&validation);
    }
    std::fs::write(path, buf).unwrap();
}

/// Builds `ka`-format (pre-`ma`) SSTable files.
pub struct OldTableBuilder {
    data: Vec<u8>,
    index: Vec<(Vec<u8>, u64)>,
}

impl OldTableBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { data: Vec::new(), index: Vec::new() }
    }

    pub fn begin_row(&mut self, key: &[u8], marked_for_deletion: i64) {
        self.index.push((key.to_vec(), self.data.len() as u64));
        push_short_string(&mut self.data, key);
        self.data.extend_from_slice(&0u32.to_be_bytes()); // local deletion
        self.data.extend_from_slice(&marked_for_deletion.to_be_bytes());
    }

    pub fn column(&mut self, name: &[u8], value: &[u8], ts: i64) {
        push_short_string(&mut self.data, name);
        self.data.push(0x00); // live
        self.data.extend_from_slice(&ts.to_be_bytes());
        self.push_value(value);
    }

    pub fn column_with_ttl(&mut self, name: &[u8], value: &[u8], ts: i64, ttl: i32, expiration: i32) {
        push_short_string(&mut self.data, name);
        self.data.push(0x02); // expiring
        self.data.extend_from_slice(&ttl.to_be_bytes());
        self.data.extend_from_slice(&expiration.to_be_bytes());
        self.data.extend_from_slice(&ts.to_be_bytes());
        self.push_value(value);
    }

    pub fn deleted_column(&mut self, name: &[u8], ts: i64) {
        push_short_string(&mut self.data, name);
        self.data.push(0x01); // tombstone
        self.data.extend_from_slice(&ts.to_be_bytes());
        self.push_value(b"");
    }

    pub fn counter_column(&mut self, name: &[u8], counter_ts: i64, ts: i64) {
        push_short_string(&mut self.data, name);
        self.data.push(0x04); // counter
        self.data.extend_from_slice(&counter_ts.to_be_bytes());
        self.data.extend_from_slice(&ts.to_be_bytes());
        self.push_value(b"");
    }

    pub fn range_tombstone(&mut self, start: &[u8], end: &[u8], ts: i64) {
        push_short_string(&mut self.data, start);
        self.data.push(0x10); // range tombstone
        push_short_string(&mut self.data, end);
        self.data.extend_from_slice(&0u32.to_be_bytes()); // local deletion
        self.data.extend_from_slice(&ts.to_be_bytes());
    }

    pub fn end_row(&mut self) {
        push_short_string(&mut self.data, b"");
    }

    fn push_value(&mut self, value: &[u8]) {
        self.data.extend_from_slice(&(value.len() as i32).to_be_bytes());
        self.data.extend_from_slice(value);
    }

    /// Writes `ks-tbl-ka-<generation>-{Data,Index,Statistics}.db` into
    /// `dir` and returns the component prefix.
    pub fn write(&self, dir: &Path, generation: u32) -> String {
        self.write_files(dir, generation, None)
    }

    /// Like [`Self::write`], also writing a `-Summary.db` covering every
    /// `interval`-th partition.
    pub fn write_with_summary(&self, dir: &Path, generation: u32, interval: usize) -> String {
        self.write_files(dir, generation, Some(interval))
    }

    fn write_files(&self, dir: &Path, generation: u32, summary_interval: Option<usize>) -> String {
        let prefix = dir.join(format!("ks-tbl-ka-{generation}")).to_string_lossy().into_owned();
        std::fs::write(format!("{prefix}-Data.db"), &self.data).unwrap();

        let mut index = Vec::new();
        let mut index_offsets = Vec::new();
        for (key, data_offset) in &self.index {
            index_offsets.push((key.clone(), index.len() as u64));
            push_short_string(&mut index, key);
            index.extend_from_slice(&(*data_offset as i64).to_be_bytes());
            index.extend_from_slice(&0i32.to_be_bytes()); // promoted index
        }
        std::fs::write(format!("{prefix}-Index.db"), &index).unwrap();

        write_statistics_ka(
            Path::new(&format!("{prefix}-Statistics.db")),
            "org.apache.cassandra.dht.ByteOrderedPartitioner",
            None,
        );

        if let Some(interval) = summary_interval {
            let sampled: Vec<&(Vec<u8>, u64)> =
                index_offsets.iter().step_by(interval.max(1)).collect();

            // Packed blob: native-endian offset table, then entries of
            // (key bytes, native-endian i64 index offset).
            let table_len = sampled.len() * 4;
            let mut entries = Vec::new();
            let mut offsets = Vec::new();
            for (key, index_offset) in &sampled {
                offsets.push((table_len + entries.len()) as i32);
                entries.extend_from_slice(key);
                entries.extend_from_slice(&(*index_offset as i64).to_ne_bytes());
            }

            let mem_size = (table_len + entries.len()) as i64;
            let mut summary = Vec::new();
            summary.extend_from_slice(&128i32.to_be_bytes()); // min index interval
            summary.extend_from_slice(&(sampled.len() as i32).to_be_bytes());
            summary.extend_from_slice(&mem_size.to_be_bytes());
            summary.extend_from_slice(&[0u8; 8]); // sampling level fields
            for offset in offsets {
                summary.extend_from_slice(&offset.to_ne_bytes());
            }
            summary.extend_from_slice(&entries);
            std::fs::write(format!("{prefix}-Summary.db"), &summary).unwrap();
        }

        prefix
    }
}

// New-format row flags, mirrored from the reader.
const END_OF_PARTITION: u8 = 0x01;
const IS_MARKER: u8 = 0x02;
const HAS_TIMESTAMP: u8 = 0x04;
const HAS_TTL: u8 = 0x08;
const HAS_ALL_COLUMNS: u8 = 0x20;

const CELL_IS_EXPIRING: u8 = 0x02;
const CELL_HAS_EMPTY_VALUE: u8 = 0x04;
const CELL_USE_ROW_TIMESTAMP: u8 = 0x08;
const CELL_USE_ROW_TTL: u8 = 0x10;

/// Builds `ma`-format SSTable files against a text-column schema.
pub struct NewTableBuilder {
    schema: TableSchema,
    data: Vec<u8>,
    index: Vec<(Vec<u8>, u64)>,
}

impl NewTableBuilder {
    pub fn new(schema: TableSchema) -> Self {
        Self { schema, data: Vec::new(), index: Vec::new() }
    }

    pub fn begin_partition(&mut self, key: &[u8], marked_for_deletion: i64) {
        self.index.push((key.to_vec(), self.data.len() as u64));
        push_short_string(&mut self.data, key);
        self.data.extend_from_slice(&0u32.to_be_bytes()); // local deletion
        self.data.extend_from_slice(&marked_for_deletion.to_be_bytes());
    }

    pub fn end_partition(&mut self) {
        self.data.push(END_OF_PARTITION);
    }

    /// A row stamped with one timestamp; `None` columns are absent and
    /// encoded through the subset bitmap.
    pub fn row(&mut self, ts: u64, values: &[Option<&[u8]>]) {
        let all_present = values.iter().all(Option::is_some);
        let mut flags = HAS_TIMESTAMP;
        if all_present {
            flags |= HAS_ALL_COLUMNS;
        }
        self.data.push(flags);
        self.row_prelude();
        push_unsigned_vint(&mut self.data, ts - self.schema.min_timestamp);
        if !all_present {
            let mut bitmap = 0u64;
            for (i, value) in values.iter().enumerate() {
                if value.is_some() {
                    bitmap |= 1 << i;
                }
            }
            push_unsigned_vint(&mut self.data, bitmap);
        }
        for value in values.iter().flatten() {
            self.data.push(CELL_USE_ROW_TIMESTAMP);
            self.push_cell_value(value);
        }
    }

    /// A row with a row-level TTL that every cell references.
    pub fn row_with_ttl(&mut self, ts: u64, ttl: u64, expiration: u64, values: &[Option<&[u8]>]) {
        self.data.push(HAS_TIMESTAMP | HAS_TTL | HAS_ALL_COLUMNS);
        self.row_prelude();
        push_unsigned_vint(&mut self.data, ts - self.schema.min_timestamp);
        push_unsigned_vint(&mut self.data, ttl - self.schema.min_ttl);
        push_unsigned_vint(&mut self.data, expiration - self.schema.min_local_deletion_time);
        for value in values.iter().flatten() {
            self.data.push(CELL_USE_ROW_TIMESTAMP | CELL_USE_ROW_TTL);
            self.push_cell_value(value);
        }
    }

    /// A row of self-stamped cells: `(value, ts_delta, Some((ttl_delta,
    /// local_deletion_delta)))`, deltas raw as they appear on disk.
    pub fn cell_row(&mut self, cells: &[(&[u8], u64, Option<(u64, u64)>)]) {
        self.data.push(HAS_ALL_COLUMNS);
        self.row_prelude();
        for (value, ts_delta, expiry) in cells {
            match expiry {
                Some((ttl_delta, local_deletion_delta)) => {
                    self.data.push(CELL_IS_EXPIRING);
                    push_unsigned_vint(&mut self.data, *ts_delta);
                    push_unsigned_vint(&mut self.data, *local_deletion_delta);
                    push_unsigned_vint(&mut self.data, *ttl_delta);
                }
                None => {
                    self.data.push(0x00);
                    push_unsigned_vint(&mut self.data, *ts_delta);
                }
            }
            self.push_cell_value(value);
        }
    }

    /// A single-cell row whose value is flagged empty (no bytes follow).
    pub fn empty_value_row(&mut self, ts: u64) {
        self.data.push(HAS_TIMESTAMP | HAS_ALL_COLUMNS);
        self.row_prelude();
        push_unsigned_vint(&mut self.data, ts - self.schema.min_timestamp);
        self.data.push(CELL_USE_ROW_TIMESTAMP | CELL_HAS_EMPTY_VALUE);
    }

    /// A two-cell row (for a two-column schema) whose first cell is flagged
    /// empty and whose second carries `value`.
    pub fn row_with_empty_first_cell(&mut self, ts: u64, value: &[u8]) {
        self.data.push(HAS_TIMESTAMP | HAS_ALL_COLUMNS);
        self.row_prelude();
        push_unsigned_vint(&mut self.data, ts - self.schema.min_timestamp);
        self.data.push(CELL_USE_ROW_TIMESTAMP | CELL_HAS_EMPTY_VALUE);
        self.data.push(CELL_USE_ROW_TIMESTAMP);
        self.push_cell_value(value);
    }

    /// A range tombstone marker deleting at `ts`.
    pub fn marker(&mut self, ts: i64) {
        self.data.push(IS_MARKER);
        self.data.push(0x00); // bound type
        self.data.extend_from_slice(&0i16.to_be_bytes()); // clustering size
        push_unsigned_vint(&mut self.data, 0); // row size
        push_unsigned_vint(&mut self.data, 0); // previous unfiltered size
        self.data.extend_from_slice(&ts.to_be_bytes());
        self.data.extend_from_slice(&0u32.to_be_bytes()); // local deletion
    }

    fn row_prelude(&mut self) {
        push_unsigned_vint(&mut self.data, 0); // row size
        push_unsigned_vint(&mut self.data, 0); // previous unfiltered size
    }

    fn push_cell_value(&mut self, value: &[u8]) {
        push_unsigned_vint(&mut self.data, value.len() as u64);
        self.data.extend_from_slice(value);
    }

    /// Writes `ma-<generation>-big-{Data,Index,Statistics}.db` into `dir`
    /// (which should be a `<keyspace>/<table>` path) and returns the
    /// component prefix.
    pub fn write(&self, dir: &Path, generation: u32) -> String {
        let prefix = dir.join(format!("ma-{generation}-big")).to_string_lossy().into_owned();
        std::fs::write(format!("{prefix}-Data.db"), &self.data).unwrap();

        let mut index = Vec::new();
        for (key, data_offset) in &self.index {
            push_short_string(&mut index, key);
            push_unsigned_vint(&mut index, *data_offset);
            push_unsigned_vint(&mut index, 0); // promoted index
        }
        std::fs::write(format!("{prefix}-Index.db"), &index).unwrap();

        write_statistics_ka(
            Path::new(&format!("{prefix}-Statistics.db")),
            "org.apache.cassandra.dht.ByteOrderedPartitioner",
            Some(&self.schema),
        );
        prefix
    }
}

#[derive(Clone, Copy)]
enum FixtureCodec {
    Lz4,
    Snappy,
    Deflate,
}

#[derive(Clone, Copy)]
enum FixtureChecksum {
    Crc32,
    Adler32,
}

/// A chunk-compressed `-Data.db` plus its `-CompressionInfo.db`.
pub struct ChunkedFixture {
    pub data_path: PathBuf,
    pub info_path: PathBuf,
}

impl ChunkedFixture {
    pub fn lz4(dir: &Path, name: &str, payload: &[u8], chunk_len: usize) -> Self {
        Self::build(dir, name, payload, chunk_len, FixtureCodec::Lz4, FixtureChecksum::Crc32)
    }

    pub fn lz4_adler(dir: &Path, name: &str, payload: &[u8], chunk_len: usize) -> Self {
        Self::build(dir, name, payload, chunk_len, FixtureCodec::Lz4, FixtureChecksum::Adler32)
    }

    pub fn snappy(dir: &Path, name: &str, payload: &[u8], chunk_len: usize) -> Self {
        Self::build(dir, name, payload, chunk_len, FixtureCodec::Snappy, FixtureChecksum::Crc32)
    }

    pub fn deflate(dir: &Path, name: &str, payload: &[u8], chunk_len: usize) -> Self {
        Self::build(dir, name, payload, chunk_len, FixtureCodec::Deflate, FixtureChecksum::Crc32)
    }

    /// An info file naming an arbitrary compressor class, for rejection
    /// tests.
    pub fn with_class(dir: &Path, name: &str, payload: &[u8], chunk_len: usize, class: &[u8]) -> Self {
        let data_path = dir.join(format!("{name}-Data.db"));
        let info_path = dir.join(format!("{name}-CompressionInfo.db"));
        std::fs::write(&data_path, payload).unwrap();

        let mut info = Vec::new();
        push_short_string(&mut info, class);
        info.extend_from_slice(&0i32.to_be_bytes()); // parameters
        info.extend_from_slice(&(chunk_len as i32).to_be_bytes());
        info.extend_from_slice(&(payload.len() as i64).to_be_bytes());
        info.extend_from_slice(&0i32.to_be_bytes()); // offsets
        std::fs::write(&info_path, info).unwrap();

        Self { data_path, info_path }
    }

    fn build(
        dir: &Path,
        name: &str,
        payload: &[u8],
        chunk_len: usize,
        codec: FixtureCodec,
        checksum: FixtureChecksum,
    ) -> Self {
        const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

        let data_path = dir.join(format!("{name}-Data.db"));
        let info_path = dir.join(format!("{name}-CompressionInfo.db"));

        let mut data = Vec::new();
        let mut offsets = Vec::new();
        for chunk in payload.chunks(chunk_len) {
            offsets.push(data.len() as i64);
            let body = match codec {
                FixtureCodec::Lz4 => {
                    let mut body = (chunk.len() as u32).to_le_bytes().to_vec();
                    body.extend_from_slice(&lz4_flex::block::compress(chunk));
                    body
                }
                FixtureCodec::Snappy => snap::raw::Encoder::new().compress_vec(chunk).unwrap(),
                FixtureCodec::Deflate => {
                    let mut encoder = flate2::write::ZlibEncoder::new(
                        Vec::new(),
                        flate2::Compression::default(),
                    );
                    encoder.write_all(chunk).unwrap();
                    encoder.finish().unwrap()
                }
            };
            let sum = match checksum {
                FixtureChecksum::Crc32 => CRC32.checksum(&body),
                FixtureChecksum::Adler32 => {
                    let mut adler = adler32::RollingAdler32::new();
                    adler.update_buffer(&body);
                    adler.hash()
                }
            };
            data.extend_from_slice(&body);
            data.extend_from_slice(&sum.to_be_bytes());
        }
        std::fs::write(&data_path, &data).unwrap();

        let class: &[u8] = match codec {
            FixtureCodec::Lz4 => b"LZ4Compressor",
            FixtureCodec::Snappy => b"SnappyCompressor",
            FixtureCodec::Deflate => b"DeflateCompressor",
        };
        let mut info = Vec::new();
        push_short_string(&mut info, class);
        info.extend_from_slice(&0i32.to_be_bytes()); // parameters
        info.extend_from_slice(&(chunk_len as i32).to_be_bytes());
        info.extend_from_slice(&(payload.len() as i64).to_be_bytes());
        info.extend_from_slice(&(offsets.len() as i32).to_be_bytes());
        for offset in offsets {
            info.extend_from_slice(&offset.to_be_bytes());
        }
        std::fs::write(&info_path, info).unwrap();

        Self { data_path, info_path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, FileSource};
    use crate::tmpfs::TempDir;

    #[test]
    fn vint_encoder_matches_decoder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vints");
        let mut buf = Vec::new();
        let values = [0u64, 0x7f, 0x80, 0x3fff, 1 << 21, 1 << 55, u64::MAX];
        for &v in &values {
            push_unsigned_vint(&mut buf, v);
        }
        std::fs::write(&path, &buf).unwrap();

        let mut src = FileSource::open(&path).unwrap();
        for &v in &values {
            assert_eq!(src.read_unsigned_vint(), v);
        }
    }

    #[test]
    fn old_builder_rows_terminate() {
        let mut builder = OldTableBuilder::new();
        builder.begin_row(b"k", STILL_ACTIVE);
        builder.end_row();
        // Key, local deletion, deletion marker, terminator.
        assert_eq!(builder.data.len(), 2 + 1 + 4 + 8 + 2);
    }
}
