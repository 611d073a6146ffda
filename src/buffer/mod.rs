//! Byte sources over SSTable component files.
//!
//! Everything an SSTable cursor reads comes through the [`Buffer`] trait: a
//! random-access byte source with typed decoders layered on top. Two
//! implementations exist, one per on-disk representation of `-Data.db`:
//!
//! - [`FileSource`]: a plain file read sequentially with seeks.
//! - [`ChunkedSource`]: chunk-compressed data described by a sibling
//!   `-CompressionInfo.db`, decompressed on demand with per-chunk checksums.
//!
//! # Decoder conventions
//!
//! Multi-byte integers in SSTable components are big-endian; floats are
//! host-endian (they are memcpy'd by the writer). Variable-length integers
//! use the Cassandra vint scheme: the count of leading one-bits in the first
//! byte gives the number of extra bytes, and the remaining low bits of the
//! first byte are concatenated big-endian with those extra bytes.
//!
//! Decoders at end-of-file return zero/empty rather than failing; callers
//! watch [`Buffer::is_eof`]. The row/column state machines in `sstable` rely
//! on this to treat EOF as a stream state instead of an error.

pub mod chunked;
pub mod file;

pub use chunked::{ChecksumKind, ChunkedSource};
pub use file::FileSource;

use byteorder::{BigEndian, ByteOrder, NativeEndian};

pub trait Buffer {
    /// Reads exactly `n` bytes, returning a borrow of an internal buffer.
    /// Returns None and sets the EOF flag if the source is exhausted.
    fn read_bytes(&mut self, n: usize) -> Option<&[u8]>;

    /// Advances the read position by `n` bytes without reading.
    fn skip_bytes(&mut self, n: u64);

    /// Moves the read position to an absolute offset.
    fn seek(&mut self, position: u64);

    /// True once any read has failed or run past the end of the source.
    fn is_eof(&self) -> bool;

    fn read_u8(&mut self) -> u8 {
        self.read_bytes(1).map_or(0, |b| b[0])
    }

    fn read_i16(&mut self) -> i16 {
        self.read_bytes(2).map_or(0, BigEndian::read_i16)
    }

    fn read_i32(&mut self) -> i32 {
        self.read_bytes(4).map_or(0, BigEndian::read_i32)
    }

    fn read_i64(&mut self) -> i64 {
        self.read_bytes(8).map_or(0, BigEndian::read_i64)
    }

    fn read_f32(&mut self) -> f32 {
        self.read_bytes(4).map_or(0.0, NativeEndian::read_f32)
    }

    fn read_f64(&mut self) -> f64 {
        self.read_bytes(8).map_or(0.0, NativeEndian::read_f64)
    }

    /// Cassandra unsigned vint: leading one-bits of the first byte count the
    /// extra bytes (0..=8); the low bits of the first byte are concatenated
    /// big-endian with the extra bytes.
    fn read_unsigned_vint(&mut self) -> u64 {
        let first = match self.read_bytes(1) {
            Some(b) => b[0],
            None => return 0,
        };

        if first < 0x7f {
            return u64::from(first);
        }

        let mut extra_bytes = 0;
        while extra_bytes < 8 && first & (0x80 >> extra_bytes) != 0 {
            extra_bytes += 1;
        }

        // The leading ones are masked away.
        let mut value = u64::from(first & (0xffu16 >> extra_bytes) as u8);
        let data = match self.read_bytes(extra_bytes) {
            Some(b) => b,
            None => return 0,
        };
        for &byte in data {
            value = (value << 8) | u64::from(byte);
        }
        value
    }

    /// Signed vint: zig-zag transform of the unsigned decoding, matching the
    /// on-disk writer byte for byte.
    fn read_vint(&mut self) -> i64 {
        let n = self.read_unsigned_vint() as i64;
        (n << 1) ^ (n >> 63)
    }

    /// Short-length string: big-endian i16 length then that many bytes.
    fn read_short_string(&mut self) -> Vec<u8> {
        let len = self.read_i16();
        if self.is_eof() || len <= 0 {
            return Vec::new();
        }
        self.read_bytes(len as usize).map_or_else(Vec::new, <[u8]>::to_vec)
    }

    /// Vint-length string: unsigned vint length then that many bytes.
    fn read_vint_string(&mut self) -> Vec<u8> {
        let len = self.read_unsigned_vint();
        if self.is_eof() {
            return Vec::new();
        }
        self.read_bytes(len as usize).map_or_else(Vec::new, <[u8]>::to_vec)
    }

    /// Length-prefixed blob: big-endian i32 length then that many bytes.
    /// Returns false at EOF.
    fn read_data(&mut self, out: &mut Vec<u8>) -> bool {
        let len = self.read_i32();
        if self.is_eof() || len < 0 {
            return false;
        }
        match self.read_bytes(len as usize) {
            Some(bytes) => {
                out.clear();
                out.extend_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Skips a length-prefixed blob without materializing it.
    fn skip_data(&mut self) {
        let len = self.read_i32();
        if len > 0 {
            self.skip_bytes(len as u64);
        }
    }
}

/// The byte source behind one SSTable's `-Data.db`: chunk-compressed when a
/// `-CompressionInfo.db` sits next to it, a plain file otherwise.
pub enum DataSource {
    Plain(FileSource),
    Chunked(ChunkedSource),
}

impl Buffer for DataSource {
    fn read_bytes(&mut self, n: usize) -> Option<&[u8]> {
        match self {
            DataSource::Plain(source) => source.read_bytes(n),
            DataSource::Chunked(source) => source.read_bytes(n),
        }
    }

    fn skip_bytes(&mut self, n: u64) {
        match self {
            DataSource::Plain(source) => source.skip_bytes(n),
            DataSource::Chunked(source) => source.skip_bytes(n),
        }
    }

    fn seek(&mut self, position: u64) {
        match self {
            DataSource::Plain(source) => source.seek(position),
            DataSource::Chunked(source) => source.seek(position),
        }
    }

    fn is_eof(&self) -> bool {
        match self {
            DataSource::Plain(source) => source.is_eof(),
            DataSource::Chunked(source) => source.is_eof(),
        }
    }
}
