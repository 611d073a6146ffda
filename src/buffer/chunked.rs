//! Chunk-compressed byte source over `-Data.db`.
//!
//! A compressed SSTable data file is a sequence of independently compressed
//! chunks, each followed by a 4-byte big-endian checksum. The sibling
//! `-CompressionInfo.db` names the compressor and lists the file offset of
//! every chunk:
//!
//! ```text
//! +---------------------------+
//! | compressor class (string) |
//! +---------------------------+
//! | param count + (k,v) pairs |
//! +---------------------------+
//! | chunk length (i32)        |
//! +---------------------------+
//! | uncompressed length (i64) |
//! +---------------------------+
//! | offset count + offsets    |
//! +---------------------------+
//! ```
//!
//! Reads are served from an in-memory window covering a contiguous range of
//! uncompressed bytes. A read outside the window decompresses the covering
//! chunk span in one positioned read, keeping any still-useful tail of the
//! old window. Depending on the format vintage the checksum runs over the
//! compressed or the decompressed bytes; a mismatch is fatal to the export.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::error;

use crate::buffer::{Buffer, FileSource};
use crate::errdata;
use crate::error::Result;

/// zlib's CRC32, as used by the SSTable writers.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Which checksum the SSTable format vintage stores per chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumKind {
    Adler32,
    Crc32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compression {
    Lz4,
    Snappy,
    Deflate,
}

pub struct ChunkedSource {
    file: File,
    /// Length of the compressed file, bounding the final chunk.
    file_len: u64,
    path: PathBuf,
    compression: Compression,
    /// Uncompressed bytes per chunk (constant, except the final chunk may
    /// cover less).
    chunk_len: u64,
    /// Total uncompressed length of the data file.
    uncompressed_len: u64,
    /// Per-chunk start offsets in the compressed file.
    offsets: Vec<u64>,
    checksum: ChecksumKind,
    /// Verify against compressed bytes (newer formats) or decompressed.
    verify_compressed: bool,
    /// Checksum verification toggle (the `-C` flag clears it).
    verify: bool,
    /// Window of decompressed bytes starting at `window_offset` in
    /// uncompressed space.
    window: Vec<u8>,
    window_offset: u64,
    /// Current read position in uncompressed space.
    file_offset: u64,
    eof: bool,
}

impl ChunkedSource {
    pub fn open(
        data_path: &Path,
        info_path: &Path,
        checksum: ChecksumKind,
        verify_compressed: bool,
        verify: bool,
    ) -> Result<Self> {
        let mut info = FileSource::open(info_path)?;

        let class_name = info.read_short_string();
        let compression = match class_name.as_slice() {
            b"SnappyCompressor" => Compression::Snappy,
            b"LZ4Compressor" => Compression::Lz4,
            b"DeflateCompressor" => Compression::Deflate,
            other => {
                return errdata!(
                    "unknown compression algorithm {:?} in {}",
                    String::from_utf8_lossy(other),
                    info_path.display()
                )
            }
        };

        let param_count = info.read_i32();
        for _ in 0..param_count.max(0) {
            info.read_short_string();
            info.read_short_string();
        }

        let chunk_len = info.read_i32();
        let uncompressed_len = info.read_i64();
        if chunk_len <= 0 || uncompressed_len < 0 {
            return errdata!("corrupt compression info in {}", info_path.display());
        }

        let offset_count = info.read_i32().max(0) as usize;
        let mut offsets = Vec::with_capacity(offset_count);
        for _ in 0..offset_count {
            offsets.push(info.read_i64() as u64);
        }
        if info.is_eof() {
            return errdata!("truncated compression info in {}", info_path.display());
        }

        let file = File::open(data_path)?;
        let file_len = file.metadata()?.len();

        Ok(Self {
            file,
            file_len,
            path: data_path.to_path_buf(),
            compression,
            chunk_len: chunk_len as u64,
            uncompressed_len: uncompressed_len as u64,
            offsets,
            checksum,
            verify_compressed,
            verify,
            window: Vec::new(),
            window_offset: 0,
            file_offset: 0,
            eof: false,
        })
    }

    /// Rebuilds the window so it covers `[file_offset, last_required)`,
    /// keeping any tail of the current window that is still ahead of the
    /// read position.
    fn refill(&mut self, last_required: u64) -> Result<()> {
        let last_chunk = last_required.div_ceil(self.chunk_len) as usize;
        let window_end = self.window_offset + self.window.len() as u64;

        let mut first_chunk = (self.file_offset / self.chunk_len) as usize;
        let mut useful = 0usize;
        if self.file_offset >= self.window_offset && self.file_offset <= window_end {
            first_chunk = (window_end / self.chunk_len) as usize;
            useful = (window_end - self.file_offset) as usize;
        }

        if last_chunk > self.offsets.len() || first_chunk >= last_chunk {
            return errdata!("chunk index out of range in {}", self.path.display());
        }

        let chunk_len = self.chunk_len as usize;
        let min_length = (last_chunk - first_chunk) * chunk_len + useful;

        // Retain the still-useful suffix of the old window at the front.
        let retained_start = (self.file_offset.saturating_sub(self.window_offset)) as usize;
        let mut window = Vec::with_capacity(min_length);
        window.extend_from_slice(&self.window[retained_start..retained_start + useful]);
        window.resize(min_length, 0);
        self.window = window;
        self.window_offset = first_chunk as u64 * self.chunk_len - useful as u64;

        // One positioned read covering every chunk needed.
        let start_of_read = self.offsets[first_chunk];
        let end_of_read = if last_chunk < self.offsets.len() {
            self.offsets[last_chunk]
        } else {
            self.file_len
        };
        let mut compressed = vec![0u8; (end_of_read - start_of_read) as usize];
        self.file.read_exact_at(&mut compressed, start_of_read)?;

        for i in first_chunk..last_chunk {
            let start_of_this = self.offsets[i];
            let end_of_this = if i + 1 == last_chunk { end_of_read } else { self.offsets[i + 1] };
            if end_of_this < start_of_this + 4 {
                return errdata!("chunk {i} out of order in {}", self.path.display());
            }
            let chunk_size = (end_of_this - start_of_this - 4) as usize;
            let body_start = (start_of_this - start_of_read) as usize;
            let body = &compressed[body_start..body_start + chunk_size];
            let stored = BigEndian::read_u32(&compressed[body_start + chunk_size..body_start + chunk_size + 4]);

            if self.verify && self.verify_compressed {
                self.verify_chunk(body, stored, start_of_this, end_of_this);
            }

            let out_pos = (i - first_chunk) * chunk_len + useful;
            decompress_chunk(
                self.compression,
                body,
                &mut self.window[out_pos..out_pos + chunk_len],
                &self.path,
            )?;

            if self.verify && !self.verify_compressed {
                // The final chunk decompresses to less than a full chunk.
                let real_len = (self.uncompressed_len - (self.window_offset + out_pos as u64))
                    .min(self.chunk_len) as usize;
                self.verify_chunk(
                    &self.window[out_pos..out_pos + real_len],
                    stored,
                    start_of_this,
                    end_of_this,
                );
            }
        }
        Ok(())
    }

    fn verify_chunk(&self, data: &[u8], stored: u32, start: u64, end: u64) {
        let computed = match self.checksum {
            ChecksumKind::Crc32 => CRC32.checksum(data),
            ChecksumKind::Adler32 => {
                let mut adler = adler32::RollingAdler32::new();
                adler.update_buffer(data);
                adler.hash()
            }
        };
        if computed != stored {
            // Corruption is fatal: carrying on would stream garbage into the
            // target store.
            error!(
                "checksum mismatch at {} {start} - {end} {stored:x} {computed:x}",
                self.path.display()
            );
            std::process::exit(1);
        }
    }
}

fn decompress_chunk(
    compression: Compression,
    body: &[u8],
    out: &mut [u8],
    path: &Path,
) -> Result<()> {
    match compression {
        Compression::Snappy => {
            snap::raw::Decoder::new()
                .decompress(body, out)
                .map_err(|err| crate::Error::InvalidData(format!("snappy chunk in {}: {err}", path.display())))?;
        }
        Compression::Lz4 => {
            // The chunk body leads with the little-endian uncompressed size.
            if body.len() < 4 {
                return errdata!("short lz4 chunk in {}", path.display());
            }
            let block_len = LittleEndian::read_u32(&body[..4]) as usize;
            if block_len > out.len() {
                return errdata!("oversized lz4 chunk in {}", path.display());
            }
            lz4_flex::block::decompress_into(&body[4..], &mut out[..block_len])
                .map_err(|err| crate::Error::InvalidData(format!("lz4 chunk in {}: {err}", path.display())))?;
        }
        Compression::Deflate => {
            let mut decoder = flate2::read::ZlibDecoder::new(body);
            let mut written = 0;
            loop {
                match decoder.read(&mut out[written..]) {
                    Ok(0) => break,
                    Ok(n) => written += n,
                    Err(err) => {
                        return errdata!("deflate chunk in {}: {err}", path.display());
                    }
                }
                if written == out.len() {
                    break;
                }
            }
        }
    }
    Ok(())
}

impl Buffer for ChunkedSource {
    fn read_bytes(&mut self, n: usize) -> Option<&[u8]> {
        if n == 0 {
            return Some(&[]);
        }
        let last_required = self.file_offset + n as u64;
        if last_required > self.uncompressed_len {
            self.eof = true;
            return None;
        }

        let window_end = self.window_offset + self.window.len() as u64;
        if self.file_offset < self.window_offset || last_required > window_end {
            if let Err(err) = self.refill(last_required) {
                error!("failed to read {}: {err}", self.path.display());
                self.eof = true;
                return None;
            }
        }

        let start = (self.file_offset - self.window_offset) as usize;
        self.file_offset += n as u64;
        Some(&self.window[start..start + n])
    }

    fn skip_bytes(&mut self, n: u64) {
        self.file_offset += n;
    }

    fn seek(&mut self, position: u64) {
        self.file_offset = position;
    }

    fn is_eof(&self) -> bool {
        self.eof
    }
}
