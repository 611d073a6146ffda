//! Plain-file byte source.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::buffer::Buffer;
use crate::error::Result;

/// Sequential + seekable reader over an uncompressed component file
/// (`-Index.db`, `-Summary.db`, `-Statistics.db`, or an uncompressed
/// `-Data.db`). Reads land in a grow-only scratch buffer that each
/// `read_bytes` call hands out a borrow of.
pub struct FileSource {
    file: File,
    scratch: Vec<u8>,
    eof: bool,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { file, scratch: Vec::new(), eof: false })
    }
}

impl Buffer for FileSource {
    fn read_bytes(&mut self, n: usize) -> Option<&[u8]> {
        if self.scratch.len() < n {
            self.scratch.resize(n, 0);
        }
        if self.file.read_exact(&mut self.scratch[..n]).is_err() {
            self.eof = true;
            return None;
        }
        Some(&self.scratch[..n])
    }

    fn skip_bytes(&mut self, n: u64) {
        let _ = self.file.seek(SeekFrom::Current(n as i64));
    }

    fn seek(&mut self, position: u64) {
        self.eof = self.file.seek(SeekFrom::Start(position)).is_err();
    }

    fn is_eof(&self) -> bool {
        self.eof
    }
}
