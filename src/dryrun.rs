//! Dry run: print the merged row stream instead of writing it anywhere.

use crate::config::ShutdownFlag;
use crate::merge::{MergeIterator, RowSink};
use crate::util::display_key;

/// Sink that prints rows to stdout, one `key:` line then `name=value`
/// lines. Binary keys and values print as lowercase hex.
pub struct PrintSink;

impl RowSink for PrintSink {
    fn new_row(&mut self, key: &[u8]) {
        println!("{}:", display_key(key));
    }

    fn new_column(&mut self, name: &[u8], value: &[u8], _ts: i64) {
        println!("{}={}", display_key(name), display_key(value));
    }

    fn new_column_with_ttl(
        &mut self,
        name: &[u8],
        value: &[u8],
        _ts: i64,
        _ttl: u32,
        expiration_secs: u32,
    ) {
        println!("{}={} (timeout={expiration_secs})", display_key(name), display_key(value));
    }
}

/// Drains the merge to stdout, stopping early on shutdown.
pub fn dry_run(iterator: &mut MergeIterator, shutdown: &ShutdownFlag) {
    let mut sink = PrintSink;
    while iterator.next(&mut sink) && !shutdown.terminated() {}
}
