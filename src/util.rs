//! Key display and resume-argument helpers.
//!
//! Partition keys are arbitrary byte strings. Wherever one reaches a human
//! (logs, the dry run, the resume hint) it is printed verbatim if every byte
//! is printable ASCII, and as lowercase hex otherwise. The hex form is also
//! what the `-S` resume argument carries back in.

use crate::errinput;
use crate::error::Result;

/// Returns true iff every byte is printable ASCII (0x20..=0x7E).
pub fn is_printable(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (0x20..=0x7e).contains(&b))
}

/// Renders a key for display: verbatim when printable, lowercase hex otherwise.
pub fn display_key(key: &[u8]) -> String {
    if is_printable(key) {
        String::from_utf8_lossy(key).into_owned()
    } else {
        hex::encode(key)
    }
}

/// Decodes a hex-encoded resume key (the `-S` argument format).
pub fn decode_hex_key(arg: &str) -> Result<Vec<u8>> {
    if arg.len() % 2 != 0 {
        return errinput!("hex key must be an even length");
    }
    hex::decode(arg).map_err(|err| crate::Error::InvalidInput(format!("bad hex key: {err}")))
}
