//! Checksummed document framing.
//!
//! A sealed document is a `crc32:<8 hex digits>` header line followed by the
//! body. Every read validates the checksum; a mismatch aborts the read.

use crc32fast::Hasher;

const HEADER_PREFIX: &str = "crc32:";

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Prefix `body` with its checksum header.
pub fn seal(body: &[u8]) -> Vec<u8> {
    let mut out = format!("{}{:08x}\n", HEADER_PREFIX, crc32(body)).into_bytes();
    out.extend_from_slice(body);
    out
}

/// Body of a sealed document, or `None` if the header is malformed or the
/// checksum does not match.
pub fn unseal(document: &[u8]) -> Option<&[u8]> {
    let split = document.iter().position(|b| *b == b'\n')?;
    let (header, body) = (&document[..split], &document[split + 1..]);
    let expected = std::str::from_utf8(header)
        .ok()?
        .strip_prefix(HEADER_PREFIX)
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())?;
    (crc32(body) == expected).then_some(body)
}
