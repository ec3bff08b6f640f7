//! Entry payload compression.

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};

use anyhow::{Result, bail};

use super::structures::CompressionMethod;

/// Compress `data` at `level` (0-9).
///
/// Level 0 stores. Otherwise raw deflate is used unless it fails to shrink
/// the payload, in which case the entry is stored as well.
pub fn compress(data: &[u8], level: u32) -> std::io::Result<(CompressionMethod, Vec<u8>)> {
    if level == 0 || data.is_empty() {
        return Ok((CompressionMethod::Stored, data.to_vec()));
    }

    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(level),
    );
    encoder.write_all(data)?;
    let deflated = encoder.finish()?;

    if deflated.len() >= data.len() {
        Ok((CompressionMethod::Stored, data.to_vec()))
    } else {
        Ok((CompressionMethod::Deflate, deflated))
    }
}

/// Decompress an entry payload, refusing to produce more than
/// `expected_size` bytes.
///
/// The caller compares the returned length against the declared size; a
/// payload that would inflate past it is cut at `expected_size + 1` so the
/// mismatch is still visible without unbounded allocation.
pub fn decompress(
    method: CompressionMethod,
    data: &[u8],
    expected_size: u64,
) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::Stored => Ok(data.to_vec()),
        CompressionMethod::Deflate => {
            let limit = expected_size.saturating_add(1);
            let mut out = Vec::with_capacity(expected_size.min(1 << 24) as usize);
            DeflateDecoder::new(data).take(limit).read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionMethod::Unknown(code) => {
            bail!("Unsupported compression method: {}", code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetitive_data_is_deflated() {
        let data = b"abcabcabc".repeat(200);
        let (method, packed) = compress(&data, 9).unwrap();
        assert_eq!(method, CompressionMethod::Deflate);
        assert!(packed.len() < data.len());
        assert_eq!(decompress(method, &packed, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn level_zero_and_incompressible_data_are_stored() {
        let (method, packed) = compress(b"hello", 0).unwrap();
        assert_eq!(method, CompressionMethod::Stored);
        assert_eq!(packed, b"hello");

        // Too short for deflate to win.
        let (method, _) = compress(b"x", 9).unwrap();
        assert_eq!(method, CompressionMethod::Stored);
    }

    #[test]
    fn decompression_stops_past_declared_size() {
        let data = vec![0u8; 10_000];
        let (method, packed) = compress(&data, 6).unwrap();
        let out = decompress(method, &packed, 100).unwrap();
        assert_eq!(out.len(), 101);
    }

    #[test]
    fn unknown_method_is_an_error() {
        assert!(decompress(CompressionMethod::Unknown(12), b"", 0).is_err());
    }
}
