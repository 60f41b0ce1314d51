//! Block compression formats.
//!
//! LZ4 blocks are stored as a little-endian `u32` compressed length followed
//! by a raw LZ4 block. ZLIB blocks are a complete zlib stream; anything after
//! the stream end is allocation padding.

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use h2_types::{
    HAMMER2_COMP_AUTOZERO, HAMMER2_COMP_LZ4, HAMMER2_COMP_NONE, HAMMER2_COMP_ZLIB, ParseError,
    ensure_slice, read_le_u32,
};
use std::io::{Read, Write};

const LZ4_HEADER_BYTES: usize = 4;

/// Expand one stored block into `out_len` logical bytes.
///
/// Short results are zero-filled to `out_len`.
pub fn decompress(comp: u8, src: &[u8], out_len: usize) -> Result<Vec<u8>, ParseError> {
    match comp {
        HAMMER2_COMP_NONE | HAMMER2_COMP_AUTOZERO => {
            let mut out = vec![0_u8; out_len];
            let take = src.len().min(out_len);
            out[..take].copy_from_slice(&src[..take]);
            Ok(out)
        }
        HAMMER2_COMP_LZ4 => decompress_lz4(src, out_len),
        HAMMER2_COMP_ZLIB => decompress_zlib(src, out_len),
        _ => Err(ParseError::InvalidField {
            field: "blockref.methods",
            reason: "unknown compression algorithm",
        }),
    }
}

pub fn decompress_lz4(src: &[u8], out_len: usize) -> Result<Vec<u8>, ParseError> {
    let stored = read_le_u32(src, 0)?;
    let stored = usize::try_from(stored).map_err(|_| ParseError::IntegerConversion {
        field: "lz4.compressed_size",
    })?;
    let payload = ensure_slice(src, LZ4_HEADER_BYTES, stored)?;
    let mut out = vec![0_u8; out_len];
    lz4_flex::block::decompress_into(payload, &mut out).map_err(|_| {
        ParseError::InvalidField {
            field: "lz4",
            reason: "corrupt block",
        }
    })?;
    Ok(out)
}

pub fn decompress_zlib(src: &[u8], out_len: usize) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(out_len);
    let limit = u64::try_from(out_len).map_err(|_| ParseError::IntegerConversion {
        field: "zlib.out_len",
    })?;
    ZlibDecoder::new(src)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|_| ParseError::InvalidField {
            field: "zlib",
            reason: "corrupt stream",
        })?;
    out.resize(out_len, 0);
    Ok(out)
}

/// Compress `src` into the LZ4 block format, or `None` when it does not
/// shrink.
#[must_use]
pub fn compress_lz4(src: &[u8]) -> Option<Vec<u8>> {
    let block = lz4_flex::block::compress(src);
    let stored = u32::try_from(block.len()).ok()?;
    if block.len() + LZ4_HEADER_BYTES >= src.len() {
        return None;
    }
    let mut out = Vec::with_capacity(block.len() + LZ4_HEADER_BYTES);
    out.extend_from_slice(&stored.to_le_bytes());
    out.extend_from_slice(&block);
    Some(out)
}

/// Compress `src` into a zlib stream, or `None` when it does not shrink.
#[must_use]
pub fn compress_zlib(src: &[u8], level: u32) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(src).ok()?;
    let out = encoder.finish().ok()?;
    (out.len() < src.len()).then_some(out)
}

#[must_use]
pub fn comp_name(comp: u8) -> &'static str {
    match comp {
        HAMMER2_COMP_NONE => "none",
        HAMMER2_COMP_AUTOZERO => "autozero",
        HAMMER2_COMP_LZ4 => "lz4",
        HAMMER2_COMP_ZLIB => "zlib",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| b"hammer2 chain "[i % 14]).collect()
    }

    #[test]
    fn lz4_block_roundtrip_with_padding() {
        let src = compressible(65536);
        let mut stored = compress_lz4(&src).expect("compressible");
        assert!(stored.len() < src.len());
        stored.resize(stored.len().next_power_of_two(), 0);
        let out = decompress(HAMMER2_COMP_LZ4, &stored, 65536).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn zlib_stream_ignores_trailing_padding() {
        let src = compressible(20000);
        let mut stored = compress_zlib(&src, 6).expect("compressible");
        stored.extend_from_slice(&[0_u8; 100]);
        let out = decompress(HAMMER2_COMP_ZLIB, &stored, 65536).unwrap();
        assert_eq!(&out[..20000], &src[..]);
        assert!(out[20000..].iter().all(|b| *b == 0));
    }

    #[test]
    fn incompressible_input_is_rejected() {
        let noise: Vec<u8> = (0..64_u32)
            .map(|i| u8::try_from(i.wrapping_mul(2_654_435_761) >> 24).unwrap_or(0))
            .collect();
        assert!(compress_lz4(&noise).is_none());
    }

    #[test]
    fn corrupt_lz4_header_is_an_error() {
        let mut stored = compress_lz4(&compressible(4096)).unwrap();
        stored[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(decompress_lz4(&stored, 4096).is_err());
        assert!(decompress(9, &stored, 16).is_err());
    }

    #[test]
    fn none_zero_fills() {
        let out = decompress(HAMMER2_COMP_NONE, b"abc", 8).unwrap();
        assert_eq!(out, b"abc\0\0\0\0\0");
    }
}
