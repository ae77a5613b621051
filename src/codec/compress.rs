//! Compress-mode registry and the multi-algorithm selection routine (spec
//! §4.1).
//!
//! `Lz4`/`Lz4Hc` are backed by this crate's own ported block codec
//! (`crate::block`, `crate::hc`) rather than an external LZ4 dependency —
//! that port is the one piece of this crate's lineage most directly on
//! target for a compression backend, so it is kept and reused rather than
//! re-implemented. `Zlib` and `Bz2` are backed by `flate2` and `bzip2`
//! respectively, the same style of per-algorithm optional backend that
//! `backhand`'s `Compressor` enum (a squashfs multi-codec selector, the
//! closest precedent in the retrieval pack to this exact problem) uses.
//! `Lzo`, `Lzf`, `Snappy` are recognized byte codes with no encoder/decoder
//! compiled in, matching spec §4.1: "an implementation may support a
//! subset; unsupported codes on read must surface a typed error; unsupported
//! codes on write are silently skipped in selection."

use std::io::{Read, Write};

use crate::error::Error;

/// Cap on distinct compression algorithms a single build can select among
/// (spec §9 REDESIGN FLAG iii: "compression flag bit layout caps
/// `num_comp_algs <= 16`; keep the cap explicit").
pub const MAX_COMPRESS_ALGS: usize = 16;

/// The eight format-stable compress-mode byte codes (spec §4.1 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMode {
    None = 0,
    Lzo = 1,
    Zlib = 2,
    Bz2 = 3,
    Lzf = 4,
    Snappy = 5,
    Lz4 = 6,
    Lz4Hc = 7,
}

impl CompressMode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Result<CompressMode, Error> {
        Ok(match b {
            0 => CompressMode::None,
            1 => CompressMode::Lzo,
            2 => CompressMode::Zlib,
            3 => CompressMode::Bz2,
            4 => CompressMode::Lzf,
            5 => CompressMode::Snappy,
            6 => CompressMode::Lz4,
            7 => CompressMode::Lz4Hc,
            other => return Err(Error::UnknownCompressMode(other)),
        })
    }

    /// Whether this build has a working encoder/decoder for this mode.
    pub fn is_implemented(self) -> bool {
        !matches!(self, CompressMode::Lzo | CompressMode::Lzf | CompressMode::Snappy)
    }

    /// All eight modes in ascending byte-code order, for selection scans.
    pub fn all() -> [CompressMode; 8] {
        [
            CompressMode::None,
            CompressMode::Lzo,
            CompressMode::Zlib,
            CompressMode::Bz2,
            CompressMode::Lzf,
            CompressMode::Snappy,
            CompressMode::Lz4,
            CompressMode::Lz4Hc,
        ]
    }
}

/// A bitmask of allowed compress modes, bit `i` gating `CompressMode` byte
/// code `i`. Spec §4.1: "given a bit-mask of allowed modes..."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressModeMask(pub u32);

impl CompressModeMask {
    /// Every mode is a candidate (unimplemented ones are simply never
    /// selected); mirrors the original `Extent::compress_all` default.
    pub const ALL: CompressModeMask = CompressModeMask(0xFF);
    /// Only the uncompressed fallback.
    pub const NONE_ONLY: CompressModeMask = CompressModeMask(1);

    pub fn allows(self, mode: CompressMode) -> bool {
        debug_assert!((mode as u32) < MAX_COMPRESS_ALGS as u32);
        self.0 & (1 << mode as u32) != 0
    }
}

impl Default for CompressModeMask {
    fn default() -> Self {
        CompressModeMask::ALL
    }
}

fn compress_zlib(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress_zlib(data: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(expected_len);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn compress_bz2(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    let mut encoder = BzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress_bz2(data: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
    use bzip2::read::BzDecoder;
    let mut decoder = BzDecoder::new(data);
    let mut out = Vec::with_capacity(expected_len);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn compress_lz4(data: &[u8]) -> Vec<u8> {
    let bound = crate::block::compress_bound(data.len() as i32).max(0) as usize;
    let mut dst = vec![0u8; bound];
    let n = crate::block::compress_default(data, &mut dst).unwrap_or(0);
    dst.truncate(n);
    dst
}

fn compress_lz4hc(data: &[u8], level: i32) -> Vec<u8> {
    let bound = crate::block::compress_bound(data.len() as i32).max(0) as usize;
    let mut dst = vec![0u8; bound];
    // SAFETY: src/dst point at valid, appropriately-sized slices for the
    // duration of the call; neither is retained afterwards.
    let n = unsafe {
        crate::hc::api::compress_hc(
            data.as_ptr(),
            dst.as_mut_ptr(),
            data.len() as i32,
            dst.len() as i32,
            level,
        )
    };
    dst.truncate(n.max(0) as usize);
    dst
}

fn decompress_lz4(data: &[u8], expected_len: usize) -> Result<Vec<u8>, Error> {
    let mut dst = vec![0u8; expected_len];
    crate::block::decompress_safe(data, &mut dst)
        .map_err(|_| Error::UnknownCompressMode(CompressMode::Lz4.as_byte()))?;
    Ok(dst)
}

/// Compress `data` with a specific mode (used when re-applying a mode chosen
/// by [`select_best`], and directly when a caller bypasses selection).
/// Returns `None` if `mode` has no compiled-in encoder.
pub fn compress_with_mode(mode: CompressMode, data: &[u8], level: u32) -> Option<Vec<u8>> {
    match mode {
        CompressMode::None => Some(data.to_vec()),
        CompressMode::Zlib => compress_zlib(data, level).ok(),
        CompressMode::Bz2 => compress_bz2(data, level).ok(),
        CompressMode::Lz4 => Some(compress_lz4(data)),
        CompressMode::Lz4Hc => Some(compress_lz4hc(data, level as i32)),
        CompressMode::Lzo | CompressMode::Lzf | CompressMode::Snappy => None,
    }
}

/// Decompress `data`, which was produced by `mode`, into a buffer of
/// exactly `expected_len` bytes.
pub fn decompress_with_mode(
    mode: CompressMode,
    data: &[u8],
    expected_len: usize,
) -> Result<Vec<u8>, Error> {
    match mode {
        CompressMode::None => Ok(data.to_vec()),
        CompressMode::Zlib => {
            decompress_zlib(data, expected_len).map_err(|_| Error::UnknownCompressMode(mode.as_byte()))
        }
        CompressMode::Bz2 => {
            decompress_bz2(data, expected_len).map_err(|_| Error::UnknownCompressMode(mode.as_byte()))
        }
        CompressMode::Lz4 | CompressMode::Lz4Hc => decompress_lz4(data, expected_len),
        CompressMode::Lzo | CompressMode::Lzf | CompressMode::Snappy => {
            Err(Error::UnknownCompressMode(mode.as_byte()))
        }
    }
}

/// Try every allowed, implemented mode against `data` and keep the smallest
/// output; `CompressMode::None` is always a fallback candidate (spec §4.1:
/// "Mode 0 is always a valid fallback"). A mode whose output is not
/// strictly smaller than the uncompressed size is discarded.
pub fn select_best(mask: CompressModeMask, level: u32, data: &[u8]) -> (CompressMode, Vec<u8>) {
    let level = level.clamp(1, 9);
    let mut best_mode = CompressMode::None;
    let mut best_bytes = data.to_vec();

    for mode in CompressMode::all() {
        if matches!(mode, CompressMode::None) || !mode.is_implemented() || !mask.allows(mode) {
            continue;
        }
        if let Some(candidate) = compress_with_mode(mode, data, level) {
            if candidate.len() < best_bytes.len() {
                best_mode = mode;
                best_bytes = candidate;
            }
        }
    }
    (best_mode, best_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_best_falls_back_to_none_for_incompressible_data() {
        // A single byte can't be shrunk by any real codec; selection should
        // keep mode 0 and the original bytes.
        let data = [42u8];
        let (mode, bytes) = select_best(CompressModeMask::ALL, 6, &data);
        assert_eq!(mode, CompressMode::None);
        assert_eq!(bytes, data);
    }

    #[test]
    fn zlib_round_trips() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let packed = compress_with_mode(CompressMode::Zlib, &data, 6).unwrap();
        assert!(packed.len() < data.len());
        let unpacked = decompress_with_mode(CompressMode::Zlib, &packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn bz2_round_trips() {
        let data = vec![7u8; 4096];
        let packed = compress_with_mode(CompressMode::Bz2, &data, 6).unwrap();
        let unpacked = decompress_with_mode(CompressMode::Bz2, &packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn lz4_round_trips() {
        let data = b"the quick brown fox the quick brown fox the quick brown fox".to_vec();
        let packed = compress_with_mode(CompressMode::Lz4, &data, 1).unwrap();
        let unpacked = decompress_with_mode(CompressMode::Lz4, &packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn lz4hc_round_trips() {
        let data = b"the quick brown fox the quick brown fox the quick brown fox".to_vec();
        let packed = compress_with_mode(CompressMode::Lz4Hc, &data, 9).unwrap();
        let unpacked = decompress_with_mode(CompressMode::Lz4Hc, &packed, data.len()).unwrap();
        assert_eq!(unpacked, data);
    }

    #[test]
    fn unimplemented_modes_are_skipped_on_write_and_error_on_read() {
        assert!(compress_with_mode(CompressMode::Snappy, b"x", 1).is_none());
        let err = decompress_with_mode(CompressMode::Lzo, b"x", 1).unwrap_err();
        assert!(matches!(err, Error::UnknownCompressMode(1)));
    }

    #[test]
    fn from_byte_rejects_out_of_range_codes() {
        assert!(CompressMode::from_byte(8).is_err());
        assert!(CompressMode::from_byte(0).is_ok());
    }
}
