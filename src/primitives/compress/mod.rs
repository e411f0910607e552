#![forbid(unsafe_code)]

//! Self-describing byte compression.
//!
//! Every compressed buffer starts with a header byte whose low nibble names the
//! method and whose high nibble carries a method parameter (usually the level),
//! so [`decompress`] needs nothing but the bytes. Aliases (`Default`, `Fast`,
//! `Small`) are resolved to a concrete method before anything is written.
//!
//! | method            | payload after the header                     |
//! |-------------------|----------------------------------------------|
//! | `None`            | raw bytes                                    |
//! | `Zlib`            | zlib stream (its CMF byte *is* the header)   |
//! | `ZlibNoChecksum`  | window-bits byte, then raw deflate           |
//! | `QuickLz`         | snappy raw block                             |
//! | `Lzma`            | zstd frame                                   |

use std::fmt;
use std::str::FromStr;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};

use crate::types::{FtError, Result};

const ZLIB_LEVEL: u32 = 5;
const ZLIB_WINDOW_BITS: u8 = 15;
const ZSTD_LEVEL: i32 = 9;

/// Compression method tag stored in the low nibble of the header byte.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionMethod {
    /// Bytes are stored verbatim.
    None = 0,
    /// Alias for the recommended general-purpose method.
    #[default]
    Default = 1,
    /// Alias for the fastest method.
    Fast = 2,
    /// Alias for the method with the smallest output.
    Small = 3,
    /// zlib with its own header and adler32 trailer.
    Zlib = 8,
    /// The fast block codec.
    QuickLz = 9,
    /// The high-ratio codec.
    Lzma = 10,
    /// Raw deflate with a two-byte header and no trailer.
    ZlibNoChecksum = 11,
}

impl CompressionMethod {
    /// Maps a header nibble back to a method.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => CompressionMethod::None,
            1 => CompressionMethod::Default,
            2 => CompressionMethod::Fast,
            3 => CompressionMethod::Small,
            8 => CompressionMethod::Zlib,
            9 => CompressionMethod::QuickLz,
            10 => CompressionMethod::Lzma,
            11 => CompressionMethod::ZlibNoChecksum,
            _ => return None,
        })
    }

    /// Numeric tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Resolves aliases to the concrete method they stand for.
    pub fn resolve(self) -> Self {
        match self {
            CompressionMethod::Default => CompressionMethod::ZlibNoChecksum,
            CompressionMethod::Fast => CompressionMethod::QuickLz,
            CompressionMethod::Small => CompressionMethod::Lzma,
            other => other,
        }
    }

    /// True for the three aliases.
    pub fn is_alias(self) -> bool {
        matches!(
            self,
            CompressionMethod::Default | CompressionMethod::Fast | CompressionMethod::Small
        )
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionMethod::None => "none",
            CompressionMethod::Default => "default",
            CompressionMethod::Fast => "fast",
            CompressionMethod::Small => "small",
            CompressionMethod::Zlib => "zlib",
            CompressionMethod::QuickLz => "quick_lz",
            CompressionMethod::Lzma => "lzma",
            CompressionMethod::ZlibNoChecksum => "zlib_no_checksum",
        };
        f.write_str(name)
    }
}

impl FromStr for CompressionMethod {
    type Err = FtError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => CompressionMethod::None,
            "default" => CompressionMethod::Default,
            "fast" => CompressionMethod::Fast,
            "small" => CompressionMethod::Small,
            "zlib" => CompressionMethod::Zlib,
            "quick_lz" | "quicklz" => CompressionMethod::QuickLz,
            "lzma" => CompressionMethod::Lzma,
            "zlib_no_checksum" => CompressionMethod::ZlibNoChecksum,
            _ => return Err(FtError::Invalid("unknown compression method")),
        })
    }
}

fn deflate_bound(size: usize) -> usize {
    size + (size >> 12) + (size >> 14) + (size >> 25) + 64
}

/// Worst-case compressed size of `size` input bytes, header included.
pub fn bound(method: CompressionMethod, size: usize) -> usize {
    match method.resolve() {
        CompressionMethod::None => size + 1,
        CompressionMethod::Zlib => deflate_bound(size) + 1,
        CompressionMethod::ZlibNoChecksum => deflate_bound(size) + 2,
        CompressionMethod::QuickLz => snap::raw::max_compress_len(size).max(size) + 1,
        CompressionMethod::Lzma => zstd::zstd_safe::compress_bound(size) + 1,
        CompressionMethod::Default | CompressionMethod::Fast | CompressionMethod::Small => {
            unreachable!("aliases are resolved above")
        }
    }
}

/// Compresses `src` into `dst` and returns the number of bytes written.
///
/// # Panics
///
/// Panics if `dst` is shorter than [`bound`] for `src.len()` or if `src` is
/// 4 GiB or larger. Both are caller bugs.
pub fn compress(method: CompressionMethod, dst: &mut [u8], src: &[u8]) -> usize {
    assert!(u32::try_from(src.len()).is_ok(), "codec input must be below 4 GiB");
    let method = method.resolve();
    assert!(
        dst.len() >= bound(method, src.len()),
        "destination smaller than compression bound"
    );
    match method {
        CompressionMethod::None => {
            dst[0] = CompressionMethod::None.tag();
            dst[1..1 + src.len()].copy_from_slice(src);
            1 + src.len()
        }
        CompressionMethod::Zlib => {
            if src.is_empty() {
                dst[0] = CompressionMethod::Zlib.tag() | (7 << 4);
                return 1;
            }
            let mut encoder = Compress::new(Compression::new(ZLIB_LEVEL), true);
            finish_deflate(&mut encoder, src, dst)
        }
        CompressionMethod::ZlibNoChecksum => {
            dst[0] = CompressionMethod::ZlibNoChecksum.tag() | ((ZLIB_LEVEL as u8) << 4);
            if src.is_empty() {
                return 1;
            }
            dst[1] = ZLIB_WINDOW_BITS;
            let mut encoder = Compress::new(Compression::new(ZLIB_LEVEL), false);
            2 + finish_deflate(&mut encoder, src, &mut dst[2..])
        }
        CompressionMethod::QuickLz => {
            dst[0] = CompressionMethod::QuickLz.tag() | (1 << 4);
            if src.is_empty() {
                return 1;
            }
            let written = snap::raw::Encoder::new()
                .compress(src, &mut dst[1..])
                .unwrap_or_else(|err| panic!("snappy compression failed: {err}"));
            1 + written
        }
        CompressionMethod::Lzma => {
            dst[0] = CompressionMethod::Lzma.tag() | ((ZSTD_LEVEL as u8) << 4);
            if src.is_empty() {
                return 1;
            }
            let written = zstd::bulk::compress_to_buffer(src, &mut dst[1..], ZSTD_LEVEL)
                .unwrap_or_else(|err| panic!("zstd compression failed: {err}"));
            1 + written
        }
        CompressionMethod::Default | CompressionMethod::Fast | CompressionMethod::Small => {
            unreachable!("aliases are resolved above")
        }
    }
}

fn finish_deflate(encoder: &mut Compress, src: &[u8], dst: &mut [u8]) -> usize {
    match encoder.compress(src, dst, FlushCompress::Finish) {
        Ok(Status::StreamEnd) => encoder.total_out() as usize,
        Ok(status) => panic!("deflate did not finish within bound: {status:?}"),
        Err(err) => panic!("deflate failed: {err}"),
    }
}

/// Compresses `src` into a freshly allocated buffer.
pub fn compress_to_vec(method: CompressionMethod, src: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; bound(method, src.len())];
    let written = compress(method, &mut out, src);
    out.truncate(written);
    out
}

/// Decompresses `src` into `dst`, which must be exactly the uncompressed size.
///
/// Bytes come from disk, so malformed input is reported as
/// [`FtError::BadFormat`] rather than treated as a bug.
pub fn decompress(dst: &mut [u8], src: &[u8]) -> Result<()> {
    let header = *src
        .first()
        .ok_or(FtError::BadFormat("empty compressed buffer"))?;
    let method = CompressionMethod::from_tag(header & 0x0f)
        .filter(|m| !m.is_alias())
        .ok_or(FtError::BadFormat("unknown compression method"))?;
    if src.len() == 1 {
        return if dst.is_empty() {
            Ok(())
        } else {
            Err(FtError::BadFormat("compressed payload missing"))
        };
    }
    match method {
        CompressionMethod::None => {
            if src.len() - 1 != dst.len() {
                return Err(FtError::BadFormat("stored payload has wrong length"));
            }
            dst.copy_from_slice(&src[1..]);
            Ok(())
        }
        CompressionMethod::Zlib => inflate(true, src, dst),
        CompressionMethod::ZlibNoChecksum => {
            if src.len() < 2 || src[1] != ZLIB_WINDOW_BITS {
                return Err(FtError::BadFormat("unsupported deflate window"));
            }
            inflate(false, &src[2..], dst)
        }
        CompressionMethod::QuickLz => {
            let expected = snap::raw::decompress_len(&src[1..])
                .map_err(|_| FtError::BadFormat("corrupt snappy block"))?;
            if expected != dst.len() {
                return Err(FtError::BadFormat("snappy block has wrong length"));
            }
            snap::raw::Decoder::new()
                .decompress(&src[1..], dst)
                .map_err(|_| FtError::BadFormat("corrupt snappy block"))?;
            Ok(())
        }
        CompressionMethod::Lzma => {
            let written = zstd::bulk::decompress_to_buffer(&src[1..], dst)
                .map_err(|_| FtError::BadFormat("corrupt zstd frame"))?;
            if written != dst.len() {
                return Err(FtError::BadFormat("zstd frame has wrong length"));
            }
            Ok(())
        }
        CompressionMethod::Default | CompressionMethod::Fast | CompressionMethod::Small => {
            Err(FtError::BadFormat("alias stored as compression method"))
        }
    }
}

fn inflate(zlib_header: bool, src: &[u8], dst: &mut [u8]) -> Result<()> {
    let mut decoder = Decompress::new(zlib_header);
    match decoder.decompress(src, dst, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) if decoder.total_out() as usize == dst.len() => Ok(()),
        Ok(_) => Err(FtError::BadFormat("deflate stream has wrong length")),
        Err(_) => Err(FtError::BadFormat("corrupt deflate stream")),
    }
}
