//! (De)compression of stored rows.
//!
//! Compressed datacubes keep both their dimension rows and fragment rows zlib-compressed.

use crate::error::CubeError;

use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use zune_inflate::{DeflateDecoder, DeflateOptions};

/// Compresses some bytes with zlib.
pub fn compress(data: &[u8]) -> Result<Bytes, CubeError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?.into())
}

/// Decompresses zlib data and returns the uncompressed bytes.
pub fn decompress(data: &[u8]) -> Result<Bytes, CubeError> {
    let options = DeflateOptions::default().set_size_hint(data.len());
    let mut decoder = DeflateDecoder::new_with_options(data, options);
    let data = decoder.decode_zlib()?;
    Ok(data.into())
}

/// Compresses `data` when `compressed` is set, otherwise copies it.
pub fn encode(data: &[u8], compressed: bool) -> Result<Bytes, CubeError> {
    if compressed {
        compress(data)
    } else {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Decompresses `data` when `compressed` is set, otherwise copies it.
pub fn decode(data: &[u8], compressed: bool) -> Result<Bytes, CubeError> {
    if compressed {
        decompress(data)
    } else {
        Ok(Bytes::copy_from_slice(data))
    }
}
