use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};

const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("zstd error: {0}")]
    Zstd(io::Error),

    #[error("gzip error: {0}")]
    Gzip(io::Error),
}

/// Compression of a stored payload, detected from its leading magic bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    // zstd with compression level
    Zstd(i32),
    Gzip,
}

impl Compression {
    pub fn detect(payload: &[u8]) -> Self {
        if payload.starts_with(ZSTD_MAGIC) {
            Compression::Zstd(0)
        } else if payload.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        match *self {
            Compression::None => Ok(payload.to_vec()),
            Compression::Zstd(level) => {
                zstd::stream::encode_all(payload, level).map_err(CodecError::Zstd)
            }
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
                encoder.write_all(payload).map_err(CodecError::Gzip)?;
                encoder.finish().map_err(CodecError::Gzip)
            }
        }
    }
}

/// Returns the plain payload, decompressing it if it carries a known magic.
pub fn decode(payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
    match Compression::detect(&payload) {
        Compression::None => Ok(payload),
        Compression::Zstd(_) => zstd::stream::decode_all(payload.as_slice()).map_err(CodecError::Zstd),
        Compression::Gzip => {
            let mut decoded = Vec::new();
            GzDecoder::new(payload.as_slice())
                .read_to_end(&mut decoded)
                .map_err(CodecError::Gzip)?;
            Ok(decoded)
        }
    }
}
