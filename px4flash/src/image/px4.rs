//! `.px4` firmware container decoding.
//!
//! A `.px4` file is UTF-8 JSON with three textual fields and one blob:
//!
//! - `board_id` — integer target board identifier
//! - `image_size` — declared binary size in bytes
//! - `description` — human-readable firmware description
//! - `image` — base64 text of a zlib-compressed binary
//!
//! The compression wrapper expects a leading 4-byte big-endian copy of
//! the decompressed size, so that header is prepended to the decoded
//! blob before inflating. The decompressed payload must match
//! `image_size` exactly; it is then padded up to the next multiple of
//! 4 bytes with `0xFF` before programming.
//!
//! Decoding is pure and synchronous; it never touches the transport.

use std::fs;
use std::io::Read as _;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use flate2::read::ZlibDecoder;
use log::{debug, info};

use crate::error::{Error, Result};

/// Fill byte used to pad the payload to a 4-byte multiple.
pub const PAD_BYTE: u8 = 0xFF;

/// A decoded and verified firmware image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    board_id: u32,
    image_size: usize,
    description: String,
    payload: Vec<u8>,
}

impl FirmwareImage {
    /// Decode a `.px4` container file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Decode a `.px4` container from its JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let container: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::InvalidFirmware(format!("not valid JSON: {e}")))?;

        let board_id = int_field(&container, "board_id")?;
        let declared = int_field(&container, "image_size")?;
        let image_size = declared as usize;
        let description = container
            .get("description")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let blob = container
            .get("image")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::InvalidFirmware("missing image field".to_string()))?;

        let compressed = BASE64
            .decode(blob.trim())
            .map_err(|e| Error::InvalidFirmware(format!("bad base64 image: {e}")))?;

        // The wrapper format carries the decompressed size as a 4-byte
        // big-endian header ahead of the zlib stream.
        let mut framed = Vec::with_capacity(4 + compressed.len());
        framed.extend_from_slice(&[0u8; 4]);
        BigEndian::write_u32(&mut framed[..4], declared);
        framed.extend_from_slice(&compressed);

        let payload = inflate_with_size_header(&framed)?;
        info!(
            "Firmware size: {} expected {} bytes",
            payload.len(),
            image_size
        );
        if payload.len() != image_size {
            return Err(Error::SizeMismatch {
                declared: image_size,
                actual: payload.len(),
            });
        }

        let mut padded = payload;
        while padded.len() % 4 != 0 {
            padded.push(PAD_BYTE);
        }
        debug!("Padded payload to {} bytes", padded.len());

        Ok(Self {
            board_id,
            image_size,
            description,
            payload: padded,
        })
    }

    /// Target board identifier declared by the container.
    #[must_use]
    pub fn board_id(&self) -> u32 {
        self.board_id
    }

    /// Declared image size in bytes, before padding.
    #[must_use]
    pub fn declared_size(&self) -> usize {
        self.image_size
    }

    /// Human-readable firmware description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The verified payload, padded to a multiple of 4 bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Parse an integer container field that may be a JSON number or a
/// numeric string.
fn int_field(container: &serde_json::Value, name: &str) -> Result<u32> {
    let value = container
        .get(name)
        .ok_or_else(|| Error::InvalidFirmware(format!("missing {name} field")))?;
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| Error::InvalidFirmware(format!("{name} out of range"))),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::InvalidFirmware(format!("{name} is not an integer"))),
        _ => Err(Error::InvalidFirmware(format!("{name} has wrong type"))),
    }
}

/// Inflate a size-header-plus-zlib-stream buffer.
fn inflate_with_size_header(framed: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(framed);
    let expected = cursor
        .read_u32::<BigEndian>()
        .map_err(|_| Error::InvalidFirmware("image blob too short".to_string()))?;

    let mut payload = Vec::with_capacity(expected as usize);
    let mut decoder = ZlibDecoder::new(cursor);
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| Error::InvalidFirmware(format!("decompression failed: {e}")))?;
    Ok(payload)
}
