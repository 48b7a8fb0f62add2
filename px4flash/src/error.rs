//! Error types for px4flash.

use std::io;
use thiserror::Error;

/// Result type for px4flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for px4flash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Write attempted while no port is open. The link auto-disconnects.
    #[error("Link is not connected")]
    NotConnected,

    /// No sync footer arrived before the deadline.
    #[error("Timed out waiting for sync ({0})")]
    SyncTimeout(String),

    /// A response ended in something other than `{0x12, 0x10}`.
    #[error("Bad sync footer: got {0:#04x} {1:#04x}")]
    BadSyncFooter(u8, u8),

    /// Bootloader protocol revision the policy refuses to drive.
    #[error("Unsupported bootloader revision {0}")]
    UnsupportedBootloader(u32),

    /// A device-info query failed; the session re-syncs.
    #[error("Device info query failed: {0}")]
    InfoQuery(String),

    /// Flash erase never confirmed. The device may be left erased.
    #[error("Timed out waiting for flash erase to complete")]
    EraseTimeout,

    /// Too many consecutive program-chunk failures.
    #[error("Error writing firmware at offset {offset} of {total}")]
    ProgramChunk {
        /// Payload offset of the failing chunk.
        offset: usize,
        /// Total padded payload length.
        total: usize,
    },

    /// An OTP chunk could not be read within the retry budget.
    #[error("OTP read failed at address {addr:#06x}")]
    OtpRead {
        /// OTP address of the failing 4-byte chunk.
        addr: u16,
    },

    /// A serial-number chunk read failed (no retry).
    #[error("Serial number read failed at address {addr:#04x}")]
    SerialNumberRead {
        /// Serial-number address of the failing 4-byte chunk.
        addr: u8,
    },

    /// Decompressed firmware length does not match the declared size.
    #[error("Image size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch {
        /// Size declared in the container.
        declared: usize,
        /// Actual decompressed length.
        actual: usize,
    },

    /// Firmware container could not be parsed.
    #[error("Invalid firmware container: {0}")]
    InvalidFirmware(String),

    /// Operation cancelled via the stop token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
