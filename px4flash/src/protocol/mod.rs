//! Protocol implementations.

pub mod bootloader;

pub use bootloader::{DeviceInfoField, MAX_PROG_CHUNK, is_sync_footer, parse_device_word};
