//! Firmware image containers.

pub mod px4;

pub use px4::FirmwareImage;
