//! # px4flash
//!
//! A library for flashing PX4 autopilot boards over their serial
//! bootloader.
//!
//! This crate provides the core functionality for talking to PX4-class
//! flight controllers over a serial byte link, including:
//!
//! - `.px4` firmware container parsing (JSON with a zlib-compressed,
//!   base64-encoded image)
//! - The PX4 bootloader command protocol (sync, device info, OTP and
//!   serial-number reads, erase, chunked programming, reboot)
//! - A threaded serial transport with queued writes, receive events and
//!   throughput accounting
//! - Hotplug detection that waits for a newly enumerated port
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::mpsc;
//!
//! use px4flash::{CancelToken, FirmwareImage, UploadEvent, UploadPolicy, upload_via_hotplug};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Parse the firmware container
//!     let image = FirmwareImage::from_file("firmware.px4")?;
//!
//!     // Wait for the board to be plugged in, then flash it
//!     let (events, progress) = mpsc::channel();
//!     let cancel = CancelToken::new();
//!     let worker = std::thread::spawn(move || {
//!         upload_via_hotplug(image, events, cancel, UploadPolicy::default())
//!     });
//!
//!     for event in progress {
//!         if let UploadEvent::Status(message) = event {
//!             println!("{message}");
//!         }
//!     }
//!
//!     worker.join().map_err(|_| "upload thread panicked")??;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod error;
pub mod image;
pub mod link;
pub mod port;
pub mod protocol;
pub mod settings;
pub mod uploader;

/// Shared cancellation flag checked by long-running library loops.
///
/// Clones observe the same flag. Cancellation is sticky and checked
/// between protocol commands, never in the middle of one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones see it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// Re-exports for convenience
pub use {
    error::{Error, Result},
    image::FirmwareImage,
    link::{LinkEvent, LinkStats, SerialLink},
    port::{
        BaudRate, DataBits, FlowControl, NativePort, NativePortEnumerator, Parity, Port,
        PortEnumerator, PortSettings, StopBits,
    },
    settings::LinkSettings,
    uploader::{Px4Uploader, UploadEvent, UploadPolicy, upload_via_hotplug},
};
