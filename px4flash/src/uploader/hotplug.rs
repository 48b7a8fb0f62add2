//! Device-plug detection by port-set diffing.
//!
//! The bootloader only listens for a short window after the board is
//! plugged in, so the uploader watches the set of enumerated ports and
//! picks the first identifier that was not present in the baseline
//! snapshot. If the set shrinks (a port vanished), the baseline is
//! rebuilt so a later re-plug of the same device is still detected.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::CancelToken;
use crate::error::{Error, Result};

/// Interval between enumeration polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Block until a port appears that was not in the baseline snapshot.
///
/// `enumerate` supplies a point-in-time snapshot of port identifiers on
/// every poll. Cancellation is honored at each poll.
pub fn wait_for_new_port<F>(
    mut enumerate: F,
    cancel: &CancelToken,
    poll_interval: Duration,
) -> Result<String>
where
    F: FnMut() -> Vec<String>,
{
    let mut baseline = enumerate();
    debug!("Hotplug baseline: {baseline:?}");

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let current = enumerate();
        if let Some(new_port) = current.iter().find(|p| !baseline.contains(p)) {
            info!("New port detected: {new_port}");
            return Ok(new_port.clone());
        }
        if current.len() < baseline.len() {
            // Something was removed. Rescan.
            debug!("Port set shrank, rebuilding baseline: {current:?}");
            baseline = current;
        }

        thread::sleep(poll_interval);
    }
}
