//! Serial link transport.
//!
//! [`SerialLink`] owns at most one open device handle and a background
//! worker thread that services it at a fixed poll interval: queued
//! outbound bytes are written first, then any inbound bytes are drained
//! and delivered to the owner as a single [`LinkEvent::BytesReceived`].
//! Cross-thread signaling (stop, DTR reset request) uses atomic flags
//! checked once per loop iteration.

use std::io::{Read as _, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::port::{
    BaudRate, DataBits, NativePort, NativePortEnumerator, Port, PortEnumerator, PortSettings,
    StopBits,
};
use crate::settings::LinkSettings;

/// Interval between worker loop iterations.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Bounded wait for inbound bytes within one iteration.
const READ_WAIT: Duration = Duration::from_millis(10);

/// How long the DTR line is held asserted for a requested reset.
const RESET_PULSE: Duration = Duration::from_millis(250);

/// Inbound read buffer size per drain.
const READ_CHUNK: usize = 2048;

/// Fallback rate when the stored raw baud is not in the enumerated set.
const FALLBACK_BAUD: u32 = 57600;

/// Events raised by the link toward its controller.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The device handle was opened and the loop started.
    Connected {
        /// Port identifier of the link.
        port: String,
    },
    /// The loop exited and the device handle was released.
    Disconnected {
        /// Port identifier of the link.
        port: String,
    },
    /// Newly arrived bytes, one delivery per loop iteration.
    BytesReceived(Vec<u8>),
    /// Advisory status message.
    CommunicationUpdate(String),
    /// A communication failure was observed.
    CommunicationError(String),
}

/// Cumulative connection statistics.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    /// Total bits queued and written to the device.
    pub bits_sent: u64,
    /// Total bits read from the device.
    pub bits_received: u64,
    /// When the current connection was opened.
    pub connected_at: Option<Instant>,
}

impl LinkStats {
    /// Average upstream rate in bits per second.
    ///
    /// `None` until at least one full second has elapsed since the
    /// connection started (the rate is undefined at zero elapsed time).
    #[must_use]
    pub fn upstream_rate(&self) -> Option<u64> {
        self.rate(self.bits_sent)
    }

    /// Average downstream rate in bits per second.
    #[must_use]
    pub fn downstream_rate(&self) -> Option<u64> {
        self.rate(self.bits_received)
    }

    fn rate(&self, bits: u64) -> Option<u64> {
        let elapsed = self.connected_at?.elapsed().as_secs();
        if elapsed == 0 {
            return None;
        }
        Some(bits / elapsed)
    }
}

/// State shared between the controller thread and the worker loop.
struct Shared {
    tx_queue: Mutex<Vec<u8>>,
    stats: Mutex<LinkStats>,
    stop: AtomicBool,
    reset: AtomicBool,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            tx_queue: Mutex::new(Vec::new()),
            stats: Mutex::new(LinkStats::default()),
            stop: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }
}

/// A serial transport with a background I/O loop.
pub struct SerialLink {
    settings: LinkSettings,
    shared: Arc<Shared>,
    events: Sender<LinkEvent>,
    worker: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Create a link from persisted settings. No device is opened yet.
    pub fn new(settings: LinkSettings, events: Sender<LinkEvent>) -> Self {
        Self {
            settings,
            shared: Arc::new(Shared::new()),
            events,
            worker: None,
        }
    }

    /// Point-in-time snapshot of available port identifiers.
    pub fn enumerate_ports() -> Result<Vec<String>> {
        NativePortEnumerator::list_port_names()
    }

    /// The port identifier this link is bound to.
    #[must_use]
    pub fn port_name(&self) -> &str {
        &self.settings.port_name
    }

    /// A copy of the current settings, including the per-port baud map.
    #[must_use]
    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Whether the worker loop is running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Change the port this link targets.
    ///
    /// If the per-port baud map remembers a rate for the new port it
    /// becomes the current baud. Returns `false` for empty names.
    pub fn set_port_name(&mut self, port_name: &str) -> bool {
        let trimmed = port_name.trim();
        if trimmed.is_empty() || trimmed == self.settings.port_name {
            return false;
        }
        self.settings.port_name = trimmed.to_string();
        if let Some(baud) = self.settings.baud_for(trimmed) {
            self.set_baud_rate(baud);
        }
        true
    }

    /// Change the baud rate.
    ///
    /// Rates outside the enumerated set are rejected; with no device
    /// attached the raw value is still preserved verbatim so it can be
    /// shown back to the user, but the call reports `false`.
    pub fn set_baud_rate(&mut self, rate: u32) -> bool {
        if BaudRate::from_raw(rate).is_some() {
            self.settings.baud = rate;
            let port = self.settings.port_name.clone();
            self.settings.remember_baud(&port, rate);
            true
        } else if !self.is_connected() {
            debug!("Keeping unrecognized baud {rate} verbatim (no device attached)");
            self.settings.baud = rate;
            false
        } else {
            warn!("Rejecting baud {rate}: not in the supported set");
            false
        }
    }

    /// Set the parity mode (0 = none, 2 = even, 1/3 = odd).
    pub fn set_parity(&mut self, parity: u8) -> bool {
        match parity {
            0..=3 => {
                self.settings.parity = parity;
                true
            },
            _ => false,
        }
    }

    /// Set the number of data bits (5-8).
    pub fn set_data_bits(&mut self, data_bits: u8) -> bool {
        if DataBits::from_count(data_bits).is_some() {
            self.settings.data_bits = data_bits;
            true
        } else {
            false
        }
    }

    /// Set the number of stop bits (1-2).
    pub fn set_stop_bits(&mut self, stop_bits: u8) -> bool {
        if StopBits::from_count(stop_bits).is_some() {
            self.settings.stop_bits = stop_bits;
            true
        } else {
            false
        }
    }

    /// Set the flow control mode (0 = none, 1 = hardware, 2 = software).
    pub fn set_flow_control(&mut self, flow_control: u8) -> bool {
        match flow_control {
            0..=2 => {
                self.settings.flow_control = flow_control;
                true
            },
            _ => false,
        }
    }

    /// The effective data rate: the stored baud when it is a member of
    /// the enumerated set, otherwise a 57600 fallback.
    #[must_use]
    pub fn nominal_data_rate(&self) -> u32 {
        BaudRate::from_raw(self.settings.baud)
            .map_or(FALLBACK_BAUD, BaudRate::as_u32)
    }

    /// Open the device and start the I/O loop.
    ///
    /// Any previously running loop is stopped first. The per-port baud
    /// map is consulted when it remembers a rate for this port.
    pub fn connect(&mut self) -> Result<()> {
        if self.worker.is_some() {
            self.disconnect();
        }

        let baud = self
            .settings
            .baud_for(&self.settings.port_name)
            .and_then(BaudRate::from_raw)
            .or_else(|| BaudRate::from_raw(self.settings.baud))
            .unwrap_or_default();

        let port_settings = PortSettings {
            port_name: self.settings.port_name.clone(),
            baud_rate: baud,
            timeout: READ_WAIT,
            data_bits: self.settings.line_data_bits(),
            parity: self.settings.line_parity(),
            stop_bits: self.settings.line_stop_bits(),
            flow_control: self.settings.line_flow_control(),
        };

        info!(
            "Connecting link {} at {} baud",
            port_settings.port_name,
            baud.as_u32()
        );
        let port = NativePort::open(&port_settings)?;

        let port_name = self.settings.port_name.clone();
        self.settings.remember_baud(&port_name, baud.as_u32());

        {
            let mut stats = self.shared.stats.lock().unwrap_or_else(|e| e.into_inner());
            *stats = LinkStats {
                connected_at: Some(Instant::now()),
                ..LinkStats::default()
            };
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.reset.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let _ = events.send(LinkEvent::Connected {
            port: port_name.clone(),
        });
        let _ = events.send(LinkEvent::CommunicationUpdate(format!(
            "Opened port {port_name}"
        )));

        self.worker = Some(thread::spawn(move || {
            io_loop(port, &shared, &events, &port_name);
        }));

        Ok(())
    }

    /// Append bytes to the outbound queue for asynchronous transmission.
    ///
    /// Fails with [`Error::NotConnected`] and reports the error through
    /// the event channel when no device is open; the link then counts
    /// as disconnected.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            let _ = self.events.send(LinkEvent::CommunicationError(format!(
                "Could not send data - link {} is disconnected",
                self.settings.port_name
            )));
            return Err(Error::NotConnected);
        }
        trace!(
            "Queueing {} bytes for {}",
            data.len(),
            self.settings.port_name
        );
        let mut queue = self
            .shared
            .tx_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        queue.extend_from_slice(data);
        Ok(())
    }

    /// Request a one-shot hardware reset of the attached device.
    ///
    /// The next loop iteration pulses DTR (asserted for 250 ms).
    pub fn request_reset(&self) {
        self.shared.reset.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and release the device handle. Idempotent.
    pub fn disconnect(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Thread-safe copy of the connection statistics.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.shared
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// The worker loop. Exits on the stop flag or a hard I/O error; always
/// releases the device handle before returning.
fn io_loop(mut port: NativePort, shared: &Shared, events: &Sender<LinkEvent>, port_name: &str) {
    let mut read_buf = [0u8; READ_CHUNK];

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        if shared.reset.swap(false, Ordering::SeqCst) {
            let _ = events.send(LinkEvent::CommunicationUpdate(
                "Reset requested via DTR signal".to_string(),
            ));
            let _ = port.set_dtr(true);
            thread::sleep(RESET_PULSE);
            let _ = port.set_dtr(false);
        }

        // Write all buffered bytes; the queue only loses the prefix
        // that was actually handed to the device.
        let pending = {
            let mut queue = shared.tx_queue.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *queue)
        };
        if !pending.is_empty() {
            match port.write_all(&pending).and_then(|()| port.flush()) {
                Ok(()) => {
                    let mut stats = shared.stats.lock().unwrap_or_else(|e| e.into_inner());
                    stats.bits_sent += pending.len() as u64 * 8;
                },
                Err(e) => {
                    let _ = events.send(LinkEvent::CommunicationError(format!(
                        "TX error on {port_name}: {e}"
                    )));
                    // Put the unsent bytes back at the head.
                    let mut queue = shared.tx_queue.lock().unwrap_or_else(|e| e.into_inner());
                    let mut restored = pending;
                    restored.extend_from_slice(&queue);
                    *queue = restored;
                    break;
                },
            }
        }

        // Drain everything currently available into one delivery.
        let mut received: Vec<u8> = Vec::new();
        loop {
            match port.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&read_buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    let _ = events.send(LinkEvent::CommunicationError(format!(
                        "RX error on {port_name}: {e}"
                    )));
                    shared.stop.store(true, Ordering::SeqCst);
                    break;
                },
            }
        }
        if !received.is_empty() {
            trace!("rx of length {}", received.len());
            {
                let mut stats = shared.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.bits_received += received.len() as u64 * 8;
            }
            let _ = events.send(LinkEvent::BytesReceived(received));
        }

        thread::sleep(POLL_INTERVAL);
    }

    debug!("Closing port {port_name}");
    let _ = port.close();
    shared.running.store(false, Ordering::SeqCst);
    let _ = events.send(LinkEvent::Disconnected {
        port: port_name.to_string(),
    });
}
