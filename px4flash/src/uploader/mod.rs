//! PX4 bootloader upload driver.
//!
//! [`Px4Uploader`] owns a serial port exclusively for the duration of a
//! session and drives the strict command/response exchange against the
//! device bootloader: sync, device-info queries, optional OTP and
//! serial-number reads, flash erase, chunked programming, and the final
//! reboot. Commands are strictly sequential; a new command is only
//! issued once the previous one has fully resolved (footer or timeout).
//!
//! Status and progress are reported through a typed [`UploadEvent`]
//! channel; events are advisory and never fail the session. A
//! [`CancelToken`] is checked between commands (never mid-command).

pub mod hotplug;

use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::CancelToken;
use crate::error::{Error, Result};
use crate::image::FirmwareImage;
use crate::port::{BaudRate, NativePort, NativePortEnumerator, Port, PortEnumerator, PortSettings};
use crate::protocol::bootloader::{
    DeviceInfoField, MAX_PROG_CHUNK, erase_command, get_device_command, get_otp_command,
    get_sn_command, is_sync_footer, parse_device_word, prog_multi_command, reboot_command,
    sync_command,
};

/// Footer wait for SYNC and device-info commands.
const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait for the 4 data bytes of a device-info response.
const INFO_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Footer wait after CHIP_ERASE. Erase can take a long time.
const ERASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Footer wait after each PROG_MULTI chunk.
const PROG_TIMEOUT: Duration = Duration::from_secs(1);

/// Footer wait for OTP and serial-number chunk reads.
const CHUNK_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Total sync attempts before the session fails.
const SYNC_ATTEMPTS: u32 = 5;

/// Consecutive program-chunk failures beyond this count are fatal.
const MAX_PROG_FAILURES: u32 = 2;

/// A progress event is emitted every this many programmed chunks.
const PROGRESS_CHUNK_INTERVAL: usize = 50;

/// Settle time between successive device-info queries.
const QUERY_SETTLE: Duration = Duration::from_millis(500);

/// Settle time before re-erasing after a failed program chunk.
const RETRY_SETTLE: Duration = Duration::from_secs(1);

/// Window spent draining residue after a failed chunk read.
const RESYNC_DRAIN: Duration = Duration::from_secs(1);

/// Settle time after the device is plugged before opening it.
const PLUG_SETTLE: Duration = Duration::from_millis(500);

/// Settle time after scrubbing the line at session start.
const SCRUB_SETTLE: Duration = Duration::from_secs(1);

/// OTP region size in bytes, read in 4-byte words.
const OTP_SIZE: usize = 512;

/// Serial-number region size in bytes, read in 4-byte words.
const SN_SIZE: usize = 12;

/// Expected magic header at OTP offset 0 ("PX4\0").
const OTP_MAGIC: [u8; 4] = [0x50, 0x58, 0x34, 0x00];

/// Events raised by the uploader toward its controller.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// The uploader is waiting for the target to be plugged in.
    DevicePlugRequested,
    /// Advisory status message.
    Status(String),
    /// Bootloader protocol revision reported by the device.
    BootloaderRev(u32),
    /// Board identifier reported by the device.
    BoardId(u32),
    /// Board hardware revision reported by the device.
    BoardRev(u32),
    /// Usable flash size reported by the device.
    FlashSize(u32),
    /// Formatted serial number (hex bytes).
    SerialNumber(String),
    /// Formatted OTP dump (hex rows).
    OtpDump(String),
    /// Programming progress.
    FlashProgress {
        /// Payload bytes confirmed so far.
        written: u64,
        /// Total padded payload bytes.
        total: u64,
    },
    /// The upload failed; the message mirrors the returned error.
    Error(String),
    /// The upload completed and the device was rebooted.
    Done,
}

/// Tunable policy knobs for behavior the protocol leaves ambiguous.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Treat a bootloader revision >= 4 as fatal instead of continuing.
    pub abort_on_v4: bool,
    /// Per-chunk retry budget for OTP reads.
    pub otp_chunk_retries: u32,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            abort_on_v4: false,
            otp_chunk_retries: 16,
        }
    }
}

/// Device properties gathered during the info-query phase.
#[derive(Debug, Clone, Copy)]
struct DeviceInfo {
    bootloader_rev: u32,
    board_id: u32,
    board_rev: u32,
    flash_size: u32,
}

/// Wait for the target to be plugged in, open it, and run an upload.
///
/// This is the production entry point: it emits
/// [`UploadEvent::DevicePlugRequested`], watches port enumeration for a
/// new identifier, opens it at 115200 8N1, and drives the session.
pub fn upload_via_hotplug(
    image: FirmwareImage,
    events: Sender<UploadEvent>,
    cancel: CancelToken,
    policy: UploadPolicy,
) -> Result<()> {
    info!("Waiting for device to be plugged in...");
    let _ = events.send(UploadEvent::DevicePlugRequested);

    let port_name = hotplug::wait_for_new_port(
        || NativePortEnumerator::list_port_names().unwrap_or_default(),
        &cancel,
        hotplug::POLL_INTERVAL,
    )?;

    // Give the OS a moment to finish creating the device node.
    thread::sleep(PLUG_SETTLE);

    let settings = PortSettings::new(&port_name, BaudRate::Baud115200);
    let port = NativePort::open(&settings)?;

    Px4Uploader::new(port, image, events, cancel)
        .with_policy(policy)
        .run()
}

/// Bootloader protocol driver bound to one port and one image.
pub struct Px4Uploader<P: Port> {
    port: P,
    image: FirmwareImage,
    events: Sender<UploadEvent>,
    cancel: CancelToken,
    policy: UploadPolicy,
    /// Bytes received but not yet consumed by a pending read.
    rx_buf: Vec<u8>,
}

impl<P: Port> Px4Uploader<P> {
    /// Create an uploader around an already-open port.
    ///
    /// The uploader is the port's sole reader and writer for the
    /// lifetime of the session.
    pub fn new(
        port: P,
        image: FirmwareImage,
        events: Sender<UploadEvent>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            port,
            image,
            events,
            cancel,
            policy: UploadPolicy::default(),
            rx_buf: Vec::new(),
        }
    }

    /// Override the default policy.
    #[must_use]
    pub fn with_policy(mut self, policy: UploadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the full upload session.
    ///
    /// On any outcome the port is closed and the decoded image buffer
    /// is released before the result is surfaced.
    pub fn run(mut self) -> Result<()> {
        let result = self.run_inner();
        let _ = self.port.close();
        match &result {
            Ok(()) => {
                let _ = self.events.send(UploadEvent::Done);
            },
            Err(Error::Cancelled) => {},
            Err(e) => {
                let _ = self.events.send(UploadEvent::Error(e.to_string()));
            },
        }
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        self.check_cancelled()?;
        self.scrub_line()?;

        let mut last_err = Error::SyncTimeout("sync attempts exhausted".to_string());
        for attempt in 1..=SYNC_ATTEMPTS {
            self.check_cancelled()?;
            info!("Sending SYNC command, attempt {attempt}/{SYNC_ATTEMPTS}");
            self.scrub_input()?;
            self.send(&sync_command())?;
            if let Err(e) = self.get_sync(SYNC_TIMEOUT) {
                warn!("Sync attempt {attempt} failed: {e}");
                last_err = e;
                continue;
            }
            info!("Initial sync successful");

            match self.session() {
                Ok(()) => return Ok(()),
                // Query and OTP-header failures fall back to re-syncing
                // within the attempt budget.
                Err(Error::InfoQuery(msg)) => {
                    warn!("Bad sync: {msg}");
                    last_err = Error::InfoQuery(msg);
                },
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// One synced session: query, identify, erase, program, reboot.
    fn session(&mut self) -> Result<()> {
        let info = self.query_device_info()?;

        if info.bootloader_rev >= 4 {
            // The legacy uploader logged this as fatal but carried on
            // regardless; which behavior is right is a product decision,
            // so it is policy-controlled with "continue" as default.
            warn!(
                "Bootloader revision {} is beyond the validated set",
                info.bootloader_rev
            );
            if self.policy.abort_on_v4 {
                return Err(Error::UnsupportedBootloader(info.bootloader_rev));
            }
        }

        let identity = if info.bootloader_rev >= 4 {
            let otp = self.read_otp()?;
            let serial = self.read_serial_number()?;
            Some((otp, serial))
        } else {
            None
        };
        self.check_cancelled()?;

        let _ = self.events.send(UploadEvent::BoardRev(info.board_rev));
        let _ = self.events.send(UploadEvent::BoardId(info.board_id));
        let _ = self
            .events
            .send(UploadEvent::BootloaderRev(info.bootloader_rev));
        let _ = self.events.send(UploadEvent::FlashSize(info.flash_size));
        if let Some((otp, serial)) = identity {
            let _ = self.events.send(UploadEvent::SerialNumber(serial));
            let _ = self.events.send(UploadEvent::OtpDump(otp));
        }

        self.erase()?;
        self.program()?;
        self.finalize()
    }

    /// Query the four standard device properties in order.
    fn query_device_info(&mut self) -> Result<DeviceInfo> {
        self.status("Requesting bootloader rev");
        let bootloader_rev = self.request_info(DeviceInfoField::BootloaderRev)?;
        info!("Bootloader rev: {bootloader_rev}");
        thread::sleep(QUERY_SETTLE);

        self.status("Requesting board ID");
        let board_id = self.request_info(DeviceInfoField::BoardId)?;
        info!("Board ID: {board_id}");
        thread::sleep(QUERY_SETTLE);

        self.status("Requesting board rev");
        let board_rev = self.request_info(DeviceInfoField::BoardRev)?;
        info!("Board rev: {board_rev}");
        thread::sleep(QUERY_SETTLE);

        self.status("Requesting flash size");
        let flash_size = self.request_info(DeviceInfoField::FlashSize)?;
        info!("Flash size: {flash_size}");

        Ok(DeviceInfo {
            bootloader_rev,
            board_id,
            board_rev,
            flash_size,
        })
    }

    /// GET_DEVICE for one field: 4-byte little-endian value + footer.
    fn request_info(&mut self, field: DeviceInfoField) -> Result<u32> {
        self.scrub_input()?;
        self.send(&get_device_command(field))?;

        let bytes = self
            .read_exact(4, INFO_READ_TIMEOUT)?
            .ok_or_else(|| Error::InfoQuery(format!("short read for {field:?}")))?;
        let word = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let value = parse_device_word(&word);

        self.get_sync(SYNC_TIMEOUT)
            .map_err(|e| Error::InfoQuery(format!("{field:?}: {e}")))?;
        Ok(value)
    }

    /// Read the 512-byte OTP region in 4-byte chunks.
    ///
    /// A failed chunk is re-issued at the same address within the
    /// policy budget; moving on with a hole would corrupt the dump.
    #[allow(clippy::cast_possible_truncation)] // addr < 512
    fn read_otp(&mut self) -> Result<String> {
        info!("Requesting OTP");
        self.status("Requesting OTP");

        let mut otp = [0u8; OTP_SIZE];
        let mut addr: usize = 0;
        while addr < OTP_SIZE {
            self.check_cancelled()?;

            let mut chunk = None;
            for _ in 0..=self.policy.otp_chunk_retries {
                match self.read_data_chunk(&get_otp_command(addr as u16)) {
                    Ok(bytes) => {
                        chunk = Some(bytes);
                        break;
                    },
                    Err(e) => {
                        warn!("OTP chunk at {addr:#06x} failed: {e}");
                        self.drain_residue()?;
                    },
                }
            }
            let Some(bytes) = chunk else {
                return Err(Error::OtpRead { addr: addr as u16 });
            };
            otp[addr..addr + 4].copy_from_slice(&bytes);
            addr += 4;
        }
        info!("OTP read");

        if otp[..4] != OTP_MAGIC {
            return Err(Error::InfoQuery("OTP header failure".to_string()));
        }
        Ok(format_hex_rows(&otp, 16))
    }

    /// Read the 12-byte serial number in 4-byte chunks.
    ///
    /// The wire delivers big-endian words, so each chunk is reassembled
    /// byte-reversed. Any chunk failure aborts the upload attempt.
    #[allow(clippy::cast_possible_truncation)] // addr < 12
    fn read_serial_number(&mut self) -> Result<String> {
        self.status("Requesting board SN");

        let mut sn = [0u8; SN_SIZE];
        let mut addr: usize = 0;
        while addr < SN_SIZE {
            let bytes = self
                .read_data_chunk(&get_sn_command(addr as u8))
                .map_err(|e| {
                    warn!("Serial number chunk at {addr:#04x} failed: {e}");
                    Error::SerialNumberRead { addr: addr as u8 }
                })?;
            sn[addr] = bytes[3];
            sn[addr + 1] = bytes[2];
            sn[addr + 2] = bytes[1];
            sn[addr + 3] = bytes[0];
            addr += 4;
        }

        let serial = format_hex_rows(&sn, SN_SIZE);
        info!("Board SN: {serial}");
        Ok(serial)
    }

    /// Issue one 4-byte data read command and validate its footer.
    fn read_data_chunk(&mut self, command: &[u8]) -> Result<[u8; 4]> {
        self.scrub_input()?;
        self.send(command)?;

        let bytes = self
            .read_exact(4, CHUNK_READ_TIMEOUT)?
            .ok_or_else(|| Error::SyncTimeout("short chunk read".to_string()))?;
        self.get_sync(SYNC_TIMEOUT)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Erase the application flash. A timeout here is fatal: the device
    /// may be left erased with no image, and that must be surfaced.
    fn erase(&mut self) -> Result<()> {
        info!("Requesting erase");
        self.status("Erasing flash, this may take up to a minute");

        self.send(&erase_command())?;
        self.get_sync(ERASE_TIMEOUT).map_err(|e| match e {
            Error::SyncTimeout(_) => Error::EraseTimeout,
            other => other,
        })
    }

    /// Program the padded payload in chunks of at most 60 bytes.
    ///
    /// A failed chunk bumps a consecutive-failure counter; past the
    /// limit the upload is fatal, otherwise the flash is re-erased and
    /// programming restarts from offset 0 so a partial image is never
    /// the final state.
    fn program(&mut self) -> Result<()> {
        info!("Starting flash process");
        self.status("Flashing firmware");

        let payload = self.image.payload().to_vec();
        let total = payload.len();

        self.scrub_input()?;
        thread::sleep(RETRY_SETTLE);

        let mut offset: usize = 0;
        let mut chunk_count: usize = 0;
        let mut failures: u32 = 0;
        while offset < total {
            self.check_cancelled()?;

            let end = usize::min(offset + MAX_PROG_CHUNK, total);
            let frame = prog_multi_command(&payload[offset..end]);
            self.scrub_input()?;
            self.send(&frame)?;

            match self.get_sync(PROG_TIMEOUT) {
                Ok(()) => {
                    failures = 0;
                    offset = end;
                    chunk_count += 1;
                    if chunk_count % PROGRESS_CHUNK_INTERVAL == 1 {
                        info!("flashing: {offset}/{total}");
                        let _ = self.events.send(UploadEvent::FlashProgress {
                            written: offset as u64,
                            total: total as u64,
                        });
                    }
                },
                Err(e) => {
                    failures += 1;
                    warn!("Program chunk at {offset} failed ({failures}): {e}");
                    if failures > MAX_PROG_FAILURES {
                        return Err(Error::ProgramChunk { offset, total });
                    }
                    // Recoverable: re-erase and start over from the top.
                    thread::sleep(RETRY_SETTLE);
                    self.erase()?;
                    self.scrub_input()?;
                    offset = 0;
                    chunk_count = 0;
                },
            }
        }

        let _ = self.events.send(UploadEvent::FlashProgress {
            written: total as u64,
            total: total as u64,
        });
        debug!("Done");
        Ok(())
    }

    /// Send REBOOT. No footer is awaited.
    fn finalize(&mut self) -> Result<()> {
        self.status("Flashing complete!");
        self.send(&reboot_command())
    }

    /// Write 128 zero bytes and drain whatever comes back, leaving the
    /// line in a known state before the first sync.
    fn scrub_line(&mut self) -> Result<()> {
        self.port.write_all(&[0u8; 128])?;
        let _ = self.port.flush();
        thread::sleep(SCRUB_SETTLE);
        self.scrub_input()
    }

    /// Wait for the two-byte sync footer.
    fn get_sync(&mut self, timeout: Duration) -> Result<()> {
        match self.read_exact(2, timeout)? {
            Some(footer) => {
                if is_sync_footer([footer[0], footer[1]]) {
                    Ok(())
                } else {
                    Err(Error::BadSyncFooter(footer[0], footer[1]))
                }
            },
            None => Err(Error::SyncTimeout(format!(
                "no footer within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Read exactly `count` bytes, serving the receive accumulator
    /// first. Returns `Ok(None)` if the deadline expires short.
    fn read_exact(&mut self, count: usize, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];

        while self.rx_buf.len() < count {
            if Instant::now() >= deadline {
                trace!("read timeout: have {} of {count}", self.rx_buf.len());
                return Ok(None);
            }
            match self.port.read(&mut buf) {
                Ok(0) => thread::sleep(Duration::from_millis(1)),
                Ok(n) => self.rx_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    thread::sleep(Duration::from_millis(1));
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(Some(self.rx_buf.drain(..count).collect()))
    }

    /// Write a full command and push it to the wire.
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("tx {bytes:02X?}");
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    /// Discard accumulated and device-buffered input.
    fn scrub_input(&mut self) -> Result<()> {
        self.rx_buf.clear();
        self.port.clear_buffers()
    }

    /// After a failed chunk read: give stragglers a window to arrive,
    /// then discard everything.
    fn drain_residue(&mut self) -> Result<()> {
        let deadline = Instant::now() + RESYNC_DRAIN;
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            match self.port.read(&mut buf) {
                Ok(0) => thread::sleep(Duration::from_millis(5)),
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    thread::sleep(Duration::from_millis(5));
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.scrub_input()
    }

    fn status(&self, message: &str) {
        let _ = self.events.send(UploadEvent::Status(message.to_string()));
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Format bytes as uppercase hex pairs separated by spaces, broken into
/// rows of `row_len` bytes.
fn format_hex_rows(bytes: &[u8], row_len: usize) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            if i % row_len == 0 {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::sync::mpsc;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    use super::*;
    use crate::protocol::bootloader::{
        PROTO_CHIP_ERASE, PROTO_EOC, PROTO_GET_OTP, PROTO_INSYNC, PROTO_OK, PROTO_PROG_MULTI,
    };

    /// An in-memory port that replays one scripted response per command
    /// written. Writes whose first byte is zero (the line scrub) do not
    /// consume a response.
    struct ScriptPort {
        responses: VecDeque<Vec<u8>>,
        rx: Vec<u8>,
        written: Vec<u8>,
        timeout: Duration,
    }

    impl ScriptPort {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: responses.into(),
                rx: Vec::new(),
                written: Vec::new(),
                timeout: Duration::from_millis(50),
            }
        }
    }

    impl Read for ScriptPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.rx.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "empty"));
            }
            let n = usize::min(buf.len(), self.rx.len());
            buf[..n].copy_from_slice(&self.rx[..n]);
            self.rx.drain(..n);
            Ok(n)
        }
    }

    impl Write for ScriptPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            if buf.first().copied().unwrap_or(0) != 0 {
                if let Some(response) = self.responses.pop_front() {
                    self.rx.extend_from_slice(&response);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for ScriptPort {
        fn set_timeout(&mut self, timeout: Duration) -> crate::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_baud_rate(&mut self, _baud_rate: BaudRate) -> crate::Result<()> {
            Ok(())
        }

        fn baud_rate(&self) -> BaudRate {
            BaudRate::Baud115200
        }

        fn clear_buffers(&mut self) -> crate::Result<()> {
            self.rx.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "script"
        }

        fn set_dtr(&mut self, _level: bool) -> crate::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    const FOOTER: [u8; 2] = [PROTO_INSYNC, PROTO_OK];
    const BAD_FOOTER: [u8; 2] = [PROTO_INSYNC, 0x11];

    fn make_image(binary: &[u8]) -> FirmwareImage {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(binary).unwrap();
        let compressed = encoder.finish().unwrap();
        let container = format!(
            "{{\"board_id\": 9, \"image_size\": {}, \
             \"description\": \"test\", \"image\": \"{}\"}}",
            binary.len(),
            BASE64.encode(compressed)
        );
        FirmwareImage::from_json_str(&container).unwrap()
    }

    fn make_uploader(
        responses: Vec<Vec<u8>>,
        payload: &[u8],
    ) -> (Px4Uploader<ScriptPort>, mpsc::Receiver<UploadEvent>) {
        let (tx, rx) = mpsc::channel();
        let uploader = Px4Uploader::new(
            ScriptPort::new(responses),
            make_image(payload),
            tx,
            CancelToken::new(),
        );
        (uploader, rx)
    }

    fn info_response(value: u32) -> Vec<u8> {
        let mut r = value.to_le_bytes().to_vec();
        r.extend_from_slice(&FOOTER);
        r
    }

    /// Parse the command stream a ScriptPort recorded into a list of
    /// (erase | chunk payload) entries.
    #[derive(Debug, PartialEq)]
    enum WireCommand {
        Erase,
        Chunk(Vec<u8>),
        Other(u8),
    }

    fn parse_written(mut bytes: &[u8]) -> Vec<WireCommand> {
        let mut commands = Vec::new();
        while let Some(&opcode) = bytes.first() {
            match opcode {
                0 => bytes = &bytes[1..], // scrub filler
                PROTO_CHIP_ERASE => {
                    commands.push(WireCommand::Erase);
                    bytes = &bytes[2..];
                },
                PROTO_PROG_MULTI => {
                    let len = bytes[1] as usize;
                    commands.push(WireCommand::Chunk(bytes[2..2 + len].to_vec()));
                    assert_eq!(bytes[2 + len], PROTO_EOC);
                    bytes = &bytes[3 + len..];
                },
                other => {
                    commands.push(WireCommand::Other(other));
                    bytes = &bytes[1..];
                },
            }
        }
        commands
    }

    #[test]
    fn get_sync_accepts_footer_and_rejects_others() {
        let (mut up, _rx) = make_uploader(vec![FOOTER.to_vec()], &[0; 4]);
        up.send(&sync_command()).unwrap();
        assert!(up.get_sync(Duration::from_millis(50)).is_ok());

        let (mut up, _rx) = make_uploader(vec![BAD_FOOTER.to_vec()], &[0; 4]);
        up.send(&sync_command()).unwrap();
        assert!(matches!(
            up.get_sync(Duration::from_millis(50)),
            Err(Error::BadSyncFooter(0x12, 0x11))
        ));

        let (mut up, _rx) = make_uploader(vec![], &[0; 4]);
        assert!(matches!(
            up.get_sync(Duration::from_millis(50)),
            Err(Error::SyncTimeout(_))
        ));
    }

    #[test]
    fn request_info_parses_little_endian_word() {
        let (mut up, _rx) = make_uploader(vec![info_response(1)], &[0; 4]);
        assert_eq!(up.request_info(DeviceInfoField::BootloaderRev).unwrap(), 1);

        let (mut up, _rx) = make_uploader(vec![info_response(u32::MAX)], &[0; 4]);
        assert_eq!(
            up.request_info(DeviceInfoField::FlashSize).unwrap(),
            u32::MAX
        );
    }

    #[test]
    fn request_info_bad_footer_is_query_failure() {
        let mut response = 7u32.to_le_bytes().to_vec();
        response.extend_from_slice(&BAD_FOOTER);
        let (mut up, _rx) = make_uploader(vec![response], &[0; 4]);
        assert!(matches!(
            up.request_info(DeviceInfoField::BoardId),
            Err(Error::InfoQuery(_))
        ));
    }

    #[test]
    fn serial_number_chunks_are_byte_reversed() {
        let mut responses = Vec::new();
        for word in 0..3u8 {
            let mut r = vec![
                4 * word + 1,
                4 * word + 2,
                4 * word + 3,
                4 * word + 4,
            ];
            r.extend_from_slice(&FOOTER);
            responses.push(r);
        }
        let (mut up, _rx) = make_uploader(responses, &[0; 4]);
        let serial = up.read_serial_number().unwrap();
        assert_eq!(serial, "04 03 02 01 08 07 06 05 0C 0B 0A 09");
    }

    #[test]
    fn serial_number_chunk_failure_is_fatal() {
        let mut second = vec![5, 6, 7, 8];
        second.extend_from_slice(&BAD_FOOTER);
        let responses = vec![
            {
                let mut r = vec![1, 2, 3, 4];
                r.extend_from_slice(&FOOTER);
                r
            },
            second,
        ];
        let (mut up, _rx) = make_uploader(responses, &[0; 4]);
        assert!(matches!(
            up.read_serial_number(),
            Err(Error::SerialNumberRead { addr: 4 })
        ));
    }

    #[test]
    fn erase_timeout_is_fatal_and_distinct() {
        let (mut up, _rx) = make_uploader(vec![], &[0; 4]);
        // Shrink the wait so the test does not sit for a minute.
        up.send(&erase_command()).unwrap();
        let result = up.get_sync(Duration::from_millis(50)).map_err(|e| match e {
            Error::SyncTimeout(_) => Error::EraseTimeout,
            other => other,
        });
        assert!(matches!(result, Err(Error::EraseTimeout)));
    }

    #[test]
    fn programming_retries_once_after_re_erase_and_restarts_at_zero() {
        // 300 payload bytes -> 5 chunks of 60.
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();

        let responses = vec![
            FOOTER.to_vec(),     // chunk 1
            FOOTER.to_vec(),     // chunk 2
            BAD_FOOTER.to_vec(), // chunk 3 fails
            FOOTER.to_vec(),     // re-erase
            FOOTER.to_vec(),     // chunk 1 again
            FOOTER.to_vec(),     // chunk 2
            FOOTER.to_vec(),     // chunk 3
            FOOTER.to_vec(),     // chunk 4
            FOOTER.to_vec(),     // chunk 5
        ];
        let (mut up, rx) = make_uploader(responses, &payload);
        up.program().unwrap();

        let commands = parse_written(&up.port.written);
        let erases = commands
            .iter()
            .filter(|c| matches!(c, WireCommand::Erase))
            .count();
        assert_eq!(erases, 1, "exactly one re-erase");

        // The stream written after the re-erase is the payload, once.
        let last_erase = commands
            .iter()
            .rposition(|c| matches!(c, WireCommand::Erase))
            .unwrap();
        let mut flashed = Vec::new();
        for command in &commands[last_erase + 1..] {
            match command {
                WireCommand::Chunk(data) => flashed.extend_from_slice(data),
                other => panic!("unexpected command after re-erase: {other:?}"),
            }
        }
        assert_eq!(flashed, payload);

        // Restart emitted progress from offset 0 again.
        let progress: Vec<(u64, u64)> = rx
            .try_iter()
            .filter_map(|e| match e {
                UploadEvent::FlashProgress { written, total } => Some((written, total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress.first(), Some(&(60, 300)));
        assert!(progress.contains(&(300, 300)));
    }

    #[test]
    fn programming_aborts_after_three_consecutive_failures() {
        let payload = vec![0xAAu8; 60];
        let responses = vec![
            BAD_FOOTER.to_vec(), // chunk fails
            FOOTER.to_vec(),     // re-erase
            BAD_FOOTER.to_vec(), // chunk fails again
            FOOTER.to_vec(),     // re-erase
            BAD_FOOTER.to_vec(), // third consecutive failure: fatal
        ];
        let (mut up, _rx) = make_uploader(responses, &payload);
        assert!(matches!(
            up.program(),
            Err(Error::ProgramChunk { offset: 0, total: 60 })
        ));
    }

    #[test]
    fn otp_read_retries_same_address() {
        // Word 0 carries the magic; every other word is its index.
        let mut responses = Vec::new();
        for word in 0..(OTP_SIZE / 4) {
            if word == 1 {
                // One bad footer: the driver must re-issue word 1.
                responses.push(BAD_FOOTER.to_vec());
            }
            let mut r = if word == 0 {
                OTP_MAGIC.to_vec()
            } else {
                (word as u32).to_le_bytes().to_vec()
            };
            r.extend_from_slice(&FOOTER);
            responses.push(r);
        }
        let (mut up, _rx) = make_uploader(responses, &[0; 4]);
        let dump = up.read_otp().unwrap();

        assert!(dump.starts_with("50 58 34 00"));
        assert_eq!(dump.lines().count(), OTP_SIZE / 16);

        // Two GET_OTP commands for address 4 were issued.
        let otp_requests: Vec<u16> = up
            .port
            .written
            .windows(5)
            .filter(|w| w[0] == PROTO_GET_OTP)
            .map(|w| u16::from_le_bytes([w[1], w[2]]))
            .collect();
        assert_eq!(
            otp_requests.iter().filter(|addr| **addr == 4).count(),
            2
        );
    }

    #[test]
    fn otp_read_fails_past_retry_budget() {
        let responses = vec![BAD_FOOTER.to_vec(), BAD_FOOTER.to_vec()];
        let (up, _rx) = make_uploader(responses, &[0; 4]);
        let mut up = up.with_policy(UploadPolicy {
            otp_chunk_retries: 1,
            ..UploadPolicy::default()
        });
        assert!(matches!(up.read_otp(), Err(Error::OtpRead { addr: 0 })));
    }

    #[test]
    fn full_session_flashes_and_reports_done() {
        let payload = vec![0x5Au8; 8];
        let responses = vec![
            FOOTER.to_vec(),           // SYNC
            info_response(3),          // bootloader rev (< 4: no OTP/SN)
            info_response(9),          // board id
            info_response(2),          // board rev
            info_response(2_080_768),  // flash size
            FOOTER.to_vec(),           // erase
            FOOTER.to_vec(),           // single program chunk
            // reboot: no response
        ];
        let (up, rx) = make_uploader(responses, &payload);
        up.run().unwrap();

        let events: Vec<UploadEvent> = rx.try_iter().collect();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, UploadEvent::BootloaderRev(3)))
        );
        assert!(events.iter().any(|e| matches!(e, UploadEvent::BoardId(9))));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, UploadEvent::FlashSize(2_080_768)))
        );
        assert!(matches!(events.last(), Some(UploadEvent::Done)));
        // No identity events for a v3 bootloader.
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, UploadEvent::OtpDump(_)))
        );
    }

    #[test]
    fn v4_bootloader_aborts_when_policy_says_so() {
        let responses = vec![
            FOOTER.to_vec(),          // SYNC
            info_response(4),         // bootloader rev
            info_response(9),         // board id
            info_response(1),         // board rev
            info_response(2_080_768), // flash size
        ];
        let (up, _rx) = make_uploader(responses, &[0x55u8; 4]);
        let up = up.with_policy(UploadPolicy {
            abort_on_v4: true,
            ..UploadPolicy::default()
        });
        assert!(matches!(up.run(), Err(Error::UnsupportedBootloader(4))));
    }

    #[test]
    fn cancelled_token_stops_before_any_command() {
        let (tx, _rx) = mpsc::channel();
        let cancel = CancelToken::new();
        cancel.cancel();
        let up = Px4Uploader::new(
            ScriptPort::new(vec![]),
            make_image(&[0; 4]),
            tx,
            cancel,
        );
        assert!(matches!(up.run(), Err(Error::Cancelled)));
    }

    #[test]
    fn hex_rows_format() {
        assert_eq!(format_hex_rows(&[0x00, 0x0F, 0xFF], 16), "00 0F FF");
        let row = format_hex_rows(&[0xAB; 32], 16);
        assert_eq!(row.lines().count(), 2);
    }
}
