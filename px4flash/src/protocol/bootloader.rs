//! PX4 serial bootloader wire format.
//!
//! Commands are short byte sequences terminated by the end-of-command
//! marker `0x20`. A successful response ends in the two-byte sync
//! footer `{0x12, 0x10}` ("in-sync", "ok"); anything else trailing a
//! response, or a timeout before it arrives, is a sync failure. Only
//! one command is ever in flight at a time.
//!
//! ```text
//! SYNC          21 20
//! GET_DEVICE    22 <field> 20          -> <u32 LE> 12 10
//! CHIP_ERASE    23 20                  -> 12 10 (up to 60 s later)
//! PROG_MULTI    27 <len> <data...> 20  -> 12 10 (within 1 s)
//! GET_OTP       2A <lo> <hi> 00 00     -> <4 bytes> 12 10
//! GET_SN        2B <addr> 00 00 00 20  -> <4 bytes> 12 10
//! REBOOT        30 20                  -> nothing
//! ```

use byteorder::{ByteOrder, LittleEndian};

/// First footer byte: the device is in sync.
pub const PROTO_INSYNC: u8 = 0x12;

/// Second footer byte: the previous command succeeded.
pub const PROTO_OK: u8 = 0x10;

/// End-of-command marker.
pub const PROTO_EOC: u8 = 0x20;

/// Resynchronize with the bootloader.
pub const PROTO_GET_SYNC: u8 = 0x21;

/// Query a device property.
pub const PROTO_GET_DEVICE: u8 = 0x22;

/// Erase the application flash.
pub const PROTO_CHIP_ERASE: u8 = 0x23;

/// Program up to [`MAX_PROG_CHUNK`] bytes at the current flash cursor.
pub const PROTO_PROG_MULTI: u8 = 0x27;

/// Read 4 bytes of one-time-programmable memory.
pub const PROTO_GET_OTP: u8 = 0x2A;

/// Read 4 bytes of serial-number memory.
pub const PROTO_GET_SN: u8 = 0x2B;

/// Finalize and reboot into the new firmware.
pub const PROTO_REBOOT: u8 = 0x30;

/// Maximum payload bytes in one PROG_MULTI command.
pub const MAX_PROG_CHUNK: usize = 60;

/// Device properties readable via GET_DEVICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceInfoField {
    /// Bootloader protocol revision.
    BootloaderRev = 0x01,
    /// Board identifier.
    BoardId = 0x02,
    /// Board hardware revision.
    BoardRev = 0x03,
    /// Usable flash size in bytes.
    FlashSize = 0x04,
    /// Vector table area.
    VecArea = 0x05,
}

/// SYNC command bytes.
#[must_use]
pub fn sync_command() -> [u8; 2] {
    [PROTO_GET_SYNC, PROTO_EOC]
}

/// GET_DEVICE command for one property.
#[must_use]
pub fn get_device_command(field: DeviceInfoField) -> [u8; 3] {
    [PROTO_GET_DEVICE, field as u8, PROTO_EOC]
}

/// CHIP_ERASE command bytes.
#[must_use]
pub fn erase_command() -> [u8; 2] {
    [PROTO_CHIP_ERASE, PROTO_EOC]
}

/// PROG_MULTI command carrying one chunk of the payload.
///
/// The frame is `0x27, len, <len bytes>, 0x20` and `chunk` must hold
/// between 1 and [`MAX_PROG_CHUNK`] bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // chunk.len() <= 60
pub fn prog_multi_command(chunk: &[u8]) -> Vec<u8> {
    debug_assert!(!chunk.is_empty() && chunk.len() <= MAX_PROG_CHUNK);
    let mut frame = Vec::with_capacity(3 + chunk.len());
    frame.push(PROTO_PROG_MULTI);
    frame.push(chunk.len() as u8);
    frame.extend_from_slice(chunk);
    frame.push(PROTO_EOC);
    frame
}

/// REBOOT command bytes.
#[must_use]
pub fn reboot_command() -> [u8; 2] {
    [PROTO_REBOOT, PROTO_EOC]
}

/// GET_OTP command for the 4-byte word at `addr`.
///
/// This command carries no end-of-command marker on the wire.
#[must_use]
pub fn get_otp_command(addr: u16) -> [u8; 5] {
    let [lo, hi] = addr.to_le_bytes();
    [PROTO_GET_OTP, lo, hi, 0x00, 0x00]
}

/// GET_SN command for the 4-byte word at `addr`.
#[must_use]
pub fn get_sn_command(addr: u8) -> [u8; 6] {
    [PROTO_GET_SN, addr, 0x00, 0x00, 0x00, PROTO_EOC]
}

/// Whether a two-byte trailer is the success footer `{0x12, 0x10}`.
#[must_use]
pub fn is_sync_footer(trailer: [u8; 2]) -> bool {
    trailer == [PROTO_INSYNC, PROTO_OK]
}

/// Decode a 4-byte little-endian device-info word.
#[must_use]
pub fn parse_device_word(bytes: &[u8; 4]) -> u32 {
    LittleEndian::read_u32(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prog_multi_frame_shape_for_all_chunk_lengths() {
        for len in 1..=MAX_PROG_CHUNK {
            let chunk: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = prog_multi_command(&chunk);

            assert_eq!(frame.len(), 3 + len);
            assert_eq!(frame[0], PROTO_PROG_MULTI);
            assert_eq!(frame[1] as usize, len);
            assert_eq!(&frame[2..2 + len], &chunk[..]);
            assert_eq!(*frame.last().unwrap(), PROTO_EOC);
        }
    }

    #[test]
    fn sync_footer_recognition() {
        assert!(is_sync_footer([0x12, 0x10]));
        assert!(!is_sync_footer([0x12, 0x11]));
        assert!(!is_sync_footer([0x10, 0x12]));
        assert!(!is_sync_footer([0x00, 0x00]));
    }

    #[test]
    fn device_word_parsing() {
        assert_eq!(parse_device_word(&[0x01, 0x00, 0x00, 0x00]), 1);
        assert_eq!(parse_device_word(&[0xFF, 0xFF, 0xFF, 0xFF]), u32::MAX);
        assert_eq!(parse_device_word(&[0x00, 0x00, 0x01, 0x00]), 0x0001_0000);
    }

    #[test]
    fn command_frames() {
        assert_eq!(sync_command(), [0x21, 0x20]);
        assert_eq!(erase_command(), [0x23, 0x20]);
        assert_eq!(reboot_command(), [0x30, 0x20]);
        assert_eq!(
            get_device_command(DeviceInfoField::FlashSize),
            [0x22, 0x04, 0x20]
        );
        assert_eq!(get_sn_command(8), [0x2B, 0x08, 0x00, 0x00, 0x00, 0x20]);
    }

    #[test]
    fn get_otp_command_splits_address_little_endian() {
        assert_eq!(get_otp_command(0x01FC), [0x2A, 0xFC, 0x01, 0x00, 0x00]);
        // No EOC byte on this command.
        assert_eq!(get_otp_command(0).len(), 5);
        assert_ne!(*get_otp_command(0).last().unwrap(), PROTO_EOC);
    }
}
