//! Serial port abstraction.
//!
//! The design separates I/O from protocol logic: the transport loop and
//! the bootloader driver both talk to a [`Port`] trait, so the protocol
//! layer can be exercised against an in-memory port in tests while
//! production code uses the `serialport`-backed [`NativePort`].

pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rates accepted by the link.
///
/// Only these values are valid on an open device; anything else is
/// rejected by the setter that receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum BaudRate {
    /// 1200 baud.
    Baud1200 = 1200,
    /// 2400 baud.
    Baud2400 = 2400,
    /// 4800 baud.
    Baud4800 = 4800,
    /// 9600 baud.
    Baud9600 = 9600,
    /// 19200 baud.
    Baud19200 = 19200,
    /// 38400 baud.
    Baud38400 = 38400,
    /// 57600 baud.
    Baud57600 = 57600,
    /// 115200 baud.
    #[default]
    Baud115200 = 115200,
}

impl BaudRate {
    /// All members of the enumerated set, ascending.
    pub const ALL: [Self; 8] = [
        Self::Baud1200,
        Self::Baud2400,
        Self::Baud4800,
        Self::Baud9600,
        Self::Baud19200,
        Self::Baud38400,
        Self::Baud57600,
        Self::Baud115200,
    ];

    /// Map a raw rate to the enumerated set, if it is a member.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| *b as u32 == raw)
    }

    /// The numeric rate.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl DataBits {
    /// Map a bit count (5-8) to the enum.
    #[must_use]
    pub fn from_count(count: u8) -> Option<Self> {
        match count {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    /// The bit count.
    #[must_use]
    pub fn count(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

impl StopBits {
    /// Map a stop-bit count (1-2) to the enum.
    #[must_use]
    pub fn from_count(count: u8) -> Option<Self> {
        match count {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }

    /// The stop-bit count.
    #[must_use]
    pub fn count(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Line settings used to open a port.
#[derive(Debug, Clone)]
pub struct PortSettings {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: BaudRate,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: BaudRate::Baud115200,
            timeout: Duration::from_millis(50),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl PortSettings {
    /// Create settings with a port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: BaudRate) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Unified trait for serial device handles.
///
/// Implemented by [`NativePort`] for real hardware and by scripted
/// in-memory ports in tests.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate. The rate must be in the enumerated set.
    fn set_baud_rate(&mut self, baud_rate: BaudRate) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> BaudRate;

    /// Discard any buffered input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set the DTR (Data Terminal Ready) line state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Close the port and release the handle. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Trait for listing available serial ports.
///
/// Separated from [`Port`] because enumeration is a static operation
/// that does not require an open handle.
pub trait PortEnumerator {
    /// List the names of all currently available serial ports.
    fn list_port_names() -> Result<Vec<String>>;
}

pub use native::{NativePort, NativePortEnumerator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_from_raw_accepts_enumerated_set() {
        for baud in BaudRate::ALL {
            assert_eq!(BaudRate::from_raw(baud.as_u32()), Some(baud));
        }
    }

    #[test]
    fn baud_rate_from_raw_rejects_others() {
        assert_eq!(BaudRate::from_raw(0), None);
        assert_eq!(BaudRate::from_raw(14400), None);
        assert_eq!(BaudRate::from_raw(921600), None);
    }

    #[test]
    fn data_bits_round_trip() {
        for count in 5..=8u8 {
            let bits = DataBits::from_count(count).unwrap();
            assert_eq!(bits.count(), count);
        }
        assert_eq!(DataBits::from_count(9), None);
    }

    #[test]
    fn port_settings_default() {
        let settings = PortSettings::default();
        assert_eq!(settings.baud_rate, BaudRate::Baud115200);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.flow_control, FlowControl::None);
    }
}
