//! Port abstraction for the serial link to the radio module.
//!
//! The install engines never touch a serial device directly. They drive the
//! link through two traits:
//!
//! - [`Stream`]: non-blocking byte read/write, the only capability the XMODEM
//!   sender needs.
//! - [`Port`]: everything else the installers use to steer the module
//!   (re-open at a baud rate, serial break, RTS, flow control, reset line,
//!   buffer levels and the millisecond timer).
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------+
//! |  install (ebl / oem)    |
//! +-----+-------------+-----+
//!       |             |
//!       v             v
//! +-----+-----+ +-----+------+
//! |  atmode   | |   xmodem   |
//! +-----+-----+ +-----+------+
//!       |             |
//!       v             v
//! +-----+-------------+------+
//! |   Port / Stream traits   |
//! +-----+--------------------+
//!       |
//!       v
//! +-----+--------------------+
//! | NativePort (serialport)  |
//! +--------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use xbflash::port::Port;
//!
//! fn say_hello<P: Port>(port: &mut P) -> xbflash::Result<()> {
//!     port.open(9600)?;
//!     port.write_byte(b'\r')?;
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(feature = "native")]
pub use native::NativePort;

use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Initial baud rate.
    pub baud_rate: u32,
    /// Read timeout handed to the OS driver. Reads never wait on it because
    /// only buffered bytes are requested.
    pub timeout: Duration,
    /// Modem-control line wired to the module's reset pin.
    pub reset_line: ResetLine,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(10),
            reset_line: ResetLine::Dtr,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the line that drives the module's reset pin.
    #[must_use]
    pub fn with_reset_line(mut self, reset_line: ResetLine) -> Self {
        self.reset_line = reset_line;
        self
    }
}

/// Which host output controls the module's reset pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ResetLine {
    /// DTR is wired to reset (asserted DTR holds the module in reset).
    #[default]
    Dtr,
    /// Reset is not wired; the user has to reset the module by hand.
    None,
}

impl ResetLine {
    /// Parse a reset line name ("dtr" or "none").
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "dtr" => Some(Self::Dtr),
            "none" | "manual" => Some(Self::None),
            _ => None,
        }
    }
}

/// Non-blocking byte stream to the receiver.
///
/// Both calls may transfer fewer bytes than requested, including zero;
/// callers resume from partial results on their next tick.
pub trait Stream {
    /// Read whatever is available, up to `buf.len()` bytes. `Ok(0)` means
    /// nothing is buffered right now.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Queue up to `buf.len()` bytes for transmission.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read a single byte if one is available.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.read(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    /// Write a single byte; a full transmit buffer is an error.
    fn write_byte(&mut self, byte: u8) -> Result<()> {
        match self.write(&[byte])? {
            0 => Err(Error::ResourceExhausted(format!(
                "transmit buffer full writing 0x{byte:02X}"
            ))),
            _ => Ok(()),
        }
    }

    /// Discard everything currently readable.
    fn drain(&mut self) -> Result<usize> {
        let mut scratch = [0u8; 64];
        let mut total = 0;
        loop {
            let n = self.read(&mut scratch)?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }
}

/// Serial transport primitives consumed by the installers.
pub trait Port: Stream {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// (Re)open the port at the given baud rate. Drops any break condition
    /// and resets flow control to off.
    fn open(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Enable or disable RTS/CTS hardware flow control.
    fn set_flow_control(&mut self, enabled: bool) -> Result<()>;

    /// Start or end a serial break (transmit line held low).
    fn set_break(&mut self, enabled: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Assert or release the module's reset line.
    fn set_reset(&mut self, asserted: bool) -> Result<()>;

    /// Discard all buffered receive data.
    fn flush_rx(&mut self) -> Result<()>;

    /// Bytes waiting in the receive buffer.
    fn rx_available(&mut self) -> Result<usize>;

    /// Free space in the transmit buffer.
    fn tx_free(&mut self) -> Result<usize>;

    /// Free-running millisecond counter; wraps at `u32::MAX`.
    fn millis(&self) -> u32;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;

    /// Toggle the reset line: assert, then release.
    ///
    /// Both edges are issued back to back; implementations whose reset
    /// circuit needs a minimum hold time must provide it here.
    fn pulse_reset(&mut self) -> Result<()> {
        self.set_reset(true)?;
        self.set_reset(false)
    }
}
