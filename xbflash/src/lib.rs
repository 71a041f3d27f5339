//! # xbflash
//!
//! A library for installing firmware on Digi XBee radio modules over a
//! serial line.
//!
//! Two install procedures are implemented:
//!
//! - `.ebl` images (XBee ZB / ZNet 2.5, and the HCS08 application on
//!   programmable modules): serial break into the Ember bootloader, then an
//!   XMODEM-CRC transfer.
//! - `.oem` images (DigiMesh 900, XTend, XStream): AT command mode checks,
//!   bootloader unlock, then a block-echo transfer.
//!
//! Everything is driven by non-blocking `tick()` calls on cooperative state
//! machines, so an install can share a thread with other work. Time comes
//! from [`Port::millis`], a wrapping millisecond counter.
//!
//! ## Features
//!
//! - `native` (default): [`NativePort`] on top of the `serialport` crate, and
//!   port discovery
//! - `serde`: `Serialize` for image headers, discovered ports and config types
//!
//! ## Example
//!
//! ```rust,no_run
//! use xbflash::{BufferSource, ImageKind, NativePort, Status, Target, TransferSession};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = BufferSource::from_file("XB24-ZB_2370.ebl")?;
//!     let kind = ImageKind::from_magic(image.as_bytes()).ok_or("unknown image format")?;
//!
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let mut session = TransferSession::new(Target::new(port), image, kind.into());
//!     while session.tick()? == Status::Pending {
//!         std::thread::sleep(std::time::Duration::from_millis(5));
//!     }
//!     println!("{}", session.status());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod install;
pub mod port;
pub mod protocol;
pub mod target;
pub mod timer;

#[cfg(test)]
mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    device::{DetectedPort, DeviceKind},
    error::{Error, Result},
    host::{auto_detect_port, discover_ports, discover_xbee_ports},
    image::{
        BufferSource, FirmwareSource, ImageKind,
        oem::{BlockChain, OemHeader},
    },
    install::{InstallKind, Substate, TransferSession},
    port::{Port, ResetLine, SerialConfig, Stream},
    protocol::{
        Status,
        xmodem::{BlockSize, XmodemFlags, XmodemSender},
    },
    target::{AtModeConfig, Mode, Target},
};
