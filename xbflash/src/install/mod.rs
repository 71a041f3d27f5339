//! Firmware install sessions.
//!
//! A [`TransferSession`] replaces the firmware on the module attached to a
//! [`Target`]. Two procedures exist, picked by [`InstallKind`]:
//!
//! - [`ebl`]: reset into the Ember bootloader with a serial break and stream
//!   the image with XMODEM-CRC (XBee ZB/ZNet, and the HCS08 application on
//!   programmable modules).
//! - [`oem`]: walk the module through AT command mode into its bootloader and
//!   send the image as length-prefixed blocks that the bootloader echoes back
//!   (DigiMesh 900, XTend, XStream).
//!
//! Sessions never block. Call [`TransferSession::tick`] until it returns
//! `Ok(Status::Complete)` or an error; redraw [`TransferSession::status`]
//! whenever [`TransferSession::progress_token`] changes.
//!
//! ```rust,no_run
//! use xbflash::{BufferSource, InstallKind, NativePort, Status, Target, TransferSession};
//!
//! fn main() -> xbflash::Result<()> {
//!     let port = NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!     let image = BufferSource::from_file("XBP09-DM.oem")?;
//!     let mut session = TransferSession::new(Target::new(port), image, InstallKind::Oem);
//!     let mut last = u32::MAX;
//!     loop {
//!         let status = session.tick()?;
//!         if session.progress_token() != last {
//!             last = session.progress_token();
//!             println!("{}", session.status());
//!         }
//!         if status == Status::Complete {
//!             return Ok(());
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(5));
//!     }
//! }
//! ```

pub mod ebl;
pub mod oem;

use log::{info, warn};

use crate::{
    error::{Error, Result},
    image::source::FirmwareSource,
    port::Port,
    protocol::{Status, XmodemSender},
    target::Target,
    timer::Deadline,
};

pub use ebl::EblState;
pub use oem::{OemProgress, OemState};

/// Session scratch buffer size: one 1K XMODEM packet with CRC.
pub const SCRATCH_SIZE: usize = 1024 + 5;

/// Install procedure, chosen by firmware format and module family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum InstallKind {
    /// `.ebl` image over XMODEM (bootloader command `1`).
    Ebl,
    /// HCS08 application on programmable modules (bootloader command `F`,
    /// no final prompt).
    Hcs08,
    /// `.oem` image over the block-echo protocol.
    Oem,
}

impl InstallKind {
    /// Parse a kind name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "ebl" => Some(Self::Ebl),
            "hcs08" | "pxbee" => Some(Self::Hcs08),
            "oem" => Some(Self::Oem),
            _ => None,
        }
    }

    /// Short name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ebl => "ebl",
            Self::Hcs08 => "hcs08",
            Self::Oem => "oem",
        }
    }
}

impl std::fmt::Display for InstallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<crate::image::ImageKind> for InstallKind {
    fn from(kind: crate::image::ImageKind) -> Self {
        match kind {
            crate::image::ImageKind::Ebl => Self::Ebl,
            crate::image::ImageKind::Oem => Self::Oem,
        }
    }
}

/// Engine-specific progress carried next to the top-level state.
#[derive(Debug, Clone)]
pub enum Substate {
    /// Nothing in flight.
    Idle,
    /// XMODEM transfer (EBL/HCS08).
    Xmodem(XmodemSender),
    /// Block-echo transfer (OEM).
    Oem(OemProgress),
}

/// Top-level state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ebl(EblState),
    Oem(OemState),
}

/// One firmware install on one target.
pub struct TransferSession<P: Port, S: FirmwareSource> {
    target: Target<P>,
    source: S,
    kind: InstallKind,
    force: bool,
    phase: Phase,
    /// State to enter once the pending AT response is in.
    next_state: OemState,
    tries: u32,
    /// Timestamp of the last timer arm.
    timer: u32,
    scratch: Box<[u8]>,
    /// Bytes of the current AT response collected in `scratch`.
    response_len: usize,
    sub: Substate,
}

impl<P: Port, S: FirmwareSource> TransferSession<P, S> {
    /// Prepare an install. Nothing is sent until the first `tick()`.
    pub fn new(target: Target<P>, source: S, kind: InstallKind) -> Self {
        let timer = target
            .port()
            .millis();
        let phase = match kind {
            InstallKind::Ebl | InstallKind::Hcs08 => Phase::Ebl(EblState::Init),
            InstallKind::Oem => Phase::Oem(OemState::Init),
        };
        Self {
            target,
            source,
            kind,
            force: false,
            phase,
            next_state: OemState::Init,
            tries: 0,
            timer,
            scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
            response_len: 0,
            sub: Substate::Idle,
        }
    }

    /// Install even if the module already runs the image's version (OEM).
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Install procedure.
    pub fn kind(&self) -> InstallKind {
        self.kind
    }

    /// The module being updated.
    pub fn target(&self) -> &Target<P> {
        &self.target
    }

    /// Mutable access to the module being updated.
    pub fn target_mut(&mut self) -> &mut Target<P> {
        &mut self.target
    }

    /// Engine-specific progress.
    pub fn substate(&self) -> &Substate {
        &self.sub
    }

    /// Give back the target and the firmware source.
    pub fn into_parts(self) -> (Target<P>, S) {
        (self.target, self.source)
    }

    /// Whether the session reached success.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.phase,
            Phase::Ebl(EblState::Success) | Phase::Oem(OemState::Success)
        )
    }

    /// Whether the session failed and has to be discarded.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.phase,
            Phase::Ebl(EblState::Failure) | Phase::Oem(OemState::Failure)
        )
    }

    /// Do one bounded unit of work.
    ///
    /// Any `Err` is terminal; later calls return [`Error::SessionFailed`].
    pub fn tick(&mut self) -> Result<Status> {
        if self.is_failed() {
            return Err(Error::SessionFailed);
        }
        let result = match self.phase {
            Phase::Ebl(_) => self.tick_ebl(),
            Phase::Oem(_) => self.tick_oem(),
        };
        match &result {
            Ok(Status::Complete) => info!("Install of {} image complete", self.kind),
            Ok(Status::Pending) => {},
            Err(e) => {
                warn!("Install failed: {e}");
                self.phase = match self.phase {
                    Phase::Ebl(_) => Phase::Ebl(EblState::Failure),
                    Phase::Oem(_) => Phase::Oem(OemState::Failure),
                };
            },
        }
        result
    }

    /// Human-readable description of the current step.
    pub fn status(&self) -> String {
        match self.phase {
            Phase::Ebl(state) => self.ebl_status(state),
            Phase::Oem(state) => self.oem_status(state),
        }
    }

    /// Value that changes whenever the state or the transfer position
    /// changes; redraw the status when it does.
    pub fn progress_token(&self) -> u32 {
        match self.phase {
            Phase::Ebl(state) => self.ebl_progress_token(state),
            Phase::Oem(state) => self.oem_progress_token(state),
        }
    }

    fn now(&self) -> u32 {
        self.target
            .port()
            .millis()
    }

    fn arm_timer(&mut self) {
        self.timer = self.now();
    }

    /// Whether `ms` milliseconds passed since the timer was armed.
    fn waited(&self, ms: u32) -> bool {
        Deadline::arm(self.timer, ms).elapsed(self.now())
    }
}

impl<P: Port, S: FirmwareSource> std::fmt::Debug for TransferSession<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("tries", &self.tries)
            .field("sub", &self.sub)
            .finish_non_exhaustive()
    }
}
