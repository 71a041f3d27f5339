//! `.oem` install: AT command mode into the bootloader, then block echo.
//!
//! The module is checked over AT commands first (`HV` hardware, `%C`
//! compatibility level, `VR` version), then unlocked with `%Pxxxx` derived
//! from its serial number (or reset into the bootloader with `ATFR` and a
//! serial break). The bootloader runs at 38400 baud and answers `+` with
//! `U`. The image body is a chain of length-prefixed blocks: each outbound
//! block is followed by the block the bootloader must echo back.

use log::{debug, info, warn};

use crate::{
    error::{Error, Result},
    image::{
        oem::{
            self, BOOTLOADER_ACK, BOOTLOADER_NAK, OFS_IMAGE_LEN, OFS_MODULE_ID, OFS_SW_COMPAT,
            OFS_VERSION, VERSION_LEN,
        },
        source::FirmwareSource,
    },
    install::{Phase, Substate, TransferSession},
    port::Port,
    protocol::{Status, Step},
    target::Mode,
};

/// Firmware baud rate tried first.
const FAST_BAUD: u32 = 115_200;

/// Factory default baud rate, tried second and used by new firmware.
const DEFAULT_BAUD: u32 = 9600;

/// Bootloader baud rate.
const BOOTLOADER_BAUD: u32 = 38_400;

/// Break held after `ATFR` to keep the module in its bootloader.
const BREAK_MS: u32 = 400;

/// Wait for the bootloader's reply to `+`.
const BOOTLOADER_REPLY_MS: u32 = 1000;

/// Wait for a whole echo block.
const ECHO_TIMEOUT_MS: u32 = 4000;

/// Wait for the new firmware to boot.
const REBOOT_MS: u32 = 3000;

/// Largest chunk written to or compared from the port per tick.
const CHUNK: usize = 128;

/// Resends of one block before giving up.
const MAX_RESENDS: u32 = 3;

/// OEM install states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OemState {
    /// Session created; the image is validated on the first tick.
    Init,
    /// Open the port and start entering command mode.
    Reset,
    /// Waiting for command mode.
    CmdPending,
    /// Collecting the reply to an AT request.
    ParseResponse,
    /// Got `ATHV`.
    CmdHv,
    /// Got `AT%C`.
    CmdCompat,
    /// Got `ATVR`.
    CmdVr,
    /// Got `ATCF1`.
    CmdCf1,
    /// Got `ATSL`.
    CmdSl,
    /// Got `AT%Pxxxx`.
    CmdProg,
    /// Got `ATFR`.
    CmdFr,
    /// Holding the break after `ATFR`.
    Break,
    /// Reopen at the bootloader rate and knock with `+`.
    Bootloader,
    /// Waiting for the bootloader's reply.
    TxStart,
    /// Start the next block.
    TxBlock,
    /// Streaming the outbound block.
    Sending,
    /// Comparing the bootloader's echo.
    RxBlock,
    /// Echo wrong or missing.
    RxFail,
    /// Waiting for the new firmware to boot.
    FinalPrompt,
    /// Nothing left to do.
    Done,
    /// Installed (or already current).
    Success,
    /// Aborted.
    Failure,
}

impl OemState {
    fn index(self) -> u32 {
        self as u32
    }

    /// AT command whose reply leads to this state.
    fn command(self) -> &'static str {
        match self {
            Self::CmdHv => "HV",
            Self::CmdCompat => "%C",
            Self::CmdVr => "VR",
            Self::CmdCf1 => "CF1",
            Self::CmdSl => "SL",
            Self::CmdProg => "%Pxxxx",
            Self::CmdFr => "FR",
            _ => "",
        }
    }
}

/// Position in the block chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OemProgress {
    /// Declared image length.
    pub firmware_length: u32,
    /// Offset of the outbound block being sent.
    pub block_offset: u32,
    /// Offset just past the block currently being sent or compared.
    pub cur_offset: u32,
    /// Bytes of the current block still to send or compare.
    pub block_length: u16,
}

impl OemProgress {
    /// Image offset of the next byte to send or compare.
    fn position(&self) -> u32 {
        self.cur_offset - u32::from(self.block_length)
    }

    /// Enter a block of `len` bytes whose length prefix sits at `at`.
    fn open_block(&mut self, at: u32, len: u16) -> Result<()> {
        let end = at + 2 + u32::from(len);
        if end > self.firmware_length {
            return Err(Error::Validation(format!(
                "{len}-byte block at offset {at} overruns the {}-byte image",
                self.firmware_length
            )));
        }
        self.block_length = len;
        self.cur_offset = end;
        Ok(())
    }
}

impl<P: Port, S: FirmwareSource> TransferSession<P, S> {
    pub(super) fn tick_oem(&mut self) -> Result<Status> {
        loop {
            let Phase::Oem(state) = self.phase else {
                return Err(Error::InvalidState("not an OEM session".into()));
            };
            if self.step_oem(state)? == Step::Yield {
                return Ok(if self.is_complete() {
                    Status::Complete
                } else {
                    Status::Pending
                });
            }
        }
    }

    fn goto_oem(&mut self, state: OemState) {
        debug!("OEM install: {:?} -> {state:?}", self.phase);
        self.phase = Phase::Oem(state);
    }

    fn progress(&self) -> OemProgress {
        match self.sub {
            Substate::Oem(progress) => progress,
            _ => OemProgress::default(),
        }
    }

    fn response(&self) -> &[u8] {
        &self.scratch[..self.response_len]
    }

    /// Send `AT<command>` and continue in `next` once the reply is in.
    fn request(&mut self, command: &[u8], next: OemState) -> Result<Step> {
        self.response_len = 0;
        self.target
            .send_request(command)?;
        self.next_state = next;
        self.goto_oem(OemState::ParseResponse);
        Ok(Step::Yield)
    }

    fn image_byte(&mut self, offset: u32) -> Result<u8> {
        self.source
            .seek(offset)?;
        self.source
            .read_u8()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn step_oem(&mut self, state: OemState) -> Result<Step> {
        match state {
            OemState::Init => {
                let header = oem::verify(&mut self.source, &mut self.scratch)?;
                let chain = oem::count_blocks(&mut self.source, &header)?;
                info!(
                    "Image for module 0x{:02X}, compatibility {}, version {}, {} blocks",
                    header.module_id,
                    header.software_id,
                    header.version_str(),
                    chain.transfers()
                );
                self.tries = 0;
                self.goto_oem(OemState::Reset);
                Ok(Step::Yield)
            },
            OemState::Reset => {
                let baud = if self.tries > 0 { DEFAULT_BAUD } else { FAST_BAUD };
                debug!("Entering command mode at {baud} baud");
                let port = self
                    .target
                    .port_mut();
                port.open(baud)?;
                port.set_flow_control(true)?;
                self.target
                    .atmode_enter()?;
                self.goto_oem(OemState::CmdPending);
                Ok(Step::Yield)
            },
            OemState::CmdPending => match self
                .target
                .atmode_tick()?
            {
                Mode::Command => self.request(b"HV", OemState::CmdHv),
                Mode::Idle if self.tries == 0 => {
                    warn!("No command mode at {FAST_BAUD} baud, trying {DEFAULT_BAUD}");
                    self.tries += 1;
                    self.goto_oem(OemState::Reset);
                    Ok(Step::Yield)
                },
                Mode::Idle => Err(Error::Timeout("module did not enter command mode".into())),
                _ => Ok(Step::Yield),
            },
            OemState::ParseResponse => {
                match self
                    .target
                    .read_response(&mut self.scratch, &mut self.response_len)?
                {
                    Some(len) => {
                        self.response_len = len;
                        let next = self.next_state;
                        self.goto_oem(next);
                        Ok(Step::Continue)
                    },
                    None => Ok(Step::Yield),
                }
            },
            OemState::CmdHv => {
                let hv = oem::hex2word(self.response());
                let module_id = self.image_byte(OFS_MODULE_ID)?;
                if (hv >> 8) as u8 != module_id {
                    return Err(Error::IncompatibleHardware(format!(
                        "module reports hardware 0x{hv:04X}, image is for 0x{module_id:02X}xx"
                    )));
                }
                self.request(b"%C", OemState::CmdCompat)
            },
            OemState::CmdCompat => {
                // XStream has no %C
                if self.response() != b"ERROR" {
                    let level = oem::hex2word(self.response());
                    let wanted = self.image_byte(OFS_SW_COMPAT)?;
                    if level != u16::from(wanted) {
                        return Err(Error::IncompatibleHardware(format!(
                            "module compatibility level {level}, image needs {wanted}"
                        )));
                    }
                }
                self.request(b"VR", OemState::CmdVr)
            },
            OemState::CmdVr => {
                let mut version = [0u8; VERSION_LEN];
                self.source
                    .seek(OFS_VERSION)?;
                self.source
                    .read_full(&mut version)?;
                let current = self
                    .response()
                    .get(..VERSION_LEN)
                    == Some(&version[..]);
                if current && !self.force {
                    info!(
                        "Module already runs {}, nothing to do",
                        String::from_utf8_lossy(&version)
                    );
                    self.target
                        .atmode_exit()?;
                    self.goto_oem(OemState::Done);
                    return Ok(Step::Continue);
                }
                info!(
                    "Updating module from {} to {}",
                    String::from_utf8_lossy(self.response()),
                    String::from_utf8_lossy(&version)
                );
                // hex serial number on XTend; other modules answer ERROR
                self.request(b"CF1", OemState::CmdCf1)
            },
            OemState::CmdCf1 => self.request(b"SL", OemState::CmdSl),
            OemState::CmdSl => {
                let command = oem::unlock_command(oem::hex2word(self.response()));
                self.request(&command, OemState::CmdProg)
            },
            OemState::CmdProg => {
                if self.response() == b"OK" {
                    debug!("Programming mode unlocked");
                    self.goto_oem(OemState::Bootloader);
                    return Ok(Step::Continue);
                }
                debug!("Unlock refused, resetting into the bootloader");
                self.request(b"FR", OemState::CmdFr)
            },
            OemState::CmdFr => {
                let port = self
                    .target
                    .port_mut();
                port.set_rts(false)?;
                port.set_break(true)?;
                self.arm_timer();
                self.goto_oem(OemState::Break);
                Ok(Step::Yield)
            },
            OemState::Break => {
                if !self.waited(BREAK_MS) {
                    return Ok(Step::Yield);
                }
                self.target
                    .port_mut()
                    .set_break(false)?;
                self.goto_oem(OemState::Bootloader);
                Ok(Step::Continue)
            },
            OemState::Bootloader => {
                let port = self
                    .target
                    .port_mut();
                port.open(BOOTLOADER_BAUD)?;
                port.write_byte(b'+')?;
                self.arm_timer();
                self.goto_oem(OemState::TxStart);
                Ok(Step::Yield)
            },
            OemState::TxStart => {
                let reply = self
                    .target
                    .port_mut()
                    .read_byte()?;
                match reply {
                    Some(BOOTLOADER_ACK | BOOTLOADER_NAK) => {},
                    None if !self.waited(BOOTLOADER_REPLY_MS) => return Ok(Step::Yield),
                    Some(byte) => {
                        return Err(Error::Protocol(format!(
                            "unexpected bootloader reply 0x{byte:02X}"
                        )));
                    },
                    None => return Err(Error::Protocol("bootloader did not answer".into())),
                }
                self.tries = 0;
                self.source
                    .seek(OFS_IMAGE_LEN)?;
                let firmware_length = self
                    .source
                    .read_u32_be()?;
                let block_offset = u32::from(
                    self.source
                        .read_u16_be()?,
                );
                info!("Bootloader ready, sending {firmware_length}-byte image");
                self.sub = Substate::Oem(OemProgress {
                    firmware_length,
                    block_offset,
                    cur_offset: block_offset,
                    block_length: 0,
                });
                self.goto_oem(OemState::TxBlock);
                Ok(Step::Continue)
            },
            OemState::TxBlock => {
                let mut progress = self.progress();
                self.source
                    .seek(progress.block_offset)?;
                let len = self
                    .source
                    .read_u16_be()?;
                if len == 0 {
                    info!("All blocks sent, resetting module");
                    self.target
                        .reset_module()?;
                    let port = self
                        .target
                        .port_mut();
                    port.open(DEFAULT_BAUD)?;
                    port.set_flow_control(true)?;
                    self.arm_timer();
                    self.goto_oem(OemState::FinalPrompt);
                    return Ok(Step::Yield);
                }
                progress.open_block(progress.block_offset, len)?;
                debug!(
                    "Sending {len}-byte block at offset {}",
                    progress.block_offset
                );
                self.sub = Substate::Oem(progress);
                self.goto_oem(OemState::Sending);
                Ok(Step::Continue)
            },
            OemState::Sending => self.send_block(),
            OemState::RxBlock => self.compare_echo(),
            OemState::RxFail => {
                self.tries += 1;
                if self.tries > MAX_RESENDS {
                    return Err(Error::Protocol(format!(
                        "block at offset {} not accepted after {MAX_RESENDS} resends",
                        self.progress()
                            .block_offset
                    )));
                }
                warn!(
                    "Bad echo for block at offset {}, resending ({}/{MAX_RESENDS})",
                    self.progress()
                        .block_offset,
                    self.tries
                );
                self.target
                    .port_mut()
                    .flush_rx()?;
                self.goto_oem(OemState::TxBlock);
                Ok(Step::Continue)
            },
            OemState::FinalPrompt => {
                if !self.waited(REBOOT_MS) {
                    return Ok(Step::Yield);
                }
                self.goto_oem(OemState::Done);
                Ok(Step::Continue)
            },
            OemState::Done => {
                self.goto_oem(OemState::Success);
                Ok(Step::Yield)
            },
            OemState::Success => Ok(Step::Yield),
            OemState::Failure => Err(Error::SessionFailed),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn send_block(&mut self) -> Result<Step> {
        let mut progress = self.progress();
        let room = self
            .target
            .port_mut()
            .tx_free()?;
        let bytes = room
            .min(CHUNK)
            .min(usize::from(progress.block_length));
        if bytes > 0 {
            let chunk = &mut self.scratch[..bytes];
            self.source
                .seek(progress.position())?;
            self.source
                .read_full(chunk)?;
            let written = self
                .target
                .port_mut()
                .write(chunk)?;
            // written <= bytes <= block_length
            progress.block_length -= written as u16;
        }
        if progress.block_length > 0 {
            self.sub = Substate::Oem(progress);
            return Ok(Step::Yield);
        }

        self.source
            .seek(progress.cur_offset)?;
        let echo_len = self
            .source
            .read_u16_be()?;
        progress.open_block(progress.cur_offset, echo_len)?;
        debug!("Expecting {echo_len}-byte echo");
        self.sub = Substate::Oem(progress);
        self.arm_timer();
        self.goto_oem(OemState::RxBlock);
        Ok(Step::Yield)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn compare_echo(&mut self) -> Result<Step> {
        let mut progress = self.progress();
        if progress.block_length > 0 {
            let want = usize::from(progress.block_length).min(CHUNK);
            let (received, expected) = self.scratch[..2 * CHUNK].split_at_mut(CHUNK);
            let got = self
                .target
                .port_mut()
                .read(&mut received[..want])?;
            if got == 0 {
                if self.waited(ECHO_TIMEOUT_MS) {
                    debug!("Echo timed out");
                    self.goto_oem(OemState::RxFail);
                    return Ok(Step::Continue);
                }
                return Ok(Step::Yield);
            }
            self.source
                .seek(progress.position())?;
            self.source
                .read_full(&mut expected[..got])?;
            if received[..got] != expected[..got] {
                debug!("Echo mismatch at offset {}", progress.position());
                self.goto_oem(OemState::RxFail);
                return Ok(Step::Continue);
            }
            // got <= want <= block_length
            progress.block_length -= got as u16;
            if progress.block_length > 0 {
                self.sub = Substate::Oem(progress);
                return Ok(Step::Yield);
            }
        }
        self.tries = 0;
        progress.block_offset = progress.cur_offset;
        self.sub = Substate::Oem(progress);
        self.goto_oem(OemState::TxBlock);
        Ok(Step::Yield)
    }

    pub(super) fn oem_status(&self, state: OemState) -> String {
        match state {
            OemState::Success | OemState::Done => "Install successful.".into(),
            OemState::Failure => "Install failed.".into(),
            OemState::Init => "Starting update.".into(),
            OemState::Reset => "Verified firmware image.".into(),
            OemState::CmdPending => format!(
                "Trying to enter command mode at {}kbps.",
                if self.tries > 0 { "9.6" } else { "115" }
            ),
            OemState::ParseResponse => {
                format!("Waiting for response to AT{}.", self.next_state.command())
            },
            OemState::CmdHv
            | OemState::CmdCompat
            | OemState::CmdVr
            | OemState::CmdCf1
            | OemState::CmdSl
            | OemState::CmdProg
            | OemState::CmdFr => format!("Received response to AT{} command.", state.command()),
            OemState::Break => "Generating serial break on transmit pin.".into(),
            OemState::Bootloader | OemState::TxStart => {
                "Waiting for response from bootloader.".into()
            },
            OemState::TxBlock | OemState::Sending | OemState::RxBlock | OemState::RxFail => {
                let progress = self.progress();
                format!(
                    "Sending firmware ({}/{}).",
                    progress.block_offset, progress.firmware_length
                )
            },
            OemState::FinalPrompt => "Update complete, rebooting into new firmware.".into(),
        }
    }

    pub(super) fn oem_progress_token(&self, state: OemState) -> u32 {
        (self
            .progress()
            .block_offset
            << 6)
            | state.index()
    }
}
