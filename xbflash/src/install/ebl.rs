//! `.ebl` install: serial break into the Ember bootloader, then XMODEM.
//!
//! Holding the transmit line low (serial break) while the module comes out
//! of reset makes it start its bootloader at 115200 baud. The bootloader
//! prints a menu ending in `>`; `1` (or `F` for the HCS08 application on
//! programmable modules) starts an XMODEM-CRC receive, and `2` runs the new
//! firmware once the transfer is done.

use log::{debug, info, warn};

use crate::{
    error::{Error, Result},
    image::source::FirmwareSource,
    install::{InstallKind, Phase, Substate, TransferSession},
    port::Port,
    protocol::{
        Status, Step,
        xmodem::{BlockSize, XmodemFlags, XmodemSender, XmodemState, control},
    },
};

/// Bootloader baud rate.
const BOOTLOADER_BAUD: u32 = 115_200;

/// How long the break is held after the reset pulse.
const BREAK_MS: u32 = 150;

/// Settle time between the end of XMODEM and the final prompt.
const SETTLE_MS: u32 = 3000;

/// Give up on a waiting state after this long and start over from reset.
const LOAD_TIMEOUT_MS: u32 = 5000;

/// Resets attempted before giving up.
const MAX_TRIES: u32 = 3;

/// EBL install states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EblState {
    /// Session created.
    Init,
    /// Reset the module with the break condition applied.
    Reset,
    /// Holding the break.
    Break,
    /// Waiting for the bootloader menu prompt.
    Prompt,
    /// Waiting for the receiver's `C`.
    XmodemWait,
    /// Streaming the image.
    XmodemSend,
    /// Transfer done, letting the bootloader settle.
    XmodemDone,
    /// Waiting for the prompt to run the new firmware.
    FinalPrompt,
    /// Installed.
    Success,
    /// Aborted.
    Failure,
}

impl EblState {
    fn index(self) -> u32 {
        self as u32
    }
}

impl<P: Port, S: FirmwareSource> TransferSession<P, S> {
    pub(super) fn tick_ebl(&mut self) -> Result<Status> {
        loop {
            let Phase::Ebl(state) = self.phase else {
                return Err(Error::InvalidState("not an EBL session".into()));
            };
            if self.step_ebl(state)? == Step::Yield {
                return Ok(if self.is_complete() {
                    Status::Complete
                } else {
                    Status::Pending
                });
            }
        }
    }

    fn goto_ebl(&mut self, state: EblState) {
        debug!("EBL install: {:?} -> {state:?}", self.phase);
        self.phase = Phase::Ebl(state);
    }

    fn bootloader_cmd(&self) -> u8 {
        match self.kind {
            InstallKind::Hcs08 => b'F',
            InstallKind::Ebl | InstallKind::Oem => b'1',
        }
    }

    fn step_ebl(&mut self, state: EblState) -> Result<Step> {
        match state {
            EblState::Init => {
                self.tries = 0;
                self.goto_ebl(EblState::Reset);
                Ok(Step::Continue)
            },
            EblState::Reset => {
                let port = self
                    .target
                    .port_mut();
                port.set_reset(false)?;
                port.open(BOOTLOADER_BAUD)?;
                port.set_flow_control(true)?;
                port.set_rts(false)?;
                debug!("Starting serial break and resetting module");
                port.set_break(true)?;
                self.target
                    .reset_module()?;
                self.arm_timer();
                self.goto_ebl(EblState::Break);
                Ok(Step::Yield)
            },
            EblState::Break => {
                if !self.waited(BREAK_MS) {
                    return self.ebl_fallback();
                }
                let port = self
                    .target
                    .port_mut();
                port.set_break(false)?;
                port.set_flow_control(true)?;
                port.set_rts(true)?;
                port.write_byte(b'\r')?;
                self.arm_timer();
                self.goto_ebl(EblState::Prompt);
                Ok(Step::Yield)
            },
            EblState::Prompt => {
                if !self.scan_for(b'>')? {
                    return self.ebl_fallback();
                }
                info!("Entered bootloader, starting upload");
                let cmd = self.bootloader_cmd();
                self.target
                    .port_mut()
                    .write_byte(cmd)?;
                self.arm_timer();
                self.goto_ebl(EblState::XmodemWait);
                Ok(Step::Yield)
            },
            EblState::XmodemWait => {
                if !self.scan_for(control::C)? {
                    return self.ebl_fallback();
                }
                // A restart after a finished transfer sends the image again
                self.source
                    .seek(0)?;
                let mut sender = XmodemSender::new(XmodemFlags::new(BlockSize::Standard, true));
                sender.accept_start(b'C');
                self.sub = Substate::Xmodem(sender);
                self.goto_ebl(EblState::XmodemSend);
                Ok(Step::Yield)
            },
            EblState::XmodemSend => {
                let now = self.now();
                let Substate::Xmodem(sender) = &mut self.sub else {
                    return Err(Error::InvalidState("XMODEM sender missing".into()));
                };
                let status = sender.tick(
                    &mut self.scratch,
                    &mut self.source,
                    self.target
                        .port_mut(),
                    now,
                )?;
                if status == Status::Complete {
                    info!("XMODEM send complete ({} packets)", sender.packet_num() - 1);
                    self.arm_timer();
                    self.goto_ebl(EblState::XmodemDone);
                }
                Ok(Step::Yield)
            },
            EblState::XmodemDone => {
                if !self.waited(SETTLE_MS) {
                    return Ok(Step::Yield);
                }
                self.target
                    .port_mut()
                    .write_byte(b'\r')?;
                self.arm_timer();
                self.goto_ebl(EblState::FinalPrompt);
                Ok(Step::Continue)
            },
            EblState::FinalPrompt => {
                if self.kind == InstallKind::Hcs08 {
                    self.goto_ebl(EblState::Success);
                    return Ok(Step::Yield);
                }
                if !self.scan_for(b'>')? {
                    return self.ebl_fallback();
                }
                info!("Running new firmware");
                self.target
                    .port_mut()
                    .write_byte(b'2')?;
                self.arm_timer();
                self.goto_ebl(EblState::Success);
                Ok(Step::Yield)
            },
            EblState::Success => Ok(Step::Yield),
            EblState::Failure => Err(Error::SessionFailed),
        }
    }

    /// Consume received bytes up to and including `wanted`.
    fn scan_for(&mut self, wanted: u8) -> Result<bool> {
        let port = self
            .target
            .port_mut();
        while let Some(byte) = port.read_byte()? {
            if byte == wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Shared timeout of the waiting states: start over from reset, give up
    /// after the third attempt.
    fn ebl_fallback(&mut self) -> Result<Step> {
        if !self.waited(LOAD_TIMEOUT_MS) {
            return Ok(Step::Yield);
        }
        self.tries += 1;
        if self.tries >= MAX_TRIES {
            return Err(Error::Timeout(format!(
                "no response from bootloader after {MAX_TRIES} attempts"
            )));
        }
        warn!(
            "Bootloader not responding, resetting again ({}/{MAX_TRIES})",
            self.tries + 1
        );
        self.arm_timer();
        self.goto_ebl(EblState::Reset);
        Ok(Step::Yield)
    }

    pub(super) fn ebl_status(&self, state: EblState) -> String {
        match state {
            EblState::Success => "Install successful.".into(),
            EblState::Failure => "Install failed.".into(),
            EblState::Init | EblState::Reset => "Starting update.".into(),
            EblState::Break => "Generating serial break on transmit pin.".into(),
            EblState::Prompt => "Waiting for response from bootloader.".into(),
            EblState::XmodemWait => "Waiting to start XMODEM send.".into(),
            EblState::XmodemSend => match &self.sub {
                Substate::Xmodem(sender) => xmodem_status(sender),
                _ => "XMODEM: Starting transfer...".into(),
            },
            EblState::XmodemDone | EblState::FinalPrompt => {
                "Update complete, rebooting into new firmware.".into()
            },
        }
    }

    pub(super) fn ebl_progress_token(&self, state: EblState) -> u32 {
        let packet_num = match &self.sub {
            Substate::Xmodem(sender) => sender.packet_num(),
            _ => 0,
        };
        (packet_num << 6) | state.index()
    }
}

fn xmodem_status(sender: &XmodemSender) -> String {
    match sender.state() {
        XmodemState::Flush | XmodemState::Start => "XMODEM: Starting transfer...".into(),
        XmodemState::Send | XmodemState::Resend | XmodemState::Sending => {
            format!("XMODEM: Sending packet {}...", sender.packet_num())
        },
        XmodemState::WaitAck => {
            format!("XMODEM: Waiting for ACK of packet {}...", sender.packet_num())
        },
        XmodemState::Eof | XmodemState::FinalAck => {
            "XMODEM: done sending, wait for final ACK.".into()
        },
        XmodemState::Success => "XMODEM: transfer successful.".into(),
        XmodemState::Failure => "XMODEM: transfer failed.".into(),
    }
}
