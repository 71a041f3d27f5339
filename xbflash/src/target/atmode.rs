//! AT command mode driver.
//!
//! Moves the module between its transparent (idle) mode and the
//! line-oriented command mode by sending the escape sequence (`+++`) framed by
//! guard times of silence, and tracks outstanding `AT` requests.
//!
//! Command mode is not robust: the module drops back to idle on its own after
//! `idle_timeout` × 100 ms without a command, and the driver only mirrors that
//! with its own timer. Callers that need certainty can re-enter command mode
//! just to send `ATCN`.
//!
//! Every call is non-blocking. After [`Target::atmode_enter`] keep calling
//! [`Target::atmode_tick`] until it reports [`Mode::Command`] (entered) or
//! [`Mode::Idle`] (failed).

use log::{debug, trace};

use crate::{
    error::{Error, Result},
    port::Port,
    target::Target,
    timer::Deadline,
};

/// Silence added on top of the guard time before and after the escape.
const GUARD_MARGIN_MS: u32 = 200;

/// How long to wait for a response line (and for `ATCN` to take effect).
const RESPONSE_TIMEOUT_MS: u32 = 2000;

/// The module's reply to a successful escape sequence.
const OK_RESPONSE: &[u8; 3] = b"OK\r";

/// Driver view of the module's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No transition has happened yet.
    #[default]
    Unknown,
    /// Transparent serial mode.
    Idle,
    /// Waiting out the guard time before sending the escape sequence.
    PreEscape,
    /// Escape sent; waiting for `OK\r`.
    PostEscape,
    /// In command mode, ready for a request.
    Command,
    /// Request sent; waiting for its response line.
    WaitResponse,
    /// `ATCN` sent; waiting to be back in idle mode.
    WaitIdle,
}

/// AT command mode timing parameters, mirroring the module's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AtModeConfig {
    /// Guard time in milliseconds (GT register).
    pub guard_time_ms: u32,
    /// Command mode timeout in units of 100 ms (CT register).
    pub idle_timeout: u32,
    /// Escape character (CC register).
    pub escape_char: u8,
}

impl Default for AtModeConfig {
    fn default() -> Self {
        Self {
            guard_time_ms: 1000,
            idle_timeout: 100,
            escape_char: b'+',
        }
    }
}

impl AtModeConfig {
    fn guard_window(&self) -> u32 {
        self.guard_time_ms
            .saturating_add(GUARD_MARGIN_MS)
    }

    fn idle_window(&self) -> u32 {
        self.idle_timeout
            .saturating_mul(100)
    }
}

impl<P: Port> Target<P> {
    fn waited(&self, now: u32, ms: u32) -> bool {
        Deadline::arm(self.mode_timer, ms).elapsed(now)
    }

    fn enter_mode(&mut self, mode: Mode) {
        debug!("AT mode {:?} -> {mode:?}", self.mode);
        self.mode = mode;
        self.mode_timer = self
            .port
            .millis();
    }

    /// Start entering command mode.
    ///
    /// Does nothing if a transition is already in progress or the module is
    /// already in command mode.
    pub fn atmode_enter(&mut self) -> Result<()> {
        match self.atmode_tick()? {
            Mode::PreEscape
            | Mode::PostEscape
            | Mode::Command
            | Mode::WaitResponse
            | Mode::WaitIdle => {
                trace!("Ignoring command mode request, already in {:?}", self.mode);
            },
            Mode::Unknown | Mode::Idle => {
                debug!(
                    "Entering command mode (guard={} ms, escape={:?})",
                    self.config.guard_time_ms,
                    char::from(self.config.escape_char)
                );
                self.enter_mode(Mode::PreEscape);
            },
        }
        Ok(())
    }

    /// Leave command mode.
    ///
    /// The module is not considered idle until [`Target::atmode_tick`] says
    /// so. Returns [`Error::Busy`] while the escape or a request is still
    /// waiting for its reply.
    pub fn atmode_exit(&mut self) -> Result<()> {
        match self.atmode_tick()? {
            Mode::PreEscape => {
                debug!("Aborting wait to enter command mode");
                self.enter_mode(Mode::Idle);
            },
            Mode::PostEscape | Mode::WaitResponse => return Err(Error::Busy),
            Mode::Command => {
                debug!("Sending ATCN");
                self.send_request(b"CN")?;
                self.mode = Mode::WaitIdle;
            },
            other => trace!("Mode unchanged ({other:?})"),
        }
        Ok(())
    }

    /// Advance the AT mode timers and return the current mode.
    pub fn atmode_tick(&mut self) -> Result<Mode> {
        let now = self
            .port
            .millis();
        match self.mode {
            Mode::PreEscape => {
                if self.waited(now, self.config.guard_window()) {
                    debug!("Guard time elapsed, sending escape sequence");
                    let escape = [self.config.escape_char; 3];
                    let written = self
                        .port
                        .write(&escape)?;
                    if written < escape.len() {
                        return Err(Error::ResourceExhausted(
                            "escape sequence did not fit the transmit buffer".into(),
                        ));
                    }
                    self.enter_mode(Mode::PostEscape);
                    self.port
                        .flush_rx()?;
                }
            },
            Mode::PostEscape => {
                if self
                    .port
                    .rx_available()?
                    >= OK_RESPONSE.len()
                {
                    let mut reply = [0u8; 3];
                    let n = self
                        .port
                        .read(&mut reply)?;
                    trace!("Escape reply {:?}", String::from_utf8_lossy(&reply[..n]));
                    if n == reply.len() && &reply == OK_RESPONSE {
                        self.enter_mode(Mode::Command);
                    } else {
                        self.enter_mode(Mode::Idle);
                    }
                } else if self.waited(now, self.config.guard_window()) {
                    debug!("Guard time expired before 'OK'");
                    self.enter_mode(Mode::Idle);
                }
            },
            Mode::WaitResponse => {
                if self.waited(now, RESPONSE_TIMEOUT_MS) {
                    debug!("Timed out waiting for response");
                    self.mode = Mode::Command;
                }
            },
            Mode::WaitIdle => {
                if self.waited(now, RESPONSE_TIMEOUT_MS) {
                    self.mode = Mode::Idle;
                }
            },
            Mode::Command => {
                if self.waited(now, self.config.idle_window()) {
                    debug!("Command mode timed out, module is idle again");
                    self.mode = Mode::Idle;
                }
            },
            Mode::Unknown | Mode::Idle => {},
        }
        Ok(self.mode)
    }

    /// Send `AT<command>\r` and wait for the response.
    ///
    /// Fails with [`Error::ResourceExhausted`] if the transmit buffer cannot
    /// take the whole request.
    pub fn send_request(&mut self, command: &[u8]) -> Result<()> {
        let needed = command.len() + 3;
        if self
            .port
            .tx_free()?
            < needed
        {
            return Err(Error::ResourceExhausted(format!(
                "no room for AT{} ({needed} bytes)",
                String::from_utf8_lossy(command)
            )));
        }
        debug!("Sending AT{}", String::from_utf8_lossy(command));
        for part in [b"AT".as_slice(), command, b"\r".as_slice()] {
            self.port
                .write(part)?;
        }
        self.enter_mode(Mode::WaitResponse);
        Ok(())
    }

    /// Collect the response to the last request.
    ///
    /// New bytes are stored from `buf[*cursor]` on and `cursor` advances with
    /// them, so the call can be repeated with the same buffer until it
    /// returns `Ok(Some(len))`. The terminating CR is not stored. `Ok(None)`
    /// means the line is not complete yet.
    pub fn read_response(&mut self, buf: &mut [u8], cursor: &mut usize) -> Result<Option<usize>> {
        if !matches!(self.mode, Mode::WaitIdle | Mode::WaitResponse) {
            return Err(Error::InvalidState(format!(
                "not waiting for a response (mode {:?})",
                self.mode
            )));
        }

        let result = loop {
            if *cursor >= buf.len() {
                return Err(Error::InsufficientSpace);
            }
            match self
                .port
                .read_byte()?
            {
                Some(b'\r') => break Ok(Some(*cursor)),
                Some(byte) => {
                    buf[*cursor] = byte;
                    *cursor += 1;
                },
                None => {
                    let now = self
                        .port
                        .millis();
                    if self.waited(now, RESPONSE_TIMEOUT_MS) {
                        break Err(Error::Timeout("no response to AT request".into()));
                    }
                    return Ok(None);
                },
            }
        };

        let done = self.mode;
        self.mode = match done {
            Mode::WaitIdle => Mode::Idle,
            _ => Mode::Command,
        };
        debug!(
            "{} waiting for response, now in {:?} mode",
            if result.is_ok() { "Success" } else { "Timeout" },
            self.mode
        );
        if let Ok(Some(len)) = result {
            trace!("Response {:?}", String::from_utf8_lossy(&buf[..len]));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPort;

    fn enter_command_mode(target: &mut Target<MockPort>) {
        target
            .atmode_enter()
            .unwrap();
        target
            .port_mut()
            .advance(1200);
        assert_eq!(target.atmode_tick().unwrap(), Mode::PostEscape);
        assert_eq!(target.port_mut().take_tx(), b"+++");
        target
            .port_mut()
            .push_rx(b"OK\r");
        assert_eq!(target.atmode_tick().unwrap(), Mode::Command);
    }

    #[test]
    fn test_escape_waits_for_guard_time() {
        let mut target = Target::new(MockPort::new());
        target
            .atmode_enter()
            .unwrap();
        assert_eq!(target.mode(), Mode::PreEscape);

        target
            .port_mut()
            .advance(1199);
        assert_eq!(target.atmode_tick().unwrap(), Mode::PreEscape);
        assert!(target.port().tx.is_empty());

        target
            .port_mut()
            .advance(1);
        assert_eq!(target.atmode_tick().unwrap(), Mode::PostEscape);
        assert_eq!(target.port().tx, b"+++");
    }

    #[test]
    fn test_escape_flushes_stale_input() {
        let mut target = Target::new(MockPort::new());
        target
            .atmode_enter()
            .unwrap();
        target
            .port_mut()
            .push_rx(b"junk");
        target
            .port_mut()
            .advance(1200);
        target
            .atmode_tick()
            .unwrap();
        assert!(target.port().rx.is_empty());
    }

    #[test]
    fn test_enter_is_idempotent() {
        let mut target = Target::new(MockPort::new());
        target
            .atmode_enter()
            .unwrap();
        target
            .port_mut()
            .advance(600);
        target
            .atmode_enter()
            .unwrap();
        // the guard timer is not restarted
        target
            .port_mut()
            .advance(600);
        assert_eq!(target.atmode_tick().unwrap(), Mode::PostEscape);
    }

    #[test]
    fn test_enter_command_mode() {
        let mut target = Target::new(MockPort::new());
        enter_command_mode(&mut target);
    }

    #[test]
    fn test_wrong_escape_reply_goes_idle() {
        let mut target = Target::new(MockPort::new());
        target
            .atmode_enter()
            .unwrap();
        target
            .port_mut()
            .advance(1200);
        target
            .atmode_tick()
            .unwrap();
        target
            .port_mut()
            .push_rx(b"ERR");
        assert_eq!(target.atmode_tick().unwrap(), Mode::Idle);
    }

    #[test]
    fn test_silent_module_goes_idle() {
        let mut target = Target::new(MockPort::new());
        target
            .atmode_enter()
            .unwrap();
        target
            .port_mut()
            .advance(1200);
        target
            .atmode_tick()
            .unwrap();
        target
            .port_mut()
            .push_rx(b"OK");
        target
            .port_mut()
            .advance(1199);
        assert_eq!(target.atmode_tick().unwrap(), Mode::PostEscape);
        target
            .port_mut()
            .advance(1);
        assert_eq!(target.atmode_tick().unwrap(), Mode::Idle);
    }

    #[test]
    fn test_custom_escape_char() {
        let config = AtModeConfig {
            guard_time_ms: 100,
            idle_timeout: 10,
            escape_char: b'*',
        };
        let mut target = Target::with_config(MockPort::new(), config);
        target
            .atmode_enter()
            .unwrap();
        target
            .port_mut()
            .advance(300);
        target
            .atmode_tick()
            .unwrap();
        assert_eq!(target.port().tx, b"***");
    }

    #[test]
    fn test_command_mode_times_out() {
        let mut target = Target::new(MockPort::new());
        enter_command_mode(&mut target);
        target
            .port_mut()
            .advance(9999);
        assert_eq!(target.atmode_tick().unwrap(), Mode::Command);
        target
            .port_mut()
            .advance(1);
        assert_eq!(target.atmode_tick().unwrap(), Mode::Idle);
    }

    #[test]
    fn test_request_and_response() {
        let mut target = Target::new(MockPort::new());
        enter_command_mode(&mut target);

        target
            .send_request(b"VR")
            .unwrap();
        assert_eq!(target.port_mut().take_tx(), b"ATVR\r");
        assert_eq!(target.mode(), Mode::WaitResponse);

        let mut buf = [0u8; 16];
        let mut cursor = 0;
        target
            .port_mut()
            .push_rx(b"10");
        assert_eq!(target.read_response(&mut buf, &mut cursor).unwrap(), None);
        assert_eq!(cursor, 2);

        target
            .port_mut()
            .push_rx(b"E8\r");
        assert_eq!(target.read_response(&mut buf, &mut cursor).unwrap(), Some(4));
        assert_eq!(&buf[..4], b"10E8");
        assert_eq!(target.mode(), Mode::Command);
    }

    #[test]
    fn test_response_buffer_too_small() {
        let mut target = Target::new(MockPort::new());
        enter_command_mode(&mut target);
        target
            .send_request(b"SL")
            .unwrap();
        target
            .port_mut()
            .push_rx(b"ABCDEFGH\r");

        let mut buf = [0u8; 4];
        let mut cursor = 0;
        assert!(matches!(
            target.read_response(&mut buf, &mut cursor),
            Err(Error::InsufficientSpace)
        ));
    }

    #[test]
    fn test_response_timeout() {
        let mut target = Target::new(MockPort::new());
        enter_command_mode(&mut target);
        target
            .send_request(b"HV")
            .unwrap();

        let mut buf = [0u8; 8];
        let mut cursor = 0;
        target
            .port_mut()
            .advance(1999);
        assert_eq!(target.read_response(&mut buf, &mut cursor).unwrap(), None);
        target
            .port_mut()
            .advance(1);
        assert!(matches!(
            target.read_response(&mut buf, &mut cursor),
            Err(Error::Timeout(_))
        ));
        assert_eq!(target.mode(), Mode::Command);
    }

    #[test]
    fn test_read_response_without_request() {
        let mut target = Target::new(MockPort::new());
        let mut buf = [0u8; 8];
        let mut cursor = 0;
        assert!(matches!(
            target.read_response(&mut buf, &mut cursor),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_send_request_without_room() {
        let mut target = Target::new(MockPort::new());
        enter_command_mode(&mut target);
        target
            .port_mut()
            .tx_capacity = 4;
        assert!(matches!(
            target.send_request(b"VR"),
            Err(Error::ResourceExhausted(_))
        ));
        assert!(target.port().tx.is_empty());
    }

    #[test]
    fn test_exit_rules() {
        let mut target = Target::new(MockPort::new());

        target
            .atmode_enter()
            .unwrap();
        target
            .atmode_exit()
            .unwrap();
        assert_eq!(target.mode(), Mode::Idle);

        enter_command_mode(&mut target);
        target
            .send_request(b"VR")
            .unwrap();
        assert!(matches!(target.atmode_exit(), Err(Error::Busy)));

        target
            .port_mut()
            .push_rx(b"1\r");
        let mut buf = [0u8; 8];
        let mut cursor = 0;
        target
            .read_response(&mut buf, &mut cursor)
            .unwrap();
        target
            .port_mut()
            .take_tx();

        target
            .atmode_exit()
            .unwrap();
        assert_eq!(target.port().tx, b"ATCN\r");
        assert_eq!(target.mode(), Mode::WaitIdle);

        target
            .port_mut()
            .advance(2000);
        assert_eq!(target.atmode_tick().unwrap(), Mode::Idle);
    }

    #[test]
    fn test_enter_across_counter_wrap() {
        let mut target = Target::new(MockPort::at(u32::MAX - 500));
        target
            .atmode_enter()
            .unwrap();
        target
            .port_mut()
            .advance(1199);
        assert_eq!(target.atmode_tick().unwrap(), Mode::PreEscape);
        target
            .port_mut()
            .advance(1);
        assert_eq!(target.atmode_tick().unwrap(), Mode::PostEscape);
    }
}
