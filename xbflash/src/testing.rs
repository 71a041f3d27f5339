//! Scripted in-memory port for unit tests.

use std::collections::VecDeque;

use crate::{
    error::{Error, Result},
    port::{Port, Stream},
};

/// Route `log` output through the test harness (`RUST_LOG=debug` to see it).
pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mock port with separate receive/transmit buffers and a manual clock.
///
/// Tests push the bytes the "device" would send into `rx`, inspect what the
/// engine wrote in `tx`, and move time forward with [`MockPort::advance`].
#[derive(Debug)]
pub(crate) struct MockPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub now: u32,
    pub baud: u32,
    pub opens: Vec<u32>,
    pub fail_bauds: Vec<u32>,
    pub break_on: bool,
    pub breaks: usize,
    pub rts: bool,
    pub flow: bool,
    pub reset_asserted: bool,
    pub reset_pulses: usize,
    pub tx_capacity: usize,
    /// Maximum bytes accepted per `write` call; `None` is unlimited.
    pub write_chunk: Option<usize>,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            tx: Vec::new(),
            now: 0,
            baud: 0,
            opens: Vec::new(),
            fail_bauds: Vec::new(),
            break_on: false,
            breaks: 0,
            rts: false,
            flow: false,
            reset_asserted: false,
            reset_pulses: 0,
            tx_capacity: 4096,
            write_chunk: None,
        }
    }

    /// Start the clock at an arbitrary value (e.g. just below the wrap).
    pub fn at(now: u32) -> Self {
        Self {
            now,
            ..Self::new()
        }
    }

    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx
            .extend(bytes.iter().copied());
    }

    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    pub fn advance(&mut self, ms: u32) {
        self.now = self
            .now
            .wrapping_add(ms);
    }
}

impl Stream for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf
            .len()
            .min(self.rx.len());
        for (slot, byte) in buf
            .iter_mut()
            .zip(self.rx.drain(..n))
        {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self
            .write_chunk
            .map_or(buf.len(), |limit| limit.min(buf.len()));
        self.tx
            .extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&mut self, baud_rate: u32) -> Result<()> {
        self.opens
            .push(baud_rate);
        if self
            .fail_bauds
            .contains(&baud_rate)
        {
            return Err(Error::Io(std::io::Error::other(format!(
                "cannot open at {baud_rate}"
            ))));
        }
        self.baud = baud_rate;
        self.break_on = false;
        self.flow = false;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_flow_control(&mut self, enabled: bool) -> Result<()> {
        self.flow = enabled;
        Ok(())
    }

    fn set_break(&mut self, enabled: bool) -> Result<()> {
        if enabled && !self.break_on {
            self.breaks += 1;
        }
        self.break_on = enabled;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.rts = level;
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<()> {
        if self.reset_asserted && !asserted {
            self.reset_pulses += 1;
        }
        self.reset_asserted = asserted;
        Ok(())
    }

    fn flush_rx(&mut self) -> Result<()> {
        self.rx
            .clear();
        Ok(())
    }

    fn rx_available(&mut self) -> Result<usize> {
        Ok(self
            .rx
            .len())
    }

    fn tx_free(&mut self) -> Result<usize> {
        Ok(self.tx_capacity)
    }

    fn millis(&self) -> u32 {
        self.now
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
