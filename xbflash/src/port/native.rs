//! Native serial port implementation using the `serialport` crate.
//!
//! Reads never block: only the bytes the driver reports as buffered are
//! requested. The millisecond counter is derived from an [`Instant`] captured
//! when the port object is created, truncated to `u32` so it wraps like a
//! microcontroller tick counter.

use {
    crate::{
        error::{Error, Result},
        port::{Port, ResetLine, SerialConfig, Stream},
    },
    log::{debug, trace, warn},
    serialport::{ClearBuffer, FlowControl},
    std::{
        io::{ErrorKind, Read, Write},
        time::{Duration, Instant},
    },
};

/// Nominal transmit buffer size used to report free space.
const TX_BUFFER_SIZE: usize = 4096;

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
    reset_line: ResetLine,
    reset_asserted: bool,
    epoch: Instant,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let mut port = Self {
            port: None,
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
            reset_line: config.reset_line,
            reset_asserted: false,
            epoch: Instant::now(),
        };
        Port::open(&mut port, config.baud_rate)?;
        Ok(port)
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig::new(port_name, baud_rate);
        Self::open(&config)
    }

    fn inner(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("port {} is closed", self.name)))
    }
}

impl Stream for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let p = self.inner()?;
        let available = p.bytes_to_read()? as usize;
        if available == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = available.min(buf.len());
        match p.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let p = self.inner()?;
        match p.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, baud_rate: u32) -> Result<()> {
        debug!("Opening {} at {baud_rate} baud", self.name);
        // Release the old handle first; some drivers refuse a second open.
        self.port
            .take();
        let port = serialport::new(&self.name, baud_rate)
            .timeout(self.timeout)
            .flow_control(FlowControl::None)
            .open()?;
        self.port = Some(port);
        self.baud_rate = baud_rate;
        let asserted = self.reset_asserted;
        self.set_reset(asserted)
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_flow_control(&mut self, enabled: bool) -> Result<()> {
        trace!("Setting flow control to {enabled}");
        let mode = if enabled {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };
        self.inner()?
            .set_flow_control(mode)?;
        Ok(())
    }

    fn set_break(&mut self, enabled: bool) -> Result<()> {
        trace!("Setting break to {enabled}");
        let p = self.inner()?;
        if enabled {
            p.set_break()?;
        } else {
            p.clear_break()?;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        self.inner()?
            .write_request_to_send(level)?;
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<()> {
        self.reset_asserted = asserted;
        match self.reset_line {
            ResetLine::Dtr => {
                trace!("Setting reset (DTR) to {asserted}");
                self.inner()?
                    .write_data_terminal_ready(asserted)?;
            },
            ResetLine::None => {
                if asserted {
                    warn!("Reset line not wired, reset the module manually");
                }
            },
        }
        Ok(())
    }

    fn flush_rx(&mut self) -> Result<()> {
        self.inner()?
            .clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn rx_available(&mut self) -> Result<usize> {
        Ok(self
            .inner()?
            .bytes_to_read()? as usize)
    }

    fn tx_free(&mut self) -> Result<usize> {
        let pending = self
            .inner()?
            .bytes_to_write()? as usize;
        Ok(TX_BUFFER_SIZE.saturating_sub(pending))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn millis(&self) -> u32 {
        self.epoch
            .elapsed()
            .as_millis() as u32
    }

    fn close(&mut self) -> Result<()> {
        self.port
            .take();
        Ok(())
    }
}
