//! Handle for the attached radio module.
//!
//! A [`Target`] owns the serial [`Port`] the module hangs off and tracks which
//! mode the driver believes the module is in. AT command mode handling lives
//! in [`atmode`].

pub mod atmode;

use crate::{error::Result, port::Port};

pub use atmode::{AtModeConfig, Mode};

/// An attached radio module and the port used to reach it.
#[derive(Debug)]
pub struct Target<P: Port> {
    port: P,
    config: AtModeConfig,
    mode: Mode,
    /// Timestamp of the last mode transition or request.
    mode_timer: u32,
}

impl<P: Port> Target<P> {
    /// Wrap a port with default AT command mode parameters.
    pub fn new(port: P) -> Self {
        Self::with_config(port, AtModeConfig::default())
    }

    /// Wrap a port with explicit AT command mode parameters.
    pub fn with_config(port: P, config: AtModeConfig) -> Self {
        let mode_timer = port.millis();
        Self {
            port,
            config,
            mode: Mode::Unknown,
            mode_timer,
        }
    }

    /// Borrow the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutably borrow the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// AT command mode parameters.
    pub fn config(&self) -> &AtModeConfig {
        &self.config
    }

    /// Mode the driver last recorded, without advancing any timers.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Pulse the module's reset line. The module comes back in an unknown
    /// mode, so any command mode state is forgotten.
    pub fn reset_module(&mut self) -> Result<()> {
        self.port
            .pulse_reset()?;
        self.mode = Mode::Unknown;
        self.mode_timer = self
            .port
            .millis();
        Ok(())
    }
}
