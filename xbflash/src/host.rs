//! Host-side serial port discovery.

use crate::device::DetectedPort;

/// All serial ports on the host.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::detect_ports()
}

/// Ports behind a recognised USB-UART bridge.
#[must_use]
pub fn discover_xbee_ports() -> Vec<DetectedPort> {
    discover_ports()
        .into_iter()
        .filter(|p| {
            p.device
                .is_known()
        })
        .collect()
}

/// The single best port candidate.
pub fn auto_detect_port() -> crate::Result<DetectedPort> {
    crate::device::auto_detect_port()
}
