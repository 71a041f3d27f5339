//! Serial port discovery and classification.
//!
//! XBee modules are usually reached through the USB-UART bridge of a carrier
//! board (Digi XBIB/XBee-USB boards, SparkFun Explorer and similar). The
//! bridge chip is identified from the USB VID/PID; Digi boards are recognised
//! by their manufacturer string since they reuse FTDI/Silicon Labs IDs.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// USB-UART bridge behind a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceKind {
    /// Digi development board.
    Digi,
    /// FTDI FT232R/FT231X (XBee Explorer, XBIB-U).
    Ftdi,
    /// Silicon Labs CP210x.
    Cp210x,
    /// CH340/CH341 on low-cost adapters.
    Ch340,
    /// Anything else.
    Unknown,
}

/// Known VID/PID pairs; an empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0403,
        &[0x6001, 0x6010, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x10C4, &[0xEA60, 0xEA70], DeviceKind::Cp210x),
    (0x1A86, &[0x7523, 0x5523], DeviceKind::Ch340),
];

impl DeviceKind {
    /// Classify a USB device by VID/PID.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Classify a USB device, letting a Digi manufacturer string win.
    #[must_use]
    pub fn classify(vid: u16, pid: u16, manufacturer: Option<&str>) -> Self {
        if manufacturer.is_some_and(|m| m.to_ascii_lowercase().contains("digi")) {
            return Self::Digi;
        }
        Self::from_vid_pid(vid, pid)
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Digi => "Digi",
            Self::Ftdi => "FTDI",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Auto-selection rank, lower is better.
    fn rank(self) -> u8 {
        match self {
            Self::Digi => 0,
            Self::Ftdi => 1,
            Self::Cp210x => 2,
            Self::Ch340 => 3,
            Self::Unknown => 4,
        }
    }
}

/// A serial port found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port path (e.g. "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Bridge classification.
    pub device: DeviceKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Port without USB metadata.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// One-line description for listings.
    pub fn describe(&self) -> String {
        let device_info = if self.device.is_known() {
            format!(" [{}]", self.device.name())
        } else if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };
        let product_info = self
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();
        format!("{}{device_info}{product_info}", self.name)
    }
}

/// Enumerate serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let mut detected = DetectedPort::plain(info.port_name);
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                detected.device =
                    DeviceKind::classify(usb.vid, usb.pid, usb.manufacturer.as_deref());
                trace!(
                    "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                    detected.name, usb.vid, usb.pid, detected.device
                );
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
            }
            detected
        })
        .collect()
}

/// Enumerate serial ports (no transport compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate from `ports`: recognised bridges first (Digi,
/// FTDI, CP210x, CH340), then the first port listed.
pub fn select_port(ports: &[DetectedPort]) -> Result<DetectedPort> {
    ports
        .iter()
        .enumerate()
        .min_by_key(|(i, p)| (p.device.rank(), *i))
        .map(|(_, p)| p.clone())
        .ok_or(Error::DeviceNotFound)
}

/// Auto-detect the port an XBee is most likely attached to.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(&detect_ports())?;
    if port.device.is_known() {
        info!("Auto-detected {} USB-UART bridge: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port)
}

/// Auto-detect the port an XBee is most likely attached to.
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}
