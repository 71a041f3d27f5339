//! Firmware info and port listing command implementations.

use {
    anyhow::{Context, Result, anyhow},
    console::style,
    serde::Serialize,
    std::path::Path,
    xbflash::{
        BlockChain, BufferSource, ImageKind, OemHeader, auto_detect_port, discover_ports,
        image::{ebl_chip, oem},
    },
};

/// Scratch size used to stream an image through the checksum.
const VERIFY_CHUNK: usize = 256;

/// What `info` reports about an image.
#[derive(Debug, Serialize)]
pub(crate) struct ImageInfo {
    pub(crate) format: ImageKind,
    pub(crate) size: usize,
    /// Chip family from an `.ebl` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) chip: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) header: Option<OemHeader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) blocks: Option<BlockChain>,
    pub(crate) valid: bool,
    /// Why validation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) problem: Option<String>,
}

/// Inspect an image in memory. No transport is involved.
pub(crate) fn inspect(path: &Path, image: &mut BufferSource) -> Result<ImageInfo> {
    let format = ImageKind::detect(Some(path), image.as_bytes()).ok_or_else(|| {
        anyhow!(
            "{} is neither an .ebl nor an .oem image",
            path.display()
        )
    })?;

    let mut info = ImageInfo {
        format,
        size: image.len(),
        chip: None,
        header: None,
        version: None,
        blocks: None,
        valid: true,
        problem: None,
    };

    match format {
        ImageKind::Ebl => {
            info.chip = ebl_chip(image.as_bytes());
            if info.chip.is_none() {
                info.valid = false;
                info.problem = Some("no recognised EBL header".into());
            }
        },
        ImageKind::Oem => {
            let header = OemHeader::read_from(image).context("Failed to read OEM header")?;
            info.header = Some(header);
            info.version = Some(header.version_str());

            let mut scratch = [0u8; VERIFY_CHUNK];
            let checked = oem::verify(image, &mut scratch)
                .and_then(|header| oem::count_blocks(image, &header));
            match checked {
                Ok(chain) => info.blocks = Some(chain),
                Err(e) => {
                    info.valid = false;
                    info.problem = Some(e.to_string());
                },
            }
        },
    }

    Ok(info)
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let mut image = BufferSource::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let info = inspect(firmware, &mut image)?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": info,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("Firmware: {}", firmware.display()))
            .bold()
            .underlined()
    );
    eprintln!("  Format:  {}", info.format);
    eprintln!("  Size:    {} bytes", info.size);
    if let Some(chip) = info.chip {
        eprintln!("  Chip:    {chip}");
    }
    if let Some(header) = &info.header {
        eprintln!("  Module:  0x{:02X}", header.module_id);
        eprintln!("  Compat:  0x{:02X}", header.software_id);
        eprintln!("  Version: {}", header.version_str());
        eprintln!("  Length:  {} bytes (header {})", header.image_len, header.header_len);
    }
    if let Some(chain) = &info.blocks {
        eprintln!(
            "  Blocks:  {} transfers, {} payload bytes",
            chain.transfers(),
            chain.payload_bytes
        );
    }
    if info.valid {
        eprintln!("  Valid:   {}", style("yes").green());
    } else {
        eprintln!(
            "  Valid:   {} ({})",
            style("no").red(),
            info.problem.as_deref().unwrap_or("unknown")
        );
    }

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": detected,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        eprintln!("  {} {}", style("•").green(), port.describe());
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}
