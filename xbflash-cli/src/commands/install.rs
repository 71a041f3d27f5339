//! Install command implementation.

use {
    crate::{Cli, CliError, config::Config, get_port, use_fancy_output, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::{debug, info},
    std::{path::Path, thread, time::Duration},
    xbflash::{
        BufferSource, ImageKind, InstallKind, NativePort, SerialConfig, Status, Target,
        TransferSession,
    },
};

/// Delay between session ticks.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Baud rate the port is first opened at; sessions switch rates themselves.
const INITIAL_BAUD: u32 = 115_200;

/// Pick the install procedure: explicit choice, else the image format.
pub(crate) fn resolve_kind(
    firmware: &Path,
    bytes: &[u8],
    kind: Option<InstallKind>,
) -> Result<InstallKind> {
    if let Some(kind) = kind {
        return Ok(kind);
    }
    ImageKind::detect(Some(firmware), bytes)
        .map(InstallKind::from)
        .ok_or_else(|| {
            CliError::Usage(format!(
                "Cannot tell whether {} is an .ebl or .oem image; pass --kind",
                firmware.display()
            ))
            .into()
        })
}

fn spinner(cli: &Cli) -> ProgressBar {
    if cli.quiet || cli.non_interactive || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Install command implementation.
pub(crate) fn cmd_install(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    kind: Option<InstallKind>,
    force: bool,
) -> Result<()> {
    let image = BufferSource::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let kind = resolve_kind(firmware, image.as_bytes(), kind)?;
    let atmode = config.atmode_config()?;

    let port_name = get_port(cli, config)?;
    let serial = SerialConfig::new(&port_name, INITIAL_BAUD)
        .with_reset_line(config.connection.reset_line.unwrap_or_default());
    let port =
        NativePort::open(&serial).with_context(|| format!("Failed to open port {port_name}"))?;

    if !cli.quiet {
        eprintln!(
            "{} Installing {} ({kind}) on {}{}",
            style("⚡").cyan(),
            style(firmware.display()).bold(),
            style(&port_name).cyan(),
            if force { " [forced]" } else { "" }
        );
    }

    let mut session =
        TransferSession::new(Target::with_config(port, atmode), image, kind).with_force(force);
    let pb = spinner(cli);
    let mut last_token = None;

    loop {
        if was_interrupted() {
            pb.abandon_with_message("Interrupted");
            drop(session);
            return Err(CliError::Cancelled("Install interrupted by user".into()).into());
        }

        let result = session.tick();

        let token = session.progress_token();
        if last_token != Some(token) {
            last_token = Some(token);
            let message = session.status();
            debug!("{message}");
            pb.set_message(message);
        }

        match result {
            Ok(Status::Complete) => break,
            Ok(Status::Pending) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                pb.abandon_with_message(session.status());
                return Err(e).with_context(|| format!("Install of {} failed", firmware.display()));
            },
        }
    }

    pb.finish_with_message(session.status());
    info!("{}", session.status());
    if !cli.quiet {
        eprintln!("{} Install complete", style("✓").green().bold());
    }
    Ok(())
}
