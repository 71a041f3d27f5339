//! xbflash CLI - Command-line tool for installing firmware on XBee modules.
//!
//! ## Features
//!
//! - Install `.ebl` (XBee ZB/ZNet, HCS08) and `.oem` (DigiMesh 900, XTend,
//!   XStream) firmware images
//! - Inspect and validate images without hardware
//! - Serial port discovery
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use xbflash::{InstallKind, auto_detect_port, discover_ports};

mod commands;
mod config;

use commands::completions::cmd_completions;
use commands::info::{cmd_info, cmd_list_ports};
use commands::install::cmd_install;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed since startup.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that map to a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing input (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    }
}

/// xbflash - Install firmware on Digi XBee radio modules.
///
/// Environment variables:
///   XBFLASH_PORT              - Default serial port
///   XBFLASH_KIND              - Install procedure (ebl, hcs08, oem)
///   XBFLASH_NON_INTERACTIVE   - Non-interactive mode (no spinner, no guessing)
#[derive(Parser)]
#[command(name = "xbflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "XBFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of guessing).
    #[arg(long, global = true, env = "XBFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Install procedure selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum KindArg {
    /// `.ebl` image over XMODEM (XBee ZB / ZNet 2.5).
    Ebl,
    /// HCS08 application on programmable modules.
    Hcs08,
    /// `.oem` image (DigiMesh 900, XTend, XStream).
    Oem,
}

impl From<KindArg> for InstallKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Ebl => Self::Ebl,
            KindArg::Hcs08 => Self::Hcs08,
            KindArg::Oem => Self::Oem,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Install a firmware image on the attached module.
    Install {
        /// Firmware image (.ebl or .oem).
        firmware: PathBuf,

        /// Install procedure (detected from the image when omitted).
        #[arg(short, long, value_enum, env = "XBFLASH_KIND")]
        kind: Option<KindArg>,

        /// Install even if the module already runs this version.
        #[arg(short, long)]
        force: bool,
    },

    /// Show information about a firmware image.
    Info {
        /// Firmware image (.ebl or .oem).
        firmware: PathBuf,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }

    debug!(
        "xbflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!(
            "{} {err:#}",
            console::style("Error:").red().bold()
        );
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Install {
            firmware,
            kind,
            force,
        } => cmd_install(
            cli,
            &config,
            firmware,
            kind.map(InstallKind::from),
            *force || config.install.force,
        ),
        Commands::Info { firmware, json } => cmd_info(firmware, *json),
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Resolve the serial port: command line or environment, then config, then
/// auto-detection.
///
/// In non-interactive mode auto-detection only succeeds when exactly one port
/// is present.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }
    if let Some(port) = &config.connection.port {
        debug!("Using port {port} from config");
        return Ok(port.clone());
    }

    if cli.non_interactive {
        let ports = discover_ports();
        return match ports.as_slice() {
            [only] => Ok(only.name.clone()),
            [] => Err(CliError::Usage(
                "No serial port found; pass --port or set XBFLASH_PORT".into(),
            )
            .into()),
            _ => Err(CliError::Usage(format!(
                "Found multiple serial ports ({}); pass --port or set XBFLASH_PORT",
                ports
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .into()),
        };
    }

    match auto_detect_port() {
        Ok(port) => Ok(port.name),
        Err(xbflash::Error::DeviceNotFound) => Err(CliError::Usage(
            "No serial port found; pass --port or set XBFLASH_PORT".into(),
        )
        .into()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_install() {
        let cli = Cli::try_parse_from([
            "xbflash",
            "--port",
            "/dev/ttyUSB0",
            "install",
            "XB24-ZB_2370.ebl",
            "--kind",
            "hcs08",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        match cli.command {
            Commands::Install {
                firmware,
                kind,
                force,
            } => {
                assert_eq!(firmware, PathBuf::from("XB24-ZB_2370.ebl"));
                assert_eq!(kind, Some(KindArg::Hcs08));
                assert!(force);
            },
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn test_cli_parse_install_defaults() {
        let cli = Cli::try_parse_from(["xbflash", "install", "xt09.oem"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Install { force: false, .. }
        ));
        assert_eq!(cli.verbose, 0);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_cli_install_requires_firmware() {
        assert!(Cli::try_parse_from(["xbflash", "install"]).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_kind() {
        assert!(Cli::try_parse_from(["xbflash", "install", "fw.bin", "--kind", "zigbee"]).is_err());
    }

    #[test]
    fn test_cli_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["xbflash", "list-ports", "--json", "-vv", "-q"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["xbflash", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
        assert!(Cli::try_parse_from(["xbflash", "completions"]).is_err());
    }

    #[test]
    fn test_kind_arg_conversion() {
        assert_eq!(InstallKind::from(KindArg::Ebl), InstallKind::Ebl);
        assert_eq!(InstallKind::from(KindArg::Hcs08), InstallKind::Hcs08);
        assert_eq!(InstallKind::from(KindArg::Oem), InstallKind::Oem);
    }

    #[test]
    fn test_exit_codes() {
        let usage: anyhow::Error = CliError::Usage("bad".into()).into();
        assert_eq!(exit_code_for(&usage), 2);

        let cancelled: anyhow::Error = CliError::Cancelled("stop".into()).into();
        assert_eq!(exit_code_for(&cancelled), 130);

        let runtime: anyhow::Error = xbflash::Error::Timeout("no prompt".into()).into();
        assert_eq!(exit_code_for(&runtime), 1);

        let wrapped = anyhow::Error::from(CliError::Usage("bad".into())).context("while installing");
        assert_eq!(exit_code_for(&wrapped), 2);
    }

    #[test]
    fn test_get_port_prefers_cli_then_config() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyUSB9".into());

        let cli = Cli::try_parse_from(["xbflash", "-p", "COM4", "list-ports"]).unwrap();
        assert_eq!(get_port(&cli, &config).unwrap(), "COM4");

        let cli = Cli::try_parse_from(["xbflash", "list-ports"]).unwrap();
        if cli.port.is_none() {
            assert_eq!(get_port(&cli, &config).unwrap(), "/dev/ttyUSB9");
        }
    }
}
