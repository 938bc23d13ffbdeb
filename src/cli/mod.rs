//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for the `uniflash` binary and
//! are likely not of much use otherwise. The surface keeps compatibility
//! with the legacy single-dash spelling (`-read`, `-cwrite`, `-port COM3`),
//! which is rewritten to the modern form before parsing.

use std::fs;
use std::path::PathBuf;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use miette::{Context, IntoDiagnostic};

use crate::error::Error;
use crate::flasher::{
    CancelToken, Flasher, FlasherEvents, FlasherState, FlashOpts, LogLevel, SECTOR_SIZE,
};
use crate::targets::ChipFamily;
use crate::transport::{available_ports, SerialTransport};

/// BK7231T/U application image offset; QIO release images carry the
/// bootloader below it.
const BK_APP_OFFSET: u32 = 0x11000;

#[derive(Debug, Parser)]
#[command(name = "uniflash", version, about, max_term_width = 100)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to the target device
    #[arg(short = 'p', long, global = true)]
    pub port: Option<String>,
    /// Baud rate to negotiate after sync
    #[arg(short = 'b', long, global = true, default_value_t = 921_600)]
    pub baud: u32,
    /// Chip family of the target device
    #[arg(long, global = true)]
    pub chip: Option<String>,
    /// Continue despite a non-standard BK encryption key
    #[arg(long, global = true)]
    pub skip_key_check: bool,
    /// Keep a BK read whose post-read CRC does not match
    #[arg(long, global = true)]
    pub ignore_crc_err: bool,
    /// Permit BK7231T/U writes below the bootloader boundary
    #[arg(long, global = true)]
    pub overwrite_bootloader: bool,
    /// Continue on a BK flash missing from the registry
    #[arg(long, global = true)]
    pub skip_unprotect: bool,
    /// Multiplier applied to every per-command timeout
    #[arg(long, global = true, default_value_t = 1.0)]
    pub timeout_multiplier: f32,
}

#[derive(Debug, Args)]
pub struct RangeArgs {
    /// Flash offset, decimal or 0xHEX
    #[arg(long = "addr", value_parser = parse_number)]
    pub addr: Option<u32>,
    /// Amount of bytes, decimal or 0xHEX
    #[arg(long = "size", value_parser = parse_number)]
    pub size: Option<u32>,
    /// Output file name
    #[arg(long = "out")]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Read the whole flash into a backup file
    Fread {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Write a firmware file to the whole flash
    Fwrite {
        /// Firmware file
        file: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Read a flash range
    #[command(name = "read_flash")]
    ReadFlash {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Write a file to a flash range
    #[command(name = "write_flash")]
    WriteFlash {
        /// Firmware file
        file: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Write, read back and verify a generated pattern
    Test {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// List serial ports on this host
    Ports,
}

/// Rewrite the legacy single-dash aliases into the modern spelling
pub fn normalize_legacy_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            match arg.as_str() {
                "-read" => "fread",
                "-write" => "fwrite",
                "-cread" => "read_flash",
                "-cwrite" => "write_flash",
                "-test" => "test",
                "-port" => "--port",
                "-baud" => "--baud",
                "-chip" => "--chip",
                "-ofs" => "--addr",
                "-len" => "--size",
                "-out" => "--out",
                "-help" | "/?" => "--help",
                _ => return arg,
            }
            .to_string()
        })
        .collect()
}

/// Parse `123` or `0x1F000`
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("'{s}' is not a number"))
}

/// Backup name: `readResult_{Chip}_{QIO|UA}_{yyyy-dd-M-HH-mm-ss}.bin`
///
/// QIO marks a read from offset 0 (bootloader included), UA one from the
/// application offset.
pub fn backup_file_name(family: ChipFamily, start_addr: u32) -> String {
    let flavor = if start_addr == BK_APP_OFFSET { "UA" } else { "QIO" };
    let stamp = Local::now().format("%Y-%d-%-m-%H-%M-%S");
    format!("readResult_{family}_{flavor}_{stamp}.bin")
}

/// The BK7231T/U QIO policy: release images whose name carries `_QIO_`
/// include a bootloader the engine must not rewrite, so the write starts at
/// the application offset instead.
pub fn apply_bk_qio_policy<'d>(
    family: ChipFamily,
    file_name: &str,
    data: &'d [u8],
    overwrite_bootloader: bool,
) -> Result<(u32, &'d [u8]), Error> {
    if family.protected_bootloader_end().is_none() || overwrite_bootloader {
        return Ok((0, data));
    }

    if file_name.contains("_QIO_") {
        if data.len() <= BK_APP_OFFSET as usize {
            return Err(Error::InvalidInput(
                "QIO image is smaller than the bootloader region".into(),
            ));
        }
        info!(
            "QIO image: skipping the first {BK_APP_OFFSET:#x} bootloader bytes"
        );
        return Ok((BK_APP_OFFSET, &data[BK_APP_OFFSET as usize..]));
    }

    // A full write at 0 without the marker would clobber the bootloader;
    // the driver rejects it before transmitting.
    Ok((0, data))
}

/// Progress / log sink rendering through `log` and an indicatif bar
#[derive(Default)]
pub struct CliReporter {
    bar: Option<ProgressBar>,
}

impl FlasherEvents for CliReporter {
    fn log(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Error => log::error!("{message}"),
            LogLevel::Success => info!("{message}"),
        }
    }

    fn state_changed(&mut self, state: FlasherState) {
        debug!("State: {state}");
    }

    fn progress_init(&mut self, addr: u32, total: usize) {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("[{bar:40}] {pos:>5}/{len:5} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(format!("@ {addr:#x}"));
        self.bar = Some(bar);
    }

    fn progress_update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn progress_finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn resolve_family(connect: &ConnectArgs) -> miette::Result<ChipFamily> {
    let name = connect
        .chip
        .as_deref()
        .ok_or_else(|| Error::InvalidInput("--chip is required for this command".into()))?;
    let family = name
        .parse::<ChipFamily>()
        .map_err(|_| Error::UnrecognizedChipName(name.to_string()))?;
    Ok(family)
}

fn resolve_port(connect: &ConnectArgs) -> miette::Result<String> {
    if let Some(port) = &connect.port {
        return Ok(port.clone());
    }
    let ports = available_ports()?;
    let port = ports[0].clone();
    info!("No port given, using {port}");
    Ok(port)
}

fn make_flasher(connect: &ConnectArgs) -> miette::Result<Box<dyn Flasher>> {
    let family = resolve_family(connect)?;
    let port = resolve_port(connect)?;
    let transport = SerialTransport::new(port, 115_200);

    let opts = FlashOpts {
        skip_key_check: connect.skip_key_check,
        ignore_crc_err: connect.ignore_crc_err,
        overwrite_bootloader: connect.overwrite_bootloader,
        skip_unprotect: connect.skip_unprotect,
        read_timeout_multiplier: connect.timeout_multiplier,
        baud: connect.baud,
    };

    Ok(family.flasher(
        Box::new(transport),
        opts,
        Box::<CliReporter>::default(),
        CancelToken::new(),
    ))
}

fn save_read_result(
    flasher: &dyn Flasher,
    out: Option<PathBuf>,
    start_addr: u32,
) -> miette::Result<()> {
    let data = flasher
        .read_result()
        .ok_or_else(|| Error::InvalidInput("the read produced no data".into()))?;
    let path = out.unwrap_or_else(|| backup_file_name(flasher.family(), start_addr).into());
    fs::write(&path, data)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
    info!("Saved {} bytes to {}", data.len(), path.display());
    Ok(())
}

/// The write/read/verify pattern: a byte ramp seeded with the offset
fn test_pattern(offset: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((offset as usize + i) & 0xFF) as u8)
        .collect()
}

pub fn run(cli: Cli) -> miette::Result<()> {
    match cli.command {
        Command::Ports => {
            for port in available_ports()? {
                println!("{port}");
            }
            Ok(())
        }

        Command::Fread { range } => {
            let mut flasher = make_flasher(&cli.connect)?;
            flasher.do_read(0, 0, true)?;
            save_read_result(flasher.as_ref(), range.out, 0)?;
            flasher.close();
            Ok(())
        }

        Command::Fwrite { file, range } => {
            let data = fs::read(&file)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut flasher = make_flasher(&cli.connect)?;
            let (offset, body) = apply_bk_qio_policy(
                flasher.family(),
                &file_name,
                &data,
                cli.connect.overwrite_bootloader,
            )?;
            let offset = range.addr.unwrap_or(offset);
            flasher.do_write(offset, body)?;
            flasher.close();
            Ok(())
        }

        Command::ReadFlash { range } => {
            let addr = range.addr.unwrap_or(0);
            let size = range
                .size
                .ok_or_else(|| Error::InvalidInput("--size is required".into()))?;
            let start_sector = addr / SECTOR_SIZE as u32;
            let sectors = size.div_ceil(SECTOR_SIZE as u32);

            let mut flasher = make_flasher(&cli.connect)?;
            flasher.do_read(start_sector, sectors, false)?;
            save_read_result(flasher.as_ref(), range.out, addr)?;
            flasher.close();
            Ok(())
        }

        Command::WriteFlash { file, range } => {
            let data = fs::read(&file)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
            let addr = range.addr.unwrap_or(0);

            let mut flasher = make_flasher(&cli.connect)?;
            flasher.do_write(addr, &data)?;
            flasher.close();
            Ok(())
        }

        Command::Test { range } => {
            let addr = range.addr.unwrap_or(0x100000);
            let size = range.size.unwrap_or(SECTOR_SIZE as u32) as usize;
            let pattern = test_pattern(addr, size);

            // One driver per operation; the transport is reopened between
            // the write and the read-back.
            let mut writer = make_flasher(&cli.connect)?;
            writer.do_write(addr, &pattern)?;
            writer.close();

            let mut reader = make_flasher(&cli.connect)?;
            reader.do_read(
                addr / SECTOR_SIZE as u32,
                (size as u32).div_ceil(SECTOR_SIZE as u32),
                false,
            )?;
            let read_back = reader
                .read_result()
                .ok_or_else(|| Error::InvalidInput("the read-back produced no data".into()))?;

            if read_back.get(..size) != Some(&pattern[..]) {
                reader.close();
                return Err(Error::Verification(
                    crate::error::VerificationError::PatternMismatch,
                )
                .into());
            }
            reader.close();
            info!("Test pattern verified at {addr:#x}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::targets::Packaging;

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("uniflash".to_string())
            .chain(args.iter().map(|s| s.to_string()));
        Cli::parse_from(normalize_legacy_args(argv))
    }

    #[test]
    fn modern_spelling_parses() {
        let cli = parse(&[
            "read_flash",
            "--chip",
            "BK7231N",
            "--port",
            "COM3",
            "--addr",
            "0x1000",
            "--size",
            "4096",
        ]);
        match cli.command {
            Command::ReadFlash { range } => {
                assert_eq!(range.addr, Some(0x1000));
                assert_eq!(range.size, Some(4096));
            }
            other => panic!("wrong command {other:?}"),
        }
        assert_eq!(cli.connect.chip.as_deref(), Some("BK7231N"));
        assert_eq!(cli.connect.baud, 921_600);
    }

    #[test]
    fn legacy_aliases_are_rewritten() {
        let cli = parse(&[
            "-cwrite",
            "fw.bin",
            "-chip",
            "ESP32",
            "-port",
            "/dev/ttyUSB0",
            "-ofs",
            "0x10000",
            "-baud",
            "460800",
        ]);
        match cli.command {
            Command::WriteFlash { file, range } => {
                assert_eq!(file.to_str(), Some("fw.bin"));
                assert_eq!(range.addr, Some(0x10000));
            }
            other => panic!("wrong command {other:?}"),
        }
        assert_eq!(cli.connect.baud, 460_800);
    }

    #[test]
    fn number_parser_accepts_hex_and_decimal() {
        assert_eq!(parse_number("4096").unwrap(), 4096);
        assert_eq!(parse_number("0x11000").unwrap(), 0x11000);
        assert!(parse_number("garbage").is_err());
    }

    #[test]
    fn backup_names_carry_chip_and_flavor() {
        let qio = backup_file_name(ChipFamily::BK7231N, 0);
        assert!(qio.starts_with("readResult_BK7231N_QIO_"));
        assert!(qio.ends_with(".bin"));

        let ua = backup_file_name(ChipFamily::BK7231T, BK_APP_OFFSET);
        assert!(ua.starts_with("readResult_BK7231T_UA_"));
    }

    #[test]
    fn qio_images_skip_the_bootloader_on_tu() {
        let data = vec![0xABu8; 0x20000];
        let (offset, body) = apply_bk_qio_policy(
            ChipFamily::BK7231T,
            "OpenBK7231T_QIO_1.17.gz.bin",
            &data,
            false,
        )
        .unwrap();
        assert_eq!(offset, BK_APP_OFFSET);
        assert_eq!(body.len(), data.len() - BK_APP_OFFSET as usize);

        // Without the marker the data is left alone; the driver enforces
        // the protection.
        let (offset, body) =
            apply_bk_qio_policy(ChipFamily::BK7231T, "backup.bin", &data, false).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(body.len(), data.len());

        // Non-T/U families never carve
        let (offset, _) = apply_bk_qio_policy(
            ChipFamily::BK7231N,
            "OpenBK7231N_QIO_1.17.bin",
            &data,
            false,
        )
        .unwrap();
        assert_eq!(offset, 0);
    }

    #[test]
    fn firmware_prefix_matches_release_assets() {
        // The prefix helper drives release matching in the outer app; keep
        // it consistent with the packaging flavour.
        for family in [ChipFamily::BK7231T, ChipFamily::BK7231N, ChipFamily::W600] {
            let prefix = family.firmware_prefix();
            match family.packaging() {
                Packaging::Qio => assert!(prefix.ends_with("_QIO_")),
                Packaging::Ua => assert!(prefix.ends_with("_UA_")),
                Packaging::Plain => assert!(prefix.ends_with('_')),
            }
        }
    }

    #[test]
    fn test_pattern_is_offset_seeded() {
        let pattern = test_pattern(0x100, 512);
        assert_eq!(pattern[0], 0x00);
        assert_eq!(pattern[1], 0x01);
        assert_eq!(pattern[255], 0xFF);
        assert_eq!(test_pattern(0x101, 4)[0], 0x01);
    }
}
