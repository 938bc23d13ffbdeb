//! A library and application for flashing BK7231, BL602/702/616, ESP32 and
//! W600/W800 devices over serial
//!
//! ## As an application
//!
//! ```bash
//! $ cargo install uniflash
//! $ uniflash fread --chip BK7231N --port /dev/ttyUSB0
//! ```
//!
//! ## As a library
//!
//! The flasher engine is usable on its own: construct a
//! [transport::SerialTransport] (or any [transport::Transport]
//! implementation), pick a [targets::ChipFamily], and drive the returned
//! [flasher::Flasher]:
//!
//! ```no_run
//! use uniflash::flasher::{CancelToken, FlashOpts, NullEvents};
//! use uniflash::targets::ChipFamily;
//! use uniflash::transport::SerialTransport;
//!
//! let transport = SerialTransport::new("/dev/ttyUSB0", 115_200);
//! let mut flasher = ChipFamily::BK7231N.flasher(
//!     Box::new(transport),
//!     FlashOpts::default(),
//!     Box::new(NullEvents),
//!     CancelToken::new(),
//! );
//! flasher.do_read(0, 256, false)?;
//! let backup = flasher.read_result().unwrap().to_vec();
//! # Ok::<(), uniflash::error::Error>(())
//! ```
//!
//! Every family exposes the same read/write/erase/verify surface; the
//! protocol differences (HCI-style frames, SLIP, XMODEM, `OK`/`FL`/`PD`
//! handshakes) stay inside the drivers.

pub mod bootheader;
pub mod checksum;
pub mod cli;
pub mod connection;
pub mod error;
pub mod flash_chips;
pub mod flasher;
pub mod partition;
pub mod slip;
pub mod stubs;
pub mod targets;
pub mod transport;
pub mod xmodem;

/// Logging utilities
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
