//! The common flasher surface
//!
//! Every family driver exposes the same four operations behind the
//! [Flasher] trait, reports through the same [FlasherEvents] sink and obeys
//! the same cooperative [CancelToken]. The outer application creates one
//! driver per operation via [ChipFamily::flasher] and must not touch the
//! transport while the driver owns it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strum::Display;

use crate::error::Error;
use crate::targets::ChipFamily;
use crate::transport::Transport;

pub mod bk7231;
pub mod bl602;
pub mod esp32;
pub mod wm;

/// Erase unit shared by every supported family
pub const SECTOR_SIZE: usize = 0x1000;
/// The BK 64K erase granularity
pub const BLOCK_SIZE: usize = 0x10000;

/// Severity of a driver log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Driver lifecycle; transitions are linear and `Failed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FlasherState {
    Idle,
    Opening,
    Syncing,
    Identifying,
    Configuring,
    Working,
    Verifying,
    Completed,
    Cancelled,
    Failed,
}

/// Callbacks a driver invokes synchronously during an operation
///
/// Implementations must not block; they run on the engine's own thread.
pub trait FlasherEvents {
    fn log(&mut self, level: LogLevel, message: &str);
    fn state_changed(&mut self, state: FlasherState);
    /// A unit of work with `total` steps is starting at `addr`
    fn progress_init(&mut self, addr: u32, total: usize);
    fn progress_update(&mut self, current: usize);
    fn progress_finish(&mut self);
}

/// Sink that swallows every event
pub struct NullEvents;

impl FlasherEvents for NullEvents {
    fn log(&mut self, _level: LogLevel, _message: &str) {}
    fn state_changed(&mut self, _state: FlasherState) {}
    fn progress_init(&mut self, _addr: u32, _total: usize) {}
    fn progress_update(&mut self, _current: usize) {}
    fn progress_finish(&mut self) {}
}

/// Cooperative cancellation flag, observable at driver checkpoints
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Checkpoint helper: errors out once the flag is set
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Options every driver recognises
#[derive(Debug, Clone, Copy)]
pub struct FlashOpts {
    /// Continue despite a non-standard BK encryption key
    pub skip_key_check: bool,
    /// Keep a BK read whose post-read CRC does not match
    pub ignore_crc_err: bool,
    /// Permit BK7231T/U writes below 0x11000
    pub overwrite_bootloader: bool,
    /// Continue on a BK flash whose MID is not in the registry
    pub skip_unprotect: bool,
    /// Scales every per-command timeout; clamped to at least 1.0
    pub read_timeout_multiplier: f32,
    /// Baud rate to negotiate after sync
    pub baud: u32,
}

impl Default for FlashOpts {
    fn default() -> Self {
        FlashOpts {
            skip_key_check: false,
            ignore_crc_err: false,
            overwrite_bootloader: false,
            skip_unprotect: false,
            read_timeout_multiplier: 1.0,
            baud: 921_600,
        }
    }
}

/// Uniform operation surface over the four protocol families
pub trait Flasher {
    fn family(&self) -> ChipFamily;

    /// Read `sectors` 4K sectors starting at `start_sector`; the result is
    /// kept for [Flasher::read_result]
    fn do_read(&mut self, start_sector: u32, sectors: u32, full_read: bool)
        -> Result<(), Error>;

    /// Write `data` at byte offset `offset`, then verify
    fn do_write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error>;

    /// Erase `sectors` 4K sectors starting at `start_sector`
    fn do_erase(&mut self, start_sector: u32, sectors: u32, erase_all: bool)
        -> Result<bool, Error>;

    /// The most recent read buffer, if any
    fn read_result(&self) -> Option<&[u8]>;

    /// Release the transport; further operations need a fresh driver
    fn close(&mut self);
}

impl ChipFamily {
    /// Create the driver for this family
    pub fn flasher(
        self,
        transport: Box<dyn Transport>,
        opts: FlashOpts,
        events: Box<dyn FlasherEvents>,
        cancel: CancelToken,
    ) -> Box<dyn Flasher> {
        if self.is_bk() {
            Box::new(bk7231::Bk7231Flasher::new(self, transport, opts, events, cancel))
        } else if self.is_bl() {
            Box::new(bl602::Bl602Flasher::new(self, transport, opts, events, cancel))
        } else if self.is_wm() {
            Box::new(wm::WmFlasher::new(self, transport, opts, events, cancel))
        } else {
            Box::new(esp32::Esp32Flasher::new(self, transport, opts, events, cancel))
        }
    }
}

/// Event plumbing shared by the drivers: tracks the lifecycle state and
/// keeps progress reports inside `Working`/`Verifying`.
pub(crate) struct EventSink {
    events: Box<dyn FlasherEvents>,
    state: FlasherState,
}

impl EventSink {
    pub(crate) fn new(events: Box<dyn FlasherEvents>) -> Self {
        EventSink {
            events,
            state: FlasherState::Idle,
        }
    }

    pub(crate) fn set_state(&mut self, state: FlasherState) {
        if self.state == FlasherState::Failed {
            return;
        }
        if self.state != state {
            self.state = state;
            self.events.state_changed(state);
        }
    }

    pub(crate) fn log(&mut self, level: LogLevel, message: &str) {
        self.events.log(level, message);
    }

    pub(crate) fn info(&mut self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub(crate) fn warning(&mut self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    pub(crate) fn error(&mut self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub(crate) fn success(&mut self, message: &str) {
        self.log(LogLevel::Success, message);
    }

    fn progress_allowed(&self) -> bool {
        matches!(
            self.state,
            FlasherState::Working | FlasherState::Verifying
        )
    }

    pub(crate) fn progress_init(&mut self, addr: u32, total: usize) {
        if self.progress_allowed() {
            self.events.progress_init(addr, total);
        }
    }

    pub(crate) fn progress_update(&mut self, current: usize) {
        if self.progress_allowed() {
            self.events.progress_update(current);
        }
    }

    pub(crate) fn progress_finish(&mut self) {
        if self.progress_allowed() {
            self.events.progress_finish();
        }
    }

    /// Map an operation result onto the terminal state and log entry
    pub(crate) fn finish<T>(
        &mut self,
        operation: &str,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        match &result {
            Ok(_) => self.set_state(FlasherState::Completed),
            Err(Error::Cancelled) => {
                let message = format!("{operation} cancelled by user");
                self.info(&message);
                self.set_state(FlasherState::Cancelled);
            }
            Err(e) => {
                let message = format!("{operation} failed: {e}");
                self.error(&message);
                self.set_state(FlasherState::Failed);
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod test_events {
    use std::sync::{Arc, Mutex};

    use super::{FlasherEvents, FlasherState, LogLevel};

    #[derive(Default)]
    pub struct Recorded {
        pub logs: Vec<(LogLevel, String)>,
        pub states: Vec<FlasherState>,
        pub progress: Vec<usize>,
    }

    /// Event recorder handed to drivers under test
    #[derive(Clone, Default)]
    pub struct RecordingEvents(pub Arc<Mutex<Recorded>>);

    impl RecordingEvents {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn logs(&self) -> Vec<(LogLevel, String)> {
            self.0.lock().unwrap().logs.clone()
        }

        pub fn states(&self) -> Vec<FlasherState> {
            self.0.lock().unwrap().states.clone()
        }

        pub fn log_contains(&self, needle: &str) -> bool {
            self.logs().iter().any(|(_, m)| m.contains(needle))
        }
    }

    impl FlasherEvents for RecordingEvents {
        fn log(&mut self, level: LogLevel, message: &str) {
            self.0
                .lock()
                .unwrap()
                .logs
                .push((level, message.to_string()));
        }

        fn state_changed(&mut self, state: FlasherState) {
            self.0.lock().unwrap().states.push(state);
        }

        fn progress_init(&mut self, _addr: u32, _total: usize) {}

        fn progress_update(&mut self, current: usize) {
            self.0.lock().unwrap().progress.push(current);
        }

        fn progress_finish(&mut self) {}
    }
}
