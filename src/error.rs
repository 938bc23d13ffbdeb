//! Library and application errors

use miette::Diagnostic;
use thiserror::Error;

use crate::targets::ChipFamily;

/// All errors which can be produced while talking to a target device
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("The device did not respond to bootloader commands")]
    #[diagnostic(
        code(uniflash::sync_failed),
        help("Make sure the device is powered and in download mode. Power-cycling the board while uniflash retries is often enough.")
    )]
    SyncFailed,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Verification(#[from] VerificationError),

    #[error("Flash chip with MID {mid:#08x} is not in the registry")]
    #[diagnostic(
        code(uniflash::unknown_flash),
        help("The SPI NOR part could not be identified; unprotecting it is not possible")
    )]
    UnknownFlash { mid: u32 },

    #[error("Write or erase at {addr:#x} would touch the {family} bootloader")]
    #[diagnostic(
        code(uniflash::protected_region),
        help("Addresses below 0x11000 hold the bootloader on BK7231T/U. Pass --overwrite-bootloader if you really mean it.")
    )]
    ProtectedRegion { family: ChipFamily, addr: u32 },

    #[error("Operation cancelled by user")]
    #[diagnostic(code(uniflash::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Xmodem(#[from] XmodemError),

    #[error("{family} does not support {operation}")]
    #[diagnostic(code(uniflash::unsupported_operation))]
    UnsupportedOperation {
        family: ChipFamily,
        operation: &'static str,
    },

    #[error("The encryption key of this chip differs from the expected one")]
    #[diagnostic(
        code(uniflash::key_mismatch),
        help("Flashing would produce an unbootable image. Pass --skip-key-check to continue anyway.")
    )]
    EncryptionKeyMismatch,

    #[error("Chip '{0}' not recognized")]
    #[diagnostic(
        code(uniflash::unrecognized_chip),
        help("Run with --help to see the list of supported chip families")
    )]
    UnrecognizedChipName(String),

    #[error("Bundled asset '{0}' is malformed")]
    #[diagnostic(code(uniflash::bad_asset))]
    MalformedAsset(&'static str),

    #[error("{0}")]
    #[diagnostic(code(uniflash::invalid_input))]
    InvalidInput(String),
}

/// Errors raised by the serial transport itself
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Failed to open serial port {port}")]
    #[diagnostic(
        code(uniflash::transport::open),
        help("Make sure the correct device is connected and the port is not held by another program")
    )]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to write to the serial port")]
    #[diagnostic(code(uniflash::transport::write))]
    Write(#[source] std::io::Error),

    #[error("Serial port IO error")]
    #[diagnostic(code(uniflash::transport::io))]
    Io(#[from] std::io::Error),

    #[error("Serial port error")]
    #[diagnostic(code(uniflash::transport::serial))]
    Serial(#[from] serialport::Error),

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(uniflash::transport::no_ports),
        help("Connect a device, or pass --port explicitly")
    )]
    NoPorts,
}

/// Per-command protocol failures; these usually trigger a local retry
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Truncated response for {command}: expected {expected} bytes, got {received}")]
    #[diagnostic(code(uniflash::protocol::truncated))]
    Truncated {
        command: &'static str,
        expected: usize,
        received: usize,
    },

    #[error("Malformed response for {command}: {details}")]
    #[diagnostic(code(uniflash::protocol::framing))]
    Framing {
        command: &'static str,
        details: String,
    },

    #[error("{command} reported failure status {status:#04x}")]
    #[diagnostic(code(uniflash::protocol::status))]
    Status { command: &'static str, status: u8 },

    #[error("No response to {command} within {timeout_ms} ms")]
    #[diagnostic(code(uniflash::protocol::timeout))]
    Timeout {
        command: &'static str,
        timeout_ms: u64,
    },
}

impl ProtocolError {
    pub fn framing(command: &'static str, details: impl Into<String>) -> Self {
        ProtocolError::Framing {
            command,
            details: details.into(),
        }
    }
}

/// Post-operation verification failures
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum VerificationError {
    #[error("CRC mismatch: device reports {device:#010x}, host computed {host:#010x}")]
    #[diagnostic(
        code(uniflash::verify::crc),
        help("The read data does not match the flash contents. Pass --ignore-crc-err to keep the buffer anyway.")
    )]
    Crc { device: u32, host: u32 },

    #[error("MD5 mismatch between flash contents and payload")]
    #[diagnostic(code(uniflash::verify::md5))]
    Md5,

    #[error("SHA-256 mismatch between flash contents and payload")]
    #[diagnostic(code(uniflash::verify::sha256))]
    Sha256,

    #[error("Read buffer is uniformly {byte:#04x}; the flash almost certainly was not read")]
    #[diagnostic(code(uniflash::verify::uniform))]
    UniformBuffer { byte: u8 },

    #[error("Read-back does not match the written pattern")]
    #[diagnostic(code(uniflash::verify::pattern))]
    PatternMismatch,
}

/// XMODEM sender failures
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum XmodemError {
    #[error("Receiver did not initiate an XMODEM transfer")]
    #[diagnostic(code(uniflash::xmodem::initiation))]
    InitiationFailed,

    #[error("Receiver cancelled the transfer")]
    #[diagnostic(code(uniflash::xmodem::cancelled))]
    ReceiverCancelled,

    #[error("Block {block} was not acknowledged after {retries} retries")]
    #[diagnostic(code(uniflash::xmodem::retries))]
    RetriesExhausted { block: u32, retries: usize },

    #[error("End of transmission was not acknowledged")]
    #[diagnostic(code(uniflash::xmodem::eot))]
    EotUnacknowledged,
}
