//! Serial transport contract consumed by the protocol drivers
//!
//! Drivers own a [Transport] exclusively for the duration of one operation.
//! The contract is deliberately small: an ordered byte stream in each
//! direction, baud-rate changes, and best-effort control lines. Port
//! discovery is a separate capability so that drivers never depend on it.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{FlowControl, SerialPort};

use crate::error::TransportError;

#[cfg(test)]
pub(crate) mod mock;

/// Abstract duplex byte stream with control-line and baud-rate capabilities
pub trait Transport: Send {
    /// Acquire the underlying port; fails with [TransportError::Open]
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Release the port; always safe, idempotent
    fn disconnect(&mut self);

    /// Queue `bytes` for transmission, preserving order
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read whatever is available into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time; that is not an error.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Apply `rate` to subsequent bytes. Bytes in flight during the change
    /// may be lost; drivers re-synchronise after calling this.
    fn set_baud(&mut self, rate: u32) -> Result<(), TransportError>;

    /// The currently configured baud rate
    fn baud(&self) -> u32;

    /// Drive DTR; returns whether the host honoured the signal
    fn set_dtr(&mut self, level: bool) -> bool;

    /// Drive RTS; returns whether the host honoured the signal
    fn set_rts(&mut self, level: bool) -> bool;
}

/// Optional capability: enumerating serial ports on the host
pub trait PortEnumeration {
    fn available_ports(&self) -> Result<Vec<String>, TransportError>;
}

/// Enumerate serial port names on this host
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        return Err(TransportError::NoPorts);
    }
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

// The hardware read timeout is kept short; longer waits are poll loops in
// the connection layer so that cancellation stays responsive.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// [Transport] implementation over a host serial port
pub struct SerialTransport {
    port_name: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baud: u32) -> Self {
        SerialTransport {
            port_name: port_name.into(),
            baud,
            port: None,
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                ErrorKind::NotConnected,
                "serial port is not open",
            ))
        })
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }

        debug!("Opening {} at {} baud", self.port_name, self.baud);
        let port = serialport::new(&self.port_name, self.baud)
            .flow_control(FlowControl::None)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|source| TransportError::Open {
                port: self.port_name.clone(),
                source,
            })?;

        self.port = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed {}", self.port_name);
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(bytes).map_err(TransportError::Write)?;
        port.flush().map_err(TransportError::Write)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        port.set_timeout(timeout.max(PORT_READ_TIMEOUT))?;

        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn set_baud(&mut self, rate: u32) -> Result<(), TransportError> {
        self.baud = rate;
        if let Some(port) = self.port.as_mut() {
            port.set_baud_rate(rate)?;
        }
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    fn set_dtr(&mut self, level: bool) -> bool {
        match self.port.as_mut() {
            Some(port) => port.write_data_terminal_ready(level).is_ok(),
            None => false,
        }
    }

    fn set_rts(&mut self, level: bool) -> bool {
        match self.port.as_mut() {
            Some(port) => port.write_request_to_send(level).is_ok(),
            None => false,
        }
    }
}

impl PortEnumeration for SerialTransport {
    fn available_ports(&self) -> Result<Vec<String>, TransportError> {
        available_ports()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
