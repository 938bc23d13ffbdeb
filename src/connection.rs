//! Buffered connection over a [Transport]
//!
//! The [Connection] struct owns the transport for the duration of one
//! operation and layers on what every driver needs: an ordered receive
//! queue, deadline reads with the configured timeout multiplier, and
//! best-effort control lines. Framing stays in the drivers; this layer only
//! moves bytes.

use std::collections::VecDeque;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, ProtocolError, TransportError};
use crate::transport::Transport;

// Chunk size for a single transport read; protocol responses are at most a
// sector plus framing.
const READ_CHUNK: usize = 4 * 1024 + 128;

// Poll interval when the transport has nothing buffered.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// An open link to a target device
pub struct Connection {
    transport: Box<dyn Transport>,
    buffer: VecDeque<u8>,
    timeout_multiplier: f32,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, timeout_multiplier: f32) -> Self {
        Connection {
            transport,
            buffer: VecDeque::new(),
            timeout_multiplier: timeout_multiplier.max(1.0),
        }
    }

    pub fn open(&mut self) -> Result<(), Error> {
        self.transport.connect().map_err(Error::from)
    }

    pub fn close(&mut self) {
        self.transport.disconnect();
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.transport.write(bytes).map_err(Error::from)
    }

    /// Scale `base` by the configured read-timeout multiplier
    pub fn effective_timeout(&self, base: Duration) -> Duration {
        base.mul_f32(self.timeout_multiplier)
    }

    /// Read exactly `len` bytes within the (scaled) timeout
    pub fn read_exact(
        &mut self,
        len: usize,
        base_timeout: Duration,
        command: &'static str,
    ) -> Result<Vec<u8>, Error> {
        let timeout = self.effective_timeout(base_timeout);
        match self.fill(len, timeout)? {
            true => Ok(self.buffer.drain(..len).collect()),
            false => Err(ProtocolError::Timeout {
                command,
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    /// Like [Connection::read_exact] but yields `None` on timeout
    pub fn try_read_exact(
        &mut self,
        len: usize,
        base_timeout: Duration,
    ) -> Result<Option<Vec<u8>>, Error> {
        let timeout = self.effective_timeout(base_timeout);
        match self.fill(len, timeout)? {
            true => Ok(Some(self.buffer.drain(..len).collect())),
            false => Ok(None),
        }
    }

    /// Discard stream bytes until `prefix` starts the queue
    ///
    /// Returns whether the prefix was seen before the (scaled) timeout; the
    /// prefix itself stays in the queue.
    pub fn read_until_prefix(
        &mut self,
        prefix: &[u8],
        base_timeout: Duration,
    ) -> Result<bool, Error> {
        let timeout = self.effective_timeout(base_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let buf = self.buffer.make_contiguous();
            if let Some(pos) = buf.windows(prefix.len()).position(|w| w == prefix) {
                self.buffer.drain(..pos);
                return Ok(true);
            }

            if Instant::now() >= deadline {
                return Ok(false);
            }
            if self.poll_transport()? == 0 {
                sleep(POLL_INTERVAL);
            }
        }
    }

    /// Read whatever arrives within `timeout`, possibly nothing
    pub fn read_some(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        self.fill(self.buffer.len() + 1, timeout)?;
        Ok(self.buffer.drain(..).collect())
    }

    /// Number of buffered bytes without touching the transport
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Put unconsumed bytes back at the front of the queue
    pub fn unread(&mut self, bytes: &[u8]) {
        for &byte in bytes.iter().rev() {
            self.buffer.push_front(byte);
        }
    }

    /// Discard everything received so far
    pub fn drain(&mut self) {
        // Pull anything the transport already has before clearing.
        let _ = self.poll_transport();
        if !self.buffer.is_empty() {
            debug!("Discarding {} stale bytes", self.buffer.len());
        }
        self.buffer.clear();
    }

    /// Change the line rate; stale bytes from the old rate are dropped
    pub fn set_baud(&mut self, rate: u32) -> Result<(), Error> {
        debug!("Switching to {} baud", rate);
        self.transport.set_baud(rate).map_err(Error::from)
    }

    pub fn baud(&self) -> u32 {
        self.transport.baud()
    }

    pub fn set_dtr(&mut self, level: bool) -> bool {
        self.transport.set_dtr(level)
    }

    pub fn set_rts(&mut self, level: bool) -> bool {
        self.transport.set_rts(level)
    }

    /// Block until `wanted` bytes are buffered or `timeout` elapses.
    ///
    /// The transport cannot signal arrival, so this polls with a short
    /// sleep between empty reads.
    fn fill(&mut self, wanted: usize, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.buffer.len() >= wanted {
                return Ok(true);
            }
            let n = self.poll_transport()?;
            if self.buffer.len() >= wanted {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if n == 0 {
                sleep(POLL_INTERVAL);
            }
        }
    }

    fn poll_transport(&mut self) -> Result<usize, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.transport.read(&mut chunk, POLL_INTERVAL)?;
        self.buffer.extend(&chunk[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Connection;
    use crate::error::{Error, ProtocolError};
    use crate::transport::mock::MockTransport;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn read_exact_returns_scripted_response() {
        let mock = MockTransport::new();
        mock.expect_prefix(vec![0x01], vec![0xAA, 0xBB, 0xCC]);

        let mut conn = Connection::new(Box::new(mock), 1.0);
        conn.write(&[0x01, 0x02]).unwrap();
        assert_eq!(conn.read_exact(3, SHORT, "test").unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn read_exact_times_out_without_data() {
        let mock = MockTransport::new();
        let mut conn = Connection::new(Box::new(mock), 1.0);

        match conn.read_exact(1, SHORT, "test") {
            Err(Error::Protocol(ProtocolError::Timeout { command, .. })) => {
                assert_eq!(command, "test")
            }
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unread_bytes_come_back_first() {
        let mock = MockTransport::new();
        mock.push_rx(&[3, 4]);

        let mut conn = Connection::new(Box::new(mock), 1.0);
        conn.unread(&[1, 2]);
        assert_eq!(conn.read_exact(4, SHORT, "test").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn prefix_scan_discards_leading_noise() {
        let mock = MockTransport::new();
        mock.push_rx(&[0x00, 0xFF, 0x04, 0x0E, 0x42]);

        let mut conn = Connection::new(Box::new(mock), 1.0);
        assert!(conn.read_until_prefix(&[0x04, 0x0E], SHORT).unwrap());
        assert_eq!(
            conn.read_exact(3, SHORT, "test").unwrap(),
            vec![0x04, 0x0E, 0x42]
        );
    }

    #[test]
    fn multiplier_never_shrinks_timeouts() {
        let mock = MockTransport::new();
        let conn = Connection::new(Box::new(mock), 0.1);
        assert_eq!(conn.effective_timeout(SHORT), SHORT);
    }
}
