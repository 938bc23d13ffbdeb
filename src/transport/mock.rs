//! Scripted in-memory transport for driver tests
//!
//! A test queues `(matcher, response)` steps; every host write is recorded
//! and checked against the front of the script. When the matcher accepts the
//! written bytes the scripted response becomes readable, emulating a device
//! answering a command. Unmatched writes (sync spam, retries) are recorded
//! and otherwise ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::Transport;

type Matcher = Box<dyn FnMut(&[u8]) -> bool + Send>;

#[derive(Default)]
struct Inner {
    script: VecDeque<(Matcher, Vec<u8>)>,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    dtr: Vec<bool>,
    rts: Vec<bool>,
    baud_changes: Vec<u32>,
    baud: u32,
    connected: bool,
    honour_control_lines: bool,
}

/// Cloneable handle; all clones share one scripted device
#[derive(Clone)]
pub struct MockTransport(Arc<Mutex<Inner>>);

impl MockTransport {
    pub fn new() -> Self {
        let inner = Inner {
            baud: 115_200,
            honour_control_lines: true,
            ..Inner::default()
        };
        MockTransport(Arc::new(Mutex::new(inner)))
    }

    pub fn without_control_lines() -> Self {
        let mock = Self::new();
        mock.0.lock().unwrap().honour_control_lines = false;
        mock
    }

    /// Queue a step: when a write matches, `response` becomes readable
    pub fn expect(
        &self,
        matcher: impl FnMut(&[u8]) -> bool + Send + 'static,
        response: impl Into<Vec<u8>>,
    ) {
        self.0
            .lock()
            .unwrap()
            .script
            .push_back((Box::new(matcher), response.into()));
    }

    /// Queue a step matching any write that starts with `prefix`
    pub fn expect_prefix(&self, prefix: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) {
        let prefix = prefix.into();
        self.expect(move |w: &[u8]| w.starts_with(&prefix), response);
    }

    /// Make bytes readable without waiting for a write (unsolicited output)
    pub fn push_rx(&self, bytes: &[u8]) {
        self.0.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().written.clone()
    }

    pub fn written_flat(&self) -> Vec<u8> {
        self.0.lock().unwrap().written.concat()
    }

    pub fn dtr_history(&self) -> Vec<bool> {
        self.0.lock().unwrap().dtr.clone()
    }

    pub fn rts_history(&self) -> Vec<bool> {
        self.0.lock().unwrap().rts.clone()
    }

    pub fn baud_changes(&self) -> Vec<u32> {
        self.0.lock().unwrap().baud_changes.clone()
    }

    pub fn script_exhausted(&self) -> bool {
        self.0.lock().unwrap().script.is_empty()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.0.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.0.lock().unwrap().connected = false;
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.0.lock().unwrap();
        inner.written.push(bytes.to_vec());

        if let Some((matcher, _)) = inner.script.front_mut() {
            if matcher(bytes) {
                let (_, response) = inner.script.pop_front().unwrap();
                inner.rx.extend(response);
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut inner = self.0.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            match inner.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn set_baud(&mut self, rate: u32) -> Result<(), TransportError> {
        let mut inner = self.0.lock().unwrap();
        inner.baud = rate;
        inner.baud_changes.push(rate);
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.0.lock().unwrap().baud
    }

    fn set_dtr(&mut self, level: bool) -> bool {
        let mut inner = self.0.lock().unwrap();
        inner.dtr.push(level);
        inner.honour_control_lines
    }

    fn set_rts(&mut self, level: bool) -> bool {
        let mut inner = self.0.lock().unwrap();
        inner.rts.push(level);
        inner.honour_control_lines
    }
}
