//! SLIP framing used by the ESP32 bootloader protocol
//!
//! Packets are delimited by 0xC0 with byte-stuffing for the delimiter and
//! escape bytes. The decoder is incremental so that a driver can feed it
//! whatever the serial link delivers and collect frames as they complete.

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encode `payload` as a single SLIP frame, delimiters included
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &byte in payload {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
    out.push(END);
    out
}

/// Incremental SLIP frame extractor
///
/// Bytes arriving outside a frame are discarded, as are the empty frames
/// produced by back-to-back delimiters.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    frame: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a frame when a delimiter completes it
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if !self.in_frame {
            if byte == END {
                self.in_frame = true;
                self.frame.clear();
                self.escaped = false;
            }
            return None;
        }

        if self.escaped {
            self.escaped = false;
            match byte {
                ESC_END => self.frame.push(END),
                ESC_ESC => self.frame.push(ESC),
                // Protocol violation; keep the byte so the frame length
                // check upstream can reject the packet.
                other => self.frame.push(other),
            }
            return None;
        }

        match byte {
            END => {
                if self.frame.is_empty() {
                    // Empty frame, stay armed for the next one.
                    return None;
                }
                self.in_frame = false;
                Some(std::mem::take(&mut self.frame))
            }
            ESC => {
                self.escaped = true;
                None
            }
            other => {
                self.frame.push(other);
                None
            }
        }
    }

    /// Feed a whole chunk, collecting any frames it completes
    pub fn push_slice(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if let Some(frame) = self.push(byte) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drop any partially accumulated frame
    pub fn reset(&mut self) {
        self.frame.clear();
        self.in_frame = false;
        self.escaped = false;
    }
}

/// Decode the first complete frame of `buf`
pub fn decode(buf: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = SlipDecoder::new();
    for &byte in buf {
        if let Some(frame) = decoder.push(byte) {
            return Some(frame);
        }
    }
    None
}
