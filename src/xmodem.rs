//! XMODEM-1K sender
//!
//! Sender-only implementation used for WM stub and firmware uploads. The
//! receiver picks the check mode with its initiation byte: `'C'` selects
//! CRC-16/XMODEM, NAK selects the 8-bit arithmetic checksum. Every packet
//! carries 1024 data bytes; the final packet is padded with a configurable
//! byte (the WM bootloader requires 0xFF).

use std::time::Duration;

use log::debug;

use crate::checksum::crc16_xmodem;
use crate::connection::Connection;
use crate::error::{Error, XmodemError};
use crate::flasher::CancelToken;

pub const BLOCK_LEN: usize = 1024;

const STX: u8 = 0x02;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_INITIATION: u8 = 0x43; // 'C'

const DEFAULT_MAX_RETRIES: usize = 5;
const INITIATION_TIMEOUT: Duration = Duration::from_secs(6);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckMode {
    Crc16,
    Checksum,
}

/// Progress snapshot fired after every acknowledged packet
#[derive(Debug, Clone, Copy)]
pub struct PacketProgress {
    pub bytes_sent: usize,
    pub total: usize,
    pub block: u32,
    pub offset: usize,
}

/// Block-oriented uploader over an open [Connection]
pub struct XmodemSender<'a> {
    conn: &'a mut Connection,
    pad_byte: u8,
    max_retries: usize,
}

impl<'a> XmodemSender<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        XmodemSender {
            conn,
            pad_byte: 0x1A,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn pad_byte(mut self, byte: u8) -> Self {
        self.pad_byte = byte;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Upload `data`, invoking `progress` after every acknowledged packet
    pub fn send(
        &mut self,
        data: &[u8],
        cancel: &CancelToken,
        progress: &mut dyn FnMut(PacketProgress),
    ) -> Result<(), Error> {
        let mode = self.wait_for_initiation()?;
        debug!(
            "XMODEM transfer initiated in {} mode, {} bytes to send",
            match mode {
                CheckMode::Crc16 => "CRC-16",
                CheckMode::Checksum => "checksum",
            },
            data.len()
        );

        let mut seq: u8 = 1;
        for (index, chunk) in data.chunks(BLOCK_LEN).enumerate() {
            cancel.check()?;
            let packet = self.build_packet(seq, chunk, mode);
            self.send_packet(&packet, index as u32 + 1)?;

            let offset = index * BLOCK_LEN;
            progress(PacketProgress {
                bytes_sent: (offset + chunk.len()).min(data.len()),
                total: data.len(),
                block: index as u32 + 1,
                offset,
            });
            seq = seq.wrapping_add(1);
        }

        self.send_eot()
    }

    fn wait_for_initiation(&mut self) -> Result<CheckMode, Error> {
        match self.conn.try_read_exact(1, INITIATION_TIMEOUT)? {
            Some(byte) if byte[0] == CRC_INITIATION => Ok(CheckMode::Crc16),
            Some(byte) if byte[0] == NAK => Ok(CheckMode::Checksum),
            _ => Err(XmodemError::InitiationFailed.into()),
        }
    }

    fn build_packet(&self, seq: u8, chunk: &[u8], mode: CheckMode) -> Vec<u8> {
        let mut packet = Vec::with_capacity(3 + BLOCK_LEN + 2);
        packet.push(STX);
        packet.push(seq);
        packet.push(255 - seq);
        packet.extend_from_slice(chunk);
        packet.resize(3 + BLOCK_LEN, self.pad_byte);

        match mode {
            CheckMode::Crc16 => {
                let crc = crc16_xmodem(&packet[3..]);
                packet.extend_from_slice(&crc.to_be_bytes());
            }
            CheckMode::Checksum => {
                let sum = packet[3..]
                    .iter()
                    .fold(0u8, |acc, &byte| acc.wrapping_add(byte));
                packet.push(sum);
            }
        }
        packet
    }

    fn send_packet(&mut self, packet: &[u8], block: u32) -> Result<(), Error> {
        for _ in 0..=self.max_retries {
            self.conn.write(packet)?;
            match self.conn.try_read_exact(1, RESPONSE_TIMEOUT)? {
                Some(resp) if resp[0] == ACK => return Ok(()),
                Some(resp) if resp[0] == CAN => {
                    return Err(XmodemError::ReceiverCancelled.into())
                }
                // NAK, garbage or timeout: retransmit the block.
                _ => debug!("Block {} not acknowledged, retrying", block),
            }
        }
        Err(XmodemError::RetriesExhausted {
            block,
            retries: self.max_retries,
        }
        .into())
    }

    fn send_eot(&mut self) -> Result<(), Error> {
        for _ in 0..=self.max_retries {
            self.conn.write(&[EOT])?;
            match self.conn.try_read_exact(1, RESPONSE_TIMEOUT)? {
                Some(resp) if resp[0] == ACK => return Ok(()),
                _ => {}
            }
        }
        Err(XmodemError::EotUnacknowledged.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn connection(mock: &MockTransport) -> Connection {
        Connection::new(Box::new(mock.clone()), 1.0)
    }

    fn expect_blocks_acked(mock: &MockTransport, blocks: usize) {
        for _ in 0..blocks {
            mock.expect(|w: &[u8]| w.first() == Some(&STX), vec![ACK]);
        }
        mock.expect(|w: &[u8]| w == [EOT], vec![ACK]);
    }

    #[test]
    fn sends_padded_blocks_in_crc_mode() {
        let mock = MockTransport::new();
        mock.push_rx(&[CRC_INITIATION]);
        expect_blocks_acked(&mock, 2);

        let mut conn = connection(&mock);
        let payload = vec![0x42u8; 1500];
        let mut acked = Vec::new();
        XmodemSender::new(&mut conn)
            .pad_byte(0xFF)
            .send(&payload, &CancelToken::new(), &mut |p| acked.push(p.block))
            .unwrap();

        assert_eq!(acked, vec![1, 2]);
        assert!(mock.script_exhausted());

        let written = mock.written();
        // initiation consumed from rx; writes are 2 packets + EOT
        assert_eq!(written.len(), 3);
        assert_eq!(written[0].len(), 3 + BLOCK_LEN + 2);
        assert_eq!(&written[0][..3], &[STX, 1, 254]);
        assert_eq!(&written[1][..3], &[STX, 2, 253]);
        // last block padded with 0xFF beyond the 1500-1024 = 476 data bytes
        assert!(written[1][3 + 476..3 + BLOCK_LEN]
            .iter()
            .all(|&b| b == 0xFF));
        // CRC over the padded data block
        let crc = crc16_xmodem(&written[1][3..3 + BLOCK_LEN]);
        assert_eq!(&written[1][3 + BLOCK_LEN..], &crc.to_be_bytes());
    }

    #[test]
    fn checksum_mode_appends_single_byte() {
        let mock = MockTransport::new();
        mock.push_rx(&[NAK]);
        expect_blocks_acked(&mock, 1);

        let mut conn = connection(&mock);
        XmodemSender::new(&mut conn)
            .send(&[1u8; 10], &CancelToken::new(), &mut |_| {})
            .unwrap();

        let written = mock.written();
        assert_eq!(written[0].len(), 3 + BLOCK_LEN + 1);
        let sum = written[0][3..3 + BLOCK_LEN]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(written[0][3 + BLOCK_LEN], sum);
    }

    #[test]
    fn retries_on_nak_then_succeeds() {
        let mock = MockTransport::new();
        mock.push_rx(&[CRC_INITIATION]);
        mock.expect(|w: &[u8]| w.first() == Some(&STX), vec![NAK]);
        mock.expect(|w: &[u8]| w.first() == Some(&STX), vec![ACK]);
        mock.expect(|w: &[u8]| w == [EOT], vec![ACK]);

        let mut conn = connection(&mock);
        XmodemSender::new(&mut conn)
            .send(&[0u8; 8], &CancelToken::new(), &mut |_| {})
            .unwrap();

        // block 1 was transmitted twice
        let stx_frames = mock
            .written()
            .iter()
            .filter(|w| w.first() == Some(&STX))
            .count();
        assert_eq!(stx_frames, 2);
    }

    #[test]
    fn receiver_cancel_aborts() {
        let mock = MockTransport::new();
        mock.push_rx(&[CRC_INITIATION]);
        mock.expect(|w: &[u8]| w.first() == Some(&STX), vec![CAN]);

        let mut conn = connection(&mock);
        let err = XmodemSender::new(&mut conn)
            .send(&[0u8; 8], &CancelToken::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Xmodem(XmodemError::ReceiverCancelled)
        ));
    }

    #[test]
    fn garbage_initiation_fails() {
        let mock = MockTransport::new();
        mock.push_rx(&[0x99]);

        let mut conn = connection(&mock);
        let err = XmodemSender::new(&mut conn)
            .send(&[0u8; 8], &CancelToken::new(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Xmodem(XmodemError::InitiationFailed)));
    }

    #[test]
    fn block_numbers_wrap_at_256() {
        let sender_probe = {
            let mock = MockTransport::new();
            mock.push_rx(&[CRC_INITIATION]);
            // 256 blocks: seq runs 1..=255, 0
            expect_blocks_acked(&mock, 256);

            let mut conn = connection(&mock);
            let payload = vec![0u8; 256 * BLOCK_LEN];
            XmodemSender::new(&mut conn)
                .send(&payload, &CancelToken::new(), &mut |_| {})
                .unwrap();
            mock.written()
        };

        assert_eq!(sender_probe[254][1], 255);
        assert_eq!(sender_probe[255][1], 0);
        assert_eq!(sender_probe[255][2], 255);
    }
}
