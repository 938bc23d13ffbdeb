//! WM W600/W800 driver
//!
//! The WinnerMicro bootloader frames commands as `21 | len16 | crc16 |
//! cmd32 | params` with CRC-16/CCITT-FALSE over command and parameters, and
//! announces readiness by spewing `'C'` bytes, which double as the XMODEM
//! initiation for uploads. Firmware travels as (pseudo-)FLS images over
//! XMODEM-1K; W800 additionally supports 4K block reads with a trailing
//! CRC-32.

use std::thread::sleep;
use std::time::{Duration, Instant};

use log::debug;

use crate::checksum::{crc16_ccitt_false, crc32};
use crate::connection::Connection;
use crate::error::{Error, ProtocolError};
use crate::flasher::{
    CancelToken, EventSink, Flasher, FlasherEvents, FlasherState, FlashOpts, SECTOR_SIZE,
};
use crate::stubs;
use crate::targets::ChipFamily;
use crate::xmodem::XmodemSender;

const FRAME_SOF: u8 = 0x21;

const CMD_SET_BAUD: u32 = 0x31;
const CMD_FLASH_ID: u32 = 0x3C;
const CMD_ERASE_SECBOOT: u32 = 0x3F;
const CMD_READ_FLASH: u32 = 0x4A;

const SYNC_MARK: u8 = 0x43; // 'C'
const ESC: u8 = 0x1B;
const SYNC_WINDOW: Duration = Duration::from_secs(2);
const SYNC_MIN_MARKS: usize = 4;
const SYNC_ATTEMPTS: usize = 1000;
const SECBOOT_ESC_COUNT: usize = 250;

const FLASH_ID_PREFIX: &[u8] = b"FID";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const READ_RETRIES: usize = 10;
const READ_BLOCK: usize = SECTOR_SIZE;

const XMODEM_PAD: u8 = 0xFF;
const SECBOOT_MAGIC: [u8; 4] = [0x9F, 0xFF, 0xFF, 0xA0];
const RAW_IMAGE_MIN: usize = 1024 * 1024;
const RAW_BODY_OFFSET: usize = 0x2000;

const W600_RUN_ADDR: u32 = 0x0801_0000;
const W800_RUN_ADDR: u32 = 0x0800_2000;

/// Driver for the W600/W800 family
pub struct WmFlasher {
    family: ChipFamily,
    conn: Connection,
    opts: FlashOpts,
    sink: EventSink,
    cancel: CancelToken,
    flash_size: u32,
    read_buf: Option<Vec<u8>>,
    prepared: bool,
}

impl WmFlasher {
    pub fn new(
        family: ChipFamily,
        transport: Box<dyn crate::transport::Transport>,
        opts: FlashOpts,
        events: Box<dyn FlasherEvents>,
        cancel: CancelToken,
    ) -> Self {
        debug_assert!(family.is_wm());
        WmFlasher {
            family,
            conn: Connection::new(transport, opts.read_timeout_multiplier),
            opts,
            sink: EventSink::new(events),
            cancel,
            flash_size: 1024 * 1024,
            read_buf: None,
            prepared: false,
        }
    }

    // -- framing ---------------------------------------------------------

    fn build_frame(cmd: u32, params: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + params.len());
        body.extend_from_slice(&cmd.to_le_bytes());
        body.extend_from_slice(params);

        let crc = crc16_ccitt_false(&body);
        // Total length counts command, parameters and the CRC itself.
        let total_len = (body.len() + 2) as u16;

        let mut frame = Vec::with_capacity(5 + body.len());
        frame.push(FRAME_SOF);
        frame.extend_from_slice(&total_len.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    fn send_command(&mut self, cmd: u32, params: &[u8]) -> Result<(), Error> {
        self.conn.write(&Self::build_frame(cmd, params))
    }

    // -- sync ------------------------------------------------------------

    /// Count `'C'` marks inside one window
    fn collect_sync_marks(&mut self) -> Result<usize, Error> {
        let deadline = Instant::now() + SYNC_WINDOW;
        let mut marks = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || marks >= SYNC_MIN_MARKS {
                return Ok(marks);
            }
            let chunk = self
                .conn
                .read_some(remaining.min(Duration::from_millis(100)))?;
            marks += chunk.iter().filter(|&&b| b == SYNC_MARK).count();
        }
    }

    /// Break a W600 out of secboot: a burst of ESC, then the erase command
    fn interrupt_secboot(&mut self) -> Result<(), Error> {
        debug!("Interrupting secboot");
        for _ in 0..SECBOOT_ESC_COUNT {
            self.conn.write(&[ESC])?;
            sleep(Duration::from_millis(1));
        }
        self.send_command(CMD_ERASE_SECBOOT, &[])
    }

    fn sync(&mut self) -> Result<(), Error> {
        for attempt in 0..SYNC_ATTEMPTS {
            self.cancel.check()?;
            if self.collect_sync_marks()? > SYNC_MIN_MARKS - 1 {
                self.sink.info("Bootloader is ready");
                return Ok(());
            }
            if self.family == ChipFamily::W600 && attempt % 3 == 2 {
                self.interrupt_secboot()?;
            }
        }
        Err(Error::SyncFailed)
    }

    // -- identification --------------------------------------------------

    fn identify_flash(&mut self) -> Result<(), Error> {
        self.conn.drain();
        self.send_command(CMD_FLASH_ID, &[])?;

        if !self
            .conn
            .read_until_prefix(FLASH_ID_PREFIX, COMMAND_TIMEOUT)?
        {
            return Err(ProtocolError::Timeout {
                command: "FlashId",
                timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
            }
            .into());
        }
        let _ = self.conn.read_exact(3, COMMAND_TIMEOUT, "FlashId")?;

        // W800 reports a two-byte ID, W600 a single byte without a usable
        // size field.
        let hex_len = if self.family == ChipFamily::W800 { 4 } else { 2 };
        let hex = self.conn.read_exact(hex_len, COMMAND_TIMEOUT, "FlashId")?;
        let text = std::str::from_utf8(&hex)
            .map_err(|_| ProtocolError::framing("FlashId", "non-ASCII flash id"))?;
        let id = u16::from_str_radix(text, 16)
            .map_err(|_| ProtocolError::framing("FlashId", "non-hex flash id"))?;

        if self.family == ChipFamily::W800 {
            let capacity = (id & 0xFF) as u8;
            if !(0x14..0x20).contains(&capacity) {
                return Err(ProtocolError::framing(
                    "FlashId",
                    format!("implausible capacity byte {capacity:#04x}"),
                )
                .into());
            }
            let size_mb = (1u64 << (capacity - 0x11)) / 8;
            self.flash_size = (size_mb * 1024 * 1024) as u32;
            self.sink
                .info(&format!("Flash ID {id:#06x}, size {size_mb} MB"));
        } else {
            self.sink.info(&format!("Flash ID {id:#04x}"));
        }
        Ok(())
    }

    // -- uploads ---------------------------------------------------------

    /// Push a buffer through XMODEM-1K; the spewed `'C'` marks initiate it
    fn xmodem_upload(&mut self, data: &[u8], label: &str) -> Result<(), Error> {
        self.sink.info(&format!("Sending {label} ({} bytes)", data.len()));

        let sink = &mut self.sink;
        let mut sender = XmodemSender::new(&mut self.conn).pad_byte(XMODEM_PAD);
        sender.send(data, &self.cancel, &mut |p| {
            sink.progress_update(p.block as usize);
        })
    }

    fn upload_stub(&mut self) -> Result<(), Error> {
        let stub = stubs::w800_stub()?;
        self.xmodem_upload(&stub, "RAM stub")?;
        // The stub re-announces itself exactly like the bootloader.
        self.sync()
    }

    fn change_baud(&mut self) -> Result<(), Error> {
        let target = self.opts.baud;
        if target == 115_200 {
            return Ok(());
        }

        self.send_command(CMD_SET_BAUD, &target.to_le_bytes())?;
        sleep(Duration::from_millis(20));
        self.conn.set_baud(target)?;
        self.sink.info(&format!("Baud rate set to {target}"));
        Ok(())
    }

    // -- session ---------------------------------------------------------

    fn begin(&mut self) -> Result<(), Error> {
        if self.prepared {
            return Ok(());
        }

        self.sink.set_state(FlasherState::Opening);
        self.conn.open()?;
        self.conn.set_baud(115_200)?;

        self.sink.set_state(FlasherState::Syncing);
        self.sync()?;

        self.sink.set_state(FlasherState::Identifying);
        self.identify_flash()?;

        self.sink.set_state(FlasherState::Configuring);
        if self.family == ChipFamily::W800 {
            self.upload_stub()?;
        }
        self.change_baud()?;

        self.prepared = true;
        Ok(())
    }

    // -- read ------------------------------------------------------------

    /// One 4K block; the response must be payload + CRC-32, and anything
    /// shorter than the full trailer is rejected before slicing.
    fn read_block(&mut self, addr: u32, wanted: usize) -> Result<Vec<u8>, Error> {
        let mut last_err: Option<Error> = None;
        for _ in 0..READ_RETRIES {
            self.conn.drain();
            let mut params = [0u8; 8];
            params[..4].copy_from_slice(&addr.to_le_bytes());
            params[4..].copy_from_slice(&(wanted as u32).to_le_bytes());
            self.send_command(CMD_READ_FLASH, &params)?;

            let total = wanted + 4;
            let response = match self.conn.try_read_exact(total, COMMAND_TIMEOUT)? {
                Some(response) => response,
                None => {
                    last_err = Some(
                        ProtocolError::Truncated {
                            command: "ReadFlash",
                            expected: total,
                            received: self.conn.buffered(),
                        }
                        .into(),
                    );
                    continue;
                }
            };

            let (payload, trailer) = response.split_at(wanted);
            let device = u32::from_le_bytes(trailer.try_into().unwrap());
            let host = crc32(0xFFFF_FFFF, payload);
            if device != host {
                last_err = Some(
                    ProtocolError::framing(
                        "ReadFlash",
                        format!("block CRC mismatch at {addr:#x}"),
                    )
                    .into(),
                );
                continue;
            }
            return Ok(payload.to_vec());
        }
        Err(last_err.unwrap())
    }

    fn run_read(
        &mut self,
        start_sector: u32,
        sectors: u32,
        full_read: bool,
    ) -> Result<(), Error> {
        if self.family != ChipFamily::W800 {
            return Err(Error::UnsupportedOperation {
                family: self.family,
                operation: "reading flash",
            });
        }

        self.begin()?;

        let (start_sector, sectors) = if full_read {
            (0, self.flash_size / SECTOR_SIZE as u32)
        } else {
            (start_sector, sectors)
        };
        let start = start_sector * SECTOR_SIZE as u32;
        let mut amount = (sectors as usize) * SECTOR_SIZE;
        // The device cannot read past the end of its flash; truncate.
        if start as usize + amount > self.flash_size as usize {
            amount = (self.flash_size - start) as usize;
            self.sink.warning(&format!(
                "Read truncated to the {:#x}-byte flash",
                self.flash_size
            ));
        }

        self.sink.set_state(FlasherState::Working);
        self.sink
            .progress_init(start, amount.div_ceil(READ_BLOCK));

        let mut buf = Vec::with_capacity(amount);
        let mut block = 0usize;
        while buf.len() < amount {
            self.cancel.check()?;
            let addr = start + buf.len() as u32;
            let wanted = (amount - buf.len()).min(READ_BLOCK);
            let payload = self.read_block(addr, wanted)?;
            buf.extend_from_slice(&payload);
            block += 1;
            self.sink.progress_update(block);
        }
        self.sink.progress_finish();

        self.sink.set_state(FlasherState::Verifying);
        self.sink.success("All blocks CRC-verified");
        self.read_buf = Some(buf);
        Ok(())
    }

    // -- write -----------------------------------------------------------

    fn run_addr(&self) -> u32 {
        match self.family {
            ChipFamily::W600 => W600_RUN_ADDR,
            _ => W800_RUN_ADDR,
        }
    }

    /// Wrap a carved firmware body in the in-memory FLS header the
    /// bootloader expects (44 bytes on W600, 48 on W800)
    fn build_pseudo_fls(&self, body: &[u8]) -> Vec<u8> {
        let header_len = if self.family == ChipFamily::W800 { 48 } else { 44 };
        let mut header = Vec::with_capacity(header_len + body.len());

        header.extend_from_slice(&0xA0FF_FF9Fu32.to_le_bytes()); // magic
        header.extend_from_slice(&0u32.to_le_bytes()); // image type
        header.extend_from_slice(&0u32.to_le_bytes()); // zip type
        header.extend_from_slice(&self.run_addr().to_le_bytes());
        header.extend_from_slice(&(body.len() as u32).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // header address
        header.extend_from_slice(&0u32.to_le_bytes()); // upgrade address
        header.extend_from_slice(&0u32.to_le_bytes()); // upgrade length
        header.extend_from_slice(&crc32(0xFFFF_FFFF, body).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // reserved
        if self.family == ChipFamily::W800 {
            header.extend_from_slice(&0u32.to_le_bytes()); // reserved
        }
        let header_crc = crc32(0xFFFF_FFFF, &header);
        header.extend_from_slice(&header_crc.to_le_bytes());
        debug_assert_eq!(header.len(), header_len);

        header.extend_from_slice(body);
        header
    }

    /// Either pass an FLS image through untouched, or carve a raw backup
    /// and wrap it
    fn prepare_image(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() >= 4 && data[..4] == SECBOOT_MAGIC {
            return Ok(data.to_vec());
        }

        if data.len() < RAW_IMAGE_MIN {
            return Err(Error::InvalidInput(
                "not an FLS image, and too small to carve as a raw backup".into(),
            ));
        }

        let body = &data[RAW_BODY_OFFSET..];
        if body[..4] != SECBOOT_MAGIC {
            return Err(Error::InvalidInput(format!(
                "no secboot header at {RAW_BODY_OFFSET:#x}; refusing to wrap this image"
            )));
        }
        Ok(self.build_pseudo_fls(body))
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        if offset != 0 {
            return Err(Error::InvalidInput(
                "WM images always start at offset 0".into(),
            ));
        }

        let image = self.prepare_image(data)?;
        self.begin()?;

        self.sink.set_state(FlasherState::Working);
        self.sink
            .progress_init(0, image.len().div_ceil(crate::xmodem::BLOCK_LEN));
        self.xmodem_upload(&image, "firmware")?;
        self.sink.progress_finish();
        self.sink.success("Firmware transferred");
        Ok(())
    }
}

impl Flasher for WmFlasher {
    fn family(&self) -> ChipFamily {
        self.family
    }

    fn do_read(
        &mut self,
        start_sector: u32,
        sectors: u32,
        full_read: bool,
    ) -> Result<(), Error> {
        let result = self.run_read(start_sector, sectors, full_read);
        self.sink.finish("Read", result)
    }

    fn do_write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let result = self.run_write(offset, data);
        self.sink.finish("Write", result)
    }

    fn do_erase(
        &mut self,
        _start_sector: u32,
        _sectors: u32,
        _erase_all: bool,
    ) -> Result<bool, Error> {
        let result = Err(Error::UnsupportedOperation {
            family: self.family,
            operation: "erasing flash",
        });
        self.sink.finish("Erase", result)
    }

    fn read_result(&self) -> Option<&[u8]> {
        self.read_buf.as_deref()
    }

    fn close(&mut self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flasher::test_events::RecordingEvents;
    use crate::transport::mock::MockTransport;

    const STX: u8 = 0x02;
    const EOT: u8 = 0x04;
    const ACK: u8 = 0x06;

    fn flasher(family: ChipFamily, mock: &MockTransport) -> (WmFlasher, RecordingEvents) {
        let events = RecordingEvents::new();
        let driver = WmFlasher::new(
            family,
            Box::new(mock.clone()),
            FlashOpts {
                baud: 115_200,
                ..FlashOpts::default()
            },
            Box::new(events.clone()),
            CancelToken::new(),
        );
        (driver, events)
    }

    fn script_xmodem(mock: &MockTransport, blocks: usize, trailing: &[u8]) {
        for _ in 0..blocks {
            mock.expect(|w: &[u8]| w.first() == Some(&STX), vec![ACK]);
        }
        let mut eot_resp = vec![ACK];
        eot_resp.extend_from_slice(trailing);
        mock.expect(|w: &[u8]| w == [EOT], eot_resp);
    }

    fn script_w800_session(mock: &MockTransport) {
        // sync spew
        mock.push_rx(b"CCCCC");
        // flash id answers and keeps spewing the XMODEM initiation
        let mut id_resp = b"FID1715".to_vec();
        id_resp.push(SYNC_MARK);
        mock.expect(
            |w: &[u8]| w.first() == Some(&FRAME_SOF) && w[5..9] == CMD_FLASH_ID.to_le_bytes(),
            id_resp,
        );
        // stub upload, then the stub spews marks again
        let stub_blocks = stubs::w800_stub()
            .unwrap()
            .len()
            .div_ceil(crate::xmodem::BLOCK_LEN);
        script_xmodem(mock, stub_blocks, b"CCCCC");
    }

    #[test]
    fn frames_carry_crc_and_self_including_length() {
        let frame = WmFlasher::build_frame(CMD_SET_BAUD, &[0x00, 0x10, 0x0E, 0x00]);

        assert_eq!(frame[0], FRAME_SOF);
        // cmd(4) + params(4) + crc(2)
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), 10);
        let crc = crc16_ccitt_false(&frame[5..]);
        assert_eq!(u16::from_le_bytes([frame[3], frame[4]]), crc);
        assert_eq!(&frame[5..9], &CMD_SET_BAUD.to_le_bytes());
    }

    #[test]
    fn w800_session_syncs_identifies_and_uploads_the_stub() {
        let mock = MockTransport::new();
        script_w800_session(&mock);

        let (mut driver, events) = flasher(ChipFamily::W800, &mock);
        driver.begin().unwrap();

        assert_eq!(driver.flash_size, 2 * 1024 * 1024);
        assert!(events.log_contains("size 2 MB"));
        assert!(mock.script_exhausted());
    }

    #[test]
    fn w800_read_verifies_the_trailing_crc() {
        let mock = MockTransport::new();
        script_w800_session(&mock);

        let block = vec![0x3Cu8; READ_BLOCK];
        let mut resp = block.clone();
        resp.extend_from_slice(&crc32(0xFFFF_FFFF, &block).to_le_bytes());
        mock.expect(
            |w: &[u8]| {
                w.first() == Some(&FRAME_SOF) && w[5..9] == CMD_READ_FLASH.to_le_bytes()
            },
            resp,
        );

        let (mut driver, _) = flasher(ChipFamily::W800, &mock);
        driver.do_read(0, 1, false).unwrap();
        assert_eq!(driver.read_result().unwrap(), block.as_slice());
    }

    #[test]
    fn w800_read_retries_on_a_corrupt_block() {
        let mock = MockTransport::new();
        script_w800_session(&mock);

        let block = vec![0x3Cu8; READ_BLOCK];
        // First response has a wrong CRC, the retry is clean
        let mut bad = block.clone();
        bad.extend_from_slice(&[0, 0, 0, 0]);
        let mut good = block.clone();
        good.extend_from_slice(&crc32(0xFFFF_FFFF, &block).to_le_bytes());

        let read_matcher = |w: &[u8]| {
            w.first() == Some(&FRAME_SOF) && w[5..9] == CMD_READ_FLASH.to_le_bytes()
        };
        mock.expect(read_matcher, bad);
        mock.expect(read_matcher, good);

        let (mut driver, _) = flasher(ChipFamily::W800, &mock);
        driver.do_read(0, 1, false).unwrap();
        assert!(mock.script_exhausted());
    }

    #[test]
    fn reads_past_the_flash_end_are_truncated() {
        let mock = MockTransport::new();
        script_w800_session(&mock);

        let block = vec![0x11u8; READ_BLOCK];
        let read_matcher = |w: &[u8]| {
            w.first() == Some(&FRAME_SOF) && w[5..9] == CMD_READ_FLASH.to_le_bytes()
        };
        let mut resp = block.clone();
        resp.extend_from_slice(&crc32(0xFFFF_FFFF, &block).to_le_bytes());
        mock.expect(read_matcher, resp);

        let (mut driver, events) = flasher(ChipFamily::W800, &mock);
        // Last sector of the 2 MB flash, plus one more that does not exist
        driver.do_read(0x1FF, 2, false).unwrap();

        assert_eq!(driver.read_result().unwrap().len(), READ_BLOCK);
        assert!(events.log_contains("truncated"));
    }

    #[test]
    fn w600_cannot_read_or_erase() {
        let mock = MockTransport::new();
        let (mut driver, _) = flasher(ChipFamily::W600, &mock);

        assert!(matches!(
            driver.do_read(0, 1, false).unwrap_err(),
            Error::UnsupportedOperation { .. }
        ));
        assert!(matches!(
            driver.do_erase(0, 1, false).unwrap_err(),
            Error::UnsupportedOperation { .. }
        ));
        assert!(mock.written().is_empty());
    }

    #[test]
    fn pseudo_fls_headers_have_family_sizes_and_crcs() {
        let mock = MockTransport::new();
        let body = vec![0xA5u8; 512];

        let (w600, _) = flasher(ChipFamily::W600, &mock);
        let image600 = w600.build_pseudo_fls(&body);
        assert_eq!(image600.len(), 44 + body.len());

        let (w800, _) = flasher(ChipFamily::W800, &mock);
        let image800 = w800.build_pseudo_fls(&body);
        assert_eq!(image800.len(), 48 + body.len());

        for (image, header_len) in [(&image600, 44usize), (&image800, 48)] {
            assert_eq!(&image[..4], &0xA0FF_FF9Fu32.to_le_bytes());
            let payload_crc =
                u32::from_le_bytes(image[32..36].try_into().unwrap());
            assert_eq!(payload_crc, crc32(0xFFFF_FFFF, &body));
            let header_crc = u32::from_le_bytes(
                image[header_len - 4..header_len].try_into().unwrap(),
            );
            assert_eq!(header_crc, crc32(0xFFFF_FFFF, &image[..header_len - 4]));
            assert_eq!(&image[header_len..], &body[..]);
        }
    }

    #[test]
    fn raw_backup_is_carved_and_wrapped() {
        let mock = MockTransport::new();
        script_w800_session(&mock);

        let mut raw = vec![0u8; RAW_IMAGE_MIN];
        raw[RAW_BODY_OFFSET..RAW_BODY_OFFSET + 4].copy_from_slice(&SECBOOT_MAGIC);

        let image_len = 48 + (RAW_IMAGE_MIN - RAW_BODY_OFFSET);
        script_xmodem(&mock, image_len.div_ceil(crate::xmodem::BLOCK_LEN), &[]);

        let (mut driver, events) = flasher(ChipFamily::W800, &mock);
        driver.begin().unwrap();
        // The stub keeps spewing initiation marks between transfers.
        mock.push_rx(b"C");
        driver.do_write(0, &raw).unwrap();

        assert!(mock.script_exhausted());
        assert!(events.log_contains("Firmware transferred"));

        // The first XMODEM packet after the stub upload starts with the
        // pseudo-FLS magic.
        let stub = stubs::w800_stub().unwrap();
        let firmware_packets: Vec<Vec<u8>> = mock
            .written()
            .into_iter()
            .filter(|w| w.first() == Some(&STX))
            .skip(stub.len().div_ceil(crate::xmodem::BLOCK_LEN))
            .collect();
        assert_eq!(&firmware_packets[0][3..7], &0xA0FF_FF9Fu32.to_le_bytes());
    }

    #[test]
    fn raw_backup_without_secboot_header_is_refused() {
        let mock = MockTransport::new();
        let (mut driver, _) = flasher(ChipFamily::W800, &mock);

        let raw = vec![0u8; RAW_IMAGE_MIN];
        assert!(matches!(
            driver.run_write(0, &raw).unwrap_err(),
            Error::InvalidInput(_)
        ));
        // Rejected before any bytes hit the wire
        assert!(mock.written().is_empty());
    }

    #[test]
    fn fls_images_pass_through_unchanged() {
        let mock = MockTransport::new();
        let (driver, _) = flasher(ChipFamily::W800, &mock);

        let mut fls = SECBOOT_MAGIC.to_vec();
        fls.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(driver.prepare_image(&fls).unwrap(), fls);
    }
}
