//! BL602/702/616-family driver
//!
//! The Bouffalo BootROM frames every command as `op | checksum | len16 |
//! payload` and answers with two ASCII bytes: `OK`, `FL` (failure, followed
//! by an error code) or `PD` (pending, poll again). BL602/702 first receive
//! the eflash loader into RAM; BL616 talks flash commands directly after a
//! clock configuration. Reads and writes are verified with the device-side
//! SHA-256 command.

use std::thread::sleep;
use std::time::Duration;

use crate::bootheader::{self, build_boot_header, ClockConfig, FlashConfig};
use crate::checksum::sha256;
use crate::connection::Connection;
use crate::error::{Error, ProtocolError, VerificationError};
use crate::flasher::{
    CancelToken, EventSink, Flasher, FlasherEvents, FlasherState, FlashOpts, SECTOR_SIZE,
};
use crate::partition::PartitionTable;
use crate::stubs;
use crate::targets::ChipFamily;

const CMD_GET_BOOT_INFO: u8 = 0x10;
const CMD_LOAD_BOOT_HEADER: u8 = 0x11;
const CMD_LOAD_SEGMENT_HEADER: u8 = 0x17;
const CMD_LOAD_SEGMENT_DATA: u8 = 0x18;
const CMD_CHECK_IMAGE: u8 = 0x19;
const CMD_RUN_IMAGE: u8 = 0x1A;
const CMD_FLASH_ERASE: u8 = 0x30;
const CMD_FLASH_WRITE: u8 = 0x31;
const CMD_FLASH_READ: u8 = 0x32;
const CMD_CLOCK_CONFIG: u8 = 0x3B;
const CMD_FLASH_CHIP_ERASE: u8 = 0x3C;
const CMD_FLASH_SHA256: u8 = 0x3D;
const CMD_FLASH_READ_JEDEC: u8 = 0x36;

const SYNC_BYTE: u8 = 0x55;
const SYNC_LEN: usize = 16;
const SYNC_TIMEOUT: Duration = Duration::from_millis(75);
const SYNC_ATTEMPTS: usize = 1000;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const ERASE_TIMEOUT: Duration = Duration::from_secs(30);
const PEND_POLL: Duration = Duration::from_millis(20);
const PEND_POLLS_MAX: usize = 500;

/// Write chunks carry a 4-byte address, so the data share is 4092.
const WRITE_CHUNK: usize = 4092;
const READ_CHUNK: usize = 4096;

// Loader image layout inside the bundled asset.
const LOADER_HEADER_LEN: usize = 176;
const LOADER_SEGMENT_HEADER_LEN: usize = 16;

/// Driver for the BL602/BL702/BL616 family
pub struct Bl602Flasher {
    family: ChipFamily,
    conn: Connection,
    sink: EventSink,
    cancel: CancelToken,
    flash_size: u32,
    read_buf: Option<Vec<u8>>,
    prepared: bool,
}

impl Bl602Flasher {
    pub fn new(
        family: ChipFamily,
        transport: Box<dyn crate::transport::Transport>,
        opts: FlashOpts,
        events: Box<dyn FlasherEvents>,
        cancel: CancelToken,
    ) -> Self {
        debug_assert!(family.is_bl());
        Bl602Flasher {
            family,
            conn: Connection::new(transport, opts.read_timeout_multiplier),
            sink: EventSink::new(events),
            cancel,
            flash_size: 2 * 1024 * 1024,
            read_buf: None,
            prepared: false,
        }
    }

    // -- framing ---------------------------------------------------------

    fn build_command(op: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u16;
        let len_bytes = len.to_le_bytes();
        let checksum = payload
            .iter()
            .chain(len_bytes.iter())
            .fold(0u8, |acc, &b| acc.wrapping_add(b));

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.push(op);
        frame.push(checksum);
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(payload);
        frame
    }

    /// Read the `OK`/`FL`/`PD` status, polling through pending states
    fn read_status(&mut self, command: &'static str, timeout: Duration) -> Result<(), Error> {
        for _ in 0..PEND_POLLS_MAX {
            let status = self.conn.read_exact(2, timeout, command)?;
            match &status[..] {
                b"OK" => return Ok(()),
                b"FL" => {
                    let code = self.conn.try_read_exact(2, COMMAND_TIMEOUT)?;
                    let status = code.map(|c| c[0]).unwrap_or(0xFF);
                    return Err(ProtocolError::Status { command, status }.into());
                }
                b"PD" => sleep(PEND_POLL),
                other => {
                    return Err(ProtocolError::framing(
                        command,
                        format!("unexpected status bytes {other:02x?}"),
                    )
                    .into())
                }
            }
        }
        Err(ProtocolError::Timeout {
            command,
            timeout_ms: (PEND_POLL * PEND_POLLS_MAX as u32).as_millis() as u64,
        }
        .into())
    }

    fn command(
        &mut self,
        command: &'static str,
        op: u8,
        payload: &[u8],
        expect_data: bool,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        self.conn.write(&Self::build_command(op, payload))?;
        self.read_status(command, timeout)?;

        if !expect_data {
            return Ok(Vec::new());
        }
        let len = self.conn.read_exact(2, timeout, command)?;
        let len = u16::from_le_bytes([len[0], len[1]]) as usize;
        self.conn.read_exact(len, timeout, command)
    }

    // -- sync ------------------------------------------------------------

    /// RTS/DTR dance that drags the boot pin low through a reset
    fn pulse_into_bootloader(&mut self) {
        self.conn.set_rts(true);
        sleep(Duration::from_millis(100));
        self.conn.set_dtr(true);
        sleep(Duration::from_millis(100));
        self.conn.set_dtr(false);
        sleep(Duration::from_millis(100));
        self.conn.set_rts(false);
        sleep(Duration::from_millis(500));
        self.conn.drain();
    }

    fn sync_once(&mut self) -> Result<(), Error> {
        self.conn.write(&[SYNC_BYTE; SYNC_LEN])?;
        if self.conn.read_until_prefix(b"OK", SYNC_TIMEOUT)? {
            let _ = self.conn.read_exact(2, SYNC_TIMEOUT, "Sync")?;
            self.conn.drain();
            return Ok(());
        }
        Err(Error::SyncFailed)
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.pulse_into_bootloader();
        for attempt in 0..SYNC_ATTEMPTS {
            self.cancel.check()?;
            if attempt > 0 && attempt % 10 == 0 {
                self.pulse_into_bootloader();
            }
            if self.sync_once().is_ok() {
                self.sink.info("Synchronized with bootrom");
                return Ok(());
            }
        }
        Err(Error::SyncFailed)
    }

    // -- identification --------------------------------------------------

    /// Opcode 0x10: bootrom version, whose leading hex digits name the die
    fn detect_variant(&mut self) -> Result<(), Error> {
        let info = self.command(
            "GetBootInfo",
            CMD_GET_BOOT_INFO,
            &[],
            true,
            COMMAND_TIMEOUT,
        )?;
        if info.len() < 4 {
            return Err(ProtocolError::framing("GetBootInfo", "short boot info").into());
        }

        let version = u32::from_le_bytes(info[..4].try_into().unwrap());
        let hex = format!("{version:x}");
        let detected = if ["702", "704", "706"].iter().any(|p| hex.starts_with(p)) {
            ChipFamily::BL702
        } else if ["616", "618"].iter().any(|p| hex.starts_with(p)) {
            ChipFamily::BL616
        } else {
            ChipFamily::BL602
        };

        self.sink
            .info(&format!("Bootrom version {version:#010x}"));
        if detected != self.family {
            self.sink.warning(&format!(
                "Requested {} but the bootrom identifies as {detected}",
                self.family
            ));
            self.family = detected;
        }
        Ok(())
    }

    fn identify_flash(&mut self) -> Result<(), Error> {
        let id = self.command(
            "FlashReadJedec",
            CMD_FLASH_READ_JEDEC,
            &[],
            true,
            COMMAND_TIMEOUT,
        )?;
        if id.len() < 4 {
            return Err(ProtocolError::framing("FlashReadJedec", "short JEDEC id").into());
        }

        let capacity = id[3];
        if capacity < 0x14 {
            return Err(ProtocolError::framing(
                "FlashReadJedec",
                format!("implausible capacity byte {capacity:#04x}"),
            )
            .into());
        }
        let size_mb = (1u64 << (capacity - 0x11)) / 8;
        self.flash_size = (size_mb * 1024 * 1024) as u32;
        self.sink
            .info(&format!("Flash size: {size_mb} MB"));
        Ok(())
    }

    // -- eflash loader ---------------------------------------------------

    /// Stream the bundled loader into RAM and start it (BL602/702)
    fn upload_eflash_loader(&mut self) -> Result<(), Error> {
        let loader = stubs::bl_eflash_loader(self.family)?;
        if loader.len() <= LOADER_HEADER_LEN + LOADER_SEGMENT_HEADER_LEN {
            return Err(Error::MalformedAsset("eflash loader image"));
        }

        self.sink.info("Uploading eflash loader");
        let (header, rest) = loader.split_at(LOADER_HEADER_LEN);
        let (segment_header, data) = rest.split_at(LOADER_SEGMENT_HEADER_LEN);

        self.command(
            "LoadBootHeader",
            CMD_LOAD_BOOT_HEADER,
            header,
            false,
            COMMAND_TIMEOUT,
        )?;
        self.command(
            "LoadSegmentHeader",
            CMD_LOAD_SEGMENT_HEADER,
            segment_header,
            false,
            COMMAND_TIMEOUT,
        )?;

        for chunk in data.chunks(WRITE_CHUNK) {
            self.cancel.check()?;
            self.command(
                "LoadSegmentData",
                CMD_LOAD_SEGMENT_DATA,
                chunk,
                false,
                COMMAND_TIMEOUT,
            )?;
        }

        self.command("CheckImage", CMD_CHECK_IMAGE, &[], false, COMMAND_TIMEOUT)?;
        self.command("RunImage", CMD_RUN_IMAGE, &[], false, COMMAND_TIMEOUT)?;

        // Give the loader time to take over the UART.
        sleep(Duration::from_millis(100));
        self.conn.drain();
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
        self.detect_variant()?;

        self.sink.set_state(FlasherState::Configuring);
        if self.family == ChipFamily::BL616 {
            self.command(
                "ClockConfig",
                CMD_CLOCK_CONFIG,
                &[0u8; 8],
                false,
                COMMAND_TIMEOUT,
            )?;
        } else {
            self.upload_eflash_loader()?;
        }
        self.identify_flash()?;

        self.prepared = true;
        Ok(())
    }

    // -- verification ----------------------------------------------------

    fn verify_sha256(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&addr.to_le_bytes());
        payload[4..].copy_from_slice(&(data.len() as u32).to_le_bytes());

        let device = self.command(
            "FlashSha256",
            CMD_FLASH_SHA256,
            &payload,
            true,
            ERASE_TIMEOUT,
        )?;
        if device.len() != 32 {
            return Err(
                ProtocolError::framing("FlashSha256", "digest is not 32 bytes").into(),
            );
        }

        if device[..] != sha256(data) {
            return Err(VerificationError::Sha256.into());
        }
        self.sink.success("SHA-256 matches!");
        Ok(())
    }

    // -- operations ------------------------------------------------------

    fn run_read(
        &mut self,
        start_sector: u32,
        sectors: u32,
        full_read: bool,
    ) -> Result<(), Error> {
        self.begin()?;

        if full_read {
            return self.run_read_amount(0, self.flash_size as usize);
        }
        let start = start_sector * SECTOR_SIZE as u32;
        let amount = sectors as usize * SECTOR_SIZE;
        self.run_read_amount(start, amount)
    }

    /// Byte-granular read used by both the sector API and tests; the last
    /// chunk may be shorter than 4096.
    fn run_read_amount(&mut self, start: u32, amount: usize) -> Result<(), Error> {
        self.begin()?;

        self.sink.set_state(FlasherState::Working);
        self.sink
            .progress_init(start, amount.div_ceil(READ_CHUNK));

        let mut buf: Vec<u8> = Vec::with_capacity(amount);
        let mut chunk_index = 0usize;
        while buf.len() < amount {
            self.cancel.check()?;
            let addr = start + buf.len() as u32;
            let wanted = (amount - buf.len()).min(READ_CHUNK);

            let mut payload = [0u8; 8];
            payload[..4].copy_from_slice(&addr.to_le_bytes());
            payload[4..].copy_from_slice(&(wanted as u32).to_le_bytes());
            let chunk = self.command(
                "FlashRead",
                CMD_FLASH_READ,
                &payload,
                true,
                COMMAND_TIMEOUT,
            )?;

            if chunk.len() != wanted {
                // The loader lost its framing; bring it back in step and
                // retry this chunk.
                self.sink
                    .warning(&format!("Short read at {addr:#x}, re-syncing"));
                self.sync_once()?;
                continue;
            }

            buf.extend_from_slice(&chunk);
            chunk_index += 1;
            self.sink.progress_update(chunk_index);
        }
        self.sink.progress_finish();

        self.sink.set_state(FlasherState::Verifying);
        self.verify_sha256(start, &buf)?;

        self.read_buf = Some(buf);
        Ok(())
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.begin()?;

        self.sink.set_state(FlasherState::Working);
        self.sink.info(&format!(
            "Erasing {:#x} bytes at {offset:#x}",
            data.len()
        ));

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&offset.to_le_bytes());
        payload[4..].copy_from_slice(&(offset + data.len() as u32 - 1).to_le_bytes());
        self.command(
            "FlashErase",
            CMD_FLASH_ERASE,
            &payload,
            false,
            ERASE_TIMEOUT,
        )?;

        self.sink
            .progress_init(offset, data.len().div_ceil(WRITE_CHUNK));
        for (i, chunk) in data.chunks(WRITE_CHUNK).enumerate() {
            self.cancel.check()?;
            let addr = offset + (i * WRITE_CHUNK) as u32;
            let mut payload = Vec::with_capacity(4 + chunk.len());
            payload.extend_from_slice(&addr.to_le_bytes());
            payload.extend_from_slice(chunk);
            self.command(
                "FlashWrite",
                CMD_FLASH_WRITE,
                &payload,
                false,
                COMMAND_TIMEOUT,
            )?;
            self.sink.progress_update(i + 1);
        }
        self.sink.progress_finish();

        self.sink.set_state(FlasherState::Verifying);
        self.verify_sha256(offset, data)
    }

    fn run_erase(
        &mut self,
        start_sector: u32,
        sectors: u32,
        erase_all: bool,
    ) -> Result<bool, Error> {
        self.begin()?;

        self.sink.set_state(FlasherState::Working);
        if erase_all {
            self.sink.info("Erasing the whole flash");
            self.command(
                "FlashChipErase",
                CMD_FLASH_CHIP_ERASE,
                &[],
                false,
                ERASE_TIMEOUT,
            )?;
            return Ok(true);
        }

        let start = start_sector * SECTOR_SIZE as u32;
        let end = start + sectors * SECTOR_SIZE as u32;
        self.sink.info(&format!("Erasing {start:#x}..{end:#x}"));
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&start.to_le_bytes());
        payload[4..].copy_from_slice(&(end - 1).to_le_bytes());
        self.command(
            "FlashErase",
            CMD_FLASH_ERASE,
            &payload,
            false,
            ERASE_TIMEOUT,
        )?;
        Ok(true)
    }

    /// Wrap a bare firmware into a bootable image: boot header at 0, the
    /// body at [bootheader::IMAGE_START], partition table at 0xE000.
    ///
    /// Only firmware that stays below the partition table can be wrapped;
    /// larger images are expected to already be full flash images.
    pub fn build_boot_image(&self, firmware: &[u8]) -> Result<Vec<u8>, Error> {
        let fw_end = bootheader::IMAGE_START as usize + firmware.len();
        if fw_end > bootheader::PARTITION_TABLE_OFFSET as usize {
            return Err(Error::InvalidInput(format!(
                "firmware of {:#x} bytes does not fit below the partition table",
                firmware.len()
            )));
        }

        let header = build_boot_header(
            firmware,
            &FlashConfig::default_for(0xEF4015),
            &ClockConfig::default(),
        );
        let table = PartitionTable::default_layout(self.flash_size);
        table.validate(self.flash_size)?;
        let table_bytes = table.build()?;

        let mut image =
            vec![0xFFu8; bootheader::PARTITION_TABLE_OFFSET as usize + table_bytes.len()];
        image[..header.len()].copy_from_slice(&header);
        image[bootheader::IMAGE_START as usize..fw_end].copy_from_slice(firmware);
        image[bootheader::PARTITION_TABLE_OFFSET as usize..].copy_from_slice(&table_bytes);
        Ok(image)
    }
}

impl Flasher for Bl602Flasher {
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
        start_sector: u32,
        sectors: u32,
        erase_all: bool,
    ) -> Result<bool, Error> {
        let result = self.run_erase(start_sector, sectors, erase_all);
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

    fn ok() -> Vec<u8> {
        b"OK".to_vec()
    }

    fn ok_with(data: &[u8]) -> Vec<u8> {
        let mut resp = b"OK".to_vec();
        resp.extend_from_slice(&(data.len() as u16).to_le_bytes());
        resp.extend_from_slice(data);
        resp
    }

    fn expect_op(mock: &MockTransport, op: u8, response: Vec<u8>) {
        mock.expect(move |w: &[u8]| w.first() == Some(&op), response);
    }

    fn script_session(mock: &MockTransport, bootrom: u32, capacity: u8) {
        // sync
        mock.expect(|w: &[u8]| w == [SYNC_BYTE; SYNC_LEN], ok());
        // boot info: version + 16 opaque bytes
        let mut info = bootrom.to_le_bytes().to_vec();
        info.extend_from_slice(&[0u8; 16]);
        expect_op(mock, CMD_GET_BOOT_INFO, ok_with(&info));
        // eflash loader upload
        expect_op(mock, CMD_LOAD_BOOT_HEADER, ok());
        expect_op(mock, CMD_LOAD_SEGMENT_HEADER, ok());
        let data_len = stubs::bl_eflash_loader(ChipFamily::BL602).unwrap().len()
            - LOADER_HEADER_LEN
            - LOADER_SEGMENT_HEADER_LEN;
        for _ in 0..data_len.div_ceil(WRITE_CHUNK) {
            expect_op(mock, CMD_LOAD_SEGMENT_DATA, ok());
        }
        expect_op(mock, CMD_CHECK_IMAGE, ok());
        expect_op(mock, CMD_RUN_IMAGE, ok());
        // JEDEC id
        expect_op(mock, CMD_FLASH_READ_JEDEC, ok_with(&[0xEF, 0x40, 0x15, capacity]));
    }

    fn flasher(mock: &MockTransport) -> (Bl602Flasher, RecordingEvents) {
        let events = RecordingEvents::new();
        let driver = Bl602Flasher::new(
            ChipFamily::BL602,
            Box::new(mock.clone()),
            FlashOpts::default(),
            Box::new(events.clone()),
            CancelToken::new(),
        );
        (driver, events)
    }

    #[test]
    fn command_frames_carry_checksum_and_length() {
        let frame = Bl602Flasher::build_command(0x32, &[0x01, 0x02]);
        let checksum = 0x01u8
            .wrapping_add(0x02)
            .wrapping_add(0x02) // len_lo
            .wrapping_add(0x00); // len_hi
        assert_eq!(frame, vec![0x32, checksum, 0x02, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn read_handles_a_tail_shorter_than_one_chunk() {
        let mock = MockTransport::new();
        script_session(&mock, 0x0602_0001, 0x15);

        let chunk_a = vec![0xA1u8; READ_CHUNK];
        let chunk_b = vec![0xB2u8; 100];
        expect_op(&mock, CMD_FLASH_READ, ok_with(&chunk_a));
        expect_op(&mock, CMD_FLASH_READ, ok_with(&chunk_b));

        let mut image = chunk_a.clone();
        image.extend_from_slice(&chunk_b);
        expect_op(&mock, CMD_FLASH_SHA256, ok_with(&sha256(&image)));

        let (mut driver, events) = flasher(&mock);
        driver.run_read_amount(0, READ_CHUNK + 100).unwrap();
        let _ = driver.sink.finish("Read", Ok::<(), Error>(()));

        assert_eq!(driver.read_result().unwrap(), image.as_slice());
        assert!(events.log_contains("SHA-256 matches"));
        assert!(mock.script_exhausted());

        // The tail request asked for exactly 100 bytes
        let tail_req = mock
            .written()
            .into_iter()
            .filter(|w| w.first() == Some(&CMD_FLASH_READ))
            .last()
            .unwrap();
        assert_eq!(&tail_req[8..12], &100u32.to_le_bytes());
    }

    #[test]
    fn short_chunk_triggers_a_resync_and_retry() {
        let mock = MockTransport::new();
        script_session(&mock, 0x0602_0001, 0x15);

        let chunk = vec![0xC3u8; READ_CHUNK];
        // First attempt comes back short, then a sync, then the real chunk
        expect_op(&mock, CMD_FLASH_READ, ok_with(&chunk[..100]));
        mock.expect(|w: &[u8]| w == [SYNC_BYTE; SYNC_LEN], ok());
        expect_op(&mock, CMD_FLASH_READ, ok_with(&chunk));
        expect_op(&mock, CMD_FLASH_SHA256, ok_with(&sha256(&chunk)));

        let (mut driver, events) = flasher(&mock);
        driver.run_read_amount(0, READ_CHUNK).unwrap();

        assert!(events.log_contains("re-syncing"));
        assert!(mock.script_exhausted());
    }

    #[test]
    fn write_erases_streams_chunks_and_verifies() {
        let mock = MockTransport::new();
        script_session(&mock, 0x0602_0001, 0x15);

        let data = vec![0x5Au8; 0x10000];
        expect_op(&mock, CMD_FLASH_ERASE, ok());
        for _ in 0..data.len().div_ceil(WRITE_CHUNK) {
            expect_op(&mock, CMD_FLASH_WRITE, ok());
        }
        expect_op(&mock, CMD_FLASH_SHA256, ok_with(&sha256(&data)));

        let (mut driver, events) = flasher(&mock);
        driver.do_write(0, &data).unwrap();

        assert!(mock.script_exhausted());
        assert!(events.log_contains("SHA-256 matches"));

        // Erase range is inclusive of the last byte only
        let erase_req = mock
            .written()
            .into_iter()
            .find(|w| w.first() == Some(&CMD_FLASH_ERASE))
            .unwrap();
        assert_eq!(&erase_req[4..8], &0u32.to_le_bytes());
        assert_eq!(&erase_req[8..12], &0xFFFFu32.to_le_bytes());
    }

    #[test]
    fn sha_mismatch_fails_the_operation() {
        let mock = MockTransport::new();
        script_session(&mock, 0x0602_0001, 0x15);

        let chunk = vec![0x11u8; READ_CHUNK];
        expect_op(&mock, CMD_FLASH_READ, ok_with(&chunk));
        expect_op(&mock, CMD_FLASH_SHA256, ok_with(&[0u8; 32]));

        let (mut driver, _) = flasher(&mock);
        assert!(matches!(
            driver.run_read_amount(0, READ_CHUNK).unwrap_err(),
            Error::Verification(VerificationError::Sha256)
        ));
    }

    #[test]
    fn failure_status_carries_the_device_code() {
        let mock = MockTransport::new();
        mock.expect(|w: &[u8]| w == [SYNC_BYTE; SYNC_LEN], ok());
        let mut failure = b"FL".to_vec();
        failure.extend_from_slice(&[0x07, 0x00]);
        expect_op(&mock, CMD_GET_BOOT_INFO, failure);

        let (mut driver, _) = flasher(&mock);
        assert!(matches!(
            driver.begin().unwrap_err(),
            Error::Protocol(ProtocolError::Status { status: 0x07, .. })
        ));
    }

    #[test]
    fn pending_status_is_polled_until_ok() {
        let mock = MockTransport::new();
        mock.expect(|w: &[u8]| w == [SYNC_BYTE; SYNC_LEN], ok());
        // PD twice, then the real answer; the extra bytes arrive unsolicited
        let mut response = b"PD".to_vec();
        response.extend_from_slice(b"PD");
        response.extend_from_slice(&ok_with(&{
            let mut info = 0x0602_0001u32.to_le_bytes().to_vec();
            info.extend_from_slice(&[0u8; 16]);
            info
        }));
        expect_op(&mock, CMD_GET_BOOT_INFO, response);

        let (mut driver, _) = flasher(&mock);
        driver.sync().unwrap();
        driver.detect_variant().unwrap();
    }

    #[test]
    fn bootrom_version_selects_the_variant() {
        for (version, expected) in [
            (0x0602_0001u32, ChipFamily::BL602),
            (0x0702_0100, ChipFamily::BL702),
            (0x0616_0000, ChipFamily::BL616),
        ] {
            let mock = MockTransport::new();
            mock.expect(|w: &[u8]| w == [SYNC_BYTE; SYNC_LEN], ok());
            let mut info = version.to_le_bytes().to_vec();
            info.extend_from_slice(&[0u8; 16]);
            expect_op(&mock, CMD_GET_BOOT_INFO, ok_with(&info));

            let (mut driver, _) = flasher(&mock);
            driver.sync().unwrap();
            driver.detect_variant().unwrap();
            assert_eq!(driver.family, expected, "version {version:#x}");
        }
    }

    #[test]
    fn boot_image_wraps_header_firmware_and_partition_table() {
        let mock = MockTransport::new();
        let (driver, _) = flasher(&mock);

        let firmware = vec![0x42u8; 0x3000];
        let image = driver.build_boot_image(&firmware).unwrap();

        assert_eq!(
            u32::from_le_bytes(image[0..4].try_into().unwrap()),
            bootheader::BOOT_HEADER_MAGIC
        );
        let fw_start = bootheader::IMAGE_START as usize;
        assert_eq!(&image[fw_start..fw_start + firmware.len()], &firmware[..]);

        let table_start = bootheader::PARTITION_TABLE_OFFSET as usize;
        PartitionTable::parse(&image[table_start..]).unwrap();
    }

    #[test]
    fn oversized_firmware_cannot_be_wrapped() {
        let mock = MockTransport::new();
        let (driver, _) = flasher(&mock);
        assert!(driver.build_boot_image(&vec![0u8; 0xE000]).is_err());
    }
}
