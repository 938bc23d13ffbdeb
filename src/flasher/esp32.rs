//! ESP32 / ESP32-S3 / ESP32-C3 driver
//!
//! Commands travel as SLIP frames: `00 | op | len16 | checksum32 | data`
//! out, `01 | op | len16 | value32 | data | status` back. The driver resets
//! the chip into its ROM bootloader over DTR/RTS, uploads the flasher stub
//! for fast transfers, reads the flash ID by driving the on-chip SPI
//! controller through register writes, and verifies writes and stub reads
//! with MD5.

use std::collections::VecDeque;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::debug;

use crate::checksum::md5;
use crate::connection::Connection;
use crate::error::{Error, ProtocolError, VerificationError};
use crate::flasher::{
    CancelToken, EventSink, Flasher, FlasherEvents, FlasherState, FlashOpts, SECTOR_SIZE,
};
use crate::slip::{self, SlipDecoder};
use crate::stubs::EspStub;
use crate::targets::ChipFamily;

const CMD_FLASH_BEGIN: u8 = 0x02;
const CMD_FLASH_DATA: u8 = 0x03;
const CMD_FLASH_END: u8 = 0x04;
const CMD_MEM_BEGIN: u8 = 0x05;
const CMD_MEM_END: u8 = 0x06;
const CMD_MEM_DATA: u8 = 0x07;
const CMD_SYNC: u8 = 0x08;
const CMD_WRITE_REG: u8 = 0x09;
const CMD_READ_REG: u8 = 0x0A;
const CMD_SPI_ATTACH: u8 = 0x0D;
const CMD_READ_FLASH_SLOW: u8 = 0x0E;
const CMD_CHANGE_BAUDRATE: u8 = 0x0F;
const CMD_SPI_FLASH_MD5: u8 = 0x13;
const CMD_GET_SECURITY_INFO: u8 = 0x14;
// Stub-only commands
const CMD_ERASE_FLASH: u8 = 0xD0;
const CMD_ERASE_REGION: u8 = 0xD1;
const CMD_READ_FLASH: u8 = 0xD2;

const CHECKSUM_INIT: u8 = 0xEF;
const FLASH_WRITE_SIZE: usize = 0x400;
const RAM_WRITE_SIZE: usize = 0x1800;
const SLOW_READ_SIZE: usize = 64;
/// Stub read: block size and max packets in flight
const FAST_READ_BLOCK: u32 = 0x1000;
const FAST_READ_IN_FLIGHT: u32 = 64;

const SPI_CMD_RDID: u8 = 0x9F;

const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;
const MAGIC_ESP32: u32 = 0x00F0_1D83;
const MAGIC_ESP32S2: u32 = 0x0000_07C6;
const MAGIC_ESP8266: u32 = 0xFFF0_C101;

const SECURITY_INFO_CHIP_ID_ESP32S3: u32 = 9;
const SECURITY_INFO_CHIP_ID_ESP32C3: u32 = 5;

const SYNC_TIMEOUT: Duration = Duration::from_millis(300);
const SYNC_EXTRA_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const STUB_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ERASE_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const RESET_ATTEMPTS: usize = 4;
const SYNC_ATTEMPTS: usize = 10;
const BLOCK_RETRIES: usize = 3;

const EXPECTED_STUB_HANDSHAKE: &[u8] = b"OHAI";
const LINK_BAUD: u32 = 115_200;

/// Register map of the on-chip SPI controller
struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    fn cmd(&self) -> u32 {
        self.base
    }

    fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|o| self.base + o)
    }

    fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|o| self.base + o)
    }
}

/// Driver for ESP32, ESP32-S3 and ESP32-C3
pub struct Esp32Flasher {
    family: ChipFamily,
    conn: Connection,
    opts: FlashOpts,
    sink: EventSink,
    cancel: CancelToken,
    decoder: SlipDecoder,
    pending_frames: VecDeque<Vec<u8>>,
    stub_running: bool,
    flash_size: u32,
    read_buf: Option<Vec<u8>>,
    prepared: bool,
}

impl Esp32Flasher {
    pub fn new(
        family: ChipFamily,
        transport: Box<dyn crate::transport::Transport>,
        opts: FlashOpts,
        events: Box<dyn FlasherEvents>,
        cancel: CancelToken,
    ) -> Self {
        debug_assert!(family.is_esp());
        Esp32Flasher {
            family,
            conn: Connection::new(transport, opts.read_timeout_multiplier),
            opts,
            sink: EventSink::new(events),
            cancel,
            decoder: SlipDecoder::new(),
            pending_frames: VecDeque::new(),
            stub_running: false,
            flash_size: 4 * 1024 * 1024,
            read_buf: None,
            prepared: false,
        }
    }

    // -- framing ---------------------------------------------------------

    fn send_command(&mut self, op: u8, checksum: u32, payload: &[u8]) -> Result<(), Error> {
        let mut packet = Vec::with_capacity(8 + payload.len());
        packet.push(0x00);
        packet.push(op);
        packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        packet.extend_from_slice(&checksum.to_le_bytes());
        packet.extend_from_slice(payload);
        self.conn.write(&slip::encode(&packet))
    }

    /// Next SLIP frame from the stream, across whatever chunking the
    /// transport applies
    fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        if let Some(frame) = self.pending_frames.pop_front() {
            return Ok(frame);
        }

        let deadline = Instant::now() + self.conn.effective_timeout(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProtocolError::Timeout {
                    command: "slip frame",
                    timeout_ms: self.conn.effective_timeout(timeout).as_millis() as u64,
                }
                .into());
            }

            let chunk = self.conn.read_some(remaining.min(Duration::from_millis(50)))?;
            if chunk.is_empty() {
                continue;
            }
            self.pending_frames
                .extend(self.decoder.push_slice(&chunk));
            if let Some(frame) = self.pending_frames.pop_front() {
                return Ok(frame);
            }
        }
    }

    /// Await the response for `op`, skipping unrelated frames
    fn read_response(
        &mut self,
        command: &'static str,
        op: u8,
        timeout: Duration,
    ) -> Result<(u32, Vec<u8>), Error> {
        for _ in 0..100 {
            let frame = self.read_frame(timeout)?;
            if frame.len() < 10 || frame[0] != 0x01 {
                debug!("Skipping non-response frame of {} bytes", frame.len());
                continue;
            }
            if frame[1] != op {
                continue;
            }

            let value = u32::from_le_bytes(frame[4..8].try_into().unwrap());
            let body = &frame[8..];
            let (data, status) = body.split_at(body.len() - 2);
            if status[0] != 0 {
                return Err(ProtocolError::Status {
                    command,
                    status: status[1],
                }
                .into());
            }
            return Ok((value, data.to_vec()));
        }
        Err(ProtocolError::framing(command, "no matching response frame").into())
    }

    fn command(
        &mut self,
        command: &'static str,
        op: u8,
        checksum: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(u32, Vec<u8>), Error> {
        self.send_command(op, checksum, payload)?;
        self.read_response(command, op, timeout)
    }

    fn xor_checksum(data: &[u8]) -> u8 {
        data.iter().fold(CHECKSUM_INIT, |acc, &b| acc ^ b)
    }

    // -- reset & sync ----------------------------------------------------

    /// Classic DTR/RTS entry into the serial bootloader
    fn reset_into_bootloader(&mut self) {
        self.conn.set_dtr(false);
        self.conn.set_rts(true);
        sleep(Duration::from_millis(100));
        self.conn.set_dtr(true);
        self.conn.set_rts(false);
        sleep(Duration::from_millis(500));
        self.conn.drain();
        self.decoder.reset();
        self.pending_frames.clear();
    }

    fn sync_once(&mut self) -> Result<(), Error> {
        let mut payload = vec![0x07, 0x07, 0x12, 0x20];
        payload.extend_from_slice(&[0x55; 32]);
        self.command("Sync", CMD_SYNC, 0, &payload, SYNC_TIMEOUT)?;

        // The ROM answers a burst of sync acknowledgements; swallow the
        // stragglers so they do not confuse the next command.
        for _ in 0..7 {
            if self.read_frame(SYNC_EXTRA_TIMEOUT).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        for _ in 0..RESET_ATTEMPTS {
            self.cancel.check()?;
            self.reset_into_bootloader();
            for _ in 0..SYNC_ATTEMPTS {
                self.cancel.check()?;
                if self.sync_once().is_ok() {
                    self.sink.info("Synchronized with bootloader");
                    return Ok(());
                }
            }
        }
        Err(Error::SyncFailed)
    }

    // -- registers and SPI controller ------------------------------------

    fn read_reg(&mut self, addr: u32) -> Result<u32, Error> {
        let (value, _) = self.command(
            "ReadReg",
            CMD_READ_REG,
            0,
            &addr.to_le_bytes(),
            DEFAULT_TIMEOUT,
        )?;
        Ok(value)
    }

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        payload.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // mask
        payload.extend_from_slice(&0u32.to_le_bytes()); // delay
        self.command("WriteReg", CMD_WRITE_REG, 0, &payload, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn spi_registers(&self) -> SpiRegisters {
        match self.family {
            ChipFamily::ESP32 => SpiRegisters {
                base: 0x3FF4_2000,
                usr_offset: 0x1C,
                usr1_offset: 0x20,
                usr2_offset: 0x24,
                w0_offset: 0x80,
                mosi_length_offset: None,
                miso_length_offset: None,
            },
            _ => SpiRegisters {
                base: 0x6000_2000,
                usr_offset: 0x18,
                usr1_offset: 0x1C,
                usr2_offset: 0x20,
                w0_offset: 0x58,
                mosi_length_offset: Some(0x24),
                miso_length_offset: Some(0x28),
            },
        }
    }

    fn spi_attach(&mut self) -> Result<(), Error> {
        // The ROM variant carries four extra reserved bytes.
        let payload = if self.stub_running {
            vec![0u8; 4]
        } else {
            vec![0u8; 8]
        };
        self.command("SpiAttach", CMD_SPI_ATTACH, 0, &payload, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    /// Run one SPI transaction through the controller registers
    fn spi_command(&mut self, opcode: u8, read_bits: u32) -> Result<u32, Error> {
        let regs = self.spi_registers();

        let old_usr = self.read_reg(regs.usr())?;
        let old_usr2 = self.read_reg(regs.usr2())?;

        let mut flags = 1 << 31; // USR_COMMAND
        if read_bits > 0 {
            flags |= 1 << 28; // USR_MISO
        }
        self.write_reg(regs.usr(), flags)?;
        self.write_reg(regs.usr2(), (7 << 28) | opcode as u32)?;

        if let Some(miso_length) = regs.miso_length() {
            if read_bits > 0 {
                self.write_reg(miso_length, read_bits - 1)?;
            }
        } else {
            let miso_mask = if read_bits == 0 { 0 } else { read_bits - 1 };
            self.write_reg(regs.usr1(), miso_mask << 8)?;
        }

        self.write_reg(regs.w0(), 0)?;
        self.write_reg(regs.cmd(), 1 << 18)?; // execute

        let mut spins = 0;
        while self.read_reg(regs.cmd())? & (1 << 18) != 0 {
            spins += 1;
            if spins > 10 {
                return Err(ProtocolError::Timeout {
                    command: "SpiCommand",
                    timeout_ms: 10,
                }
                .into());
            }
            sleep(Duration::from_millis(1));
        }

        let result = self.read_reg(regs.w0())?;
        self.write_reg(regs.usr(), old_usr)?;
        self.write_reg(regs.usr2(), old_usr2)?;
        Ok(result)
    }

    // -- identification --------------------------------------------------

    fn detect_chip(&mut self) -> Result<(), Error> {
        let detected = match self.command(
            "GetSecurityInfo",
            CMD_GET_SECURITY_INFO,
            0,
            &[],
            DEFAULT_TIMEOUT,
        ) {
            Ok((_, data)) if data.len() >= 16 => {
                let chip_id = u32::from_le_bytes(data[12..16].try_into().unwrap());
                match chip_id {
                    SECURITY_INFO_CHIP_ID_ESP32C3 => Some(ChipFamily::ESP32C3),
                    SECURITY_INFO_CHIP_ID_ESP32S3 => Some(ChipFamily::ESP32S3),
                    other => {
                        debug!("Unmapped security-info chip id {other}");
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(_) => {
                // Old ROMs lack the command; fall back to the magic word.
                match self.read_reg(CHIP_DETECT_MAGIC_REG)? {
                    MAGIC_ESP32 => Some(ChipFamily::ESP32),
                    MAGIC_ESP32S2 => {
                        return Err(Error::UnrecognizedChipName("ESP32-S2".into()))
                    }
                    MAGIC_ESP8266 => {
                        return Err(Error::UnrecognizedChipName("ESP8266".into()))
                    }
                    other => {
                        debug!("Unknown chip magic {other:#010x}");
                        None
                    }
                }
            }
        };

        match detected {
            Some(family) if family == self.family => {
                self.sink.info(&format!("Detected {family}"));
            }
            Some(family) => {
                self.sink.warning(&format!(
                    "Requested {} but the device identifies as {family}",
                    self.family
                ));
                self.family = family;
            }
            None => self
                .sink
                .warning("Could not identify the chip; continuing as requested"),
        }
        Ok(())
    }

    // -- stub upload -----------------------------------------------------

    fn mem_begin(&mut self, size: u32, blocks: u32, offset: u32) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&size.to_le_bytes());
        payload.extend_from_slice(&blocks.to_le_bytes());
        payload.extend_from_slice(&(RAM_WRITE_SIZE as u32).to_le_bytes());
        payload.extend_from_slice(&offset.to_le_bytes());
        self.command("MemBegin", CMD_MEM_BEGIN, 0, &payload, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn mem_data(&mut self, sequence: u32, data: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16 + data.len());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(&sequence.to_le_bytes());
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(data);
        self.command(
            "MemData",
            CMD_MEM_DATA,
            Self::xor_checksum(data) as u32,
            &payload,
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    fn mem_end(&mut self, entry: u32) -> Result<(), Error> {
        let no_entry: u32 = if entry == 0 { 1 } else { 0 };
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&no_entry.to_le_bytes());
        payload.extend_from_slice(&entry.to_le_bytes());
        self.command("MemEnd", CMD_MEM_END, 0, &payload, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn upload_stub(&mut self) -> Result<(), Error> {
        let stub = EspStub::get(self.family)?;
        self.sink.info("Uploading flasher stub");

        for (addr, segment) in [stub.text()?, stub.data()?] {
            let blocks = segment.len().div_ceil(RAM_WRITE_SIZE);
            self.mem_begin(segment.len() as u32, blocks as u32, addr)?;
            for (seq, block) in segment.chunks(RAM_WRITE_SIZE).enumerate() {
                self.cancel.check()?;
                self.mem_data(seq as u32, block)?;
            }
        }
        self.mem_end(stub.entry())?;

        // The stub says hello once it owns the UART.
        let deadline = Instant::now() + STUB_HANDSHAKE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(
                    ProtocolError::framing("StubHandshake", "no OHAI from the stub").into(),
                );
            }
            let frame = self.read_frame(remaining)?;
            if frame == EXPECTED_STUB_HANDSHAKE {
                break;
            }
        }

        self.stub_running = true;
        self.sink.info("Stub running");
        Ok(())
    }

    // -- baud ------------------------------------------------------------

    fn change_baud(&mut self) -> Result<(), Error> {
        let target = self.opts.baud;
        if target == LINK_BAUD {
            return Ok(());
        }

        let prior = if self.stub_running { self.conn.baud() } else { 0 };
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&target.to_le_bytes());
        payload.extend_from_slice(&prior.to_le_bytes());
        self.command(
            "ChangeBaudrate",
            CMD_CHANGE_BAUDRATE,
            0,
            &payload,
            DEFAULT_TIMEOUT,
        )?;

        self.conn.set_baud(target)?;
        sleep(Duration::from_millis(50));
        self.conn.drain();
        self.decoder.reset();
        self.pending_frames.clear();
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
        self.conn.set_baud(LINK_BAUD)?;

        self.sink.set_state(FlasherState::Syncing);
        self.sync()?;

        self.sink.set_state(FlasherState::Identifying);
        self.detect_chip()?;

        self.sink.set_state(FlasherState::Configuring);
        if let Err(e) = self.upload_stub() {
            // Reads still work against the bare ROM, just slowly.
            self.sink
                .warning(&format!("Stub upload failed ({e}); staying on the ROM"));
            self.stub_running = false;
        }
        self.spi_attach()?;
        self.change_baud()?;

        let flash_id = self.spi_command(SPI_CMD_RDID, 24)?;
        let capacity = (flash_id >> 16) & 0xFF;
        if (0x12..=0x20).contains(&capacity) {
            self.flash_size = 1 << capacity;
        }
        self.sink.info(&format!(
            "Flash ID {flash_id:#08x}, size {} MB",
            self.flash_size / (1024 * 1024)
        ));

        self.prepared = true;
        Ok(())
    }

    // -- read ------------------------------------------------------------

    fn erase_timeout(size: u32) -> Duration {
        let mb = (size as u64).div_ceil(1024 * 1024);
        DEFAULT_TIMEOUT.max(ERASE_TIMEOUT_PER_MB * mb as u32)
    }

    fn run_read_fast(&mut self, start: u32, len: u32) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&start.to_le_bytes());
        payload.extend_from_slice(&len.to_le_bytes());
        payload.extend_from_slice(&FAST_READ_BLOCK.to_le_bytes());
        payload.extend_from_slice(&FAST_READ_IN_FLIGHT.to_le_bytes());
        self.command("ReadFlash", CMD_READ_FLASH, 0, &payload, DEFAULT_TIMEOUT)?;

        let mut buf: Vec<u8> = Vec::with_capacity(len as usize);
        while (buf.len() as u32) < len {
            self.cancel.check()?;
            // Data arrives as raw SLIP packets without a command header.
            let packet = self.read_frame(DEFAULT_TIMEOUT)?;
            if packet.len() > (len as usize - buf.len()).max(FAST_READ_BLOCK as usize) {
                return Err(
                    ProtocolError::framing("ReadFlash", "oversized data packet").into(),
                );
            }
            buf.extend_from_slice(&packet);
            // Acknowledge the running total so the stub keeps streaming.
            self.conn
                .write(&slip::encode(&(buf.len() as u32).to_le_bytes()))?;
            self.sink
                .progress_update(buf.len() / FAST_READ_BLOCK as usize);
        }

        let digest = self.read_frame(DEFAULT_TIMEOUT)?;
        if digest.len() != 16 {
            return Err(ProtocolError::framing("ReadFlash", "missing MD5 trailer").into());
        }

        self.sink.set_state(FlasherState::Verifying);
        if digest[..] != md5(&buf) {
            return Err(VerificationError::Md5.into());
        }
        self.sink.success("MD5 matches!");
        Ok(buf)
    }

    fn run_read_slow(&mut self, start: u32, len: u32) -> Result<Vec<u8>, Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(len as usize);
        while (buf.len() as u32) < len {
            self.cancel.check()?;
            let wanted = (len as usize - buf.len()).min(SLOW_READ_SIZE);
            let addr = start + buf.len() as u32;

            let mut payload = Vec::with_capacity(16);
            payload.extend_from_slice(&addr.to_le_bytes());
            payload.extend_from_slice(&(wanted as u32).to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            let (_, data) = self.command(
                "ReadFlashSlow",
                CMD_READ_FLASH_SLOW,
                0,
                &payload,
                DEFAULT_TIMEOUT,
            )?;

            if data.len() < wanted {
                return Err(ProtocolError::Truncated {
                    command: "ReadFlashSlow",
                    expected: wanted,
                    received: data.len(),
                }
                .into());
            }
            buf.extend_from_slice(&data[..wanted]);
            self.sink.progress_update(buf.len() / SLOW_READ_SIZE);
        }
        Ok(buf)
    }

    fn run_read(
        &mut self,
        start_sector: u32,
        sectors: u32,
        full_read: bool,
    ) -> Result<(), Error> {
        self.begin()?;

        let (start_sector, sectors) = if full_read {
            (0, self.flash_size / SECTOR_SIZE as u32)
        } else {
            (start_sector, sectors)
        };
        let start = start_sector * SECTOR_SIZE as u32;
        let len = sectors * SECTOR_SIZE as u32;

        self.sink.set_state(FlasherState::Working);
        self.sink.progress_init(
            start,
            if self.stub_running {
                len.div_ceil(FAST_READ_BLOCK) as usize
            } else {
                len as usize / SLOW_READ_SIZE
            },
        );

        let buf = if self.stub_running {
            self.run_read_fast(start, len)?
        } else {
            self.run_read_slow(start, len)?
        };
        self.sink.progress_finish();

        self.read_buf = Some(buf);
        Ok(())
    }

    // -- write -----------------------------------------------------------

    fn flash_data_block(&mut self, sequence: u32, block: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16 + block.len());
        payload.extend_from_slice(&(block.len() as u32).to_le_bytes());
        payload.extend_from_slice(&sequence.to_le_bytes());
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(block);
        let checksum = Self::xor_checksum(block) as u32;

        let mut last_err = None;
        for _ in 0..BLOCK_RETRIES {
            match self.command("FlashData", CMD_FLASH_DATA, checksum, &payload, DEFAULT_TIMEOUT)
            {
                Ok(_) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap())
    }

    fn verify_md5(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(&[0u8; 8]);
        let (_, digest) = self.command(
            "SpiFlashMd5",
            CMD_SPI_FLASH_MD5,
            0,
            &payload,
            Self::erase_timeout(data.len() as u32),
        )?;

        // The stub answers 16 raw bytes, the ROM 32 hex characters.
        let matches = match digest.len() {
            16 => digest[..] == md5(data),
            32 => {
                let hex: String = md5(data).iter().map(|b| format!("{b:02x}")).collect();
                digest == hex.as_bytes()
            }
            _ => {
                return Err(
                    ProtocolError::framing("SpiFlashMd5", "unexpected digest length").into(),
                )
            }
        };

        if !matches {
            return Err(VerificationError::Md5.into());
        }
        self.sink.success("MD5 matches!");
        Ok(())
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.begin()?;
        if !self.stub_running {
            return Err(Error::UnsupportedOperation {
                family: self.family,
                operation: "writing without the flasher stub",
            });
        }

        let blocks = data.len().div_ceil(FLASH_WRITE_SIZE);
        self.sink.set_state(FlasherState::Working);
        self.sink.info(&format!(
            "Writing {:#x} bytes at {offset:#x}",
            data.len()
        ));

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(&(blocks as u32).to_le_bytes());
        payload.extend_from_slice(&(FLASH_WRITE_SIZE as u32).to_le_bytes());
        payload.extend_from_slice(&offset.to_le_bytes());
        self.command(
            "FlashBegin",
            CMD_FLASH_BEGIN,
            0,
            &payload,
            Self::erase_timeout(data.len() as u32),
        )?;

        self.sink.progress_init(offset, blocks);
        for (seq, block) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
            self.cancel.check()?;
            self.flash_data_block(seq as u32, block)?;
            self.sink.progress_update(seq + 1);
        }
        self.sink.progress_finish();

        self.sink.set_state(FlasherState::Verifying);
        self.verify_md5(offset, data)?;

        // Stay in the bootloader so further operations can follow.
        self.command("FlashEnd", CMD_FLASH_END, 0, &1u32.to_le_bytes(), DEFAULT_TIMEOUT)?;
        Ok(())
    }

    fn run_erase(
        &mut self,
        start_sector: u32,
        sectors: u32,
        erase_all: bool,
    ) -> Result<bool, Error> {
        self.begin()?;
        if !self.stub_running {
            return Err(Error::UnsupportedOperation {
                family: self.family,
                operation: "erasing without the flasher stub",
            });
        }

        self.sink.set_state(FlasherState::Working);
        if erase_all {
            self.sink.info("Erasing the whole flash");
            self.command(
                "EraseFlash",
                CMD_ERASE_FLASH,
                0,
                &[],
                Self::erase_timeout(self.flash_size),
            )?;
            return Ok(true);
        }

        let offset = start_sector * SECTOR_SIZE as u32;
        let size = sectors * SECTOR_SIZE as u32;
        self.sink
            .info(&format!("Erasing {offset:#x}..{:#x}", offset + size));
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        self.command(
            "EraseRegion",
            CMD_ERASE_REGION,
            0,
            &payload,
            Self::erase_timeout(size),
        )?;
        Ok(true)
    }
}

impl Flasher for Esp32Flasher {
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
