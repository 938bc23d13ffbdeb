//! BK7231-family driver
//!
//! The BootROM speaks HCI-style frames: every command starts `01 E0 FC`,
//! every response `04 0E`. System commands (link check, registers, baud)
//! use the short header; flash commands use the long `FF F4` header with a
//! 16-bit length. The driver acquires the bus by hammering LinkCheck while
//! the user power-cycles the board, negotiates a faster baud rate, resolves
//! the external SPI NOR through the registry to lift its write protection,
//! and verifies every transfer with the ROM's CheckCRC.

use std::thread::sleep;
use std::time::Duration;

use log::debug;

use crate::checksum::crc32;
use crate::connection::Connection;
use crate::error::{Error, ProtocolError, VerificationError};
use crate::flash_chips::{self, FlashDescriptor};
use crate::flasher::{
    CancelToken, EventSink, Flasher, FlasherEvents, FlasherState, FlashOpts, BLOCK_SIZE,
    SECTOR_SIZE,
};
use crate::targets::ChipFamily;

const COMMAND_PREFIX: [u8; 3] = [0x01, 0xE0, 0xFC];
const RESPONSE_PREFIX: [u8; 2] = [0x04, 0x0E];
const LONG_MARKER: u8 = 0xFF;
const LONG_SUBTYPE: u8 = 0xF4;

const CMD_LINK_CHECK: u8 = 0x00;
const CMD_WRITE_REG: u8 = 0x01;
const CMD_READ_REG: u8 = 0x03;
const CMD_FLASH_WRITE_4K: u8 = 0x07;
const CMD_FLASH_READ_4K: u8 = 0x09;
const CMD_FLASH_ERASE_4K: u8 = 0x0B;
const CMD_FLASH_READ_SR: u8 = 0x0C;
const CMD_FLASH_WRITE_SR: u8 = 0x0D;
const CMD_FLASH_GET_MID: u8 = 0x0E;
const CMD_SET_BAUD_RATE: u8 = 0x0F;
const CMD_FLASH_ERASE_SIZED: u8 = 0x0F;
const CMD_CHECK_CRC: u8 = 0x10;

const ERASE_SIZED_4K: u8 = 0x20;
const ERASE_SIZED_64K: u8 = 0xD8;

// SPI opcodes for the one-, two- and three-byte status registers.
const SR_READ_OPCODES: [u8; 3] = [0x05, 0x35, 0x15];
const SR_WRITE_OPCODE: u8 = 0x01;

const LINK_BAUD: u32 = 115_200;
const LINK_CHECK_TIMEOUT: Duration = Duration::from_millis(10);
const LINK_OUTER_ATTEMPTS: usize = 100;
const LINK_INNER_ATTEMPTS: usize = 100;
const RESET_PULSE: Duration = Duration::from_millis(50);

const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const BAUD_SWITCH_FLUSH: Duration = Duration::from_millis(20);
const BAUD_SWITCH_TIMEOUT: Duration = Duration::from_millis(500);
const BAUD_SWITCH_ATTEMPTS: usize = 10;

const SECTOR_READ_RETRIES: usize = 3;
const SECTOR_WRITE_RETRIES: usize = 3;
const ERASE_RETRIES: usize = 6;
const UNPROTECT_RETRIES: usize = 10;

const SCTRL_CHIP_ID_REG: u32 = 0x0080_0000;
const EFUSE_CTRL_REG: u32 = 0x4488_0000;
const EFUSE_DATA_REG: u32 = 0x4488_0004;
const EFUSE_POLL_ATTEMPTS: usize = 50;

// Coefficients the stock Tuya BootROM burns into BK7231N eFuse.
const TUYA_KEY: [u32; 4] = [0x510F_B093, 0xA3CB_EADC, 0x5993_A17E, 0xC7AD_EB03];

/// Driver for the BK7231 family
pub struct Bk7231Flasher {
    family: ChipFamily,
    conn: Connection,
    opts: FlashOpts,
    sink: EventSink,
    cancel: CancelToken,
    flash: Option<&'static FlashDescriptor>,
    flash_size: u32,
    read_buf: Option<Vec<u8>>,
    warned_control_lines: bool,
    prepared: bool,
}

impl Bk7231Flasher {
    pub fn new(
        family: ChipFamily,
        transport: Box<dyn crate::transport::Transport>,
        opts: FlashOpts,
        events: Box<dyn FlasherEvents>,
        cancel: CancelToken,
    ) -> Self {
        debug_assert!(family.is_bk());
        Bk7231Flasher {
            family,
            conn: Connection::new(transport, opts.read_timeout_multiplier),
            opts,
            sink: EventSink::new(events),
            cancel,
            flash: None,
            flash_size: 2 * 1024 * 1024,
            read_buf: None,
            warned_control_lines: false,
            prepared: false,
        }
    }

    fn is_tu(&self) -> bool {
        matches!(self.family, ChipFamily::BK7231T | ChipFamily::BK7231U)
    }

    /// The BootROM quirk: T/U sector reads address flash through an alias
    /// one flash-size above the real offset.
    fn read_alias(&self, addr: u32) -> u32 {
        if self.is_tu() {
            addr.wrapping_add(self.flash_size)
        } else {
            addr
        }
    }

    fn check_bootloader_protection(&self, addr: u32) -> Result<(), Error> {
        if self.opts.overwrite_bootloader {
            return Ok(());
        }
        if let Some(end) = self.family.protected_bootloader_end() {
            if addr < end {
                return Err(Error::ProtectedRegion {
                    family: self.family,
                    addr,
                });
            }
        }
        Ok(())
    }

    // -- framing ---------------------------------------------------------

    fn build_short(op: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.extend_from_slice(&COMMAND_PREFIX);
        frame.push(payload.len() as u8 + 1);
        frame.push(op);
        frame.extend_from_slice(payload);
        frame
    }

    fn build_long(op: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u16 + 1;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&COMMAND_PREFIX);
        frame.push(LONG_MARKER);
        frame.push(LONG_SUBTYPE);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.push(op);
        frame.extend_from_slice(payload);
        frame
    }

    /// Await a short `04 0E len 01 E0 FC op data` response
    fn await_short(
        &mut self,
        command: &'static str,
        op: u8,
        data_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        if !self.conn.read_until_prefix(&RESPONSE_PREFIX, timeout)? {
            return Err(ProtocolError::Timeout {
                command,
                timeout_ms: self.conn.effective_timeout(timeout).as_millis() as u64,
            }
            .into());
        }

        let total = 7 + data_len;
        let frame = self.conn.read_exact(total, timeout, command)?;
        if frame[2] as usize != data_len + 4
            || frame[3..6] != COMMAND_PREFIX
            || frame[6] != op
        {
            return Err(ProtocolError::framing(
                command,
                format!("unexpected short header {:02x?}", &frame[..7]),
            )
            .into());
        }
        Ok(frame[7..].to_vec())
    }

    /// Await a long `04 0E FF 01 E0 FC F4 len16 op data` response
    fn await_long(
        &mut self,
        command: &'static str,
        op: u8,
        data_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        if !self.conn.read_until_prefix(&RESPONSE_PREFIX, timeout)? {
            return Err(ProtocolError::Timeout {
                command,
                timeout_ms: self.conn.effective_timeout(timeout).as_millis() as u64,
            }
            .into());
        }

        let total = 10 + data_len;
        let frame = self.conn.read_exact(total, timeout, command)?;
        let len = u16::from_le_bytes([frame[7], frame[8]]) as usize;
        if frame[2] != LONG_MARKER
            || frame[3..6] != COMMAND_PREFIX
            || frame[6] != LONG_SUBTYPE
            || len != data_len + 1
            || frame[9] != op
        {
            return Err(ProtocolError::framing(
                command,
                format!("unexpected long header {:02x?}", &frame[..10]),
            )
            .into());
        }
        Ok(frame[10..].to_vec())
    }

    fn command_short(
        &mut self,
        command: &'static str,
        op: u8,
        payload: &[u8],
        resp_data: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        self.conn.write(&Self::build_short(op, payload))?;
        // LinkCheck is acknowledged with the next opcode; everything else
        // echoes its own.
        let resp_op = if op == CMD_LINK_CHECK { 0x01 } else { op };
        self.await_short(command, resp_op, resp_data, timeout)
    }

    fn command_long(
        &mut self,
        command: &'static str,
        op: u8,
        payload: &[u8],
        resp_data: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        self.conn.write(&Self::build_long(op, payload))?;
        self.await_long(command, op, resp_data, timeout)
    }

    fn expect_status(command: &'static str, data: &[u8]) -> Result<(), Error> {
        match data.first() {
            Some(0) => Ok(()),
            Some(&status) => Err(ProtocolError::Status { command, status }.into()),
            None => Err(ProtocolError::framing(command, "empty response").into()),
        }
    }

    // -- registers -------------------------------------------------------

    fn read_reg(&mut self, addr: u32) -> Result<u32, Error> {
        let data = self.command_short(
            "ReadReg",
            CMD_READ_REG,
            &addr.to_le_bytes(),
            8,
            COMMAND_TIMEOUT,
        )?;
        if data[..4] != addr.to_le_bytes() {
            return Err(
                ProtocolError::framing("ReadReg", "response for a different register").into(),
            );
        }
        Ok(u32::from_le_bytes(data[4..8].try_into().unwrap()))
    }

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Error> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&addr.to_le_bytes());
        payload[4..].copy_from_slice(&value.to_le_bytes());
        self.command_short("WriteReg", CMD_WRITE_REG, &payload, 8, COMMAND_TIMEOUT)?;
        Ok(())
    }

    // -- bus acquisition -------------------------------------------------

    fn pulse_reset_lines(&mut self) {
        let dtr = self.conn.set_dtr(true);
        let rts = self.conn.set_rts(true);
        sleep(RESET_PULSE);
        self.conn.set_dtr(false);
        self.conn.set_rts(false);

        if !(dtr && rts) && !self.warned_control_lines {
            self.warned_control_lines = true;
            self.sink
                .warning("Control lines not honoured; power-cycle the device manually");
        }
    }

    fn link_check(&mut self) -> bool {
        match self.command_short("LinkCheck", CMD_LINK_CHECK, &[], 1, LINK_CHECK_TIMEOUT) {
            Ok(data) => data == [0x00],
            Err(_) => false,
        }
    }

    /// Hammer LinkCheck until the BootROM answers; the user may be power
    /// cycling the board during this window, so be liberal.
    fn get_bus(&mut self) -> Result<(), Error> {
        for outer in 0..LINK_OUTER_ATTEMPTS {
            self.cancel.check()?;
            self.pulse_reset_lines();
            if outer % 5 == 4 {
                // Soft-reset fallback for boards running application code.
                self.conn.write(b"reboot\r\n")?;
            }

            for _ in 0..LINK_INNER_ATTEMPTS {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if self.link_check() {
                    self.conn.drain();
                    self.sink.info("Bus acquired");
                    return Ok(());
                }
            }
        }
        Err(Error::SyncFailed)
    }

    fn negotiate_baud(&mut self) -> Result<(), Error> {
        let target = self.opts.baud;
        if target == LINK_BAUD {
            return Ok(());
        }

        let mut payload = [0u8; 5];
        payload[..4].copy_from_slice(&target.to_le_bytes());
        payload[4] = 20; // delay the ROM applies before switching, ms

        for attempt in 0..BAUD_SWITCH_ATTEMPTS {
            self.conn
                .write(&Self::build_short(CMD_SET_BAUD_RATE, &payload))?;
            // Let the acknowledge-at-old-rate leave the wire before
            // retuning the transport.
            sleep(BAUD_SWITCH_FLUSH);
            self.conn.set_baud(target)?;

            match self.await_short("SetBaudRate", CMD_SET_BAUD_RATE, 5, BAUD_SWITCH_TIMEOUT) {
                Ok(data) if data == payload => {
                    self.conn.drain();
                    self.sink.info(&format!("Baud rate set to {target}"));
                    return Ok(());
                }
                Ok(_) | Err(_) => {
                    debug!("Baud switch attempt {} failed, reverting", attempt + 1);
                    self.conn.set_baud(LINK_BAUD)?;
                    self.conn.drain();
                    self.get_bus()?;
                }
            }
        }
        Err(Error::SyncFailed)
    }

    // -- flash identification -------------------------------------------

    fn read_mid(&mut self) -> Result<u32, Error> {
        let data = self.command_long(
            "FlashGetMID",
            CMD_FLASH_GET_MID,
            &[0x00],
            5,
            COMMAND_TIMEOUT,
        )?;
        Self::expect_status("FlashGetMID", &data)?;
        Ok(u32::from_le_bytes(data[1..5].try_into().unwrap()) & 0x00FF_FFFF)
    }

    fn identify_flash(&mut self) -> Result<(), Error> {
        let mid = self.read_mid()?;
        match flash_chips::by_mid(mid) {
            Ok(desc) => {
                self.flash = Some(desc);
                self.flash_size = desc.memory_bytes;
                self.sink
                    .info(&format!("Flash def found: {}", desc.icon.to_uppercase()));
                Ok(())
            }
            Err(e) if self.opts.skip_unprotect => {
                self.sink.warning(&format!(
                    "Unknown flash MID {mid:#08x}; continuing without unprotect"
                ));
                debug!("registry miss tolerated: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn read_status_register(&mut self, desc: &FlashDescriptor) -> Result<u32, Error> {
        let mut sr = 0u32;
        for (i, &opcode) in SR_READ_OPCODES[..desc.status_reg_width as usize]
            .iter()
            .enumerate()
        {
            let data = self.command_long(
                "FlashReadSR",
                CMD_FLASH_READ_SR,
                &[opcode],
                3,
                COMMAND_TIMEOUT,
            )?;
            Self::expect_status("FlashReadSR", &data)?;
            sr |= (data[2] as u32) << (8 * i);
        }
        Ok(sr)
    }

    fn write_status_register(
        &mut self,
        desc: &FlashDescriptor,
        value: u32,
    ) -> Result<(), Error> {
        let width = desc.status_reg_width as usize;
        let mut payload = Vec::with_capacity(1 + width);
        payload.push(SR_WRITE_OPCODE);
        payload.extend_from_slice(&value.to_le_bytes()[..width]);
        let data = self.command_long(
            "FlashWriteSR",
            CMD_FLASH_WRITE_SR,
            &payload,
            1 + width,
            COMMAND_TIMEOUT,
        )?;
        Self::expect_status("FlashWriteSR", &data)
    }

    fn set_protect_state(&mut self, unprotect: bool) -> Result<(), Error> {
        let Some(desc) = self.flash else {
            return Ok(());
        };

        let target_field = if unprotect {
            desc.unprotect_word
        } else {
            desc.protect_word
        };
        let positioned = flash_chips::bfd(target_field, desc.sb, desc.lb);

        for _ in 0..UNPROTECT_RETRIES {
            self.cancel.check()?;
            let sr = self.read_status_register(desc)?;
            if sr & desc.mask == positioned {
                return Ok(());
            }
            let next = (sr & !desc.mask) | positioned;
            debug!("Rewriting SR {:#x} -> {:#x}", sr, next);
            self.write_status_register(desc, next)?;
        }
        Err(ProtocolError::framing(
            "SetProtectState",
            "status register refuses to latch the protect bits",
        )
        .into())
    }

    // -- encryption key sanity check ------------------------------------

    fn family_expected_key(&self) -> [u32; 4] {
        match self.family {
            ChipFamily::BK7231N => TUYA_KEY,
            _ => [0; 4],
        }
    }

    fn read_efuse_block(&mut self) -> Result<[u8; 16], Error> {
        let mut block = [0u8; 16];
        for (addr, byte) in block.iter_mut().enumerate() {
            self.write_reg(EFUSE_CTRL_REG, ((addr as u32) << 8) | 0x01)?;

            let mut ready = false;
            for _ in 0..EFUSE_POLL_ATTEMPTS {
                if self.read_reg(EFUSE_CTRL_REG)? & 0x01 == 0 {
                    ready = true;
                    break;
                }
                sleep(Duration::from_millis(1));
            }
            if !ready {
                return Err(
                    ProtocolError::framing("ReadEfuse", "eFuse controller stayed busy").into(),
                );
            }

            *byte = (self.read_reg(EFUSE_DATA_REG)? & 0xFF) as u8;
        }
        Ok(block)
    }

    fn check_encryption_key(&mut self) -> Result<(), Error> {
        let block = self.read_efuse_block()?;
        let mut coefficients = [0u32; 4];
        for (i, chunk) in block.chunks_exact(4).enumerate() {
            coefficients[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }

        let expected = self.family_expected_key();
        if coefficients == expected {
            return Ok(());
        }

        // A uniform block means the fuses were never programmed; flashing
        // is still safe.
        if coefficients.iter().all(|&c| c == coefficients[0]) {
            self.sink.warning("Encryption key not programmed");
            return Ok(());
        }

        if self.opts.skip_key_check {
            self.sink
                .warning("Encryption key differs from the expected one; continuing as requested");
            return Ok(());
        }
        Err(Error::EncryptionKeyMismatch)
    }

    // -- session ---------------------------------------------------------

    fn begin(&mut self) -> Result<(), Error> {
        if self.prepared {
            return Ok(());
        }

        self.sink.set_state(FlasherState::Opening);
        self.conn.open()?;

        self.sink.set_state(FlasherState::Syncing);
        self.get_bus()?;
        self.negotiate_baud()?;

        self.sink.set_state(FlasherState::Identifying);
        if !self.is_tu() {
            let chip_id = self.read_reg(SCTRL_CHIP_ID_REG)?;
            self.sink.info(&format!("Chip ID {chip_id:#010x}"));
        }
        self.identify_flash()?;

        if !self.is_tu() {
            self.sink.set_state(FlasherState::Configuring);
            if !matches!(self.family, ChipFamily::BK7238 | ChipFamily::BK7252N) {
                self.check_encryption_key()?;
            }
            self.set_protect_state(true)?;
        }

        self.prepared = true;
        Ok(())
    }

    // -- operations ------------------------------------------------------

    fn crc_timeout(len: u32) -> Duration {
        let secs = (len as u64).div_ceil(1024 * 1024).max(3);
        Duration::from_secs(secs)
    }

    fn device_crc(&mut self, start: u32, end: u32) -> Result<u32, Error> {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&start.to_le_bytes());
        payload[4..].copy_from_slice(&end.to_le_bytes());
        let data = self.command_long(
            "CheckCRC",
            CMD_CHECK_CRC,
            &payload,
            4,
            Self::crc_timeout(end - start),
        )?;
        Ok(u32::from_le_bytes(data[..4].try_into().unwrap()))
    }

    fn read_sector(&mut self, addr: u32) -> Result<Vec<u8>, Error> {
        let mut last_err = None;
        for _ in 0..SECTOR_READ_RETRIES {
            match self.command_long(
                "FlashRead4K",
                CMD_FLASH_READ_4K,
                &addr.to_le_bytes(),
                5 + SECTOR_SIZE,
                COMMAND_TIMEOUT,
            ) {
                Ok(data) => {
                    Self::expect_status("FlashRead4K", &data)?;
                    if data[1..5] != addr.to_le_bytes() {
                        last_err = Some(
                            ProtocolError::framing("FlashRead4K", "address echo mismatch")
                                .into(),
                        );
                        continue;
                    }
                    return Ok(data[5..].to_vec());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap())
    }

    fn write_sector(&mut self, addr: u32, sector: &[u8]) -> Result<(), Error> {
        debug_assert_eq!(sector.len(), SECTOR_SIZE);
        let mut payload = Vec::with_capacity(4 + SECTOR_SIZE);
        payload.extend_from_slice(&addr.to_le_bytes());
        payload.extend_from_slice(sector);

        let mut last_err = None;
        for _ in 0..SECTOR_WRITE_RETRIES {
            match self.command_long(
                "FlashWrite4K",
                CMD_FLASH_WRITE_4K,
                &payload,
                5,
                COMMAND_TIMEOUT,
            ) {
                Ok(data) => return Self::expect_status("FlashWrite4K", &data),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap())
    }

    fn erase_unit(&mut self, addr: u32, sized_cmd: u8) -> Result<(), Error> {
        let mut payload = [0u8; 5];
        payload[0] = sized_cmd;
        payload[1..].copy_from_slice(&addr.to_le_bytes());

        let mut last_err = None;
        for _ in 0..ERASE_RETRIES {
            match self.command_long(
                "FlashErase",
                CMD_FLASH_ERASE_SIZED,
                &payload,
                6,
                COMMAND_TIMEOUT,
            ) {
                Ok(data) => return Self::expect_status("FlashErase", &data),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap())
    }

    /// Erase `[start, end)`: 4K sectors at the ragged edges, 64K blocks in
    /// the aligned middle.
    fn erase_range(&mut self, start: u32, end: u32) -> Result<(), Error> {
        let mut addr = start & !(SECTOR_SIZE as u32 - 1);
        while addr < end {
            self.cancel.check()?;
            if addr % BLOCK_SIZE as u32 == 0 && addr + BLOCK_SIZE as u32 <= end {
                self.erase_unit(addr, ERASE_SIZED_64K)?;
                addr += BLOCK_SIZE as u32;
            } else {
                self.erase_unit(addr, ERASE_SIZED_4K)?;
                addr += SECTOR_SIZE as u32;
            }
        }
        Ok(())
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
        self.sink.progress_init(start, sectors as usize);

        let mut buf = Vec::with_capacity(len as usize);
        for i in 0..sectors {
            self.cancel.check()?;
            let addr = self.read_alias(start + i * SECTOR_SIZE as u32);
            let sector = self.read_sector(addr)?;
            buf.extend_from_slice(&sector);
            self.sink.progress_update(i as usize + 1);
        }
        self.sink.progress_finish();

        // A constant buffer means the ROM fed us garbage, not flash.
        if let Some(&first) = buf.first() {
            if (first == 0x00 || first == 0xFF) && buf.iter().all(|&b| b == first) {
                return Err(VerificationError::UniformBuffer { byte: first }.into());
            }
        }

        self.sink.set_state(FlasherState::Verifying);
        let crc_start = self.read_alias(start);
        let device = self.device_crc(crc_start, crc_start + len)?;
        let host = crc32(0xFFFF_FFFF, &buf);
        if device != host {
            if self.opts.ignore_crc_err {
                self.sink
                    .warning(&format!("CRC mismatch ignored ({device:#010x} vs {host:#010x})"));
            } else {
                return Err(VerificationError::Crc { device, host }.into());
            }
        } else {
            self.sink.success(&format!("CRC matches {host:#010x}!"));
        }

        self.read_buf = Some(buf);
        Ok(())
    }

    fn run_write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.check_bootloader_protection(offset)?;
        if offset % SECTOR_SIZE as u32 != 0 {
            return Err(Error::InvalidInput(format!(
                "write offset {offset:#x} is not sector aligned"
            )));
        }

        self.begin()?;

        let mut padded = data.to_vec();
        let tail = padded.len() % SECTOR_SIZE;
        if tail != 0 {
            padded.resize(padded.len() + SECTOR_SIZE - tail, 0xFF);
        }
        let end = offset + padded.len() as u32;

        self.sink.set_state(FlasherState::Working);
        self.sink.info(&format!(
            "Writing {:#x} bytes at {offset:#x}",
            padded.len()
        ));
        self.erase_range(offset, end)?;

        self.sink
            .progress_init(offset, padded.len() / SECTOR_SIZE);
        for (i, sector) in padded.chunks(SECTOR_SIZE).enumerate() {
            self.cancel.check()?;
            let addr = offset + (i * SECTOR_SIZE) as u32;
            self.write_sector(addr, sector)?;
            self.sink.progress_update(i + 1);
        }
        self.sink.progress_finish();

        self.sink.set_state(FlasherState::Verifying);
        let device = self.device_crc(offset, end)?;
        let host = crc32(0xFFFF_FFFF, &padded);
        if device != host {
            return Err(VerificationError::Crc { device, host }.into());
        }
        self.sink.success(&format!("CRC matches {host:#010x}!"));
        Ok(())
    }

    fn run_erase(
        &mut self,
        start_sector: u32,
        sectors: u32,
        erase_all: bool,
    ) -> Result<bool, Error> {
        let start = if erase_all {
            0
        } else {
            start_sector * SECTOR_SIZE as u32
        };
        self.check_bootloader_protection(start)?;

        self.begin()?;

        let end = if erase_all {
            self.flash_size
        } else {
            start + sectors * SECTOR_SIZE as u32
        };

        self.sink.set_state(FlasherState::Working);
        self.sink
            .info(&format!("Erasing {start:#x}..{end:#x}"));
        self.erase_range(start, end)?;
        Ok(true)
    }
}

impl Flasher for Bk7231Flasher {
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
