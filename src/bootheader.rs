//! BL602/702 boot header construction
//!
//! The BootROM reads a 176-byte header at flash offset 0: flash timing, a
//! clock tree, boot flags, the firmware length and its SHA-256, with CRC-32
//! seals over the flash-config and clock-config substructures and over the
//! whole header. The on-wire layout is modelled as packed structs; the CRC
//! fields are patched into the serialised image afterwards.

use bytemuck::{bytes_of, Pod, Zeroable};

use crate::checksum::{crc32, sha256};

pub const BOOT_HEADER_SIZE: usize = 176;
pub const BOOT_HEADER_MAGIC: u32 = 0x504E_4642; // "BFNP"
const FLASH_CFG_MAGIC: u32 = 0x4746_4346; // "FCFG"
const CLOCK_CFG_MAGIC: u32 = 0x4746_4350; // "PCFG"

/// Firmware body location the header points at
pub const IMAGE_START: u32 = 0x1000;
/// Where the partition table lives relative to the header
pub const PARTITION_TABLE_OFFSET: u32 = 0xE000;

// CRC seal offsets inside the header; fixed by the BootROM.
const FLASH_CFG_START: usize = 12;
const FLASH_CFG_CRC: usize = 96;
const CLOCK_CFG_START: usize = 104;
const CLOCK_CFG_CRC: usize = 112;
const IMAGE_LEN: usize = 120;
const BOOT_ENTRY: usize = 124;
const IMAGE_START_FIELD: usize = 128;
const HASH_START: usize = 132;
const HEADER_CRC: usize = 172;

/// SPI flash timing and command set, 84 bytes on the wire
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FlashConfig {
    pub jedec_id: [u8; 3],
    pub io_mode: u8,
    pub continuous_read: u8,
    pub clk_delay: u8,
    pub clk_invert: u8,
    pub sector_size_kb: u8,
    pub page_size: u16,
    pub read_cmd: u8,
    pub fast_read_cmd: u8,
    pub quad_read_cmd: u8,
    pub write_enable_cmd: u8,
    pub page_program_cmd: u8,
    pub sector_erase_cmd: u8,
    pub block_erase_cmd: u8,
    pub chip_erase_cmd: u8,
    pub read_status_cmd: u8,
    pub write_status_cmd: u8,
    pub busy_bit: u8,
    pub qe_bit: u8,
    pub sector_erase_time_ms: u16,
    pub block_erase_time_ms: u16,
    pub chip_erase_time_ms: u16,
    pub page_program_time_us: u16,
    reserved: [u8; 54],
}

impl FlashConfig {
    /// Conservative timings that every part seen on BL modules tolerates
    pub fn default_for(jedec_id: u32) -> Self {
        let id = jedec_id.to_le_bytes();
        FlashConfig {
            jedec_id: [id[0], id[1], id[2]],
            io_mode: 0x04, // quad output
            continuous_read: 0x01,
            clk_delay: 1,
            clk_invert: 0x01,
            sector_size_kb: 4,
            page_size: 256,
            read_cmd: 0x03,
            fast_read_cmd: 0x0B,
            quad_read_cmd: 0xEB,
            write_enable_cmd: 0x06,
            page_program_cmd: 0x02,
            sector_erase_cmd: 0x20,
            block_erase_cmd: 0xD8,
            chip_erase_cmd: 0xC7,
            read_status_cmd: 0x05,
            write_status_cmd: 0x01,
            busy_bit: 0,
            qe_bit: 1,
            sector_erase_time_ms: 300,
            block_erase_time_ms: 1200,
            chip_erase_time_ms: 33_000,
            page_program_time_us: 3_000,
            reserved: [0; 54],
        }
    }
}

/// Clock tree selection for the boot stage, 8 bytes on the wire
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ClockConfig {
    pub xtal_type: u8,
    pub pll_clk: u8,
    pub hclk_div: u8,
    pub bclk_div: u8,
    pub flash_clk_type: u8,
    pub flash_clk_div: u8,
    reserved: [u8; 2],
}

impl Default for ClockConfig {
    fn default() -> Self {
        // 40 MHz crystal, 160 MHz PLL, flash clock 80 MHz
        ClockConfig {
            xtal_type: 0x04,
            pll_clk: 0x04,
            hclk_div: 0,
            bclk_div: 1,
            flash_clk_type: 0x03,
            flash_clk_div: 1,
            reserved: [0; 2],
        }
    }
}

/// The complete header as the BootROM sees it
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BootHeader {
    magic: u32,
    revision: u32,
    flash_cfg_magic: u32,
    flash_cfg: FlashConfig,
    flash_cfg_crc: u32,
    clock_cfg_magic: u32,
    clock_cfg: ClockConfig,
    clock_cfg_crc: u32,
    boot_flags: u32,
    image_len: u32,
    boot_entry: u32,
    image_start: u32,
    hash: [u8; 32],
    reserved: [u8; 8],
    header_crc: u32,
}

/// Build the 176-byte boot header for `firmware`
pub fn build_boot_header(
    firmware: &[u8],
    flash: &FlashConfig,
    clock: &ClockConfig,
) -> Vec<u8> {
    let header = BootHeader {
        magic: BOOT_HEADER_MAGIC,
        revision: 1,
        flash_cfg_magic: FLASH_CFG_MAGIC,
        flash_cfg: *flash,
        flash_cfg_crc: 0,
        clock_cfg_magic: CLOCK_CFG_MAGIC,
        clock_cfg: *clock,
        clock_cfg_crc: 0,
        // Boot config: cache enabled, no encryption, no signature.
        boot_flags: 0x0000_0100,
        image_len: firmware.len() as u32,
        boot_entry: 0,
        image_start: IMAGE_START,
        hash: sha256(firmware),
        reserved: [0; 8],
        header_crc: 0,
    };

    let mut bytes = bytes_of(&header).to_vec();
    debug_assert_eq!(bytes.len(), BOOT_HEADER_SIZE);

    let flash_crc = crc32(0xFFFF_FFFF, &bytes[FLASH_CFG_START..FLASH_CFG_CRC]);
    bytes[FLASH_CFG_CRC..FLASH_CFG_CRC + 4].copy_from_slice(&flash_crc.to_le_bytes());
    let clock_crc = crc32(0xFFFF_FFFF, &bytes[CLOCK_CFG_START..CLOCK_CFG_CRC]);
    bytes[CLOCK_CFG_CRC..CLOCK_CFG_CRC + 4].copy_from_slice(&clock_crc.to_le_bytes());
    let header_crc = crc32(0xFFFF_FFFF, &bytes[..HEADER_CRC]);
    bytes[HEADER_CRC..].copy_from_slice(&header_crc.to_le_bytes());

    bytes
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    fn sample_header(firmware: &[u8]) -> Vec<u8> {
        build_boot_header(
            firmware,
            &FlashConfig::default_for(0xEF4015),
            &ClockConfig::default(),
        )
    }

    #[test]
    fn wire_structs_have_their_documented_sizes() {
        assert_eq!(size_of::<FlashConfig>(), FLASH_CFG_CRC - FLASH_CFG_START);
        assert_eq!(size_of::<ClockConfig>(), CLOCK_CFG_CRC - CLOCK_CFG_START);
        assert_eq!(size_of::<BootHeader>(), BOOT_HEADER_SIZE);
    }

    #[test]
    fn header_is_exactly_176_bytes() {
        assert_eq!(sample_header(b"firmware").len(), BOOT_HEADER_SIZE);
    }

    #[test]
    fn crc_fields_seal_their_ranges() {
        let firmware = vec![0xA5u8; 4096];
        let header = sample_header(&firmware);

        let field = |offset: usize| {
            u32::from_le_bytes(header[offset..offset + 4].try_into().unwrap())
        };

        assert_eq!(
            field(FLASH_CFG_CRC),
            crc32(0xFFFF_FFFF, &header[FLASH_CFG_START..FLASH_CFG_CRC])
        );
        assert_eq!(
            field(CLOCK_CFG_CRC),
            crc32(0xFFFF_FFFF, &header[CLOCK_CFG_START..CLOCK_CFG_CRC])
        );
        assert_eq!(
            field(HEADER_CRC),
            crc32(0xFFFF_FFFF, &header[..HEADER_CRC])
        );
    }

    #[test]
    fn firmware_hash_and_length_are_embedded() {
        let firmware: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let header = sample_header(&firmware);

        assert_eq!(&header[HASH_START..HASH_START + 32], &sha256(&firmware));
        assert_eq!(
            u32::from_le_bytes(header[IMAGE_LEN..IMAGE_LEN + 4].try_into().unwrap()),
            firmware.len() as u32
        );
        assert_eq!(
            u32::from_le_bytes(header[BOOT_ENTRY..BOOT_ENTRY + 4].try_into().unwrap()),
            0
        );
        assert_eq!(
            u32::from_le_bytes(
                header[IMAGE_START_FIELD..IMAGE_START_FIELD + 4]
                    .try_into()
                    .unwrap()
            ),
            IMAGE_START
        );
    }

    #[test]
    fn magic_words_are_in_place() {
        let header = sample_header(b"x");
        assert_eq!(
            u32::from_le_bytes(header[0..4].try_into().unwrap()),
            BOOT_HEADER_MAGIC
        );
        assert_eq!(
            u32::from_le_bytes(header[8..12].try_into().unwrap()),
            FLASH_CFG_MAGIC
        );
        assert_eq!(
            u32::from_le_bytes(header[96 + 4..104].try_into().unwrap()),
            CLOCK_CFG_MAGIC
        );
    }

    #[test]
    fn jedec_id_lands_in_the_flash_config() {
        let header = sample_header(b"x");
        assert_eq!(
            &header[FLASH_CFG_START..FLASH_CFG_START + 3],
            &[0x15, 0x40, 0xEF]
        );
    }
}
