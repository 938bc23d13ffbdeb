//! BL-family partition tables
//!
//! The BL602/702 boot flow expects a partition table at 0xE000 describing
//! the flash layout. The wire format is a 16-byte header, up to sixteen
//! 36-byte entries and a trailing CRC-32 over the entry bytes; header and
//! entries are modelled as packed structs.

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

use crate::checksum::crc32;
use crate::error::Error;

pub const TABLE_MAGIC: u32 = 0x5450_4642; // "BFPT"
pub const MAX_ENTRIES: usize = 16;
pub const HEADER_SIZE: usize = 16;
pub const ENTRY_SIZE: usize = 36;

const NAME_FIELD: usize = 9;

// The header CRC covers everything before it.
const HEADER_CRC_OFFSET: usize = 12;

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawTableHeader {
    magic: u32,
    version: u16,
    entry_count: u16,
    age: u32,
    crc32: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawEntry {
    kind: u8,
    device: u8,
    slot_flag: u8,
    name: [u8; NAME_FIELD],
    addr0: u32,
    addr1: u32,
    len0: u32,
    len1: u32,
    len: u32,
    age: u32,
}

/// One slot of the on-chip flash layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub kind: u8,
    pub device: u8,
    /// Which of the two address/length slots is active
    pub slot_flag: u8,
    /// ASCII, at most 8 characters
    pub name: String,
    pub addr0: u32,
    pub addr1: u32,
    pub len0: u32,
    pub len1: u32,
    pub len: u32,
    pub age: u32,
}

impl PartitionEntry {
    fn parse(buf: &[u8]) -> Result<Self, Error> {
        let raw: RawEntry = pod_read_unaligned(&buf[..ENTRY_SIZE]);

        let name_bytes = raw.name;
        let name_end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_FIELD - 1);
        let name = std::str::from_utf8(&name_bytes[..name_end])
            .map_err(|_| Error::InvalidInput("partition name is not ASCII".into()))?
            .to_string();
        if !name.is_ascii() {
            return Err(Error::InvalidInput("partition name is not ASCII".into()));
        }

        Ok(PartitionEntry {
            kind: raw.kind,
            device: raw.device,
            slot_flag: raw.slot_flag,
            name,
            addr0: raw.addr0,
            addr1: raw.addr1,
            len0: raw.len0,
            len1: raw.len1,
            len: raw.len,
            age: raw.age,
        })
    }

    fn build(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        if self.name.len() > 8 || !self.name.is_ascii() {
            return Err(Error::InvalidInput(format!(
                "partition name '{}' must be at most 8 ASCII characters",
                self.name
            )));
        }

        let mut name = [0u8; NAME_FIELD];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        let raw = RawEntry {
            kind: self.kind,
            device: self.device,
            slot_flag: self.slot_flag,
            name,
            addr0: self.addr0,
            addr1: self.addr1,
            len0: self.len0,
            len1: self.len1,
            len: self.len,
            age: self.age,
        };
        out.extend_from_slice(bytes_of(&raw));
        Ok(())
    }
}

/// A complete partition table as written at 0xE000
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub version: u16,
    pub age: u32,
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Parse a table buffer, verifying magic and both CRC fields
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidInput("partition table is truncated".into()));
        }

        let header: RawTableHeader = pod_read_unaligned(&buf[..HEADER_SIZE]);
        let magic = header.magic;
        let count = header.entry_count as usize;
        let header_crc = header.crc32;

        if magic != TABLE_MAGIC {
            return Err(Error::InvalidInput(format!(
                "bad partition table magic {magic:#010x}"
            )));
        }
        if count > MAX_ENTRIES {
            return Err(Error::InvalidInput(format!(
                "partition table claims {count} entries, at most {MAX_ENTRIES} allowed"
            )));
        }
        if crc32(0xFFFF_FFFF, &buf[..HEADER_CRC_OFFSET]) != header_crc {
            return Err(Error::InvalidInput(
                "partition table header CRC mismatch".into(),
            ));
        }

        let entries_end = HEADER_SIZE + count * ENTRY_SIZE;
        if buf.len() < entries_end + 4 {
            return Err(Error::InvalidInput("partition table is truncated".into()));
        }
        let entries_crc =
            u32::from_le_bytes(buf[entries_end..entries_end + 4].try_into().unwrap());
        if crc32(0xFFFF_FFFF, &buf[HEADER_SIZE..entries_end]) != entries_crc {
            return Err(Error::InvalidInput(
                "partition table entry CRC mismatch".into(),
            ));
        }

        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let offset = HEADER_SIZE + i * ENTRY_SIZE;
            entries.push(PartitionEntry::parse(&buf[offset..offset + ENTRY_SIZE])?);
        }

        Ok(PartitionTable {
            version: header.version,
            age: header.age,
            entries,
        })
    }

    /// Serialise the table, computing both CRC fields
    pub fn build(&self) -> Result<Vec<u8>, Error> {
        if self.entries.len() > MAX_ENTRIES {
            return Err(Error::InvalidInput(format!(
                "partition table holds {} entries, at most {MAX_ENTRIES} allowed",
                self.entries.len()
            )));
        }

        let mut header = RawTableHeader {
            magic: TABLE_MAGIC,
            version: self.version,
            entry_count: self.entries.len() as u16,
            age: self.age,
            crc32: 0,
        };
        header.crc32 = crc32(0xFFFF_FFFF, &bytes_of(&header)[..HEADER_CRC_OFFSET]);

        let mut out = Vec::with_capacity(HEADER_SIZE + self.entries.len() * ENTRY_SIZE + 4);
        out.extend_from_slice(bytes_of(&header));
        for entry in &self.entries {
            entry.build(&mut out)?;
        }
        let entries_crc = crc32(0xFFFF_FFFF, &out[HEADER_SIZE..]);
        out.extend_from_slice(&entries_crc.to_le_bytes());
        Ok(out)
    }

    /// Check that no slot reaches past the end of the flash
    pub fn validate(&self, flash_size: u32) -> Result<(), Error> {
        for entry in &self.entries {
            for (addr, len) in [(entry.addr0, entry.len0), (entry.addr1, entry.len1)] {
                let end = addr as u64 + len as u64;
                if end > flash_size as u64 {
                    return Err(Error::InvalidInput(format!(
                        "partition '{}' ends at {end:#x}, past the {flash_size:#x}-byte flash",
                        entry.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The layout uniflash writes alongside a bare firmware image
    pub fn default_layout(flash_size: u32) -> Self {
        // Data regions occupy the top 0x18000 bytes; the firmware area below
        // them is split into two equal slots.
        let usable = flash_size.saturating_sub(0x18000 + 0x10000);
        let fw_len = 0xC8000.min(usable / 2) & !0xFFF;
        let entry = |kind: u8, name: &str, addr0: u32, len0: u32, addr1: u32, len1: u32| {
            PartitionEntry {
                kind,
                device: 0,
                slot_flag: 0,
                name: name.to_string(),
                addr0,
                addr1,
                len0,
                len1,
                len: 0,
                age: 0,
            }
        };

        PartitionTable {
            version: 0,
            age: 0,
            entries: vec![
                entry(0, "FW", 0x10000, fw_len, 0x10000 + fw_len, fw_len),
                entry(2, "mfg", 0, 0, 0, 0),
                entry(3, "media", flash_size - 0x18000, 0x7000, 0, 0),
                entry(4, "PSM", flash_size - 0x11000, 0x8000, 0, 0),
                entry(5, "KEY", flash_size - 0x9000, 0x2000, 0, 0),
                entry(6, "DATA", flash_size - 0x7000, 0x5000, 0, 0),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn wire_structs_have_their_documented_sizes() {
        assert_eq!(size_of::<RawTableHeader>(), HEADER_SIZE);
        assert_eq!(size_of::<RawEntry>(), ENTRY_SIZE);
    }

    #[test]
    fn build_parse_round_trip() {
        let table = PartitionTable::default_layout(0x200000);
        let built = table.build().unwrap();
        let parsed = PartitionTable::parse(&built).unwrap();
        assert_eq!(parsed, table);
        // Byte-level idempotence: rebuilding the parsed table reproduces
        // the exact buffer.
        assert_eq!(parsed.build().unwrap(), built);
    }

    #[test]
    fn default_layout_fits_its_flash() {
        for size in [0x100000u32, 0x200000, 0x400000] {
            PartitionTable::default_layout(size).validate(size).unwrap();
        }
    }

    #[test]
    fn rejects_too_many_entries() {
        let mut table = PartitionTable::default_layout(0x200000);
        let filler = table.entries[1].clone();
        table.entries.resize(MAX_ENTRIES + 1, filler);
        assert!(table.build().is_err());
    }

    #[test]
    fn rejects_long_names() {
        let mut table = PartitionTable::default_layout(0x200000);
        table.entries[0].name = "overlylongname".into();
        assert!(table.build().is_err());
    }

    #[test]
    fn rejects_corrupted_entry_crc() {
        let mut built = PartitionTable::default_layout(0x200000).build().unwrap();
        let flip = HEADER_SIZE + 20;
        built[flip] ^= 0xFF;
        assert!(PartitionTable::parse(&built).is_err());
    }

    #[test]
    fn rejects_out_of_range_partition() {
        let mut table = PartitionTable::default_layout(0x200000);
        table.entries[0].len0 = 0x300000;
        assert!(table.validate(0x200000).is_err());
    }
}
