//! CRC and hash primitives shared by the protocol drivers
//!
//! Every family verifies data differently: BK compares CRC-32 over sector
//! ranges, BL compares SHA-256 digests, ESP compares MD5 digests, and WM
//! frames every command with CRC-16. The checksum tables are built once at
//! compile time.

use crc::{Algorithm, Crc, CRC_16_IBM_3740, CRC_16_XMODEM};
use md5::{Digest, Md5};
use sha2::Sha256;

// The BootROMs use the reflected 0xEDB88320 CRC-32 but skip the final XOR,
// so the standard ISO-HDLC algorithm cannot be used as-is.
const CRC_32_NO_XOROUT: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04C1_1DB7,
    init: 0xFFFF_FFFF,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0x340B_C6D9,
    residue: 0,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_NO_XOROUT);
const CRC16_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const CRC16_XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Reflected CRC-32 (poly 0xEDB88320) without the final XOR
///
/// `init` is caller-supplied; the drivers always pass `0xFFFFFFFF`, which
/// also makes the result chainable across buffers.
pub fn crc32(init: u32, data: &[u8]) -> u32 {
    let mut digest = CRC32.digest_with_initial(init);
    digest.update(data);
    digest.finalize()
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), used by the WM framing
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    CRC16_CCITT_FALSE.checksum(data)
}

/// CRC-16/XMODEM (poly 0x1021, init 0x0000), used by the XMODEM sender
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    CRC16_XMODEM.checksum(data)
}

/// MD5 digest, used by the ESP32 write verification
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 digest, used by BL verification and boot header generation
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
