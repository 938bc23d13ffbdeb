//! Bundled loader and stub assets
//!
//! Every family that needs RAM-resident helper code ships it inside the
//! binary: the BL eflash loaders and the W800 stub as gzip blobs, the ESP
//! stubs as JSON objects with base64 payloads (the format esptool uses).

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::error::Error;
use crate::targets::ChipFamily;

const BL602_LOADER_GZ: &[u8] = include_bytes!("../resources/loaders/bl602-eflash-loader.bin.gz");
const BL702_LOADER_GZ: &[u8] = include_bytes!("../resources/loaders/bl702-eflash-loader.bin.gz");
const BL602_DTS: &[u8] = include_bytes!("../resources/loaders/bl602-dts.bin");

const W800_STUB_RAW: &[u8] = include_bytes!("../resources/stubs/w800-stub.bin");
const W800_STUB_GZ: &[u8] = include_bytes!("../resources/stubs/w800-stub.bin.gz");

const STUB_ESP32: &str = include_str!("../resources/stubs/esp32.json");
const STUB_ESP32S3: &str = include_str!("../resources/stubs/esp32s3.json");
const STUB_ESP32C3: &str = include_str!("../resources/stubs/esp32c3.json");

fn gunzip(raw: &[u8], asset: &'static str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    GzDecoder::new(raw)
        .read_to_end(&mut out)
        .map_err(|_| Error::MalformedAsset(asset))?;
    Ok(out)
}

/// The eflash loader image uploaded to BL602/702 RAM
pub fn bl_eflash_loader(family: ChipFamily) -> Result<Vec<u8>, Error> {
    match family {
        ChipFamily::BL602 => gunzip(BL602_LOADER_GZ, "bl602-eflash-loader"),
        ChipFamily::BL702 => gunzip(BL702_LOADER_GZ, "bl702-eflash-loader"),
        _ => Err(Error::MalformedAsset("no eflash loader for this family")),
    }
}

/// Device-tree image paired with the BL602 loader
pub fn bl602_dts() -> &'static [u8] {
    BL602_DTS
}

/// The W800 RAM stub, preferring the raw image over the gzip variant
pub fn w800_stub() -> Result<Vec<u8>, Error> {
    if !W800_STUB_RAW.is_empty() {
        return Ok(W800_STUB_RAW.to_vec());
    }
    gunzip(W800_STUB_GZ, "w800-stub")
}

/// ESP flasher stub, deserialised from the bundled JSON
#[derive(Debug, Clone, Deserialize)]
pub struct EspStub {
    entry: u32,
    text: String,
    text_start: u32,
    data: String,
    data_start: u32,
}

impl EspStub {
    /// Fetch the stub for an ESP family
    pub fn get(family: ChipFamily) -> Result<EspStub, Error> {
        let raw = match family {
            ChipFamily::ESP32 => STUB_ESP32,
            ChipFamily::ESP32S3 => STUB_ESP32S3,
            ChipFamily::ESP32C3 => STUB_ESP32C3,
            _ => return Err(Error::MalformedAsset("no flasher stub for this family")),
        };

        serde_json::from_str(raw).map_err(|_| Error::MalformedAsset("esp stub json"))
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Text segment load address and bytes
    pub fn text(&self) -> Result<(u32, Vec<u8>), Error> {
        let bytes = BASE64
            .decode(&self.text)
            .map_err(|_| Error::MalformedAsset("esp stub text segment"))?;
        Ok((self.text_start, bytes))
    }

    /// Data segment load address and bytes
    pub fn data(&self) -> Result<(u32, Vec<u8>), Error> {
        let bytes = BASE64
            .decode(&self.data)
            .map_err(|_| Error::MalformedAsset("esp stub data segment"))?;
        Ok((self.data_start, bytes))
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn esp_stub_encodings_decode() {
        for family in ChipFamily::iter().filter(ChipFamily::is_esp) {
            let stub = EspStub::get(family).unwrap();
            let (text_start, text) = stub.text().unwrap();
            let (data_start, data) = stub.data().unwrap();
            assert!(!text.is_empty());
            assert!(!data.is_empty());
            assert_ne!(text_start, data_start);
            assert_ne!(stub.entry(), 0);
        }
    }

    #[test]
    fn bl_loaders_decompress() {
        for family in [ChipFamily::BL602, ChipFamily::BL702] {
            let loader = bl_eflash_loader(family).unwrap();
            assert!(!loader.is_empty());
        }
        assert!(bl_eflash_loader(ChipFamily::BL616).is_err());
        assert!(!bl602_dts().is_empty());
    }

    #[test]
    fn w800_stub_raw_and_gz_variants_agree() {
        let raw = w800_stub().unwrap();
        let gz = super::gunzip(super::W800_STUB_GZ, "w800-stub").unwrap();
        assert_eq!(raw, gz);
    }
}
