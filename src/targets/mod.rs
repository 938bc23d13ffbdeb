//! Supported chip families
//!
//! A [ChipFamily] identifies the protocol dialect a device speaks and the
//! firmware-packaging rules that go with it. The protocol drivers themselves
//! live in [crate::flasher].

use strum::{Display, EnumIter, EnumString, VariantNames};

/// Every chip family uniflash can talk to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, VariantNames,
)]
#[strum(ascii_case_insensitive)]
#[non_exhaustive]
pub enum ChipFamily {
    BK7231T,
    BK7231U,
    BK7231N,
    BK7231M,
    BK7238,
    BK7236,
    BK7252,
    BK7252N,
    BK7258,
    BL602,
    BL702,
    BL616,
    W600,
    W800,
    ESP32,
    #[strum(to_string = "ESP32S3", serialize = "ESP32-S3")]
    ESP32S3,
    #[strum(to_string = "ESP32C3", serialize = "ESP32-C3")]
    ESP32C3,
}

/// Firmware packaging flavour, reflected in release-asset names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packaging {
    /// Image contains a bootloader prefix
    Qio,
    /// Image starts at the application offset
    Ua,
    /// Single flat image
    Plain,
}

impl ChipFamily {
    /// Packaging flavour of this family's release firmware
    pub fn packaging(&self) -> Packaging {
        use ChipFamily::*;

        match self {
            BK7231N | BK7231M | BK7236 | BK7238 | BK7252N | BK7258 => Packaging::Qio,
            BK7231T | BK7231U | BK7252 => Packaging::Ua,
            _ => Packaging::Plain,
        }
    }

    /// Prefix used to match this family's firmware among release assets
    pub fn firmware_prefix(&self) -> String {
        match self.packaging() {
            Packaging::Qio => format!("Open{}_QIO_", self),
            Packaging::Ua => format!("Open{}_UA_", self),
            Packaging::Plain => format!("Open{}_", self),
        }
    }

    /// First writable address when the bootloader must stay intact
    ///
    /// Only BK7231T/U enforce this; their BootROM happily overwrites the
    /// bootloader otherwise.
    pub fn protected_bootloader_end(&self) -> Option<u32> {
        match self {
            ChipFamily::BK7231T | ChipFamily::BK7231U => Some(0x11000),
            _ => None,
        }
    }

    pub fn is_bk(&self) -> bool {
        matches!(
            self,
            ChipFamily::BK7231T
                | ChipFamily::BK7231U
                | ChipFamily::BK7231N
                | ChipFamily::BK7231M
                | ChipFamily::BK7238
                | ChipFamily::BK7236
                | ChipFamily::BK7252
                | ChipFamily::BK7252N
                | ChipFamily::BK7258
        )
    }

    pub fn is_bl(&self) -> bool {
        matches!(
            self,
            ChipFamily::BL602 | ChipFamily::BL702 | ChipFamily::BL616
        )
    }

    pub fn is_wm(&self) -> bool {
        matches!(self, ChipFamily::W600 | ChipFamily::W800)
    }

    pub fn is_esp(&self) -> bool {
        matches!(
            self,
            ChipFamily::ESP32 | ChipFamily::ESP32S3 | ChipFamily::ESP32C3
        )
    }
}
