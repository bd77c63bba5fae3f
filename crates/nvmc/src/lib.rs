//! Codec for the NVS (legacy) and ZMS (modern) non-volatile settings
//! storage formats used by FMN accessory firmware, plus the provisioning
//! and extraction workflows built on top of it.
//!
//! The entry points most callers want are [`device::lookup`],
//! [`provisioning::provision`] and [`provisioning::extract`]; the `nvs` and
//! `zms` modules implement the per-sector codecs that [`settings::Settings`]
//! dispatches between.

pub mod crc;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod ihex;
pub mod image;
pub mod nvs;
pub mod provisioning;
pub mod sector;
pub mod settings;
pub mod zms;
