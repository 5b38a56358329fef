// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Exynos BL2 (U-Boot SPL) machine parameter block.
//!
//! The SPL carries a parameter block that tells it how to set up memory and
//! where to load U-Boot from:
//!
//! ```text
//! u32le marker (0xdeadbeef)
//! u32le version (1)
//! u32le size
//! u8[]  parameter codes, NUL terminated, padded to 4 bytes
//! u32le value for each code
//! ```
//!
//! The last four bytes of the whole BL2 image are a checksum: the sum of all
//! preceding bytes, truncated to 32 bits.

use std::{fmt, str::FromStr};

use memchr::memmem;
use thiserror::Error;
use tracing::{info, trace, warn};
use zerocopy::{FromBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::format::padding;

pub const PARAM_MARKER: u32 = 0xdeadbeef;
pub const PARAM_VERSION: u32 = 1;

/// Size of the checksum at the end of the image.
pub const CHECKSUM_SIZE: usize = 4;

/// Device tree node holding the memory controller settings.
pub const DMC_NODE: &str = "/dmc";

pub const MEM_TYPES: [&str; 4] = ["ddr2", "ddr3", "lpddr2", "lpddr3"];
pub const MEM_MANUFS: [&str; 3] = ["autodetect", "elpida", "samsung"];
pub const MEM_SPEEDS_MHZ: [u32; 3] = [533, 667, 800];

const DEFAULT_MEM_TYPE: &str = "ddr3";
const DEFAULT_MEM_MANUF: &str = "samsung";
const DEFAULT_MEM_FREQ_HZ: u32 = 800_000_000;
const MEM_INTERLEAVE: u32 = 31;
const UBOOT_SIZE_ALIGN: u32 = 0x1000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not find machine parameter block")]
    ParameterBlockNotFound,
    #[error("Cannot update machine parameter block version {0}")]
    UnsupportedVersion(u32),
    #[error("Machine parameter block at {pos:#x} is corrupt: {reason}")]
    CorruptParameterBlock { pos: usize, reason: String },
    #[error("Image is too small to hold a checksum: {0} bytes")]
    NoChecksum(usize),
    #[error("Unknown memory type: {0:?}")]
    UnknownMemoryType(String),
    #[error("Unknown memory manufacturer: {0:?}")]
    UnknownMemoryManufacturer(String),
    #[error("Invalid boot source: {0:?}")]
    InvalidBootSource(String),
    #[error("U-Boot size overflows when rounded up: {0:#x}")]
    UBootSizeOverflow(u32),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout of the parameter block header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`PARAM_MARKER`].
    marker: little_endian::U32,
    version: little_endian::U32,
    size: little_endian::U32,
}

/// Device the SPL loads U-Boot from. The discriminants are U-Boot's
/// `enum boot_mode` values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootSource {
    /// Selected by the CPU strap pins.
    #[default]
    Straps,
    Spi,
    Emmc,
    Usb,
}

impl BootSource {
    pub fn code(self) -> u32 {
        match self {
            Self::Straps => 32,
            Self::Spi => 20,
            Self::Emmc => 4,
            Self::Usb => 33,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Straps => "straps",
            Self::Spi => "spi",
            Self::Emmc => "emmc",
            Self::Usb => "usb",
        }
    }
}

impl fmt::Display for BootSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BootSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "straps" => Ok(Self::Straps),
            "spi" => Ok(Self::Spi),
            "emmc" => Ok(Self::Emmc),
            "usb" => Ok(Self::Usb),
            _ => Err(Error::InvalidBootSource(s.to_owned())),
        }
    }
}

/// Inputs for the parameter values. Device tree values are [`None`] when the
/// property is absent, in which case a default is used with a warning.
#[derive(Clone, Debug, Default)]
pub struct MachineParams {
    pub mem_type: Option<String>,
    pub mem_manuf: Option<String>,
    /// Memory clock in Hz.
    pub mem_freq: Option<u32>,
    /// Size of the payload the SPL must load.
    pub uboot_size: u32,
    pub boot_source: BootSource,
}

/// A single-character parameter code from the block's code list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterKind {
    MemoryType,
    MemoryManufacturer,
    MemoryFrequency,
    MemoryInterleave,
    UBootSize,
    BootSource,
    Unknown(u8),
}

impl ParameterKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            b'm' => Self::MemoryType,
            b'M' => Self::MemoryManufacturer,
            b'f' => Self::MemoryFrequency,
            b'v' => Self::MemoryInterleave,
            b'u' => Self::UBootSize,
            b'b' => Self::BootSource,
            c => Self::Unknown(c),
        }
    }

    /// Compute the new value for this parameter. `current` is the value
    /// already stored in the block, which is kept for unknown codes.
    pub fn resolve(self, params: &MachineParams, current: u32) -> Result<u32> {
        let value = match self {
            Self::MemoryType => {
                let mem_type = params.mem_type.as_deref().unwrap_or_else(|| {
                    warn!("No value for memory type: using {DEFAULT_MEM_TYPE:?}");
                    DEFAULT_MEM_TYPE
                });
                let index = MEM_TYPES
                    .iter()
                    .position(|t| *t == mem_type)
                    .ok_or_else(|| Error::UnknownMemoryType(mem_type.to_owned()))?;

                info!("  Memory type: {mem_type} ({index})");
                index as u32
            }
            Self::MemoryManufacturer => {
                let mem_manuf = params.mem_manuf.as_deref().unwrap_or_else(|| {
                    warn!("No value for memory manufacturer: using {DEFAULT_MEM_MANUF:?}");
                    DEFAULT_MEM_MANUF
                });
                let index = MEM_MANUFS
                    .iter()
                    .position(|m| *m == mem_manuf)
                    .ok_or_else(|| Error::UnknownMemoryManufacturer(mem_manuf.to_owned()))?;

                info!("  Memory manufacturer: {mem_manuf} ({index})");
                index as u32
            }
            Self::MemoryFrequency => {
                let freq = params.mem_freq.unwrap_or_else(|| {
                    warn!("No value for memory frequency: using {DEFAULT_MEM_FREQ_HZ}");
                    DEFAULT_MEM_FREQ_HZ
                });
                let mhz = freq / 1_000_000;

                if !MEM_SPEEDS_MHZ.contains(&mhz) {
                    warn!("Unexpected memory speed: {mhz}");
                }

                info!("  Memory speed: {mhz}");
                mhz
            }
            Self::MemoryInterleave => {
                info!("  Memory interleave: {MEM_INTERLEAVE:#x}");
                MEM_INTERLEAVE
            }
            Self::UBootSize => {
                let size = padding::round(params.uboot_size, UBOOT_SIZE_ALIGN)
                    .ok_or(Error::UBootSizeOverflow(params.uboot_size))?;

                info!(
                    "  U-Boot size: {size:#x} (rounded up from {:#x})",
                    params.uboot_size,
                );
                size
            }
            Self::BootSource => {
                let code = params.boot_source.code();

                info!("  Boot source: {} ({code:#x})", params.boot_source);
                code
            }
            Self::Unknown(c) => {
                warn!("Unknown machine parameter type: {:?}", char::from(c));
                info!("  Unknown value: {current:#x}");
                current
            }
        };

        Ok(value)
    }
}

fn corrupt(pos: usize, reason: impl Into<String>) -> Error {
    Error::CorruptParameterBlock {
        pos,
        reason: reason.into(),
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    little_endian::U32::read_from_bytes(bytes).ok().map(|v| v.get())
}

/// Find the offset of the last parameter block marker.
pub fn find_block(data: &[u8]) -> Result<usize> {
    memmem::rfind(data, &PARAM_MARKER.to_le_bytes()).ok_or(Error::ParameterBlockNotFound)
}

/// Rewrite every value in the parameter block according to its code. The
/// checksum is not touched.
pub fn update_parameters(data: &mut [u8], params: &MachineParams) -> Result<()> {
    let pos = find_block(data)?;

    let (header, _) = RawHeader::read_from_prefix(&data[pos..])
        .map_err(|_| corrupt(pos, "header is truncated"))?;

    trace!(
        "Parameter block at {pos:#x}: marker={:#x}, version={}, size={}",
        header.marker.get(),
        header.version.get(),
        header.size.get(),
    );

    let version = header.version.get();
    if version != PARAM_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let size = header.size.get() as usize;
    let space = data.len() - pos;
    if size > space {
        return Err(corrupt(
            pos,
            format!("size {size} exceeds remaining space {space} (image size {})", data.len()),
        ));
    }

    let codes_start = pos + size_of::<RawHeader>();
    let codes_len = memchr::memchr(0, &data[codes_start..])
        .ok_or_else(|| corrupt(pos, "parameter list is not NUL terminated"))?;
    let codes = data[codes_start..codes_start + codes_len].to_vec();
    let values_start = codes_start + ((codes_len + 4) & !3);

    for (i, code) in codes.into_iter().enumerate() {
        let offset = values_start + i * 4;
        let current = read_u32(data, offset)
            .ok_or_else(|| corrupt(pos, format!("value #{i} at {offset:#x} is out of bounds")))?;

        let value = ParameterKind::from_code(code).resolve(params, current)?;
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    info!("BL2 configuration complete");

    Ok(())
}

/// Sum of all bytes, truncated to 32 bits.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |sum, b| sum.wrapping_add(u32::from(*b)))
}

/// Recompute the checksum stored in the last four bytes of the image.
pub fn update_checksum(data: &mut [u8]) -> Result<u32> {
    let Some(split) = data.len().checked_sub(CHECKSUM_SIZE) else {
        return Err(Error::NoChecksum(data.len()));
    };

    let (body, trailer) = data.split_at_mut(split);
    let sum = checksum(body);
    trailer.copy_from_slice(&sum.to_le_bytes());

    Ok(sum)
}

/// Check that the stored checksum matches the image contents.
pub fn verify_checksum(data: &[u8]) -> Result<bool> {
    let Some(split) = data.len().checked_sub(CHECKSUM_SIZE) else {
        return Err(Error::NoChecksum(data.len()));
    };

    Ok(read_u32(data, split) == Some(checksum(&data[..split])))
}

/// Update the parameter block and the checksum of a BL2 image in place.
pub fn patch(data: &mut [u8], params: &MachineParams) -> Result<()> {
    update_parameters(data, params)?;
    update_checksum(data)?;

    Ok(())
}
