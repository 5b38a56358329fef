// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! U-Boot TEXT_BASE detection.
//!
//! U-Boot images start with a small header where the word `0x12345678` is
//! immediately followed by the TEXT_BASE value. Upstream Tegra builds prepend a
//! 16 KiB SPL, whose header holds the U-Boot text base rather than the SPL
//! one, so the U-Boot part after the SPL is searched as well.

use tracing::{info, trace, warn};

/// Header word preceding the TEXT_BASE value.
pub const TEXT_BASE_MARKER: u32 = 0x12345678;
/// Size of the SPL prepended to upstream Tegra U-Boot images.
pub const SPL_SIZE: usize = 0x4000;
/// Offsets where a U-Boot header may start, in order of precedence.
pub const SCAN_STARTS: [usize; 2] = [0, SPL_SIZE];
/// Number of words searched after each start offset.
const SCAN_WORDS: usize = 40;

fn read_word(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Find the TEXT_BASE recorded in a U-Boot image. The value found is relative
/// to the scan start, so the SPL size is subtracted for the second location.
/// Returns [`None`] when no marker is present.
pub fn decode(data: &[u8]) -> Option<u32> {
    for start in SCAN_STARTS {
        for i in 0..SCAN_WORDS {
            let offset = start + i * 4;

            let Some(word) = read_word(data, offset) else {
                break;
            };

            if word == TEXT_BASE_MARKER {
                // A marker in the last word has no value after it.
                let Some(value) = read_word(data, offset + 4) else {
                    break;
                };
                trace!("Found TEXT_BASE marker at {offset:#x}: {value:#x}");

                // The scan start is far below 4 GiB.
                return Some(value.wrapping_sub(start as u32));
            }
        }
    }

    None
}

/// Pick the text base to load U-Boot at. The device tree value may hold a
/// sign-extended cell, so only the low 32 bits are used. If the image
/// contains a different value, the image wins.
pub fn reconcile(name: &str, declared: i64, decoded: Option<u32>) -> u32 {
    let declared = (declared & 0xffffffff) as u32;

    match decoded {
        Some(value) => {
            info!("TEXT_BASE: fdt says {declared:#x}, {name} says {value:#x}");

            if value != declared {
                warn!(
                    "TEXT_BASE {value:#x} in {name} doesn't match fdt value of {declared:#x}; \
                    using {value:#x}",
                );
            }

            value
        }
        None => {
            info!("TEXT_BASE: fdt says {declared:#x}, {name} says None");
            declared
        }
    }
}
