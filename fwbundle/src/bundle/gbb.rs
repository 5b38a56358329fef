// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Google Binary Block creation with `gbb_utility`.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{info, trace};

use crate::{
    bundle::CONFIG_NODE,
    fdt::{self, DeviceTree},
    format::gbb::{self, GbbFlags},
    tool::{self, ToolRunner},
};

/// Flash map node of the GBB region.
pub const GBB_NODE: &str = "/flash/ro-gbb";
/// Space taken by the header, the hardware ID and the two keys.
const FIXED_SECTIONS_SIZE: u32 = 0x2180;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No hardware ID given and none found at /config/hwid")]
    NoHardwareId,
    #[error("No size for the GBB region: {GBB_NODE}")]
    NoGbbSize,
    #[error("GBB region is too small: {0:#x}")]
    GbbTooSmall(u32),
    #[error("Invalid GBB flags")]
    Flags(#[from] gbb::Error),
    #[error("Device tree error")]
    Fdt(#[from] fdt::Error),
    #[error("GBB tool failed")]
    Tool(#[from] tool::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Size of the GBB region in the device tree's flash map.
pub fn gbb_size<T: DeviceTree>(tree: &T) -> Result<u32> {
    if let Some(reg) = tree.get_ints(GBB_NODE, "reg")? {
        if let [_, size] = reg[..] {
            return Ok(size as u32);
        }
    }

    tree.get_int(GBB_NODE, "size")?
        .map(|s| s as u32)
        .ok_or(Error::NoGbbSize)
}

/// Flags from the device tree, with the user's adjustments applied on top.
pub fn decode_flags<T: DeviceTree>(tree: &T, adjustments: Option<&str>) -> Result<GbbFlags> {
    let props = tree.get_props(gbb::FDT_NODE)?;
    let base = GbbFlags::from_fdt_props(&props)?;
    trace!("GBB flags from device tree: {base:#x}");

    Ok(gbb::adjust(base, adjustments)?)
}

/// Inputs for [`create_gbb`].
#[derive(Clone, Copy, Debug)]
pub struct GbbSources<'a> {
    /// Overrides `/config/hwid`.
    pub hardware_id: Option<&'a str>,
    pub flag_adjustments: Option<&'a str>,
    /// Directory containing `root_key.vbpubk` and `recovery_key.vbpubk`.
    pub keydir: &'a Path,
    pub bmpblk: &'a Path,
    pub out_dir: &'a Path,
}

fn path_arg(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path);
    arg
}

/// Create `gbb.bin` in the output directory.
pub fn create_gbb<T: DeviceTree, R: ToolRunner + ?Sized>(
    tree: &T,
    tools: &R,
    sources: &GbbSources,
) -> Result<PathBuf> {
    let hardware_id = match sources.hardware_id {
        Some(id) => id.to_owned(),
        None => tree
            .get_string(CONFIG_NODE, "hwid")?
            .ok_or(Error::NoHardwareId)?,
    };

    let size = gbb_size(tree)?;
    let bmpfv_size = size
        .checked_sub(FIXED_SECTIONS_SIZE)
        .ok_or(Error::GbbTooSmall(size))?;

    let flags = decode_flags(tree, sources.flag_adjustments)?;
    info!("GBB flags value {flags:#x}");
    info!("Creating GBB");

    let sizes = [0x100, 0x1000, bmpfv_size, 0x1000]
        .iter()
        .map(|s| format!("{s:#x}"))
        .collect::<Vec<_>>()
        .join(",");
    let gbb = "gbb.bin";

    tools.run(
        "gbb_utility",
        &["-c".into(), sizes.into(), gbb.into()],
        Some(sources.out_dir),
    )?;
    tools.run(
        "gbb_utility",
        &[
            "-s".into(),
            format!("--hwid={hardware_id}").into(),
            path_arg("--rootkey=", &sources.keydir.join("root_key.vbpubk")),
            path_arg("--recoverykey=", &sources.keydir.join("recovery_key.vbpubk")),
            path_arg("--bmpfv=", sources.bmpblk),
            format!("--flags={}", flags.bits()).into(),
            gbb.into(),
        ],
        Some(sources.out_dir),
    )?;

    Ok(sources.out_dir.join(gbb))
}
