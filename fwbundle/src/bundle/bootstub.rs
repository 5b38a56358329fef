// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Signed Tegra bootstub creation.
//!
//! The bootstub is U-Boot followed by its device tree. The boot ROM only loads
//! the signed part, so an optional postload binary is appended after the
//! signed image and U-Boot is told where to find it through
//! `/config/postload-text-offset`.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    bundle::{CHROMEOS_CONFIG_NODE, CONFIG_NODE},
    fdt::{self, DeviceTree},
    format::textbase,
    tool::{self, ToolRunner},
    util::NumBytes,
};

/// Device tree property holding the flash offset of the postload binary.
pub const POSTLOAD_PROP: &str = "postload-text-offset";
/// Postload offset meaning the postload binary directly follows the bootstub.
pub const NO_POSTLOAD_OFFSET: u32 = 0xffffffff;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Signed file size changed from {before} to {after} after updating fdt")]
    SizeInvariantViolation { before: u64, after: u64 },
    #[error("Signed image is too large for a postload offset: {0}")]
    SignedTooLarge(usize),
    #[error("Device tree error")]
    Fdt(#[from] fdt::Error),
    #[error("Signing tool failed")]
    Tool(#[from] tool::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::File(path.to_owned(), e))
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|e| Error::File(path.to_owned(), e))
}

fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::File(path.to_owned(), e))
}

/// Produces an image that the SoC boot ROM accepts.
pub trait BootstubSigner {
    /// Sign `bootstub` using `bct`, to be loaded at `text_base`. The signed
    /// image is written to `output`.
    fn sign(&self, bct: &Path, bootstub: &Path, text_base: u32, output: &Path) -> Result<()>;
}

/// Signs bootstubs with `cbootimage`.
#[derive(Clone, Debug)]
pub struct CbootimageSigner<R: ToolRunner> {
    tools: R,
    out_dir: PathBuf,
}

impl<R: ToolRunner> CbootimageSigner<R> {
    pub fn new(tools: R, out_dir: &Path) -> Self {
        Self {
            tools,
            out_dir: out_dir.to_owned(),
        }
    }

    /// Contents of the `cbootimage` configuration file.
    pub fn boot_config(bct: &Path, bootstub: &Path, text_base: u32, is_nand: bool) -> String {
        let mut config = String::new();
        config.push_str("Version    = 1;\n");
        config.push_str("Redundancy = 1;\n");
        config.push_str(&format!("Bctfile    = {};\n", bct.display()));

        // The flash map only has space for one BCT copy on NAND.
        if is_nand {
            config.push_str("Bctcopy = 1;\n");
        }

        config.push_str(&format!(
            "BootLoader = {},{text_base:#x},{text_base:#x},Complete;\n",
            bootstub.display(),
        ));

        config
    }
}

impl<R: ToolRunner> BootstubSigner for CbootimageSigner<R> {
    fn sign(&self, bct: &Path, bootstub: &Path, text_base: u32, output: &Path) -> Result<()> {
        info!("Signing bootstub");

        let bct_info = self.tools.run("bct_dump", &[bct.into()], None)?;
        let is_nand = bct_info.contains("NvBootDevType_Nand");

        let config_path = self.out_dir.join("boot.cfg");
        let config = Self::boot_config(bct, bootstub, text_base, is_nand);
        write_file(&config_path, config.as_bytes())?;

        let args: [OsString; 2] = [config_path.into(), output.into()];
        self.tools.run("cbootimage", &args, None)?;

        debug!("BCT: {:?}", NumBytes(file_size(bct)?));
        debug!("Signed image: {:?}", NumBytes(file_size(output)?));

        Ok(())
    }
}

/// Inputs for [`create_bootstub`].
#[derive(Clone, Copy, Debug)]
pub struct BootstubSources<'a> {
    pub uboot: &'a Path,
    pub bct: &'a Path,
    pub postload: Option<&'a Path>,
    pub out_dir: &'a Path,
}

/// Outputs of [`create_bootstub`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bootstub {
    /// U-Boot, the device tree with no postload offset, and the postload
    /// binary if there is one. This is used by the RW firmware copies.
    pub bootstub: PathBuf,
    /// Signed image with the postload binary appended.
    pub signed: PathBuf,
}

/// Build and sign the bootstub. When a postload binary is configured, the
/// bootstub is signed a second time with the real postload offset, and the
/// signed image must keep its size.
pub fn create_bootstub<T: DeviceTree, S: BootstubSigner + ?Sized>(
    base_fdt: &T,
    signer: &S,
    sources: &BootstubSources,
) -> Result<Bootstub> {
    let out_dir = sources.out_dir;
    let uboot_data = read_file(sources.uboot)?;

    // The load address always comes from the plain U-Boot binary.
    let declared = base_fdt
        .get_int(CHROMEOS_CONFIG_NODE, "textbase")?
        .unwrap_or(0);
    let text_base = textbase::reconcile(
        &sources.uboot.display().to_string(),
        declared,
        textbase::decode(&uboot_data),
    );

    let mut fdt = base_fdt.copy(&out_dir.join("bootstub.dtb"))?;
    fdt.put_int(CONFIG_NODE, POSTLOAD_PROP, NO_POSTLOAD_OFFSET)?;
    let fdt_data = fdt.data()?;

    let mut bootstub = out_dir.join("u-boot-fdt.bin");
    write_file(&bootstub, &[uboot_data.as_slice(), &fdt_data].concat())?;
    debug!("U-Boot binary: {:?}", NumBytes(uboot_data.len()));
    debug!("U-Boot fdt: {:?}", NumBytes(fdt_data.len()));
    debug!("Combined binary: {:?}", NumBytes(uboot_data.len() + fdt_data.len()));

    let signed = out_dir.join("signed.bin");
    signer.sign(sources.bct, &bootstub, text_base, &signed)?;
    let mut data = read_file(&signed)?;

    if let Some(postload) = sources.postload {
        let postload_data = read_file(postload)?;

        // The RW copies find the postload binary right after the bootstub.
        let mut bs_data = read_file(&bootstub)?;
        bs_data.extend_from_slice(&postload_data);
        bootstub = out_dir.join("u-boot-fdt-postload.bin");
        write_file(&bootstub, &bs_data)?;
        debug!("Combined binary with postload: {:?}", NumBytes(bs_data.len()));

        let offset = u32::try_from(data.len()).map_err(|_| Error::SignedTooLarge(data.len()))?;
        fdt.put_int(CONFIG_NODE, POSTLOAD_PROP, offset)?;
        let fdt_data = fdt.data()?;

        let postload_bootstub = out_dir.join("postload.bin");
        write_file(&postload_bootstub, &[uboot_data.as_slice(), &fdt_data].concat())?;

        let resigned = out_dir.join("signed-resigned.bin");
        signer.sign(sources.bct, &postload_bootstub, text_base, &resigned)?;

        let before = data.len() as u64;
        let after = file_size(&resigned)?;
        if before != after {
            return Err(Error::SizeInvariantViolation { before, after });
        }

        data = read_file(&resigned)?;
        data.extend_from_slice(&postload_data);
        debug!("Post-load binary: {:?}", NumBytes(postload_data.len()));
    }

    let signed_postload = out_dir.join("signed-postload.bin");
    write_file(&signed_postload, &data)?;
    debug!("Final bootstub with postload: {:?}", NumBytes(data.len()));

    Ok(Bootstub {
        bootstub,
        signed: signed_postload,
    })
}
