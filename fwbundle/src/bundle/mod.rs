// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Firmware image assembly.
//!
//! [`Bundle`] drives a single build: it prepares the device tree, builds the
//! blob for every blob type in the flash map, and hands the results to the
//! packer. Every intermediate file is written once into the output directory.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use bstr::ByteSlice;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    board::{self, ArchFamily, BoardProfile},
    fdt::{self, DeviceTree},
    format::bl2::{self, BootSource, MachineParams},
    pack::{self, FlashMapPacker, Packer},
    tool::{self, ToolRunner},
    util::NumBytes,
};

pub mod bootstub;
pub mod configure;
pub mod gbb;

use bootstub::{BootstubSigner, BootstubSources};
use gbb::GbbSources;

/// U-Boot runtime configuration node.
pub const CONFIG_NODE: &str = "/config";
/// Chrome OS verified boot configuration node.
pub const CHROMEOS_CONFIG_NODE: &str = "/chromeos-config";

/// Offset within the full coreboot ROM where the bootstub region starts.
const COREBOOT_STUB_OFFSET: usize = 0x700000;
/// Load address and entry point of U-Boot as a coreboot payload.
const COREBOOT_PAYLOAD_LOAD: &str = "0x1110000";
const COREBOOT_PAYLOAD_ENTRY: &str = "0x1110008";
/// CBFS file type for the device tree.
const CBFS_TYPE_DTB: &str = "0xac";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Board configuration error")]
    Board(#[from] board::Error),
    #[error("Failed to apply device tree overrides")]
    Configure(#[from] configure::Error),
    #[error("Failed to create GBB")]
    Gbb(#[from] gbb::Error),
    #[error("Failed to create bootstub")]
    Bootstub(#[from] bootstub::Error),
    #[error("Failed to configure BL2")]
    Bl2(#[from] bl2::Error),
    #[error("Failed to pack image")]
    Pack(#[from] pack::Error),
    #[error("Device tree error")]
    Fdt(#[from] fdt::Error),
    #[error("External tool failed")]
    Tool(#[from] tool::Error),
    #[error("Unknown blob type {0:?} required in flash map")]
    UnknownBlobType(String),
    #[error("Device tree has no model, which is needed for the firmware ID")]
    NoModel,
    #[error("Coreboot image is too small for the bootstub offset: {0:?}")]
    CorebootTooSmall(NumBytes<usize>),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a build failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing user input. Fixable by changing the configuration.
    Configuration,
    /// An input binary does not have the expected structure.
    IncompatibleBinary,
    /// An internal consistency check failed.
    InvariantViolation,
    ToolExecution,
    /// A full build is missing contents for part of the flash map.
    IncompleteImage,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration error",
            Self::IncompatibleBinary => "incompatible binary",
            Self::InvariantViolation => "invariant violation",
            Self::ToolExecution => "tool execution error",
            Self::IncompleteImage => "incomplete image",
            Self::Io => "I/O error",
        };

        f.write_str(name)
    }
}

fn fdt_kind(e: &fdt::Error) -> ErrorKind {
    match e {
        fdt::Error::InvalidInt { .. } => ErrorKind::Configuration,
        fdt::Error::Tool(_) => ErrorKind::ToolExecution,
        fdt::Error::File(..) => ErrorKind::Io,
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Board(e) => match e {
                board::Error::NoBoard => ErrorKind::Configuration,
                board::Error::ReadDir(..) => ErrorKind::Io,
            },
            Self::Configure(e) => match e {
                configure::Error::Fdt(e) => fdt_kind(e),
                _ => ErrorKind::Configuration,
            },
            Self::Gbb(e) => match e {
                gbb::Error::Fdt(e) => fdt_kind(e),
                gbb::Error::Tool(_) => ErrorKind::ToolExecution,
                _ => ErrorKind::Configuration,
            },
            Self::Bootstub(e) => match e {
                bootstub::Error::SizeInvariantViolation { .. }
                | bootstub::Error::SignedTooLarge(_) => ErrorKind::InvariantViolation,
                bootstub::Error::Fdt(e) => fdt_kind(e),
                bootstub::Error::Tool(_) => ErrorKind::ToolExecution,
                bootstub::Error::File(..) => ErrorKind::Io,
            },
            Self::Bl2(e) => match e {
                bl2::Error::ParameterBlockNotFound
                | bl2::Error::UnsupportedVersion(_)
                | bl2::Error::CorruptParameterBlock { .. }
                | bl2::Error::NoChecksum(_) => ErrorKind::IncompatibleBinary,
                _ => ErrorKind::Configuration,
            },
            Self::Pack(e) => match e {
                pack::Error::IncompleteImage(_) => ErrorKind::IncompleteImage,
                pack::Error::Fdt(e) => fdt_kind(e),
                pack::Error::File(..) => ErrorKind::Io,
                _ => ErrorKind::Configuration,
            },
            Self::Fdt(e) => fdt_kind(e),
            Self::Tool(_) => ErrorKind::ToolExecution,
            Self::UnknownBlobType(_) | Self::NoModel => ErrorKind::Configuration,
            Self::CorebootTooSmall(_) => ErrorKind::IncompatibleBinary,
            Self::File(..) => ErrorKind::Io,
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::File(path.to_owned(), e))
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|e| Error::File(path.to_owned(), e))
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).map_err(|e| Error::File(from.to_owned(), e))?;
    Ok(())
}

/// Build settings that are not board properties.
#[derive(Clone, Debug)]
pub struct BundleOptions {
    /// Only build a signed U-Boot, without a GBB or the verified boot parts.
    pub small: bool,
    /// GBB flag adjustments. See [`crate::format::gbb::GbbAdjustment`].
    pub gbb_flags: Option<String>,
    /// Overrides the hardware ID in the device tree.
    pub hardware_id: Option<String>,
    /// Clear the preamble flags of both RW firmware copies.
    pub force_rw: bool,
    pub keydir: PathBuf,
    /// Version part of the firmware ID.
    pub fw_version: String,
    pub spl_source: BootSource,
    /// `(node, "0" | "1")` pairs.
    pub enable: Vec<(String, String)>,
    /// `/config` values, stored as integers when they look like one.
    pub config: Vec<(String, String)>,
    /// `/config` values that must be integers.
    pub config_int: Vec<(String, String)>,
    pub bootcmd: Option<String>,
    pub bootsecure: bool,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            small: false,
            gbb_flags: None,
            hardware_id: None,
            force_rw: false,
            keydir: PathBuf::from("/usr/share/vboot/devkeys"),
            fw_version: "0.0.0".to_owned(),
            spl_source: BootSource::default(),
            enable: vec![],
            config: vec![],
            config_int: vec![],
            bootcmd: None,
            bootsecure: false,
        }
    }
}

/// Result of a successful build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BundleOutput {
    pub image: PathBuf,
    pub props: BTreeMap<String, PathBuf>,
}

/// Compile the board device tree and make the copy that the build modifies.
/// The original tree is never written to.
pub fn select_fdt<T: DeviceTree>(base: &mut T, family: ArchFamily, out_dir: &Path) -> Result<T> {
    base.compile(family.arch_include())?;

    Ok(base.copy(&out_dir.join("updated.dtb"))?)
}

/// Firmware ID: the model with runs of spaces and commas replaced by `_`,
/// followed by the version.
pub fn firmware_id(model: &str, version: &str) -> String {
    let separators = Regex::new("[ ,]+").unwrap();

    format!("{}.{version}", separators.replace_all(model, "_"))
}

/// A single firmware build.
pub struct Bundle<'a, T: DeviceTree> {
    profile: BoardProfile,
    options: BundleOptions,
    fdt: T,
    tools: &'a dyn ToolRunner,
    signer: &'a dyn BootstubSigner,
    out_dir: PathBuf,
}

impl<'a, T: DeviceTree> Bundle<'a, T> {
    /// Prepare a build from the board's device tree. This compiles it,
    /// switches to a writable copy and applies the configured overrides.
    pub fn new(
        profile: BoardProfile,
        options: BundleOptions,
        mut base_fdt: T,
        tools: &'a dyn ToolRunner,
        signer: &'a dyn BootstubSigner,
        out_dir: &Path,
    ) -> Result<Self> {
        let fdt = select_fdt(&mut base_fdt, profile.family, out_dir)?;

        let mut bundle = Self {
            profile,
            options,
            fdt,
            tools,
            signer,
            out_dir: out_dir.to_owned(),
        };
        bundle.apply_overrides()?;

        Ok(bundle)
    }

    /// The device tree that the build modifies.
    pub fn fdt(&self) -> &T {
        &self.fdt
    }

    fn apply_overrides(&mut self) -> Result<()> {
        if let Some(bootcmd) = &self.options.bootcmd {
            configure::set_bootcmd(&mut self.fdt, bootcmd, self.options.bootsecure)?;
        }

        configure::add_enable_list(&mut self.fdt, &self.options.enable)?;
        configure::add_config_list(&mut self.fdt, &self.options.config, false)?;
        configure::add_config_list(&mut self.fdt, &self.options.config_int, true)?;

        Ok(())
    }

    /// Create a patched copy of the BL2 that loads `uboot_size` bytes.
    pub fn configure_exynos_bl2(&self, uboot_size: usize) -> Result<PathBuf> {
        info!("Configuring BL2");

        let mut data = read_file(&self.profile.files.exynos_bl2)?;
        let params = MachineParams {
            mem_type: self.fdt.get_string(bl2::DMC_NODE, "mem-type")?,
            mem_manuf: self.fdt.get_string(bl2::DMC_NODE, "mem-manuf")?,
            mem_freq: self
                .fdt
                .get_int(bl2::DMC_NODE, "clock-frequency")?
                .map(|f| f as u32),
            // Sizes that don't fit fail when rounded up.
            uboot_size: u32::try_from(uboot_size).unwrap_or(u32::MAX),
            boot_source: self.options.spl_source,
        };

        bl2::patch(&mut data, &params)?;

        let bl2 = self.out_dir.join("updated-spl.bin");
        write_file(&bl2, &data)?;

        Ok(bl2)
    }

    fn build_blob(&self, packer: &mut FlashMapPacker, blob_type: &str) -> Result<()> {
        let files = &self.profile.files;

        match blob_type {
            "coreboot" => {
                let coreboot = self.out_dir.join("coreboot-full.rom");
                copy_file(&files.coreboot, &coreboot)?;
                packer.add_property("coreboot", &coreboot);
                packer.add_property("image", &coreboot);
            }
            "legacy" => packer.add_property("legacy", &files.seabios),
            "signed" => {
                let stub = bootstub::create_bootstub(
                    &self.fdt,
                    self.signer,
                    &BootstubSources {
                        uboot: &files.uboot,
                        bct: &files.bct,
                        postload: files.postload.as_deref(),
                        out_dir: &self.out_dir,
                    },
                )?;
                packer.add_property("bootstub", &stub.bootstub);
                packer.add_property("signed", &stub.signed);
                packer.add_property("image", &stub.signed);
            }
            "exynos-bl1" => packer.add_property(blob_type, &files.exynos_bl1),
            "ecrw" | "ecbin" => {
                packer.add_property("ecrw", &files.ecrw);
                packer.add_property("ecbin", &files.ecrw);
            }
            "ecro" => {
                // There can only be one flash map in the image, so the EC's
                // own one must not be found by a search.
                let data = read_file(&files.ecro)?.replace(b"__FMAP__", b"__fMAP__");
                let ecro = self.out_dir.join("updated-ecro.bin");
                write_file(&ecro, &data)?;
                packer.add_property(blob_type, &ecro);
            }
            "exynos-bl2" => {
                let params = packer.blob_params(blob_type);
                let names = match params.first() {
                    Some(p) => p.split(',').collect::<Vec<_>>(),
                    None => vec!["boot", "dtb"],
                };
                let size = packer.concat_prop_contents(&names)?.len();
                info!(
                    "BL2/SPL contains {:?}, size is {size} / {size:#x}",
                    names.join(", "),
                );

                let bl2 = self.configure_exynos_bl2(size)?;
                packer.add_property(blob_type, &bl2);
            }
            _ if packer.has_property(blob_type) => {
                debug!("Using existing property for blob type {blob_type:?}");
            }
            _ => return Err(Error::UnknownBlobType(blob_type.to_owned())),
        }

        Ok(())
    }

    fn cbfstool(&self, rom: &Path, args: &[&str], file: &Path) -> Result<()> {
        let mut argv: Vec<OsString> = vec![rom.into(), args[0].into(), "-f".into(), file.into()];
        argv.extend(args[1..].iter().map(OsString::from));

        self.tools.run("cbfstool", &argv, None)?;

        Ok(())
    }

    /// Add U-Boot and the final device tree to the coreboot ROM, then keep
    /// only the part that belongs in the bootstub region.
    fn fixup_coreboot(&self, packer: &FlashMapPacker, uboot_dtb: &Path) -> Result<()> {
        let Some(rom) = packer.get_property("coreboot").map(|p| p.to_owned()) else {
            return Err(pack::Error::MissingProperty("coreboot".to_owned()).into());
        };
        let fdt = self.fdt.copy(&self.out_dir.join("bootstub.dtb"))?;

        match &self.profile.files.coreboot_elf {
            Some(elf) => {
                self.cbfstool(
                    &rom,
                    &["add-payload", "-n", "fallback/payload", "-c", "lzma"],
                    elf,
                )?;
            }
            None => {
                self.cbfstool(
                    &rom,
                    &[
                        "add-flat-binary",
                        "-n",
                        "fallback/payload",
                        "-c",
                        "lzma",
                        "-l",
                        COREBOOT_PAYLOAD_LOAD,
                        "-e",
                        COREBOOT_PAYLOAD_ENTRY,
                    ],
                    uboot_dtb,
                )?;
            }
        }

        self.cbfstool(&rom, &["add", "-n", "u-boot.dtb", "-t", CBFS_TYPE_DTB], fdt.path())?;

        let data = read_file(&rom)?;
        write_file(&self.out_dir.join("coreboot-8mb.rom"), &data)?;

        let stub = data
            .get(COREBOOT_STUB_OFFSET..)
            .ok_or(Error::CorebootTooSmall(NumBytes(data.len())))?;
        write_file(&rom, stub)?;

        Ok(())
    }

    fn create_image(&mut self, gbb: Option<&Path>) -> Result<(PathBuf, FlashMapPacker)> {
        let model = self.fdt.get_string("/", "model")?;
        info!("Model: {}", model.as_deref().unwrap_or("<unknown>"));

        if self.options.force_rw {
            self.fdt.put_int("/flash/rw-a-vblock", "preamble-flags", 0)?;
            self.fdt.put_int("/flash/rw-b-vblock", "preamble-flags", 0)?;
        }

        let mut packer =
            FlashMapPacker::select(&self.fdt, self.profile.default_flash_map.as_deref())?;

        let files = self.profile.files.clone();
        packer.add_property("boot", &files.uboot);
        packer.add_property("skeleton", &files.skeleton);
        packer.add_property("dtb", self.fdt.path());

        // Each firmware copy gets its own device tree.
        let mut fdt_rwa = self.fdt.copy(&self.out_dir.join("updated-rwa.dtb"))?;
        fdt_rwa.put_string(CHROMEOS_CONFIG_NODE, "firmware-type", "rw-a")?;
        packer.add_property("dtb-rwa", fdt_rwa.path());
        let mut fdt_rwb = self.fdt.copy(&self.out_dir.join("updated-rwb.dtb"))?;
        fdt_rwb.put_string(CHROMEOS_CONFIG_NODE, "firmware-type", "rw-b")?;
        packer.add_property("dtb-rwb", fdt_rwb.path());
        self.fdt
            .put_string(CHROMEOS_CONFIG_NODE, "firmware-type", "ro")?;

        if let Some(kernel) = &files.kernel {
            self.fdt
                .put_int(CONFIG_NODE, "kernel-offset", packer.image_size())?;
            packer.add_property("kernel", kernel);
        }

        // Small builds pass U-Boot through in place of the GBB.
        packer.add_property("gbb", &files.uboot);

        let blob_list = packer.blob_list();
        info!("Building blobs {blob_list:?}");
        for blob_type in &blob_list {
            self.build_blob(&mut packer, blob_type)?;
        }

        info!("Packing image");
        if let Some(gbb) = gbb {
            packer.require_all_entries();

            let model = model.as_deref().ok_or(Error::NoModel)?;
            let fwid = firmware_id(model, &self.options.fw_version);
            info!("Firmware ID: {fwid}");
            let fwid_path = self.out_dir.join("fwid.txt");
            write_file(&fwid_path, fwid.as_bytes())?;

            packer.add_property("fwid", &fwid_path);
            packer.add_property("gbb", gbb);
            packer.add_property("keydir", &self.options.keydir);
        }

        packer.check_properties()?;

        packer.update_blob_positions(&mut self.fdt)?;
        packer.update_blob_positions(&mut fdt_rwa)?;
        packer.update_blob_positions(&mut fdt_rwb)?;

        let fdt_data = self.fdt.data()?;
        let uboot_data = read_file(&files.uboot)?;
        write_file(&self.out_dir.join("u-boot.bin"), &uboot_data)?;

        let uboot_dtb = self.out_dir.join("u-boot-dtb.bin");
        write_file(&uboot_dtb, &[uboot_data.as_slice(), &fdt_data].concat())?;

        // The coreboot ROM can only be completed once the device tree is final.
        if blob_list.iter().any(|b| b == "coreboot") {
            self.fixup_coreboot(&packer, &uboot_dtb)?;
        }

        let image = self.out_dir.join("image.bin");
        packer.pack_image(&image)?;
        packer.add_property("image", &image);
        debug!("Final image: {:?}", NumBytes(packer.image_size()));

        Ok((image, packer))
    }

    /// Run the build. The image is copied to `output` if one is given.
    pub fn start(mut self, output: Option<&Path>, show_map: bool) -> Result<BundleOutput> {
        let gbb = if self.options.small {
            None
        } else {
            let sources = GbbSources {
                hardware_id: self.options.hardware_id.as_deref(),
                flag_adjustments: self.options.gbb_flags.as_deref(),
                keydir: &self.options.keydir,
                bmpblk: &self.profile.files.bmpblk,
                out_dir: &self.out_dir,
            };

            Some(gbb::create_gbb(&self.fdt, self.tools, &sources)?)
        };

        let (image, packer) = self.create_image(gbb.as_deref())?;

        if show_map {
            packer.show_map();
        }

        if let Some(output) = output {
            copy_file(&image, output)?;
            info!("Output image: {output:?}");
        }

        Ok(BundleOutput {
            image,
            props: packer.properties().clone(),
        })
    }
}
