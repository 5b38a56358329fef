// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use tempfile::TempDir;

use crate::{
    board::BoardConfig,
    bundle::{self, Bundle, BundleOptions, bootstub::CbootimageSigner},
    cli::{status, warning},
    fdt::Fdt,
    format::bl2::BootSource,
    pack::{FlashEntry, FlashMapFile},
    tool::ProcessRunner,
};

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected <key>=<value>: {s:?}"))?;

    Ok((key.to_owned(), value.to_owned()))
}

fn read_flash_map(path: &Path) -> Result<Vec<FlashEntry>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read flash map TOML: {path:?}"))?;
    let map: FlashMapFile = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse flash map TOML: {path:?}"))?;

    Ok(map.entries)
}

fn write_props(path: &Path, output: &bundle::BundleOutput) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(&output.props)
        .with_context(|| format!("Failed to serialize properties TOML: {path:?}"))?;
    fs::write(path, data)
        .with_context(|| format!("Failed to write properties TOML: {path:?}"))?;

    Ok(())
}

/// Attach the failure class so configuration mistakes stand out from
/// tool and consistency failures.
fn build_error(e: bundle::Error) -> anyhow::Error {
    let kind = e.kind();
    anyhow::Error::new(e).context(format!("Firmware build failed ({kind})"))
}

pub fn bundle_main(cli: &BundleCli) -> Result<()> {
    let flash_map = cli.flash_map.as_deref().map(read_flash_map).transpose()?;

    let config = BoardConfig {
        board: cli.board.clone(),
        build_root: cli.build_root.clone(),
        fdt: cli.dt.clone(),
        uboot: cli.uboot.clone(),
        bct: cli.bct.clone(),
        bmpblk: cli.bmpblk.clone(),
        coreboot: cli.coreboot.clone(),
        coreboot_elf: cli.coreboot_elf.clone(),
        postload: cli.postload.clone(),
        seabios: cli.seabios.clone(),
        exynos_bl1: cli.bl1.clone(),
        exynos_bl2: cli.bl2.clone(),
        skeleton: cli.skeleton.clone(),
        ecrw: cli.ecrw.clone(),
        ecro: cli.ecro.clone(),
        kernel: cli.kernel.clone(),
        flash_map,
    };
    let profile = config.resolve().map_err(|e| build_error(e.into()))?;

    let options = BundleOptions {
        small: cli.small,
        gbb_flags: cli.gbb_flags.clone(),
        hardware_id: cli.hwid.clone(),
        force_rw: cli.force_rw,
        keydir: cli.key.clone(),
        fw_version: cli.fw_version.clone(),
        spl_source: cli.spl_source,
        enable: cli.enable.clone(),
        config: cli.config.clone(),
        config_int: cli.config_int.clone(),
        bootcmd: cli.bootcmd.clone(),
        bootsecure: cli.bootsecure,
    };

    let mut temp_dir: Option<TempDir> = None;
    let out_dir = match &cli.outdir {
        Some(d) => {
            fs::create_dir_all(d)
                .with_context(|| format!("Failed to create output directory: {d:?}"))?;
            d.clone()
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix("fwbundle-")
                .tempdir()
                .context("Failed to create temporary output directory")?;
            temp_dir.insert(dir).path().to_owned()
        }
    };

    if cli.small {
        warning!("Small build: the image has no GBB and no verified boot data");
    }

    let runner = ProcessRunner;
    let signer = CbootimageSigner::new(runner, &out_dir);
    let fdt = Fdt::new(runner, &profile.fdt, &out_dir);

    let output = Bundle::new(profile, options, fdt, &runner, &signer, &out_dir)
        .and_then(|b| b.start(cli.output.as_deref(), cli.show_map))
        .map_err(build_error)?;

    if let Some(path) = &cli.props_output {
        write_props(path, &output)?;
    }

    match &cli.output {
        Some(path) => status!("Firmware image: {path:?}"),
        None => status!("Firmware image: {:?}", output.image),
    }

    Ok(())
}

/// Build a firmware image for a board.
#[derive(Debug, Parser)]
pub struct BundleCli {
    /// Board to build for.
    #[arg(short, long, value_name = "BOARD")]
    board: Option<String>,

    /// Firmware build output directory [default: /build/<board>/firmware].
    #[arg(long, value_name = "DIR", value_parser)]
    build_root: Option<PathBuf>,

    /// Device tree source or blob, or a bare name in the build root's dts
    /// directory.
    #[arg(short, long, value_name = "FILE", value_parser)]
    dt: Option<PathBuf>,

    /// U-Boot binary.
    #[arg(short, long, value_name = "FILE", value_parser)]
    uboot: Option<PathBuf>,

    /// Tegra boot configuration table.
    #[arg(long, value_name = "FILE", value_parser)]
    bct: Option<PathBuf>,

    /// Bitmap block for the GBB.
    #[arg(long, value_name = "FILE", value_parser)]
    bmpblk: Option<PathBuf>,

    /// Coreboot ROM.
    #[arg(long, value_name = "FILE", value_parser)]
    coreboot: Option<PathBuf>,

    /// ELF payload to add to coreboot instead of U-Boot.
    #[arg(long, value_name = "FILE", value_parser)]
    coreboot_elf: Option<PathBuf>,

    /// Binary to load after the signed bootstub.
    #[arg(long, value_name = "FILE", value_parser)]
    postload: Option<PathBuf>,

    /// SeaBIOS CBFS payload for legacy boot.
    #[arg(long, value_name = "FILE", value_parser)]
    seabios: Option<PathBuf>,

    /// Exynos BL1 binary.
    #[arg(long, value_name = "FILE", value_parser)]
    bl1: Option<PathBuf>,

    /// Exynos BL2 (SPL) binary.
    #[arg(long, value_name = "FILE", value_parser)]
    bl2: Option<PathBuf>,

    /// Coreboot image holding the Intel flash descriptor.
    #[arg(long, value_name = "FILE", value_parser)]
    skeleton: Option<PathBuf>,

    /// EC read-write image.
    #[arg(long, value_name = "FILE", value_parser)]
    ecrw: Option<PathBuf>,

    /// EC read-only image.
    #[arg(long, value_name = "FILE", value_parser)]
    ecro: Option<PathBuf>,

    /// Kernel to place after the firmware.
    #[arg(long, value_name = "FILE", value_parser)]
    kernel: Option<PathBuf>,

    /// Only build a signed U-Boot, without a GBB.
    #[arg(long)]
    small: bool,

    /// GBB flags: a hex value, or a comma-separated list of flag names, each
    /// optionally prefixed with + or -.
    #[arg(short, long, value_name = "FLAGS")]
    gbb_flags: Option<String>,

    /// Hardware ID [default: /config/hwid in the device tree].
    #[arg(long, value_name = "ID")]
    hwid: Option<String>,

    /// Force both RW firmware copies to be used.
    #[arg(long)]
    force_rw: bool,

    /// U-Boot boot command. `none` means no command.
    #[arg(long, value_name = "CMD")]
    bootcmd: Option<String>,

    /// Only boot verified kernels with the boot command.
    #[arg(long, requires = "bootcmd")]
    bootsecure: bool,

    /// Enable (1) or disable (0) a device tree node or alias.
    #[arg(long, value_name = "NODE=0|1", value_parser = parse_key_value)]
    enable: Vec<(String, String)>,

    /// Add a /config property. Integer-like values are stored as integers.
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    config: Vec<(String, String)>,

    /// Add an integer /config property.
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    config_int: Vec<(String, String)>,

    /// Where the SPL loads U-Boot from.
    #[arg(long, value_name = "SOURCE", default_value = "straps")]
    spl_source: BootSource,

    /// Directory containing the verified boot keys.
    #[arg(long, value_name = "DIR", value_parser, default_value = "/usr/share/vboot/devkeys")]
    key: PathBuf,

    /// Version part of the firmware ID.
    #[arg(long, value_name = "VERSION", default_value = "0.0.0")]
    fw_version: String,

    /// Directory for intermediate files [default: temporary directory].
    #[arg(long, value_name = "DIR", value_parser)]
    outdir: Option<PathBuf>,

    /// Copy the final image here.
    #[arg(short, long, value_name = "FILE", value_parser, required_unless_present = "outdir")]
    output: Option<PathBuf>,

    /// Log the flash map layout.
    #[arg(long)]
    show_map: bool,

    /// Flash map TOML to use when the device tree has none.
    #[arg(long, value_name = "FILE", value_parser)]
    flash_map: Option<PathBuf>,

    /// Write the final property map as TOML.
    #[arg(long, value_name = "FILE", value_parser)]
    props_output: Option<PathBuf>,
}
