// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Board selection and default artifact locations.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::pack::FlashEntry;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No board defined - please define a board to use")]
    NoBoard,
    #[error("Failed to list directory: {0:?}")]
    ReadDir(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// SoC family of a board. This decides which architecture definitions the
/// device tree is compiled against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchFamily {
    /// x86 boards booting U-Boot as a coreboot payload.
    Coreboot,
    Exynos,
    Tegra,
}

impl ArchFamily {
    /// Boards with a known family. Anything else is treated as Tegra.
    const BOARDS: &'static [(&'static str, Self)] = &[
        ("link", Self::Coreboot),
        ("lumpy", Self::Coreboot),
        ("stumpy", Self::Coreboot),
        ("x86-alex", Self::Coreboot),
        ("x86-generic", Self::Coreboot),
        ("x86-mario", Self::Coreboot),
        ("x86-zgb", Self::Coreboot),
        ("daisy", Self::Exynos),
        ("smdk5250", Self::Exynos),
        ("snow", Self::Exynos),
        ("tegra", Self::Tegra),
        ("tegra2_aebl", Self::Tegra),
        ("tegra2_arthur", Self::Tegra),
        ("tegra2_asymptote", Self::Tegra),
        ("tegra2_kaen", Self::Tegra),
        ("tegra2_seaboard", Self::Tegra),
        ("tegra3_cardhu", Self::Tegra),
        ("tegra3_waluigi", Self::Tegra),
    ];

    pub fn for_board(board: &str) -> Self {
        match Self::BOARDS.iter().find(|(b, _)| *b == board) {
            Some((_, family)) => *family,
            None => {
                debug!("Board {board:?} is not known; assuming Tegra");
                Self::Tegra
            }
        }
    }

    /// Architecture device tree include.
    pub fn arch_include(self) -> &'static str {
        match self {
            Self::Coreboot => "coreboot.dtsi",
            Self::Exynos => "exynos5250.dtsi",
            Self::Tegra => "tegra20.dtsi",
        }
    }
}

/// Flash map used when the device tree has none (eg. upstream U-Boot).
pub fn default_flash_map(board: &str) -> Option<Vec<FlashEntry>> {
    let map = match board {
        "tegra" => vec![FlashEntry {
            node: "ro-boot".into(),
            label: "boot-stub".into(),
            size: Some(512 << 10),
            read_only: true,
            kind: "blob signed".into(),
            required: true,
            ..Default::default()
        }],
        "daisy" => vec![
            FlashEntry {
                node: "pre-boot".into(),
                label: "bl1 pre-boot".into(),
                size: Some(0x2000),
                read_only: true,
                filename: Some("e5250.nbl1.bin".into()),
                kind: "blob exynos-bl1".into(),
                required: true,
                ..Default::default()
            },
            FlashEntry {
                node: "spl".into(),
                label: "bl2 spl".into(),
                size: Some(0x4000),
                read_only: true,
                filename: Some("bl2.bin".into()),
                kind: "blob exynos-bl2 boot,dtb".into(),
                required: true,
                ..Default::default()
            },
            FlashEntry {
                node: "ro-boot".into(),
                label: "u-boot".into(),
                size: Some(0x9a000),
                read_only: true,
                kind: "blob boot,dtb".into(),
                required: true,
                ..Default::default()
            },
        ],
        "link" => vec![
            FlashEntry {
                node: "si-all".into(),
                label: "si-all".into(),
                reg: Some([0x00000000, 0x00200000]),
                kind: "ifd".into(),
                required: true,
                ..Default::default()
            },
            FlashEntry {
                node: "ro-boot".into(),
                label: "boot-stub".into(),
                reg: Some([0x00700000, 0x00100000]),
                read_only: true,
                kind: "blob coreboot".into(),
                required: true,
                ..Default::default()
            },
        ],
        _ => return None,
    };

    Some(map)
}

/// User-provided board settings. Every path left as [`None`] is filled in by
/// [`BoardConfig::resolve`].
#[derive(Clone, Debug, Default)]
pub struct BoardConfig {
    pub board: Option<String>,
    /// Firmware build output directory for the board. Defaults to
    /// `/build/<board>/firmware`.
    pub build_root: Option<PathBuf>,
    pub fdt: Option<PathBuf>,
    pub uboot: Option<PathBuf>,
    pub bct: Option<PathBuf>,
    pub bmpblk: Option<PathBuf>,
    pub coreboot: Option<PathBuf>,
    pub coreboot_elf: Option<PathBuf>,
    pub postload: Option<PathBuf>,
    pub seabios: Option<PathBuf>,
    pub exynos_bl1: Option<PathBuf>,
    pub exynos_bl2: Option<PathBuf>,
    pub skeleton: Option<PathBuf>,
    pub ecrw: Option<PathBuf>,
    pub ecro: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    /// Replaces the board's built-in default flash map.
    pub flash_map: Option<Vec<FlashEntry>>,
}

/// Resolved artifact paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoardFiles {
    pub uboot: PathBuf,
    pub bct: PathBuf,
    pub bmpblk: PathBuf,
    pub coreboot: PathBuf,
    pub coreboot_elf: Option<PathBuf>,
    pub postload: Option<PathBuf>,
    pub seabios: PathBuf,
    pub exynos_bl1: PathBuf,
    pub exynos_bl2: PathBuf,
    pub skeleton: PathBuf,
    pub ecrw: PathBuf,
    pub ecro: PathBuf,
    pub kernel: Option<PathBuf>,
}

/// Everything known about the target board. This is resolved once and not
/// modified afterwards.
#[derive(Clone, Debug)]
pub struct BoardProfile {
    pub board: String,
    pub family: ArchFamily,
    /// Device tree source or blob. This may not exist if no unique match was
    /// found, in which case loading it fails later.
    pub fdt: PathBuf,
    pub files: BoardFiles,
    pub default_flash_map: Option<Vec<FlashEntry>>,
}

/// Find `*<name>*.dts` in `dir`. Returns [`None`] unless there is exactly one
/// match.
fn find_unique_dts(dir: &Path, name: &str) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::ReadDir(dir.to_owned(), e)),
    };

    let mut found = vec![];

    for entry in entries {
        let entry = entry.map_err(|e| Error::ReadDir(dir.to_owned(), e))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        if file_name.ends_with(".dts") && file_name.contains(name) {
            found.push(entry.path());
        }
    }

    trace!("Device tree candidates for {name:?}: {found:?}");

    if found.len() == 1 {
        Ok(found.pop())
    } else {
        Ok(None)
    }
}

impl BoardConfig {
    pub fn resolve(&self) -> Result<BoardProfile> {
        let board = self.board.as_deref().ok_or(Error::NoBoard)?;
        let build_root = self
            .build_root
            .clone()
            .unwrap_or_else(|| Path::new("/build").join(board).join("firmware"));
        let dts_dir = build_root.join("dts");
        let base_name = board.replace('_', "-");

        let mut fdt = match &self.fdt {
            Some(p) => p.clone(),
            None => match find_unique_dts(&dts_dir, &base_name)? {
                Some(p) => p,
                None => dts_dir.join(format!("{base_name}.dts")),
            },
        };

        // Turn a bare name like `exynos5250-daisy` into a full path.
        if fdt.extension().is_none() && fdt.parent().is_none_or(|p| p.as_os_str().is_empty()) {
            let mut name = fdt.into_os_string();
            name.push(".dts");
            fdt = dts_dir.join(name);
        }

        let or_default = |path: &Option<PathBuf>, default: &str| {
            path.clone().unwrap_or_else(|| build_root.join(default))
        };

        let files = BoardFiles {
            uboot: or_default(&self.uboot, "u-boot.bin"),
            bct: or_default(&self.bct, "bct/board.bct"),
            bmpblk: or_default(&self.bmpblk, "bmpblk.bin"),
            coreboot: or_default(&self.coreboot, "coreboot.rom"),
            coreboot_elf: self.coreboot_elf.clone(),
            postload: self.postload.clone(),
            seabios: self
                .seabios
                .clone()
                .unwrap_or_else(|| PathBuf::from("seabios.cbfs")),
            exynos_bl1: or_default(&self.exynos_bl1, "E5250.nbl1.bin"),
            exynos_bl2: or_default(&self.exynos_bl2, "smdk5250-spl.bin"),
            skeleton: or_default(&self.skeleton, "coreboot.rom"),
            ecrw: or_default(&self.ecrw, "ec.RW.bin"),
            ecro: or_default(&self.ecro, "ec.RO.bin"),
            kernel: self.kernel.clone(),
        };

        let default_flash_map = self
            .flash_map
            .clone()
            .or_else(|| default_flash_map(board));

        Ok(BoardProfile {
            board: board.to_owned(),
            family: ArchFamily::for_board(board),
            fdt,
            files,
            default_flash_map,
        })
    }
}
