// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::{
    fs,
    path::{Path, PathBuf},
};

use assert_matches::assert_matches;
use fwbundle::{
    board::{self, BoardConfig},
    bundle::{self, Bundle, BundleOptions, BundleOutput, ErrorKind},
    format::bl2,
    pack::{self, FlashEntry},
};

use common::{FakeSigner, MemoryFdt, RecordingRunner, Value};

struct Fixture {
    _temp_dir: tempfile::TempDir,
    dir: PathBuf,
    out: PathBuf,
    runner: RecordingRunner,
    signer: FakeSigner,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().to_owned();
        let out = dir.join("out");

        fs::create_dir(&out).unwrap();
        fs::write(dir.join("u-boot.bin"), common::uboot_image(0xe08000, 0x300)).unwrap();
        fs::write(dir.join("board.bct"), b"bct").unwrap();

        Self {
            _temp_dir: temp_dir,
            dir,
            out,
            runner: RecordingRunner::default(),
            signer: FakeSigner::default(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn config(&self, board: &str) -> BoardConfig {
        BoardConfig {
            board: Some(board.to_owned()),
            build_root: Some(self.dir.clone()),
            fdt: Some(self.path("base.dtb")),
            uboot: Some(self.path("u-boot.bin")),
            bct: Some(self.path("board.bct")),
            ..Default::default()
        }
    }

    fn tree(&self) -> MemoryFdt {
        MemoryFdt::new(&self.path("base.dtb"))
            .with_str("/", "model", "NVIDIA Seaboard")
            .with_ints("/chromeos-config", "textbase", &[0xe08000])
    }

    fn build(
        &self,
        config: BoardConfig,
        options: BundleOptions,
        tree: MemoryFdt,
    ) -> Result<BundleOutput, bundle::Error> {
        let profile = config.resolve()?;
        let bundle = Bundle::new(profile, options, tree, &self.runner, &self.signer, &self.out)?;

        bundle.start(Some(self.out.join("final.bin").as_path()), true)
    }

    fn read(&self, name: &str) -> Vec<u8> {
        fs::read(self.out.join(name)).unwrap()
    }

    fn updated(&self, name: &str) -> MemoryFdt {
        MemoryFdt::open(&self.out.join(name))
    }
}

fn small() -> BundleOptions {
    BundleOptions {
        small: true,
        ..Default::default()
    }
}

fn string(s: &str) -> Option<Value> {
    Some(Value::Str(s.to_owned()))
}

fn ints(values: &[u32]) -> Option<Value> {
    Some(Value::Ints(values.to_vec()))
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_owned()).collect()
}

/// Flash map with a signed bootstub, a GBB and a firmware ID.
fn with_verified_map(tree: MemoryFdt) -> MemoryFdt {
    tree.with_ints("/flash/ro-boot", "reg", &[0, 0x4000])
        .with_str("/flash/ro-boot", "type", "blob signed")
        .with_str("/flash/ro-boot", "required", "")
        .with_ints("/flash/ro-gbb", "reg", &[0x4000, 0x4000])
        .with_str("/flash/ro-gbb", "type", "blob gbb")
        .with_ints("/flash/ro-fwid", "reg", &[0x8000, 0x100])
        .with_str("/flash/ro-fwid", "type", "blobstring fwid")
        .with_str("/chromeos-config", "gbb-flag-force-dev-switch-on", "")
}

#[test]
fn tegra_small_build() {
    let f = Fixture::new();
    fs::write(f.path("vmlinux.bin"), b"kernel").unwrap();
    let config = BoardConfig {
        kernel: Some(f.path("vmlinux.bin")),
        ..f.config("tegra")
    };

    let profile = config.resolve().unwrap();
    let bundle = Bundle::new(profile, small(), f.tree(), &f.runner, &f.signer, &f.out).unwrap();
    assert_eq!(bundle.fdt().compiled_with.as_deref(), Some("tegra20.dtsi"));
    let output = bundle.start(None, false).unwrap();

    assert_eq!(output.image, f.out.join("image.bin"));
    assert_eq!(f.signer.calls.borrow().len(), 1);
    assert!(f.runner.calls_to("gbb_utility").is_empty());
    assert!(!output.props.contains_key("fwid"));
    assert!(!output.props.contains_key("keydir"));
    assert_eq!(output.props["gbb"], f.path("u-boot.bin"));
    assert_eq!(output.props["kernel"], f.path("vmlinux.bin"));

    // Default map: a single 512 KiB bootstub region.
    let image = f.read("image.bin");
    let signed = f.read("signed-postload.bin");
    assert_eq!(image.len(), 0x80000);
    assert_eq!(&image[..signed.len()], signed.as_slice());
    assert!(image[signed.len()..].iter().all(|b| *b == 0xff));

    let updated = f.updated("updated.dtb");
    assert_eq!(updated.value("/flash/ro-boot", "reg").cloned(), ints(&[0, 0x80000]));
    assert_eq!(
        updated.value("/flash/ro-boot", "used").cloned(),
        ints(&[signed.len() as u32]),
    );
    assert_eq!(updated.value("/chromeos-config", "firmware-type").cloned(), string("ro"));
    assert_eq!(updated.value("/config", "kernel-offset").cloned(), ints(&[0x80000]));

    let rwa = f.updated("updated-rwa.dtb");
    assert_eq!(rwa.value("/chromeos-config", "firmware-type").cloned(), string("rw-a"));
    assert_eq!(rwa.value("/flash/ro-boot", "reg").cloned(), ints(&[0, 0x80000]));
    let rwb = f.updated("updated-rwb.dtb");
    assert_eq!(rwb.value("/chromeos-config", "firmware-type").cloned(), string("rw-b"));
}

#[test]
fn tegra_small_build_from_dts_dir() {
    let f = Fixture::new();
    fs::create_dir(f.path("dts")).unwrap();
    fs::write(f.path("dts/tegra.dts"), "/dts-v1/;").unwrap();
    let config = BoardConfig {
        fdt: None,
        ..f.config("tegra")
    };

    let profile = config.resolve().unwrap();
    assert_eq!(profile.fdt, f.path("dts/tegra.dts"));

    let tree = MemoryFdt::new(&profile.fdt)
        .with_str("/", "model", "NVIDIA Seaboard")
        .with_ints("/chromeos-config", "textbase", &[0xe08000]);
    let bundle = Bundle::new(profile, small(), tree, &f.runner, &f.signer, &f.out).unwrap();
    assert_eq!(bundle.fdt().compiled_with.as_deref(), Some("tegra20.dtsi"));
    let output = bundle.start(None, false).unwrap();

    assert_eq!(f.signer.calls.borrow().len(), 1);
    assert_eq!(f.read("image.bin").len(), 0x80000);
    assert_eq!(output.props["dtb"], f.out.join("updated.dtb"));

    let updated = f.updated("updated.dtb");
    assert_eq!(updated.value("/flash/ro-boot", "reg").cloned(), ints(&[0, 0x80000]));
}

#[test]
fn tegra_full_build() {
    let f = Fixture::new();
    let tree = with_verified_map(f.tree()).with_str("/config", "hwid", "SEABOARD TEST 1234");
    let options = BundleOptions {
        fw_version: "1.2.3".to_owned(),
        gbb_flags: Some("+force-dev-boot-usb".to_owned()),
        ..Default::default()
    };

    let output = f.build(f.config("tegra2_seaboard"), options, tree).unwrap();

    let fwid = f.read("fwid.txt");
    assert_eq!(fwid, b"NVIDIA_Seaboard.1.2.3");
    assert_eq!(output.props["fwid"], f.out.join("fwid.txt"));
    assert_eq!(output.props["gbb"], f.out.join("gbb.bin"));
    assert_eq!(output.props["keydir"], Path::new("/usr/share/vboot/devkeys"));

    let calls = f.runner.calls_to("gbb_utility");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].args[1], "0x100,0x1000,0x1e80,0x1000");
    assert!(calls[1].args.contains(&"--hwid=SEABOARD TEST 1234".to_owned()));
    // force-dev-switch-on from the device tree plus force-dev-boot-usb.
    assert!(calls[1].args.contains(&"--flags=24".to_owned()));

    let image = f.read("image.bin");
    assert_eq!(image, f.read("final.bin"));
    assert_eq!(image.len(), 0x8100);
    assert_eq!(&image[0x4000..0x4003], b"GBB");
    assert_eq!(&image[0x8000..0x8000 + fwid.len()], fwid.as_slice());

    let updated = f.updated("updated.dtb");
    assert_eq!(updated.value("/flash/ro-gbb", "reg").cloned(), ints(&[0x4000, 0x4000]));
    assert_eq!(updated.value("/flash/ro-gbb", "used").cloned(), ints(&[3]));
    assert_eq!(
        updated.value("/flash/ro-fwid", "used").cloned(),
        ints(&[fwid.len() as u32]),
    );

    let rwb = f.updated("updated-rwb.dtb");
    assert_eq!(rwb.value("/flash/ro-gbb", "used").cloned(), ints(&[3]));
}

#[test]
fn full_build_needs_hardware_id() {
    let f = Fixture::new();
    let tree = with_verified_map(f.tree());

    let err = f.build(f.config("tegra"), BundleOptions::default(), tree).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(f.signer.calls.borrow().is_empty());
}

#[test]
fn full_build_rejects_unpopulated_regions() {
    let f = Fixture::new();
    let tree = with_verified_map(f.tree())
        .with_str("/config", "hwid", "SEABOARD TEST 1234")
        .with_ints("/flash/ro-version", "reg", &[0x8100, 0x100])
        .with_str("/flash/ro-version", "type", "blobstring version");

    let err = f
        .build(f.config("tegra"), BundleOptions::default(), tree.clone())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompleteImage);
    assert_matches!(
        err,
        bundle::Error::Pack(pack::Error::IncompleteImage(m)) if m == ["ro-version"]
    );

    // Small builds leave the region erased.
    let output = f.build(f.config("tegra"), small(), tree).unwrap();

    let image = fs::read(&output.image).unwrap();
    assert!(image[0x8100..0x8200].iter().all(|b| *b == 0xff));
}

#[test]
fn exynos_small_build() {
    let f = Fixture::new();
    let codes = b"mMfvub";
    fs::write(f.path("bl1.bin"), [0x01u8; 0x100]).unwrap();
    fs::write(f.path("bl2.bin"), common::bl2_image(1, codes, 0x100)).unwrap();
    fs::write(f.path("ec.RO.bin"), b"ec__FMAP__ro").unwrap();

    let mut flash_map = board::default_flash_map("daisy").unwrap();
    flash_map.push(FlashEntry {
        node: "ec-ro".to_owned(),
        label: "ec-ro".to_owned(),
        size: Some(0x100),
        kind: "blob ecro".to_owned(),
        ..Default::default()
    });
    let config = BoardConfig {
        exynos_bl1: Some(f.path("bl1.bin")),
        exynos_bl2: Some(f.path("bl2.bin")),
        ecro: Some(f.path("ec.RO.bin")),
        flash_map: Some(flash_map),
        ..f.config("daisy")
    };
    let tree = MemoryFdt::new(&f.path("base.dtb"))
        .with_str("/", "model", "Google Daisy")
        .with_str("/dmc", "mem-type", "lpddr2")
        .with_str("/dmc", "mem-manuf", "elpida")
        .with_ints("/dmc", "clock-frequency", &[667_000_000]);
    let options = BundleOptions {
        spl_source: bl2::BootSource::Spi,
        ..small()
    };

    let profile = config.resolve().unwrap();
    let bundle = Bundle::new(profile, options, tree, &f.runner, &f.signer, &f.out).unwrap();
    assert_eq!(bundle.fdt().compiled_with.as_deref(), Some("exynos5250.dtsi"));
    let output = bundle.start(None, false).unwrap();

    assert!(f.signer.calls.borrow().is_empty());

    let spl = f.read("updated-spl.bin");
    assert!(bl2::verify_checksum(&spl).unwrap());
    assert_eq!(common::bl2_value(&spl, codes.len(), 0), 2);
    assert_eq!(common::bl2_value(&spl, codes.len(), 1), 1);
    assert_eq!(common::bl2_value(&spl, codes.len(), 2), 667);
    assert_eq!(common::bl2_value(&spl, codes.len(), 3), 31);
    let uboot_size = common::bl2_value(&spl, codes.len(), 4);
    assert_eq!(uboot_size % 0x1000, 0);
    assert!(uboot_size >= 0x300);
    assert_eq!(common::bl2_value(&spl, codes.len(), 5), 20);

    let image = fs::read(&output.image).unwrap();
    assert_eq!(image.len(), 0xa0100);
    assert_eq!(&image[..0x100], &[0x01u8; 0x100]);
    assert_eq!(&image[0x2000..0x2000 + spl.len()], spl.as_slice());
    assert_eq!(&image[0x6000..0x6300], &f.read("u-boot.bin")[..]);
    assert_eq!(&image[0xa0000..0xa000c], b"ec__fMAP__ro");
}

#[test]
fn unknown_blob_type() {
    let f = Fixture::new();
    let tree = f
        .tree()
        .with_ints("/flash/ro-boot", "size", &[0x100])
        .with_str("/flash/ro-boot", "type", "blob mystery");

    let err = f.build(f.config("tegra"), small(), tree).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_matches!(err, bundle::Error::UnknownBlobType(t) if t == "mystery");
}

#[test]
fn coreboot_small_build() {
    let f = Fixture::new();
    let mut coreboot = vec![0u8; 0x800000];
    coreboot[0x700000..0x700004].copy_from_slice(b"STUB");
    fs::write(f.path("coreboot.rom"), coreboot).unwrap();
    fs::write(f.path("skeleton.rom"), [0x5au8; 0x1000]).unwrap();

    let config = BoardConfig {
        coreboot: Some(f.path("coreboot.rom")),
        skeleton: Some(f.path("skeleton.rom")),
        ..f.config("link")
    };
    let tree = MemoryFdt::new(&f.path("base.dtb"))
        .with_str("/", "model", "Google Link")
        .with_ints("/flash/si-all", "reg", &[0, 0x200000])
        .with_str("/flash/si-all", "type", "ifd")
        .with_ints("/flash/rw-a-vblock", "reg", &[0x200000, 0x10000])
        .with_str("/flash/rw-a-vblock", "type", "keyblock dtb-rwa")
        .with_ints("/flash/rw-b-vblock", "reg", &[0x210000, 0x10000])
        .with_str("/flash/rw-b-vblock", "type", "keyblock dtb-rwb")
        .with_ints("/flash/ro-boot", "reg", &[0x700000, 0x100000])
        .with_str("/flash/ro-boot", "type", "blob coreboot");
    let options = BundleOptions {
        force_rw: true,
        ..small()
    };

    let output = f.build(config, options, tree).unwrap();

    let rom = f.out.join("coreboot-full.rom");
    let calls = f.runner.calls_to("cbfstool");
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0].args,
        strings(&[
            rom.to_str().unwrap(),
            "add-flat-binary",
            "-f",
            f.out.join("u-boot-dtb.bin").to_str().unwrap(),
            "-n",
            "fallback/payload",
            "-c",
            "lzma",
            "-l",
            "0x1110000",
            "-e",
            "0x1110008",
        ]),
    );
    assert_eq!(
        calls[1].args,
        strings(&[
            rom.to_str().unwrap(),
            "add",
            "-f",
            f.out.join("bootstub.dtb").to_str().unwrap(),
            "-n",
            "u-boot.dtb",
            "-t",
            "0xac",
        ]),
    );

    assert_eq!(f.read("coreboot-8mb.rom").len(), 0x800000);
    assert_eq!(f.read("coreboot-full.rom").len(), 0x100000);

    let image = fs::read(&output.image).unwrap();
    assert_eq!(image.len(), 0x800000);
    assert!(image[..0x1000].iter().all(|b| *b == 0x5a));
    assert!(image[0x1000..0x200000].iter().all(|b| *b == 0xff));
    assert_eq!(&image[0x700000..0x700004], b"STUB");

    let updated = f.updated("updated.dtb");
    assert_eq!(updated.value("/flash/rw-a-vblock", "preamble-flags").cloned(), ints(&[0]));
    assert_eq!(updated.value("/flash/rw-b-vblock", "preamble-flags").cloned(), ints(&[0]));
    // The device tree added to coreboot has the final flash map.
    let stub_fdt = f.updated("bootstub.dtb");
    assert_eq!(
        stub_fdt.value("/flash/ro-boot", "reg").cloned(),
        ints(&[0x700000, 0x100000]),
    );
}
