// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{
    bundle::gbb,
    fdt::Fdt,
    format::gbb::{self as flags, FLAG_NAMES, GbbFlags},
    tool::ProcessRunner,
    util,
};

pub fn gbb_flags_main(cli: &GbbFlagsCli) -> Result<()> {
    match &cli.command {
        GbbFlagsCommand::List(_) => {
            for (name, flag) in FLAG_NAMES {
                println!("{:#04x}  {name}", flag.bits());
            }
        }
        GbbFlagsCommand::Decode(c) => {
            let result = match &c.dt {
                Some(path) => {
                    let fdt = Fdt::new(ProcessRunner, path, util::parent_path(path));

                    gbb::decode_flags(&fdt, c.adjustments.as_deref())
                        .with_context(|| format!("Failed to decode GBB flags: {path:?}"))?
                }
                None => {
                    let base = GbbFlags::from_bits_retain(c.base);

                    flags::adjust(base, c.adjustments.as_deref())
                        .context("Failed to decode GBB flags")?
                }
            };

            println!("{result:#x}");
        }
    }

    Ok(())
}

/// List the GBB flag names and values.
#[derive(Debug, Parser)]
struct ListCli {}

/// Compute the GBB flags value for an adjustment string.
#[derive(Debug, Parser)]
struct DecodeCli {
    /// Flags to adjust, in decimal or 0x-prefixed hex.
    #[arg(long, value_name = "FLAGS", value_parser = util::parse_u32_cell, default_value = "0")]
    base: u32,

    /// Read the base flags from a device tree blob.
    #[arg(short, long, value_name = "FILE", value_parser, conflicts_with = "base")]
    dt: Option<PathBuf>,

    /// Hex value, or comma-separated flag names optionally prefixed with +
    /// or -.
    #[arg(value_name = "ADJUSTMENTS")]
    adjustments: Option<String>,
}

#[derive(Debug, Subcommand)]
enum GbbFlagsCommand {
    List(ListCli),
    Decode(DecodeCli),
}

/// Inspect Google Binary Block flags.
#[derive(Debug, Parser)]
pub struct GbbFlagsCli {
    #[command(subcommand)]
    command: GbbFlagsCommand,
}
