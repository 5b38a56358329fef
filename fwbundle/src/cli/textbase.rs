// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{format::textbase, util};

pub fn text_base_main(cli: &TextBaseCli) -> Result<()> {
    let data = fs::read(&cli.input)
        .with_context(|| format!("Failed to read U-Boot image: {:?}", cli.input))?;
    let decoded = textbase::decode(&data);

    let text_base = match (cli.declared, decoded) {
        (Some(declared), _) => textbase::reconcile(
            &cli.input.display().to_string(),
            i64::from(declared),
            decoded,
        ),
        (None, Some(value)) => value,
        (None, None) => bail!("No TEXT_BASE marker found: {:?}", cli.input),
    };

    println!("{text_base:#x}");

    Ok(())
}

/// Find the load address of a U-Boot image.
#[derive(Debug, Parser)]
pub struct TextBaseCli {
    /// U-Boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Load address from the device tree. The image's own value wins if it
    /// differs.
    #[arg(long, value_name = "ADDR", value_parser = util::parse_u32_cell)]
    declared: Option<u32>,
}
