// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! User overrides applied to the device tree before any blob is built.

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    bundle::CONFIG_NODE,
    fdt::{self, DeviceTree},
    util,
};

/// Node whose string properties map alias names to node paths.
pub const ALIASES_NODE: &str = "/aliases";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid enable option value {value:?} for {node:?} (should be 0 or 1)")]
    InvalidEnableValue { node: String, value: String },
    #[error("Cannot convert config option {key:?} to integer: {value:?}")]
    InvalidInt { key: String, value: String },
    #[error("Device tree error")]
    Fdt(#[from] fdt::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A value for a `/config` property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    Int(u32),
    Str(String),
}

impl ConfigValue {
    /// Values that parse as integers are stored as integers, everything else
    /// as strings. With `use_int`, a non-integer value is an error.
    pub fn parse(key: &str, value: &str, use_int: bool) -> Result<Self> {
        match util::parse_u32_cell(value) {
            Ok(n) => Ok(Self::Int(n)),
            Err(_) if use_int => Err(Error::InvalidInt {
                key: key.to_owned(),
                value: value.to_owned(),
            }),
            Err(_) => Ok(Self::Str(value.to_owned())),
        }
    }
}

/// Set the `status` of a node to `okay` or `disabled`. `node` is either an
/// absolute path or the name of an alias. Unknown aliases are skipped with a
/// warning.
pub fn set_node_enabled<T: DeviceTree>(tree: &mut T, node: &str, enabled: bool) -> Result<()> {
    let path = if node.starts_with('/') {
        node.to_owned()
    } else {
        match tree.get_string(ALIASES_NODE, node)? {
            Some(p) if !p.is_empty() => p,
            _ => {
                warn!("Cannot find alias {node:?} - ignoring");
                return Ok(());
            }
        }
    };

    let status = if enabled { "okay" } else { "disabled" };
    tree.put_string(&path, "status", status)?;

    Ok(())
}

/// Enable or disable each node in a list of `(node, "0" | "1")` pairs. The
/// whole list is validated before the tree is touched.
pub fn add_enable_list<T: DeviceTree>(tree: &mut T, list: &[(String, String)]) -> Result<()> {
    let mut parsed = Vec::with_capacity(list.len());

    for (node, value) in list {
        let enabled = match value.trim() {
            "0" => false,
            "1" => true,
            _ => {
                return Err(Error::InvalidEnableValue {
                    node: node.clone(),
                    value: value.clone(),
                });
            }
        };

        parsed.push((node, enabled));
    }

    for (node, enabled) in parsed {
        set_node_enabled(tree, node, enabled)?;
    }

    Ok(())
}

/// Write `(key, value)` pairs to `/config/<key>`.
pub fn add_config_list<T: DeviceTree>(
    tree: &mut T,
    list: &[(String, String)],
    use_int: bool,
) -> Result<()> {
    let values = list
        .iter()
        .map(|(k, v)| ConfigValue::parse(k, v, use_int).map(|v| (k, v)))
        .collect::<Result<Vec<_>>>()?;

    for (key, value) in values {
        match value {
            ConfigValue::Int(n) => tree.put_int(CONFIG_NODE, key, n)?,
            ConfigValue::Str(s) => tree.put_string(CONFIG_NODE, key, &s)?,
        }
    }

    Ok(())
}

/// Set U-Boot's boot command. `none` means an empty command.
pub fn set_bootcmd<T: DeviceTree>(tree: &mut T, bootcmd: &str, bootsecure: bool) -> Result<()> {
    let bootcmd = if bootcmd == "none" { "" } else { bootcmd };

    tree.put_string(CONFIG_NODE, "bootcmd", bootcmd)?;
    tree.put_int(CONFIG_NODE, "bootsecure", u32::from(bootsecure))?;
    info!("Boot command: {bootcmd}");

    Ok(())
}
