// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Google Binary Block feature flags.
//!
//! The flags value stored in the GBB header is a 32-bit mask. The base value
//! comes from the `gbb-flag-*` properties of the `/chromeos-config` device tree
//! node and can then be adjusted by the user with either a raw hex mask or a
//! list of flag names.

use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;
use tracing::info;

/// Device tree node holding the `gbb-flag-*` properties.
pub const FDT_NODE: &str = "/chromeos-config";
/// Prefix of the device tree properties that enable a flag.
pub const FDT_PROP_PREFIX: &str = "gbb-flag-";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Device tree contains invalid GBB flag: {0:?}")]
    InvalidFdtFlag(String),
    #[error("Invalid GBB flag: {0:?}")]
    InvalidFlag(String),
}

type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Flags from `vboot_reference/firmware/include/gbb_header.h`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GbbFlags: u32 {
        const DEV_SCREEN_SHORT_DELAY = 0x00000001;
        const LOAD_OPTION_ROMS = 0x00000002;
        const ENABLE_ALTERNATE_OS = 0x00000004;
        const FORCE_DEV_SWITCH_ON = 0x00000008;
        const FORCE_DEV_BOOT_USB = 0x00000010;
        const DISABLE_FW_ROLLBACK_CHECK = 0x00000020;
        const ENTER_TRIGGERS_TONORM = 0x00000040;
        const FORCE_DEV_BOOT_LEGACY = 0x00000080;
    }
}

/// User-facing flag names, in bit order.
pub const FLAG_NAMES: [(&str, GbbFlags); 8] = [
    ("dev-screen-short-delay", GbbFlags::DEV_SCREEN_SHORT_DELAY),
    ("load-option-roms", GbbFlags::LOAD_OPTION_ROMS),
    ("enable-alternate-os", GbbFlags::ENABLE_ALTERNATE_OS),
    ("force-dev-switch-on", GbbFlags::FORCE_DEV_SWITCH_ON),
    ("force-dev-boot-usb", GbbFlags::FORCE_DEV_BOOT_USB),
    ("disable-fw-rollback-check", GbbFlags::DISABLE_FW_ROLLBACK_CHECK),
    ("enter-triggers-tonorm", GbbFlags::ENTER_TRIGGERS_TONORM),
    ("force-dev-boot-legacy", GbbFlags::FORCE_DEV_BOOT_LEGACY),
];

impl GbbFlags {
    /// Look up a single flag by its user-facing name.
    pub fn from_flag_name(name: &str) -> Option<Self> {
        FLAG_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, flag)| *flag)
    }

    /// Decode the flags enabled by a device tree node's property names.
    /// Properties without the `gbb-flag-` prefix are ignored, but an unknown
    /// flag name after the prefix is an error.
    pub fn from_fdt_props<S: AsRef<str>>(props: &[S]) -> Result<Self> {
        let mut flags = Self::empty();

        for prop in props {
            let prop = prop.as_ref();
            let Some(name) = prop.strip_prefix(FDT_PROP_PREFIX) else {
                continue;
            };

            let flag =
                Self::from_flag_name(name).ok_or_else(|| Error::InvalidFdtFlag(prop.to_owned()))?;

            info!("FDT: Enabling {prop}");
            flags |= flag;
        }

        Ok(flags)
    }
}

/// One entry of a comma-separated adjustment list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagToken {
    /// `+name`: set the flag on top of the current value.
    Add(&'static str, GbbFlags),
    /// `-name`: clear the flag from the current value.
    Remove(&'static str, GbbFlags),
    /// `name`: the first bare name discards the base value, then each bare
    /// name is OR-ed in.
    Select(&'static str, GbbFlags),
}

/// A parsed user adjustment to the device tree GBB flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GbbAdjustment {
    /// Raw hex mask that replaces the base value entirely. Bits without a
    /// name are kept as is.
    Override(GbbFlags),
    /// Tokens applied left to right.
    Tokens(Vec<FlagToken>),
}

impl FromStr for GbbAdjustment {
    type Err = Error;

    /// Parse the whole string up front so that an invalid token never leaves a
    /// partially applied result.
    fn from_str(s: &str) -> Result<Self> {
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);

        if let Ok(value) = u32::from_str_radix(hex, 16) {
            return Ok(Self::Override(GbbFlags::from_bits_retain(value)));
        }

        let mut tokens = vec![];

        for token in s.split(',') {
            let (oper, name) = match token.as_bytes().first() {
                Some(b'+' | b'-') => (Some(&token[..1]), &token[1..]),
                _ => (None, token),
            };

            let &(name, flag) = FLAG_NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .ok_or_else(|| Error::InvalidFlag(name.to_owned()))?;

            tokens.push(match oper {
                Some("+") => FlagToken::Add(name, flag),
                Some(_) => FlagToken::Remove(name, flag),
                None => FlagToken::Select(name, flag),
            });
        }

        Ok(Self::Tokens(tokens))
    }
}

impl GbbAdjustment {
    pub fn apply(&self, base: GbbFlags) -> GbbFlags {
        let tokens = match self {
            Self::Override(flags) => return *flags,
            Self::Tokens(tokens) => tokens,
        };

        let mut flags = base;
        let mut use_base_value = true;

        for token in tokens {
            match *token {
                FlagToken::Add(name, flag) => {
                    info!("Cmdline: Enabling {name}");
                    flags |= flag;
                }
                FlagToken::Remove(name, flag) => {
                    info!("Cmdline: Disabling {name}");
                    flags &= !flag;
                }
                FlagToken::Select(name, flag) => {
                    if use_base_value {
                        info!("Cmdline: Resetting flags to 0");
                        flags = GbbFlags::empty();
                        use_base_value = false;
                    }
                    info!("Cmdline: Enabling {name}");
                    flags |= flag;
                }
            }
        }

        flags
    }
}

/// Apply an optional adjustment string to the base flags. An absent or empty
/// string leaves the base value untouched.
pub fn adjust(base: GbbFlags, adjustments: Option<&str>) -> Result<GbbFlags> {
    match adjustments {
        Some(s) if !s.is_empty() => Ok(s.parse::<GbbAdjustment>()?.apply(base)),
        _ => Ok(base),
    }
}
