// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Since fwbundle is primarily an application and not a library, the semver
//! versioning covers the CLI only. All Rust APIs can change at any time.
//!
//! The external collaborators of a build (device tree tools, signing tools,
//! the packer) sit behind traits so that the pipeline can run against fakes.

pub mod board;
pub mod bundle;
pub mod cli;
pub mod fdt;
pub mod format;
pub mod pack;
pub mod tool;
pub mod util;
