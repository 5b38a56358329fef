// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Flattened device tree access.
//!
//! The bundler only needs property-level reads and writes, so the device tree
//! is treated as an opaque file that is queried and modified through the
//! `fdtget`, `fdtput` and `dtc` tools. Each [`DeviceTree`] handle owns its
//! backing file. A variant that must diverge from its parent is created with
//! [`DeviceTree::copy`], which never shares writes with the original.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    tool::{self, ToolRunner},
    util,
};

/// Printed by `fdtget` instead of failing when a property is absent.
const MISSING_SENTINEL: &str = "fwbundle-missing-value";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse {prop:?} of {node:?} as integers: {value:?}")]
    InvalidInt {
        node: String,
        prop: String,
        value: String,
    },
    #[error("Device tree tool failed")]
    Tool(#[from] tool::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Property-level access to a device tree blob.
pub trait DeviceTree: Sized {
    /// Path of the backing file.
    fn path(&self) -> &Path;

    /// Read a string property. Returns [`None`] if it does not exist.
    fn get_string(&self, node: &str, prop: &str) -> Result<Option<String>>;

    /// Read an integer list property. Cells are returned as signed values,
    /// like the device tree tools print them.
    fn get_ints(&self, node: &str, prop: &str) -> Result<Option<Vec<i64>>>;

    /// List the property names of a node. A missing node has no properties.
    fn get_props(&self, node: &str) -> Result<Vec<String>>;

    /// List the names of a node's children. A missing node has no children.
    fn subnodes(&self, node: &str) -> Result<Vec<String>>;

    /// Write a string property, creating the node if needed.
    fn put_string(&mut self, node: &str, prop: &str, value: &str) -> Result<()>;

    /// Write a list of 32-bit cells, creating the node if needed.
    fn put_ints(&mut self, node: &str, prop: &str, values: &[u32]) -> Result<()>;

    /// Create an independent copy backed by a new file at `path`.
    fn copy(&self, path: &Path) -> Result<Self>;

    /// Compile device tree source into a blob, including the architecture's
    /// common definitions. Handles that are already blobs are left alone.
    fn compile(&mut self, arch_include: &str) -> Result<()>;

    /// Read the first cell of an integer property.
    fn get_int(&self, node: &str, prop: &str) -> Result<Option<i64>> {
        Ok(self
            .get_ints(node, prop)?
            .and_then(|v| v.first().copied()))
    }

    /// Write a single 32-bit cell. The encoded size does not depend on the
    /// value.
    fn put_int(&mut self, node: &str, prop: &str, value: u32) -> Result<()> {
        self.put_ints(node, prop, &[value])
    }

    /// Read the binary contents of the device tree.
    fn data(&self) -> Result<Vec<u8>> {
        fs::read(self.path()).map_err(|e| Error::File(self.path().to_owned(), e))
    }
}

/// A device tree file manipulated via the device tree compiler tools.
#[derive(Clone, Debug)]
pub struct Fdt<R: ToolRunner + Clone> {
    tools: R,
    path: PathBuf,
    /// Where compiled blobs are written.
    out_dir: PathBuf,
}

impl<R: ToolRunner + Clone> Fdt<R> {
    pub fn new(tools: R, path: &Path, out_dir: &Path) -> Self {
        Self {
            tools,
            path: path.to_owned(),
            out_dir: out_dir.to_owned(),
        }
    }

    fn fdtput(&self, node: &str, prop: &str, kind: &str, values: Vec<OsString>) -> Result<()> {
        let mut argv: Vec<OsString> = vec![
            "-p".into(),
            "-t".into(),
            kind.into(),
            self.path.as_os_str().to_owned(),
            node.into(),
            prop.into(),
        ];
        argv.extend(values);

        self.tools.run("fdtput", &argv, None)?;

        Ok(())
    }

    fn get_raw(&self, node: &str, prop: &str, kind: &str) -> Result<Option<String>> {
        let argv: Vec<OsString> = vec![
            "-t".into(),
            kind.into(),
            "-d".into(),
            MISSING_SENTINEL.into(),
            self.path.as_os_str().to_owned(),
            node.into(),
            prop.into(),
        ];
        let output = self.tools.run("fdtget", &argv, None)?;
        let output = output.strip_suffix('\n').unwrap_or(&output);

        if output == MISSING_SENTINEL {
            Ok(None)
        } else {
            Ok(Some(output.to_owned()))
        }
    }

    fn list(&self, flag: &str, node: &str) -> Result<Vec<String>> {
        let argv: Vec<OsString> = vec![flag.into(), self.path.as_os_str().to_owned(), node.into()];

        match self.tools.run("fdtget", &argv, None) {
            Ok(output) => Ok(output.lines().map(|l| l.to_owned()).collect()),
            // fdtget fails for nodes that don't exist.
            Err(tool::Error::CommandExecution(..)) => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: ToolRunner + Clone> DeviceTree for Fdt<R> {
    fn path(&self) -> &Path {
        &self.path
    }

    fn get_string(&self, node: &str, prop: &str) -> Result<Option<String>> {
        self.get_raw(node, prop, "s")
    }

    fn get_ints(&self, node: &str, prop: &str) -> Result<Option<Vec<i64>>> {
        let Some(output) = self.get_raw(node, prop, "i")? else {
            return Ok(None);
        };

        let values = output
            .split_whitespace()
            .map(|v| v.parse::<i64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidInt {
                node: node.to_owned(),
                prop: prop.to_owned(),
                value: output.clone(),
            })?;

        Ok(Some(values))
    }

    fn get_props(&self, node: &str) -> Result<Vec<String>> {
        self.list("-p", node)
    }

    fn subnodes(&self, node: &str) -> Result<Vec<String>> {
        self.list("-l", node)
    }

    fn put_string(&mut self, node: &str, prop: &str, value: &str) -> Result<()> {
        self.fdtput(node, prop, "s", vec![value.into()])
    }

    fn put_ints(&mut self, node: &str, prop: &str, values: &[u32]) -> Result<()> {
        let values = values.iter().map(|v| v.to_string().into()).collect();

        self.fdtput(node, prop, "u", values)
    }

    fn copy(&self, path: &Path) -> Result<Self> {
        fs::copy(&self.path, path).map_err(|e| Error::File(path.to_owned(), e))?;

        Ok(Self {
            tools: self.tools.clone(),
            path: path.to_owned(),
            out_dir: self.out_dir.clone(),
        })
    }

    fn compile(&mut self, arch_include: &str) -> Result<()> {
        if self.path.extension().is_none_or(|e| e != "dts") {
            return Ok(());
        }

        let stem = self.path.file_stem().unwrap_or_default().to_owned();
        let search_dir = util::parent_path(&self.path).to_owned();
        let source = fs::canonicalize(&self.path).map_err(|e| Error::File(self.path.clone(), e))?;

        // dtc has no option for prepending an include, so compile a small
        // wrapper that pulls in the architecture first.
        let mut wrapper = self.out_dir.join(&stem);
        wrapper.set_extension("wrapper.dts");
        let wrapper_data = format!(
            "/dts-v1/;\n/include/ \"{arch_include}\"\n/include/ \"{}\"\n",
            source.display(),
        );
        fs::write(&wrapper, wrapper_data).map_err(|e| Error::File(wrapper.clone(), e))?;

        let mut output = self.out_dir.join(&stem);
        output.set_extension("dtb");

        debug!("Compiling {:?} with {arch_include:?} to {output:?}", self.path);

        self.tools.run(
            "dtc",
            &[
                "-I".into(),
                "dts".into(),
                "-O".into(),
                "dtb".into(),
                "-p".into(),
                "4096".into(),
                "-i".into(),
                search_dir.into(),
                "-o".into(),
                output.as_os_str().to_owned(),
                wrapper.into(),
            ],
            None,
        )?;

        self.path = output;

        Ok(())
    }
}
