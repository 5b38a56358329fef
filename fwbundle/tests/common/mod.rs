// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! In-memory stand-ins for the external tools.

#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::BTreeMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use fwbundle::{
    bundle::bootstub::{self, BootstubSigner},
    fdt::{self, DeviceTree},
    format::bl2::PARAM_MARKER,
    tool::{self, ToolRunner},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Ints(Vec<u32>),
}

/// Device tree kept in memory and mirrored to its backing file in a simple
/// text format. Integer cells always take the same number of bytes.
#[derive(Clone, Debug)]
pub struct MemoryFdt {
    path: PathBuf,
    nodes: BTreeMap<String, BTreeMap<String, Value>>,
    pub compiled_with: Option<String>,
}

impl MemoryFdt {
    pub fn new(path: &Path) -> Self {
        let tree = Self {
            path: path.to_owned(),
            nodes: BTreeMap::new(),
            compiled_with: None,
        };
        tree.save();
        tree
    }

    /// Load a tree previously written by [`MemoryFdt`].
    pub fn open(path: &Path) -> Self {
        let data = fs::read_to_string(path).unwrap();
        let mut nodes = BTreeMap::<String, BTreeMap<String, Value>>::new();

        for line in data.lines() {
            let mut pieces = line.splitn(3, '\t');
            let node = pieces.next().unwrap();
            let prop = pieces.next().unwrap();
            let raw = pieces.next().unwrap();

            let value = if let Some(s) = raw.strip_prefix("s:") {
                Value::Str(s.to_owned())
            } else {
                let cells = raw.strip_prefix("i:").unwrap();
                Value::Ints(
                    cells
                        .split_whitespace()
                        .map(|c| u32::from_str_radix(&c[2..], 16).unwrap())
                        .collect(),
                )
            };

            let props = nodes.entry(node.to_owned()).or_default();
            if !prop.is_empty() {
                props.insert(prop.to_owned(), value);
            }
        }

        Self {
            path: path.to_owned(),
            nodes,
            compiled_with: None,
        }
    }

    fn save(&self) {
        let mut data = String::new();

        for (node, props) in &self.nodes {
            if props.is_empty() {
                data.push_str(&format!("{node}\t\ts:\n"));
            }

            for (prop, value) in props {
                let raw = match value {
                    Value::Str(s) => format!("s:{s}"),
                    Value::Ints(cells) => {
                        let cells = cells
                            .iter()
                            .map(|c| format!("{c:#010x}"))
                            .collect::<Vec<_>>();
                        format!("i:{}", cells.join(" "))
                    }
                };

                data.push_str(&format!("{node}\t{prop}\t{raw}\n"));
            }
        }

        fs::write(&self.path, data).unwrap();
    }

    /// Set a property without going through the trait.
    pub fn with(mut self, node: &str, prop: &str, value: Value) -> Self {
        self.nodes
            .entry(node.to_owned())
            .or_default()
            .insert(prop.to_owned(), value);
        self.save();
        self
    }

    pub fn with_str(self, node: &str, prop: &str, value: &str) -> Self {
        self.with(node, prop, Value::Str(value.to_owned()))
    }

    pub fn with_ints(self, node: &str, prop: &str, values: &[u32]) -> Self {
        self.with(node, prop, Value::Ints(values.to_vec()))
    }

    pub fn value(&self, node: &str, prop: &str) -> Option<&Value> {
        self.nodes.get(node)?.get(prop)
    }

    fn put(&mut self, node: &str, prop: &str, value: Value) {
        self.nodes
            .entry(node.to_owned())
            .or_default()
            .insert(prop.to_owned(), value);
        self.save();
    }
}

impl DeviceTree for MemoryFdt {
    fn path(&self) -> &Path {
        &self.path
    }

    fn get_string(&self, node: &str, prop: &str) -> Result<Option<String>, fdt::Error> {
        Ok(match self.value(node, prop) {
            Some(Value::Str(s)) => Some(s.clone()),
            Some(Value::Ints(_)) => panic!("{node}/{prop} is not a string"),
            None => None,
        })
    }

    fn get_ints(&self, node: &str, prop: &str) -> Result<Option<Vec<i64>>, fdt::Error> {
        match self.value(node, prop) {
            // Cells read back as signed, like fdtget prints them.
            Some(Value::Ints(cells)) => Ok(Some(
                cells.iter().map(|c| i64::from(*c as i32)).collect(),
            )),
            Some(Value::Str(s)) => Err(fdt::Error::InvalidInt {
                node: node.to_owned(),
                prop: prop.to_owned(),
                value: s.clone(),
            }),
            None => Ok(None),
        }
    }

    fn get_props(&self, node: &str) -> Result<Vec<String>, fdt::Error> {
        Ok(self
            .nodes
            .get(node)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn subnodes(&self, node: &str) -> Result<Vec<String>, fdt::Error> {
        let prefix = format!("{}/", node.trim_end_matches('/'));

        Ok(self
            .nodes
            .keys()
            .filter_map(|n| n.strip_prefix(&prefix))
            .filter(|n| !n.contains('/'))
            .map(|n| n.to_owned())
            .collect())
    }

    fn put_string(&mut self, node: &str, prop: &str, value: &str) -> Result<(), fdt::Error> {
        self.put(node, prop, Value::Str(value.to_owned()));
        Ok(())
    }

    fn put_ints(&mut self, node: &str, prop: &str, values: &[u32]) -> Result<(), fdt::Error> {
        self.put(node, prop, Value::Ints(values.to_vec()));
        Ok(())
    }

    fn copy(&self, path: &Path) -> Result<Self, fdt::Error> {
        let tree = Self {
            path: path.to_owned(),
            nodes: self.nodes.clone(),
            compiled_with: self.compiled_with.clone(),
        };
        tree.save();
        Ok(tree)
    }

    fn compile(&mut self, arch_include: &str) -> Result<(), fdt::Error> {
        self.compiled_with = Some(arch_include.to_owned());
        Ok(())
    }
}

/// One recorded tool invocation.
#[derive(Clone, Debug)]
pub struct ToolCall {
    pub tool: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Records invocations. `gbb_utility -c` creates an empty GBB, `cbootimage`
/// writes a placeholder signed image and `bct_dump` prints the configured
/// device type. Everything else succeeds silently.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub calls: RefCell<Vec<ToolCall>>,
    pub bct_dump_output: String,
    /// Tools that fail when run.
    pub failing: Vec<String>,
}

impl RecordingRunner {
    pub fn calls_to(&self, tool: &str) -> Vec<ToolCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.tool == tool)
            .cloned()
            .collect()
    }
}

impl ToolRunner for RecordingRunner {
    fn run(
        &self,
        tool: &str,
        args: &[OsString],
        cwd: Option<&Path>,
    ) -> Result<String, tool::Error> {
        let args = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>();

        self.calls.borrow_mut().push(ToolCall {
            tool: tool.to_owned(),
            args: args.clone(),
            cwd: cwd.map(|p| p.to_owned()),
        });

        if self.failing.iter().any(|t| t == tool) {
            return Err(tool::Error::CommandSpawn(
                fwbundle::util::DebugString::new(tool),
                std::io::Error::other("tool disabled"),
            ));
        }

        match tool {
            "gbb_utility" if args[0] == "-c" => {
                let dir = cwd.unwrap();
                fs::write(dir.join(&args[2]), b"GBB").unwrap();
            }
            "cbootimage" => {
                fs::write(&args[1], b"cbootimage signed").unwrap();
            }
            "bct_dump" => return Ok(self.bct_dump_output.clone()),
            _ => {}
        }

        Ok(String::new())
    }
}

/// Fake signer: a fixed header followed by the bootstub padded to 512 bytes.
/// With `grow_on_resign`, every signing after the first adds another block.
#[derive(Debug, Default)]
pub struct FakeSigner {
    pub calls: RefCell<Vec<(PathBuf, u32)>>,
    pub grow_on_resign: bool,
}

pub const SIGNED_HEADER: &[u8] = b"SIGNED-BY-FAKE\0\0";

impl BootstubSigner for FakeSigner {
    fn sign(
        &self,
        _bct: &Path,
        bootstub: &Path,
        text_base: u32,
        output: &Path,
    ) -> Result<(), bootstub::Error> {
        let mut calls = self.calls.borrow_mut();
        calls.push((bootstub.to_owned(), text_base));

        let mut data = SIGNED_HEADER.to_vec();
        data.extend(fs::read(bootstub).unwrap());
        data.resize(data.len().div_ceil(512) * 512, 0);

        if self.grow_on_resign && calls.len() > 1 {
            data.extend([0u8; 512]);
        }

        fs::write(output, data).unwrap();

        Ok(())
    }
}

/// U-Boot image whose header declares `text_base`.
pub fn uboot_image(text_base: u32, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    data[0x10..0x14].copy_from_slice(&0x12345678u32.to_le_bytes());
    data[0x14..0x18].copy_from_slice(&text_base.to_le_bytes());
    data
}

/// Offset of the parameter block in [`bl2_image`].
pub const BL2_BLOCK_POS: usize = 0x40;

/// A BL2 image with a parameter block at [`BL2_BLOCK_POS`] holding `codes`,
/// each with a placeholder value of `0xaaaaaaaa`, followed by `tail` padding
/// bytes and the checksum.
pub fn bl2_image(version: u32, codes: &[u8], tail: usize) -> Vec<u8> {
    let codes_area = (codes.len() + 4) & !3;
    let block_size = 12 + codes_area + codes.len() * 4;

    let mut data = vec![0x11u8; BL2_BLOCK_POS];
    data.extend(PARAM_MARKER.to_le_bytes());
    data.extend(version.to_le_bytes());
    data.extend((block_size as u32).to_le_bytes());
    data.extend(codes);
    data.resize(data.len() + codes_area - codes.len(), 0);
    for _ in codes {
        data.extend(0xaaaaaaaau32.to_le_bytes());
    }
    data.resize(data.len() + tail, 0x22);
    data.extend([0u8; 4]);

    data
}

/// Value of parameter `index` in an image from [`bl2_image`].
pub fn bl2_value(data: &[u8], codes_len: usize, index: usize) -> u32 {
    let offset = BL2_BLOCK_POS + 12 + ((codes_len + 4) & !3) + index * 4;
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}
