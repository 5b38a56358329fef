// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Flash map driven image packing.
//!
//! The flash map is an ordered list of regions. Regions of type `blob <name>`
//! are filled from the property called `<name>`, which is a path registered by
//! the bundler. A blob name containing commas is the concatenation of the
//! listed properties.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    fdt::{self, DeviceTree},
    format::padding,
    util::NumBytes,
};

/// Device tree node containing the flash map.
pub const FLASH_NODE: &str = "/flash";

#[derive(Debug, Error)]
pub enum Error {
    #[error("No flash map found in the device tree and the board has no default")]
    NoFlashMap,
    #[error("Flash map entry {0:?} has neither a size nor a reg property")]
    NoEntrySize(String),
    #[error("Flash map entry {0:?} extends past 4 GiB")]
    EntryOverflow(String),
    #[error("Flash map entries are not populated: {0:?}")]
    IncompleteImage(Vec<String>),
    #[error("Blob for {node:?} is too large: {size} > {capacity}")]
    BlobTooLarge {
        node: String,
        size: usize,
        capacity: u32,
    },
    #[error("No property for blob: {0:?}")]
    MissingProperty(String),
    #[error("Device tree error")]
    Fdt(#[from] fdt::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A flash map node descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlashEntry {
    pub node: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Explicit `[offset, size]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reg: Option<[u32; 2]>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// On-disk TOML representation of a flash map.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FlashMapFile {
    #[serde(rename = "entry")]
    pub entries: Vec<FlashEntry>,
}

/// Parsed form of [`FlashEntry::kind`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Blob {
        blob_type: String,
        params: Vec<String>,
    },
    BlobString(String),
    /// Intel flash descriptor region, copied from the coreboot skeleton.
    Ifd,
    Wiped,
    Other(String),
}

impl EntryKind {
    pub fn parse(kind: &str) -> Self {
        let mut words = kind.split_whitespace();

        match (words.next(), words.next()) {
            (Some("blob"), Some(blob_type)) => Self::Blob {
                blob_type: blob_type.to_owned(),
                params: words.map(|w| w.to_owned()).collect(),
            },
            (Some("blobstring"), Some(name)) => Self::BlobString(name.to_owned()),
            (Some("ifd"), None) => Self::Ifd,
            (Some("wiped" | "empty"), _) => Self::Wiped,
            _ => Self::Other(kind.to_owned()),
        }
    }

    /// Name of the property holding this region's contents.
    fn property(&self) -> Option<&str> {
        match self {
            Self::Blob { blob_type, .. } => Some(blob_type),
            Self::BlobString(name) => Some(name),
            _ => None,
        }
    }
}

/// Operations the bundler needs from an image packer.
pub trait Packer {
    /// Register the file for a property. Existing entries are replaced.
    fn add_property(&mut self, name: &str, path: &Path);

    fn get_property(&self, name: &str) -> Option<&Path>;

    /// All registered properties.
    fn properties(&self) -> &BTreeMap<String, PathBuf>;

    /// Whether every property named in a comma-separated list exists.
    fn has_property(&self, name: &str) -> bool {
        name.split(',').all(|n| self.get_property(n).is_some())
    }

    /// Read and concatenate the contents of the named properties.
    fn concat_prop_contents(&self, names: &[&str]) -> Result<Vec<u8>> {
        let mut data = vec![];

        for name in names {
            let path = self
                .get_property(name)
                .ok_or_else(|| Error::MissingProperty((*name).to_owned()))?;
            let mut contents = fs::read(path).map_err(|e| Error::File(path.to_owned(), e))?;
            data.append(&mut contents);
        }

        Ok(data)
    }

    /// Blob types used by the flash map, in map order.
    fn blob_list(&self) -> Vec<String>;

    /// Extra parameters of the first region using `blob_type`.
    fn blob_params(&self, blob_type: &str) -> Vec<String>;

    /// Total size of the packed image.
    fn image_size(&self) -> u32;

    /// Require every blob region to be populated.
    fn require_all_entries(&mut self);

    /// Check that the registered properties satisfy the flash map.
    fn check_properties(&self) -> Result<()>;

    /// Record each region's position, and how much of it is used, in the
    /// `/flash` node of the given device tree.
    fn update_blob_positions<T: DeviceTree>(&self, tree: &mut T) -> Result<()>;

    /// Write the image to `output`.
    fn pack_image(&self, output: &Path) -> Result<()>;

    /// Log the flash map layout.
    fn show_map(&self);
}

#[derive(Clone, Debug)]
struct Region {
    entry: FlashEntry,
    kind: EntryKind,
    offset: u32,
    size: u32,
}

/// Packs regions at their `reg` offsets, or directly after the previous
/// region if they only specify a size. Unused space is left erased.
#[derive(Clone, Debug)]
pub struct FlashMapPacker {
    regions: Vec<Region>,
    image_size: u32,
    props: BTreeMap<String, PathBuf>,
    require_all: bool,
}

impl FlashMapPacker {
    pub fn new(entries: Vec<FlashEntry>) -> Result<Self> {
        let mut regions = Vec::with_capacity(entries.len());
        let mut cursor = 0u32;
        let mut image_size = 0u32;

        for entry in entries {
            let (offset, size) = match (entry.reg, entry.size) {
                (Some([offset, size]), _) => (offset, size),
                (None, Some(size)) => (cursor, size),
                (None, None) => return Err(Error::NoEntrySize(entry.node)),
            };
            let end = offset
                .checked_add(size)
                .ok_or_else(|| Error::EntryOverflow(entry.node.clone()))?;

            cursor = end;
            image_size = image_size.max(end);

            regions.push(Region {
                kind: EntryKind::parse(&entry.kind),
                entry,
                offset,
                size,
            });
        }

        Ok(Self {
            regions,
            image_size,
            props: BTreeMap::new(),
            require_all: false,
        })
    }

    /// Read the flash map from the `/flash` node of a device tree. Returns
    /// [`None`] if the device tree has no flash map.
    pub fn entries_from_tree<T: DeviceTree>(tree: &T) -> Result<Option<Vec<FlashEntry>>> {
        let nodes = tree.subnodes(FLASH_NODE)?;
        if nodes.is_empty() {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(nodes.len());

        for node in nodes {
            let path = format!("{FLASH_NODE}/{node}");
            let props = tree.get_props(&path)?;
            let reg = tree
                .get_ints(&path, "reg")?
                .and_then(|r| match r[..] {
                    [offset, size] => Some([offset as u32, size as u32]),
                    _ => None,
                });
            let size = tree.get_int(&path, "size")?.map(|s| s as u32);

            entries.push(FlashEntry {
                label: tree
                    .get_string(&path, "label")?
                    .unwrap_or_else(|| node.clone()),
                size,
                reg,
                read_only: props.iter().any(|p| p == "read-only"),
                kind: tree.get_string(&path, "type")?.unwrap_or_default(),
                required: props.iter().any(|p| p == "required"),
                filename: tree.get_string(&path, "filename")?,
                node,
            });
        }

        Ok(Some(entries))
    }

    /// Use the device tree's flash map if it has one, otherwise the board
    /// default.
    pub fn select<T: DeviceTree>(tree: &T, default: Option<&[FlashEntry]>) -> Result<Self> {
        let entries = match Self::entries_from_tree(tree)? {
            Some(e) => e,
            None => {
                debug!("No flash map in device tree; using board default");
                default.ok_or(Error::NoFlashMap)?.to_vec()
            }
        };

        Self::new(entries)
    }

    fn missing_entries(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().filter(|r| {
            r.kind
                .property()
                .is_some_and(|p| !self.has_property(p))
        })
    }
}

impl Packer for FlashMapPacker {
    fn add_property(&mut self, name: &str, path: &Path) {
        debug!("Property {name:?}: {path:?}");
        self.props.insert(name.to_owned(), path.to_owned());
    }

    fn get_property(&self, name: &str) -> Option<&Path> {
        self.props.get(name).map(|p| p.as_path())
    }

    fn properties(&self) -> &BTreeMap<String, PathBuf> {
        &self.props
    }

    fn blob_list(&self) -> Vec<String> {
        let mut result: Vec<String> = vec![];

        for region in &self.regions {
            if let EntryKind::Blob { blob_type, .. } = &region.kind {
                if !result.contains(blob_type) {
                    result.push(blob_type.clone());
                }
            }
        }

        result
    }

    fn blob_params(&self, blob_type: &str) -> Vec<String> {
        self.regions
            .iter()
            .find_map(|r| match &r.kind {
                EntryKind::Blob {
                    blob_type: t,
                    params,
                } if t == blob_type => Some(params.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn image_size(&self) -> u32 {
        self.image_size
    }

    fn require_all_entries(&mut self) {
        self.require_all = true;
    }

    fn check_properties(&self) -> Result<()> {
        let missing = self
            .missing_entries()
            .map(|r| r.entry.node.clone())
            .collect::<Vec<_>>();

        if missing.is_empty() {
            return Ok(());
        }

        if self.require_all {
            return Err(Error::IncompleteImage(missing));
        }

        for region in self.missing_entries() {
            if region.entry.required {
                warn!(
                    "Flash map entry {:?} ({}) has no contents; leaving it erased",
                    region.entry.node, region.entry.kind,
                );
            }
        }

        Ok(())
    }

    fn update_blob_positions<T: DeviceTree>(&self, tree: &mut T) -> Result<()> {
        for region in &self.regions {
            let path = format!("{FLASH_NODE}/{}", region.entry.node);
            tree.put_ints(&path, "reg", &[region.offset, region.size])?;

            let Some(prop) = region.kind.property() else {
                continue;
            };
            if !self.has_property(prop) {
                continue;
            }

            let mut used = 0u64;
            for name in prop.split(',') {
                let file = &self.props[name];
                let metadata = fs::metadata(file).map_err(|e| Error::File(file.clone(), e))?;
                used += metadata.len();
            }

            tree.put_int(&path, "used", used.min(u64::from(u32::MAX)) as u32)?;
        }

        Ok(())
    }

    fn pack_image(&self, output: &Path) -> Result<()> {
        let mut image = padding::erased(self.image_size as usize);

        for region in &self.regions {
            let start = region.offset as usize;
            let end = start + region.size as usize;

            let data = match &region.kind {
                EntryKind::Blob { .. } | EntryKind::BlobString(_) => {
                    let Some(prop) = region.kind.property().filter(|p| self.has_property(p))
                    else {
                        continue;
                    };
                    let names = prop.split(',').collect::<Vec<_>>();
                    self.concat_prop_contents(&names)?
                }
                EntryKind::Ifd => {
                    let Some(skeleton) = self.get_property("skeleton") else {
                        warn!("No skeleton for {:?}; leaving it erased", region.entry.node);
                        continue;
                    };
                    let data = fs::read(skeleton).map_err(|e| Error::File(skeleton.to_owned(), e))?;
                    data.get(start..end.min(data.len()))
                        .unwrap_or_default()
                        .to_vec()
                }
                EntryKind::Wiped => continue,
                EntryKind::Other(kind) => {
                    debug!("Leaving {:?} ({kind:?}) erased", region.entry.node);
                    continue;
                }
            };

            if data.len() > region.size as usize {
                return Err(Error::BlobTooLarge {
                    node: region.entry.node.clone(),
                    size: data.len(),
                    capacity: region.size,
                });
            }

            image[start..start + data.len()].copy_from_slice(&data);
        }

        fs::write(output, &image).map_err(|e| Error::File(output.to_owned(), e))?;
        debug!("Packed image: {:?}", NumBytes(image.len()));

        Ok(())
    }

    fn show_map(&self) {
        info!("{:>10} {:>10} {:<20} {:<20} type", "offset", "size", "node", "label");

        for region in &self.regions {
            info!(
                "{:>#10x} {:>#10x} {:<20} {:<20} {}",
                region.offset, region.size, region.entry.node, region.entry.label, region.entry.kind,
            );
        }
    }
}
