// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Reader-rank marshaling state: rebuilds per-variable descriptors from the
//! metadata blocks of every writer rank for the currently installed
//! timestep.

use std::collections::HashMap;

use log::debug;

use crate::control::msg::FormatBlock;
use crate::error::{Error, Result};
use crate::marshal::format::FormatList;
use crate::marshal::writer::META_HEADER_LEN;
use crate::marshal::VarType;

/// One writer rank's contribution to an array variable this timestep.
#[derive(Clone, Debug)]
pub struct RankGeom {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    /// Byte range within that rank's data block.
    pub data_off: u64,
    pub data_len: u64,
}

/// A variable as visible in the installed timestep.
#[derive(Clone, Debug)]
pub struct VarRecord {
    pub name: String,
    pub vtype: VarType,
    pub ndims: usize,
    /// Global shape, taken from the lowest writer rank that wrote the
    /// variable this step.
    pub shape: Vec<u64>,
    /// Indexed by writer rank; `None` where that rank did not write the
    /// variable this step. Empty for scalars.
    pub per_rank: Vec<Option<RankGeom>>,
    /// Scalar value (element-size bytes) from the lowest writing rank.
    pub scalar: Option<Vec<u8>>,
}

/// Per-reader-rank marshaling state.
pub struct MarshalReader {
    writer_size: usize,
    formats: HashMap<[u8; 16], FormatList>,
    vars: HashMap<String, VarRecord>,
    /// Data block size per writer rank for the installed step.
    data_sizes: Vec<u64>,
    installed: Option<u64>,
}

impl MarshalReader {
    pub fn new(writer_size: usize) -> Self {
        Self {
            writer_size,
            formats: HashMap::new(),
            vars: HashMap::new(),
            data_sizes: vec![0; writer_size],
            installed: None,
        }
    }

    /// Install format blocks received from the control plane. Duplicates
    /// (same hash) are harmless and skipped.
    pub fn add_formats(&mut self, blocks: &[FormatBlock]) -> Result<()> {
        for block in blocks {
            if self.formats.contains_key(&block.hash) {
                continue;
            }
            let list = FormatList::decode(&block.body)?;
            if list.content_hash() != block.hash {
                return Err(Error::Codec("format block hash mismatch".into()));
            }
            debug!(
                "[MarshalReader::add_formats] installed format with {} fields",
                list.fields.len()
            );
            self.formats.insert(block.hash, list);
        }
        Ok(())
    }

    /// Parse every writer rank's metadata block for `timestep` and rebuild
    /// the variable table. `metadata` is indexed by writer rank.
    pub fn install_step(&mut self, timestep: u64, metadata: &[Vec<u8>]) -> Result<()> {
        if metadata.len() != self.writer_size {
            return Err(Error::Codec(format!(
                "expected {} metadata blocks, got {}",
                self.writer_size,
                metadata.len()
            )));
        }
        self.vars.clear();
        self.data_sizes = vec![0; self.writer_size];

        for (rank, meta) in metadata.iter().enumerate() {
            self.install_rank(rank, meta)?;
        }
        self.installed = Some(timestep);
        Ok(())
    }

    fn install_rank(&mut self, rank: usize, meta: &[u8]) -> Result<()> {
        if meta.len() < META_HEADER_LEN {
            return Err(Error::Codec(format!(
                "rank {} metadata truncated at {} bytes",
                rank,
                meta.len()
            )));
        }
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&meta[0..16]);
        // Cloned out of the map: the loop below inserts into `self.vars`
        // while walking the field list.
        let format = self
            .formats
            .get(&hash)
            .cloned()
            .ok_or_else(|| Error::Codec(format!("rank {} references an unknown format", rank)))?;

        self.data_sizes[rank] = u64::from_le_bytes(meta[16..24].try_into().unwrap());
        let bitfield_len =
            u32::from_le_bytes(meta[24..28].try_into().unwrap()) as usize;
        if bitfield_len != format.bitfield_len() {
            return Err(Error::Codec(format!(
                "rank {} bitfield length disagrees with its format",
                rank
            )));
        }
        let records_base = META_HEADER_LEN + bitfield_len;
        let (offsets, records_len) = format.record_offsets();
        if meta.len() < records_base + records_len {
            return Err(Error::Codec(format!(
                "rank {} metadata shorter than its format implies",
                rank
            )));
        }

        for (slot, field) in format.fields.iter().enumerate() {
            let written = meta[META_HEADER_LEN + slot / 8] & (1 << (slot % 8)) != 0;
            if !written {
                continue;
            }
            let at = records_base + offsets[slot];
            let writer_size = self.writer_size;
            let var = self.vars.entry(field.name.clone()).or_insert_with(|| VarRecord {
                name: field.name.clone(),
                vtype: field.vtype,
                ndims: field.ndims,
                shape: Vec::new(),
                per_rank: vec![None; writer_size],
                scalar: None,
            });
            if var.vtype != field.vtype || var.ndims != field.ndims {
                return Err(Error::Codec(format!(
                    "variable {} has conflicting definitions across writer ranks",
                    field.name
                )));
            }

            if field.ndims == 0 {
                // Lowest writing rank wins; ranks are visited in order.
                if var.scalar.is_none() {
                    var.scalar = Some(meta[at..at + field.vtype.elem_size()].to_vec());
                }
            } else {
                let data_off = u64::from_le_bytes(meta[at..at + 8].try_into().unwrap());
                let data_len =
                    u64::from_le_bytes(meta[at + 8..at + 16].try_into().unwrap());
                let mut shape = Vec::with_capacity(field.ndims);
                let mut start = Vec::with_capacity(field.ndims);
                let mut count = Vec::with_capacity(field.ndims);
                let mut cursor = at + 16;
                for _ in 0..field.ndims {
                    shape.push(u64::from_le_bytes(
                        meta[cursor..cursor + 8].try_into().unwrap(),
                    ));
                    start.push(u64::from_le_bytes(
                        meta[cursor + 8..cursor + 16].try_into().unwrap(),
                    ));
                    count.push(u64::from_le_bytes(
                        meta[cursor + 16..cursor + 24].try_into().unwrap(),
                    ));
                    cursor += 24;
                }
                if var.shape.is_empty() {
                    var.shape = shape;
                }
                var.per_rank[rank] = Some(RankGeom {
                    start,
                    count,
                    data_off,
                    data_len,
                });
            }
        }
        Ok(())
    }

    /// Look up a variable in the installed step.
    pub fn var(&self, name: &str) -> Option<&VarRecord> {
        self.vars.get(name)
    }

    /// Names of every variable present in the installed step.
    pub fn var_names(&self) -> Vec<&str> {
        self.vars.keys().map(String::as_str).collect()
    }

    pub fn installed_step(&self) -> Option<u64> {
        self.installed
    }

    /// Data block size a writer rank registered for the installed step.
    pub fn data_size(&self, rank: usize) -> u64 {
        self.data_sizes[rank]
    }
}
