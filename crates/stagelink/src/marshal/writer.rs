// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Writer-rank marshaling state: collects `put` calls for the current
//! timestep and flattens them into one metadata block and one data block at
//! step close.

use std::collections::HashMap;

use log::debug;

use crate::control::msg::FormatBlock;
use crate::error::{Error, Result};
use crate::marshal::format::{FieldDef, FormatList};
use crate::marshal::VarType;

/// Fixed metadata header: format hash + data block size + bitfield length.
pub const META_HEADER_LEN: usize = 16 + 8 + 4;

enum Staged {
    Scalar([u8; 8]),
    Array {
        shape: Vec<u64>,
        start: Vec<u64>,
        count: Vec<u64>,
        data_off: u64,
        data_len: u64,
    },
}

/// Output of closing one timestep.
pub struct ClosedStep {
    pub metadata: Vec<u8>,
    pub data: Vec<u8>,
    /// Format blocks first announced by this step (empty when the layout is
    /// unchanged from the previous step).
    pub new_formats: Vec<FormatBlock>,
}

/// Per-writer-rank marshaling state. Fields accumulate over the stream's
/// lifetime; each distinct field catalog is announced once, as a format
/// block keyed by content hash, and referenced by hash thereafter.
pub struct MarshalWriter {
    fields: Vec<FieldDef>,
    index: HashMap<String, usize>,
    /// Hash of the last announced format, `None` before the first step or
    /// after a new field registration.
    announced: Option<[u8; 16]>,
    staged: Vec<Option<Staged>>,
    data: Vec<u8>,
}

impl MarshalWriter {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            index: HashMap::new(),
            announced: None,
            staged: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Register or look up a field, checking type and rank consistency
    /// against any previous registration.
    fn field_slot(&mut self, name: &str, vtype: VarType, ndims: usize) -> Result<usize> {
        if let Some(&slot) = self.index.get(name) {
            let existing = &self.fields[slot];
            if existing.vtype != vtype || existing.ndims != ndims {
                return Err(Error::InvalidParam(format!(
                    "variable {} redefined with different type or rank",
                    name
                )));
            }
            return Ok(slot);
        }
        let slot = self.fields.len();
        debug!("[MarshalWriter::field_slot] new field {} (slot {})", name, slot);
        self.fields.push(FieldDef {
            name: name.to_string(),
            vtype,
            ndims,
        });
        self.index.insert(name.to_string(), slot);
        self.staged.push(None);
        // Layout changed: the next close announces a fresh format.
        self.announced = None;
        Ok(slot)
    }

    /// Stage one array put. `payload` must hold exactly
    /// `product(count) * elem_size` bytes; the bytes are copied into the
    /// step's data block immediately so the caller's buffer is free to reuse
    /// on return.
    pub fn put_array(
        &mut self,
        name: &str,
        vtype: VarType,
        shape: &[u64],
        start: &[u64],
        count: &[u64],
        payload: &[u8],
    ) -> Result<()> {
        if shape.is_empty() {
            return Err(Error::InvalidParam(format!(
                "variable {}: arrays need at least one dimension",
                name
            )));
        }
        if start.len() != shape.len() || count.len() != shape.len() {
            return Err(Error::InvalidParam(format!(
                "variable {}: shape/start/count rank mismatch",
                name
            )));
        }
        for d in 0..shape.len() {
            if start[d].saturating_add(count[d]) > shape[d] {
                return Err(Error::InvalidParam(format!(
                    "variable {}: dim {} block {}+{} exceeds shape {}",
                    name, d, start[d], count[d], shape[d]
                )));
            }
        }
        let elems: u64 = count.iter().product();
        let expect = elems as usize * vtype.elem_size();
        if payload.len() != expect {
            return Err(Error::InvalidParam(format!(
                "variable {}: payload is {} bytes, geometry implies {}",
                name,
                payload.len(),
                expect
            )));
        }

        let slot = self.field_slot(name, vtype, shape.len())?;
        let data_off = self.data.len() as u64;
        self.data.extend_from_slice(payload);
        self.staged[slot] = Some(Staged::Array {
            shape: shape.to_vec(),
            start: start.to_vec(),
            count: count.to_vec(),
            data_off,
            data_len: payload.len() as u64,
        });
        Ok(())
    }

    /// Stage one scalar put. `value` must be exactly the element size of
    /// `vtype`; it travels in the metadata block, not the data block.
    pub fn put_scalar(&mut self, name: &str, vtype: VarType, value: &[u8]) -> Result<()> {
        if value.len() != vtype.elem_size() {
            return Err(Error::InvalidParam(format!(
                "variable {}: scalar value is {} bytes, type needs {}",
                name,
                value.len(),
                vtype.elem_size()
            )));
        }
        let slot = self.field_slot(name, vtype, 0)?;
        let mut cell = [0u8; 8];
        cell[..value.len()].copy_from_slice(value);
        self.staged[slot] = Some(Staged::Scalar(cell));
        Ok(())
    }

    /// Flatten the staged puts into metadata and data blocks and reset for
    /// the next step. Fields registered in earlier steps but not written
    /// this step get a cleared bitfield entry and a zeroed record.
    pub fn close_step(&mut self) -> ClosedStep {
        let list = FormatList {
            fields: self.fields.clone(),
        };
        let hash = list.content_hash();
        let new_formats = if self.announced == Some(hash) {
            Vec::new()
        } else {
            self.announced = Some(hash);
            vec![FormatBlock {
                hash,
                body: list.encode(),
            }]
        };

        let bitfield_len = list.bitfield_len();
        let (offsets, records_len) = list.record_offsets();
        let records_base = META_HEADER_LEN + bitfield_len;
        let mut meta = vec![0u8; records_base + records_len];

        meta[0..16].copy_from_slice(&hash);
        meta[16..24].copy_from_slice(&(self.data.len() as u64).to_le_bytes());
        meta[24..28].copy_from_slice(&(bitfield_len as u32).to_le_bytes());

        for (slot, staged) in self.staged.iter_mut().enumerate() {
            let Some(staged) = staged.take() else {
                continue;
            };
            meta[META_HEADER_LEN + slot / 8] |= 1 << (slot % 8);
            let at = records_base + offsets[slot];
            match staged {
                Staged::Scalar(cell) => {
                    meta[at..at + 8].copy_from_slice(&cell);
                }
                Staged::Array {
                    shape,
                    start,
                    count,
                    data_off,
                    data_len,
                } => {
                    meta[at..at + 8].copy_from_slice(&data_off.to_le_bytes());
                    meta[at + 8..at + 16].copy_from_slice(&data_len.to_le_bytes());
                    let mut cursor = at + 16;
                    for d in 0..shape.len() {
                        meta[cursor..cursor + 8].copy_from_slice(&shape[d].to_le_bytes());
                        meta[cursor + 8..cursor + 16].copy_from_slice(&start[d].to_le_bytes());
                        meta[cursor + 16..cursor + 24].copy_from_slice(&count[d].to_le_bytes());
                        cursor += 24;
                    }
                }
            }
        }

        ClosedStep {
            metadata: meta,
            data: std::mem::take(&mut self.data),
            new_formats,
        }
    }
}

impl Default for MarshalWriter {
    fn default() -> Self {
        Self::new()
    }
}
