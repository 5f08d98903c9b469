// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Marshaling layer: named/typed/dimensioned variables to and from flat
//! metadata and data blocks.
//!
//! Writer side builds one metadata block and one data block per timestep;
//! reader side reconstructs per-variable descriptors and supports partial
//! reads via selection extraction.
//!
//! # Metadata block layout (per writer rank, per timestep)
//!
//! ```text
//! [0..16)        format hash (md5 of the format list body)
//! [16..24)       data block size, u64
//! [24..28)       written-variable bitfield length in bytes, u32
//! [28..28+B)     written-variable bitfield (bit i = field i written)
//! [28+B..)       per-field records at offsets fixed by the format list:
//!                  scalar: 8 bytes of value, zero padded
//!                  array:  data_off u64 | data_len u64 |
//!                          per dim: shape u64, start u64, count u64
//! ```
//!
//! Record offsets are a pure function of the format list, so both sides
//! compute them independently; only the format list itself travels (once per
//! distinct layout, identified by content hash).

pub mod format;
pub mod reader;
pub mod selection;
pub mod writer;

pub use format::{FieldDef, FormatList};
pub use reader::{MarshalReader, RankGeom, VarRecord};
pub use selection::Selection;
pub use writer::MarshalWriter;

use crate::error::{Error, Result};

/// Element type of a marshaled variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl VarType {
    pub fn elem_size(self) -> usize {
        match self {
            VarType::I8 | VarType::U8 => 1,
            VarType::I16 | VarType::U16 => 2,
            VarType::I32 | VarType::U32 | VarType::F32 => 4,
            VarType::I64 | VarType::U64 | VarType::F64 => 8,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            VarType::I8 => 0,
            VarType::I16 => 1,
            VarType::I32 => 2,
            VarType::I64 => 3,
            VarType::U8 => 4,
            VarType::U16 => 5,
            VarType::U32 => 6,
            VarType::U64 => 7,
            VarType::F32 => 8,
            VarType::F64 => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => VarType::I8,
            1 => VarType::I16,
            2 => VarType::I32,
            3 => VarType::I64,
            4 => VarType::U8,
            5 => VarType::U16,
            6 => VarType::U32,
            7 => VarType::U64,
            8 => VarType::F32,
            9 => VarType::F64,
            other => return Err(Error::Codec(format!("unknown type tag {}", other))),
        })
    }
}
