// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Format lists: the ordered field catalog a writer rank's metadata blocks
//! are laid out against, identified by content hash.

use md5::{Digest, Md5};

use crate::control::wire::{WireReader, WireWriter};
use crate::error::{Error, Result};
use crate::marshal::VarType;

/// One field of a format list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub vtype: VarType,
    /// Zero for scalars.
    pub ndims: usize,
}

impl FieldDef {
    /// Byte size of this field's record in the metadata block.
    pub fn record_size(&self) -> usize {
        if self.ndims == 0 {
            8
        } else {
            16 + 24 * self.ndims
        }
    }
}

/// An ordered list of fields. Field order is append-only over a stream's
/// lifetime, so every format a writer rank ever announces is a prefix
/// extension of the previous one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatList {
    pub fields: Vec<FieldDef>,
}

impl FormatList {
    /// Serialize to the body that travels in a format block.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.fields.len() as u32);
        for field in &self.fields {
            w.put_str(&field.name);
            w.put_u8(field.vtype.tag());
            w.put_u8(field.ndims as u8);
        }
        w.into_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(body);
        let count = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.read_str()?;
            let vtype = VarType::from_tag(r.read_u8()?)?;
            let ndims = r.read_u8()? as usize;
            fields.push(FieldDef { name, vtype, ndims });
        }
        if r.remaining() != 0 {
            return Err(Error::Codec("trailing bytes after format list".into()));
        }
        Ok(Self { fields })
    }

    /// Content hash identifying this layout.
    pub fn content_hash(&self) -> [u8; 16] {
        let digest = Md5::digest(self.encode());
        digest.into()
    }

    /// Byte length of the written-variable bitfield for this list.
    pub fn bitfield_len(&self) -> usize {
        self.fields.len().div_ceil(8)
    }

    /// Per-field record offsets relative to the start of the records area,
    /// plus the total records area size.
    pub fn record_offsets(&self) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut cursor = 0usize;
        for field in &self.fields {
            offsets.push(cursor);
            cursor += field.record_size();
        }
        (offsets, cursor)
    }

    /// Total metadata block size for this layout (header + bitfield +
    /// records).
    pub fn meta_block_size(&self) -> usize {
        let (_, records) = self.record_offsets();
        super::writer::META_HEADER_LEN + self.bitfield_len() + records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FormatList {
        FormatList {
            fields: vec![
                FieldDef {
                    name: "step_id".into(),
                    vtype: VarType::U64,
                    ndims: 0,
                },
                FieldDef {
                    name: "temperature".into(),
                    vtype: VarType::F64,
                    ndims: 2,
                },
                FieldDef {
                    name: "flags".into(),
                    vtype: VarType::U8,
                    ndims: 1,
                },
            ],
        }
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let list = sample();
        let decoded = FormatList::decode(&list.encode()).expect("decode");
        assert_eq!(decoded, list);
    }

    #[test]
    fn hash_tracks_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.content_hash(), b.content_hash());
        b.fields.push(FieldDef {
            name: "extra".into(),
            vtype: VarType::I32,
            ndims: 0,
        });
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn record_offsets_are_packed() {
        let list = sample();
        let (offsets, total) = list.record_offsets();
        // scalar u64: 8 bytes; 2-d array: 16 + 48; 1-d array: 16 + 24.
        assert_eq!(offsets, vec![0, 8, 72]);
        assert_eq!(total, 112);
    }

    #[test]
    fn bitfield_rounds_up() {
        let mut list = FormatList::default();
        assert_eq!(list.bitfield_len(), 0);
        for i in 0..9 {
            list.fields.push(FieldDef {
                name: format!("v{}", i),
                vtype: VarType::I8,
                ndims: 0,
            });
        }
        assert_eq!(list.bitfield_len(), 2);
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let mut body = sample().encode();
        body.push(0);
        assert!(matches!(FormatList::decode(&body), Err(Error::Codec(_))));
    }
}
