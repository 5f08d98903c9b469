// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

//! Control-plane message set and its wire encoding.
//!
//! Each message is a structured record; the codec is a tag byte followed by
//! fixed little-endian fields. Bulk data never travels here -- only setup
//! handshakes, per-timestep metadata and small bookkeeping messages (plus the
//! reference data plane's read request/response pair, which rides the control
//! net by design).

use crate::control::wire::{WireReader, WireWriter};
use crate::control::ContactInfo;
use crate::error::{Error, Result};

/// One versioned wire-format descriptor block from the marshal layer.
///
/// Identified by the md5 of its body; emitted once per distinct layout and
/// cached by readers, replayed in full to late joiners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatBlock {
    pub hash: [u8; 16],
    pub body: Vec<u8>,
}

/// Writer-side queueing configuration echoed to readers at registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterConfig {
    pub queue_limit: u64,
    pub discard_on_full: bool,
}

/// Control messages exchanged over the control connection layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMsg {
    /// Reader rank 0 -> writer rank 0: request to join the stream.
    ReaderRegister {
        /// Token from the rendezvous contact line; must match the writer's.
        writer_token: u64,
        /// Correlation key for the response condition wait on the reader.
        response_cond: u64,
        /// Full reader cohort contact list, indexed by reader rank.
        reader_cohort: Vec<ContactInfo>,
    },
    /// Writer rank 0 -> reader rank 0: registration accepted.
    WriterResponse {
        response_cond: u64,
        /// Identity assigned to this reader cohort, quoted in every
        /// subsequent activate/release/close message.
        reader_id: u64,
        writer_cohort: Vec<ContactInfo>,
        start_step: u64,
        config: WriterConfig,
        /// Full format history so far; replayed steps reference these by
        /// hash.
        formats: Vec<FormatBlock>,
    },
    /// Reader rank -> each writer rank in its peer slice: connections are up.
    ReaderActivate { reader_id: u64 },
    /// Writer rank -> each reader rank in its peer slice: one timestep's
    /// aggregated metadata.
    TimestepMetadata {
        timestep: u64,
        /// Per-writer-rank metadata blocks, indexed by writer rank.
        metadata: Vec<Vec<u8>>,
        /// Per-writer-rank data plane contact info for this timestep.
        dp_info: Vec<Vec<u8>>,
        /// Format blocks first announced at this timestep (full history for a
        /// late joiner's first delivery).
        formats: Vec<FormatBlock>,
    },
    /// Reader rank -> each writer rank in its peer slice: done with a step.
    ReleaseTimestep { reader_id: u64, timestep: u64 },
    /// Writer rank -> its reader peers: orderly end of stream.
    WriterClose { final_timestep: u64 },
    /// Reader rank -> its writer peers: orderly departure.
    ReaderClose { reader_id: u64 },
    /// Reference data plane: fetch a byte range of one writer rank's data
    /// block.
    DpReadRequest {
        request_id: u64,
        timestep: u64,
        offset: u64,
        length: u64,
        /// Requester's data plane endpoint, target of the response.
        reply_to: ContactInfo,
    },
    /// Reference data plane: read completion.
    DpReadResponse {
        request_id: u64,
        ok: bool,
        data: Vec<u8>,
    },
}

// Message tags. Stable wire values; append only.
const TAG_READER_REGISTER: u8 = 1;
const TAG_WRITER_RESPONSE: u8 = 2;
const TAG_READER_ACTIVATE: u8 = 3;
const TAG_TIMESTEP_METADATA: u8 = 4;
const TAG_RELEASE_TIMESTEP: u8 = 5;
const TAG_WRITER_CLOSE: u8 = 6;
const TAG_READER_CLOSE: u8 = 7;
const TAG_DP_READ_REQUEST: u8 = 8;
const TAG_DP_READ_RESPONSE: u8 = 9;

fn put_contacts(w: &mut WireWriter, contacts: &[ContactInfo]) {
    w.put_u32(contacts.len() as u32);
    for c in contacts {
        w.put_str(&c.0);
    }
}

fn read_contacts(r: &mut WireReader<'_>) -> Result<Vec<ContactInfo>> {
    let count = r.read_u32()? as usize;
    let mut contacts = Vec::with_capacity(count);
    for _ in 0..count {
        contacts.push(ContactInfo(r.read_str()?));
    }
    Ok(contacts)
}

fn put_formats(w: &mut WireWriter, formats: &[FormatBlock]) {
    w.put_u32(formats.len() as u32);
    for fb in formats {
        w.put_bytes(&fb.hash);
        w.put_block(&fb.body);
    }
}

fn read_formats(r: &mut WireReader<'_>) -> Result<Vec<FormatBlock>> {
    let count = r.read_u32()? as usize;
    let mut formats = Vec::with_capacity(count);
    for _ in 0..count {
        let mut hash = [0u8; 16];
        hash.copy_from_slice(r.read_bytes(16)?);
        formats.push(FormatBlock {
            hash,
            body: r.read_block()?,
        });
    }
    Ok(formats)
}

fn put_blocks(w: &mut WireWriter, blocks: &[Vec<u8>]) {
    w.put_u32(blocks.len() as u32);
    for b in blocks {
        w.put_block(b);
    }
}

fn read_blocks(r: &mut WireReader<'_>) -> Result<Vec<Vec<u8>>> {
    let count = r.read_u32()? as usize;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(r.read_block()?);
    }
    Ok(blocks)
}

impl ControlMsg {
    /// Encode to wire bytes (no outer length prefix; framing is the net's
    /// concern).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        match self {
            ControlMsg::ReaderRegister {
                writer_token,
                response_cond,
                reader_cohort,
            } => {
                w.put_u8(TAG_READER_REGISTER);
                w.put_u64(*writer_token);
                w.put_u64(*response_cond);
                put_contacts(&mut w, reader_cohort);
            }
            ControlMsg::WriterResponse {
                response_cond,
                reader_id,
                writer_cohort,
                start_step,
                config,
                formats,
            } => {
                w.put_u8(TAG_WRITER_RESPONSE);
                w.put_u64(*response_cond);
                w.put_u64(*reader_id);
                put_contacts(&mut w, writer_cohort);
                w.put_u64(*start_step);
                w.put_u64(config.queue_limit);
                w.put_u8(u8::from(config.discard_on_full));
                put_formats(&mut w, formats);
            }
            ControlMsg::ReaderActivate { reader_id } => {
                w.put_u8(TAG_READER_ACTIVATE);
                w.put_u64(*reader_id);
            }
            ControlMsg::TimestepMetadata {
                timestep,
                metadata,
                dp_info,
                formats,
            } => {
                w.put_u8(TAG_TIMESTEP_METADATA);
                w.put_u64(*timestep);
                put_blocks(&mut w, metadata);
                put_blocks(&mut w, dp_info);
                put_formats(&mut w, formats);
            }
            ControlMsg::ReleaseTimestep {
                reader_id,
                timestep,
            } => {
                w.put_u8(TAG_RELEASE_TIMESTEP);
                w.put_u64(*reader_id);
                w.put_u64(*timestep);
            }
            ControlMsg::WriterClose { final_timestep } => {
                w.put_u8(TAG_WRITER_CLOSE);
                w.put_u64(*final_timestep);
            }
            ControlMsg::ReaderClose { reader_id } => {
                w.put_u8(TAG_READER_CLOSE);
                w.put_u64(*reader_id);
            }
            ControlMsg::DpReadRequest {
                request_id,
                timestep,
                offset,
                length,
                reply_to,
            } => {
                w.put_u8(TAG_DP_READ_REQUEST);
                w.put_u64(*request_id);
                w.put_u64(*timestep);
                w.put_u64(*offset);
                w.put_u64(*length);
                w.put_str(&reply_to.0);
            }
            ControlMsg::DpReadResponse {
                request_id,
                ok,
                data,
            } => {
                w.put_u8(TAG_DP_READ_RESPONSE);
                w.put_u64(*request_id);
                w.put_u8(u8::from(*ok));
                w.put_block(data);
            }
        }
        w.into_vec()
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let tag = r.read_u8()?;
        match tag {
            TAG_READER_REGISTER => Ok(ControlMsg::ReaderRegister {
                writer_token: r.read_u64()?,
                response_cond: r.read_u64()?,
                reader_cohort: read_contacts(&mut r)?,
            }),
            TAG_WRITER_RESPONSE => Ok(ControlMsg::WriterResponse {
                response_cond: r.read_u64()?,
                reader_id: r.read_u64()?,
                writer_cohort: read_contacts(&mut r)?,
                start_step: r.read_u64()?,
                config: WriterConfig {
                    queue_limit: r.read_u64()?,
                    discard_on_full: r.read_u8()? != 0,
                },
                formats: read_formats(&mut r)?,
            }),
            TAG_READER_ACTIVATE => Ok(ControlMsg::ReaderActivate {
                reader_id: r.read_u64()?,
            }),
            TAG_TIMESTEP_METADATA => Ok(ControlMsg::TimestepMetadata {
                timestep: r.read_u64()?,
                metadata: read_blocks(&mut r)?,
                dp_info: read_blocks(&mut r)?,
                formats: read_formats(&mut r)?,
            }),
            TAG_RELEASE_TIMESTEP => Ok(ControlMsg::ReleaseTimestep {
                reader_id: r.read_u64()?,
                timestep: r.read_u64()?,
            }),
            TAG_WRITER_CLOSE => Ok(ControlMsg::WriterClose {
                final_timestep: r.read_u64()?,
            }),
            TAG_READER_CLOSE => Ok(ControlMsg::ReaderClose {
                reader_id: r.read_u64()?,
            }),
            TAG_DP_READ_REQUEST => Ok(ControlMsg::DpReadRequest {
                request_id: r.read_u64()?,
                timestep: r.read_u64()?,
                offset: r.read_u64()?,
                length: r.read_u64()?,
                reply_to: ContactInfo(r.read_str()?),
            }),
            TAG_DP_READ_RESPONSE => Ok(ControlMsg::DpReadResponse {
                request_id: r.read_u64()?,
                ok: r.read_u8()? != 0,
                data: r.read_block()?,
            }),
            other => Err(Error::Codec(format!("unknown message tag {}", other))),
        }
    }
}
