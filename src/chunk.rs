// Chunk extraction: split a container buffer into typed, identified
// payload records, preserving order and exact bytes.

use crate::error::FormatError;
use log::debug;
use std::fmt;

/// Chunk header layout: 4-byte ASCII type tag, u16 LE chunk id,
/// u32 LE payload length.
pub const CHUNK_HEADER_SIZE: usize = 10;

/// The closed set of chunk kinds this core understands. Unknown tags
/// are still extracted (bytes preserved) but carry no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkKind {
    BehaviorRoutine,
    InteractionTable,
    ObjectDefinition,
    AttachmentSlot,
    DrawGroup,
    Sprite,
}

impl ChunkKind {
    /// Map a 4-byte type tag to a known kind.
    pub fn from_tag(tag: &[u8; 4]) -> Option<ChunkKind> {
        match tag {
            b"BHAV" => Some(ChunkKind::BehaviorRoutine),
            b"TTAB" => Some(ChunkKind::InteractionTable),
            b"OBJD" => Some(ChunkKind::ObjectDefinition),
            b"SLOT" => Some(ChunkKind::AttachmentSlot),
            b"DGRP" => Some(ChunkKind::DrawGroup),
            b"SPR2" => Some(ChunkKind::Sprite),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ChunkKind::BehaviorRoutine => "BHAV",
            ChunkKind::InteractionTable => "TTAB",
            ChunkKind::ObjectDefinition => "OBJD",
            ChunkKind::AttachmentSlot => "SLOT",
            ChunkKind::DrawGroup => "DGRP",
            ChunkKind::Sprite => "SPR2",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// One extracted chunk. Payload bytes are copied verbatim from the
/// container; nothing is interpreted at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub tag: [u8; 4],
    pub id: u16,
    pub payload: Vec<u8>,
    /// Byte offset of the chunk header in the source buffer.
    pub offset: usize,
}

impl ChunkRecord {
    pub fn kind(&self) -> Option<ChunkKind> {
        ChunkKind::from_tag(&self.tag)
    }

    /// The type tag as text, for logs and dumps.
    pub fn tag_str(&self) -> String {
        self.tag.iter().map(|&b| b as char).collect()
    }
}

/// Split a container buffer into ordered chunk records.
///
/// Extraction is sequential over length-prefixed chunks, so a malformed
/// header makes resync impossible: extraction stops at the fault, but
/// every chunk extracted before it is returned usable alongside the
/// positioned error.
pub fn extract_chunks(buf: &[u8]) -> (Vec<ChunkRecord>, Vec<FormatError>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let remaining = buf.len() - offset;
        if remaining < CHUNK_HEADER_SIZE {
            errors.push(FormatError::TruncatedChunkHeader { offset });
            break;
        }

        let mut tag = [0u8; 4];
        tag.copy_from_slice(&buf[offset..offset + 4]);
        let id = u16::from_le_bytes([buf[offset + 4], buf[offset + 5]]);
        let declared = u32::from_le_bytes([
            buf[offset + 6],
            buf[offset + 7],
            buf[offset + 8],
            buf[offset + 9],
        ]);

        let available = remaining - CHUNK_HEADER_SIZE;
        if declared as usize > available {
            errors.push(FormatError::BadChunkLength {
                offset,
                chunk_id: id,
                declared,
                available,
            });
            break;
        }

        let start = offset + CHUNK_HEADER_SIZE;
        let payload = buf[start..start + declared as usize].to_vec();
        debug!(
            "chunk {} id {} at offset {:#06x}, {} payload bytes",
            String::from_utf8_lossy(&tag),
            id,
            offset,
            declared
        );
        records.push(ChunkRecord {
            tag,
            id,
            payload,
            offset,
        });
        offset = start + declared as usize;
    }

    (records, errors)
}

#[cfg(test)]
pub(crate) fn make_chunk(tag: &[u8; 4], id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}
