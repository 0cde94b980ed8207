// Instruction model and fixed-width record codec.

use crate::error::FormatError;
use std::fmt;

// Reserved target values. Narrow form is the u8 encoding used by
// format versions below 0x8003; wide form is the u16 encoding.
const NARROW_ERROR: u8 = 0xFD;
const NARROW_RETURN_TRUE: u8 = 0xFE;
const NARROW_RETURN_FALSE: u8 = 0xFF;
const WIDE_ERROR: u16 = 0xFFFD;
const WIDE_RETURN_TRUE: u16 = 0xFFFE;
const WIDE_RETURN_FALSE: u16 = 0xFFFF;

/// A jump target: either an instruction index or one of the three
/// reserved sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Index(u16),
    Error,
    ReturnTrue,
    ReturnFalse,
}

impl Target {
    pub fn from_narrow(raw: u8) -> Target {
        match raw {
            NARROW_ERROR => Target::Error,
            NARROW_RETURN_TRUE => Target::ReturnTrue,
            NARROW_RETURN_FALSE => Target::ReturnFalse,
            idx => Target::Index(idx as u16),
        }
    }

    pub fn from_wide(raw: u16) -> Target {
        match raw {
            WIDE_ERROR => Target::Error,
            WIDE_RETURN_TRUE => Target::ReturnTrue,
            WIDE_RETURN_FALSE => Target::ReturnFalse,
            idx => Target::Index(idx),
        }
    }

    /// Narrow encoding. Fails when an index collides with the sentinel
    /// band (indices 0xFD and up cannot be represented in one byte).
    pub fn to_narrow(self) -> Option<u8> {
        match self {
            Target::Error => Some(NARROW_ERROR),
            Target::ReturnTrue => Some(NARROW_RETURN_TRUE),
            Target::ReturnFalse => Some(NARROW_RETURN_FALSE),
            Target::Index(idx) if idx < NARROW_ERROR as u16 => Some(idx as u8),
            Target::Index(_) => None,
        }
    }

    pub fn to_wide(self) -> u16 {
        match self {
            Target::Error => WIDE_ERROR,
            Target::ReturnTrue => WIDE_RETURN_TRUE,
            Target::ReturnFalse => WIDE_RETURN_FALSE,
            Target::Index(idx) => idx,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, Target::Index(_))
    }

    pub fn index(&self) -> Option<u16> {
        match self {
            Target::Index(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Index(idx) => write!(f, "{}", idx),
            Target::Error => write!(f, "ERROR"),
            Target::ReturnTrue => write!(f, "TRUE"),
            Target::ReturnFalse => write!(f, "FALSE"),
        }
    }
}

/// Routine record format versions. The set is closed; anything else is
/// a FormatError at routine decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    V8000,
    V8001,
    V8002,
    /// Wide-target variant: u16 targets instead of u8.
    V8003,
}

impl FormatVersion {
    pub fn from_raw(raw: u16) -> Option<FormatVersion> {
        match raw {
            0x8000 => Some(FormatVersion::V8000),
            0x8001 => Some(FormatVersion::V8001),
            0x8002 => Some(FormatVersion::V8002),
            0x8003 => Some(FormatVersion::V8003),
            _ => None,
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            FormatVersion::V8000 => 0x8000,
            FormatVersion::V8001 => 0x8001,
            FormatVersion::V8002 => 0x8002,
            FormatVersion::V8003 => 0x8003,
        }
    }

    /// All versions carry an 8-byte operand block.
    pub fn operand_width(&self) -> usize {
        8
    }

    pub fn target_width(&self) -> usize {
        match self {
            FormatVersion::V8003 => 2,
            _ => 1,
        }
    }

    /// Total bytes per instruction record: u16 opcode, operand block,
    /// two targets.
    pub fn record_size(&self) -> usize {
        2 + self.operand_width() + 2 * self.target_width()
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.raw())
    }
}

/// One decoded instruction. Operand bytes are kept raw so an untouched
/// instruction reserializes byte-exact; field meaning is looked up in
/// the opcode table, never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u16,
    pub operands: Vec<u8>,
    pub true_target: Target,
    pub false_target: Target,
}

impl Instruction {
    pub fn new(opcode: u16, operands: Vec<u8>, true_target: Target, false_target: Target) -> Self {
        Instruction {
            opcode,
            operands,
            true_target,
            false_target,
        }
    }

    /// Decode one record at `offset` in a routine payload.
    pub fn decode(
        payload: &[u8],
        offset: usize,
        format: FormatVersion,
        chunk_id: u16,
        index: u16,
    ) -> Result<Instruction, FormatError> {
        let size = format.record_size();
        if offset + size > payload.len() {
            return Err(FormatError::TruncatedInstruction {
                chunk_id,
                index,
                offset,
            });
        }

        let opcode = u16::from_le_bytes([payload[offset], payload[offset + 1]]);
        let op_start = offset + 2;
        let op_end = op_start + format.operand_width();
        let operands = payload[op_start..op_end].to_vec();

        let (true_target, false_target) = match format.target_width() {
            1 => (
                Target::from_narrow(payload[op_end]),
                Target::from_narrow(payload[op_end + 1]),
            ),
            _ => (
                Target::from_wide(u16::from_le_bytes([payload[op_end], payload[op_end + 1]])),
                Target::from_wide(u16::from_le_bytes([
                    payload[op_end + 2],
                    payload[op_end + 3],
                ])),
            ),
        };

        Ok(Instruction {
            opcode,
            operands,
            true_target,
            false_target,
        })
    }

    /// Append this instruction's record bytes to `out`.
    pub fn encode(
        &self,
        format: FormatVersion,
        chunk_id: u16,
        index: u16,
        out: &mut Vec<u8>,
    ) -> Result<(), FormatError> {
        if self.operands.len() != format.operand_width() {
            return Err(FormatError::BadOperandWidth {
                chunk_id,
                index,
                expected: format.operand_width(),
                found: self.operands.len(),
            });
        }

        out.extend_from_slice(&self.opcode.to_le_bytes());
        out.extend_from_slice(&self.operands);
        match format.target_width() {
            1 => {
                for target in [self.true_target, self.false_target] {
                    let raw = target.to_narrow().ok_or(FormatError::TargetWidthOverflow {
                        chunk_id,
                        index,
                        target: target.index().unwrap_or(0),
                    })?;
                    out.push(raw);
                }
            }
            _ => {
                out.extend_from_slice(&self.true_target.to_wide().to_le_bytes());
                out.extend_from_slice(&self.false_target.to_wide().to_le_bytes());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_sentinel_mapping() {
        assert_eq!(Target::from_narrow(0xFD), Target::Error);
        assert_eq!(Target::from_narrow(0xFE), Target::ReturnTrue);
        assert_eq!(Target::from_narrow(0xFF), Target::ReturnFalse);
        assert_eq!(Target::from_narrow(0x0C), Target::Index(12));
        assert_eq!(Target::Index(0xFC).to_narrow(), Some(0xFC));
        assert_eq!(Target::Index(0xFD).to_narrow(), None);
    }

    #[test]
    fn test_wide_sentinel_mapping() {
        assert_eq!(Target::from_wide(0xFFFD), Target::Error);
        assert_eq!(Target::from_wide(0xFFFE), Target::ReturnTrue);
        assert_eq!(Target::from_wide(0xFFFF), Target::ReturnFalse);
        assert_eq!(Target::from_wide(0x0123), Target::Index(0x0123));
    }

    #[test]
    fn test_decode_narrow_record() {
        // expression (opcode 2), 8 operand bytes, true -> 3, false -> RETURN_FALSE
        let payload = vec![
            0x02, 0x00, // opcode
            1, 2, 3, 4, 5, 6, 7, 8, // operands
            0x03, // true target
            0xFF, // false target
        ];
        let inst = Instruction::decode(&payload, 0, FormatVersion::V8000, 4096, 0).unwrap();
        assert_eq!(inst.opcode, 0x0002);
        assert_eq!(inst.operands, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(inst.true_target, Target::Index(3));
        assert_eq!(inst.false_target, Target::ReturnFalse);
    }

    #[test]
    fn test_decode_wide_record() {
        let payload = vec![
            0x00, 0x10, // opcode 0x1000 (local call)
            0, 0, 0, 0, 0, 0, 0, 0, // operands
            0x00, 0x01, // true target 0x0100
            0xFD, 0xFF, // false target ERROR
        ];
        let inst = Instruction::decode(&payload, 0, FormatVersion::V8003, 4096, 0).unwrap();
        assert_eq!(inst.opcode, 0x1000);
        assert_eq!(inst.true_target, Target::Index(0x0100));
        assert_eq!(inst.false_target, Target::Error);
    }

    #[test]
    fn test_decode_truncated_record() {
        let payload = vec![0x02, 0x00, 1, 2, 3]; // far short of 12 bytes
        let err = Instruction::decode(&payload, 0, FormatVersion::V8000, 7, 4).unwrap_err();
        assert_eq!(
            err,
            FormatError::TruncatedInstruction {
                chunk_id: 7,
                index: 4,
                offset: 0
            }
        );
    }

    #[test]
    fn test_encode_round_trip() {
        for format in [FormatVersion::V8000, FormatVersion::V8003] {
            let payload_len = format.record_size();
            let mut raw = vec![0u8; payload_len];
            raw[0] = 0x02;
            raw[2..10].copy_from_slice(&[9, 8, 7, 6, 5, 4, 3, 2]);
            // point true target at index 1, false at RETURN_TRUE
            match format.target_width() {
                1 => {
                    raw[10] = 0x01;
                    raw[11] = 0xFE;
                }
                _ => {
                    raw[10..12].copy_from_slice(&1u16.to_le_bytes());
                    raw[12..14].copy_from_slice(&0xFFFEu16.to_le_bytes());
                }
            }
            let inst = Instruction::decode(&raw, 0, format, 1, 0).unwrap();
            let mut out = Vec::new();
            inst.encode(format, 1, 0, &mut out).unwrap();
            assert_eq!(out, raw);
        }
    }

    #[test]
    fn test_encode_narrow_index_overflow() {
        let inst = Instruction::new(
            0x0002,
            vec![0; 8],
            Target::Index(0x0123),
            Target::ReturnFalse,
        );
        let mut out = Vec::new();
        let err = inst.encode(FormatVersion::V8000, 5, 2, &mut out).unwrap_err();
        assert_eq!(
            err,
            FormatError::TargetWidthOverflow {
                chunk_id: 5,
                index: 2,
                target: 0x0123
            }
        );
    }
}
