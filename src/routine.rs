// Routine: an immutable, decoded behavior-script snapshot.
//
// Payload layout: header (u8 arg_count, u8 local_count,
// u16 LE instruction_count, u16 LE format_version) followed by
// instruction_count fixed-width records. A routine is replaced
// wholesale on a successful edit, never patched in place.

use crate::error::{BrokenReference, BrokenReferenceKind, FormatError, Severity};
use crate::instruction::{FormatVersion, Instruction};
use log::debug;
use std::fmt;

pub const ROUTINE_HEADER_SIZE: usize = 6;

/// Namespace tier a routine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Local,
    SemiGlobal,
    Global,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scope::Local => write!(f, "local"),
            Scope::SemiGlobal => write!(f, "semi_global"),
            Scope::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub id: u16,
    pub scope: Scope,
    pub arg_count: u8,
    pub local_count: u8,
    pub format: FormatVersion,
    pub instructions: Vec<Instruction>,
}

impl Routine {
    /// Decode a routine from a chunk payload. Jump targets that name a
    /// nonexistent instruction index are reported as findings; decode
    /// still succeeds so the routine stays inspectable.
    pub fn decode(
        id: u16,
        scope: Scope,
        payload: &[u8],
    ) -> Result<(Routine, Vec<BrokenReference>), FormatError> {
        if payload.len() < ROUTINE_HEADER_SIZE {
            return Err(FormatError::TruncatedRoutineHeader {
                chunk_id: id,
                len: payload.len(),
            });
        }

        let arg_count = payload[0];
        let local_count = payload[1];
        let instruction_count = u16::from_le_bytes([payload[2], payload[3]]);
        let raw_version = u16::from_le_bytes([payload[4], payload[5]]);
        let format = FormatVersion::from_raw(raw_version).ok_or(
            FormatError::UnsupportedVersion {
                chunk_id: id,
                version: raw_version,
            },
        )?;

        debug!(
            "routine {}: {} args, {} locals, {} instructions, format {}",
            id, arg_count, local_count, instruction_count, format
        );

        let mut instructions = Vec::with_capacity(instruction_count as usize);
        let mut offset = ROUTINE_HEADER_SIZE;
        for index in 0..instruction_count {
            let inst = Instruction::decode(payload, offset, format, id, index)?;
            offset += format.record_size();
            instructions.push(inst);
        }

        let routine = Routine {
            id,
            scope,
            arg_count,
            local_count,
            format,
            instructions,
        };
        let findings = routine.dangling_targets();
        Ok((routine, findings))
    }

    /// Scan all jump targets for indices past the end of the
    /// instruction list.
    pub fn dangling_targets(&self) -> Vec<BrokenReference> {
        let count = self.instructions.len() as u16;
        let mut findings = Vec::new();
        for (index, inst) in self.instructions.iter().enumerate() {
            for target in [inst.true_target, inst.false_target] {
                if let Some(idx) = target.index() {
                    if idx >= count {
                        findings.push(BrokenReference {
                            kind: BrokenReferenceKind::DanglingJumpTarget,
                            severity: Severity::Error,
                            chunk_id: self.id,
                            instruction: Some(index as u16),
                            referenced: idx as u32,
                        });
                    }
                }
            }
        }
        findings
    }

    /// Serialize back to payload bytes. Byte-identical to the decoded
    /// input when no edit touched the routine.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::with_capacity(
            ROUTINE_HEADER_SIZE + self.instructions.len() * self.format.record_size(),
        );
        out.push(self.arg_count);
        out.push(self.local_count);
        out.extend_from_slice(&(self.instructions.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.format.raw().to_le_bytes());
        for (index, inst) in self.instructions.iter().enumerate() {
            inst.encode(self.format, self.id, index as u16, &mut out)?;
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "routine {} ({}): {} args, {} locals, {} instructions, format {}",
            self.id,
            self.scope,
            self.arg_count,
            self.local_count,
            self.instructions.len(),
            self.format
        )?;
        for (index, inst) in self.instructions.iter().enumerate() {
            writeln!(
                f,
                "  {:3}: {:#06x} true->{} false->{}",
                index, inst.opcode, inst.true_target, inst.false_target
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::instruction::Target;

    /// Build a narrow-format routine payload from (opcode, true, false)
    /// triples with zeroed operand blocks.
    pub fn payload_from_triples(triples: &[(u16, Target, Target)]) -> Vec<u8> {
        let mut payload = vec![0u8, 0u8];
        payload.extend_from_slice(&(triples.len() as u16).to_le_bytes());
        payload.extend_from_slice(&0x8000u16.to_le_bytes());
        for (opcode, t, f) in triples {
            payload.extend_from_slice(&opcode.to_le_bytes());
            payload.extend_from_slice(&[0u8; 8]);
            payload.push(t.to_narrow().unwrap());
            payload.push(f.to_narrow().unwrap());
        }
        payload
    }

    pub fn routine_from_triples(id: u16, triples: &[(u16, Target, Target)]) -> Routine {
        let payload = payload_from_triples(triples);
        let (routine, findings) = Routine::decode(id, Scope::Local, &payload).unwrap();
        assert!(findings.is_empty(), "unexpected findings: {:?}", findings);
        routine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Target;
    use super::test_support::payload_from_triples;

    #[test]
    fn test_decode_header_and_instructions() {
        let mut payload = payload_from_triples(&[
            (0x0000, Target::Index(1), Target::ReturnFalse),
            (0x0002, Target::ReturnTrue, Target::ReturnFalse),
        ]);
        payload[0] = 2; // args
        payload[1] = 5; // locals

        let (routine, findings) = Routine::decode(4096, Scope::Local, &payload).unwrap();
        assert!(findings.is_empty());
        assert_eq!(routine.arg_count, 2);
        assert_eq!(routine.local_count, 5);
        assert_eq!(routine.format, FormatVersion::V8000);
        assert_eq!(routine.len(), 2);
        assert_eq!(routine.instructions[0].true_target, Target::Index(1));
    }

    #[test]
    fn test_decode_reports_dangling_target() {
        let payload = payload_from_triples(&[(0x0000, Target::Index(9), Target::ReturnFalse)]);
        let (routine, findings) = Routine::decode(77, Scope::Local, &payload).unwrap();
        assert_eq!(routine.len(), 1);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, BrokenReferenceKind::DanglingJumpTarget);
        assert_eq!(findings[0].chunk_id, 77);
        assert_eq!(findings[0].instruction, Some(0));
        assert_eq!(findings[0].referenced, 9);
    }

    #[test]
    fn test_unsupported_version() {
        let mut payload = payload_from_triples(&[]);
        payload[4..6].copy_from_slice(&0x9001u16.to_le_bytes());
        let err = Routine::decode(3, Scope::Local, &payload).unwrap_err();
        assert_eq!(
            err,
            FormatError::UnsupportedVersion {
                chunk_id: 3,
                version: 0x9001
            }
        );
    }

    #[test]
    fn test_truncated_payload() {
        let payload = payload_from_triples(&[(0x0000, Target::ReturnTrue, Target::ReturnFalse)]);
        let err = Routine::decode(3, Scope::Local, &payload[..payload.len() - 1]).unwrap_err();
        assert!(matches!(err, FormatError::TruncatedInstruction { index: 0, .. }));
    }

    #[test]
    fn test_round_trip_byte_identical() {
        // Narrow format.
        let mut payload = payload_from_triples(&[
            (0x0002, Target::Index(1), Target::Index(2)),
            (0x0000, Target::ReturnTrue, Target::ReturnFalse),
            (0x001F, Target::Error, Target::Error),
        ]);
        payload[0] = 1;
        // Non-zero operand bytes must survive untouched.
        payload[8] = 0xAB;
        payload[9] = 0xCD;
        let (routine, _) = Routine::decode(1, Scope::Local, &payload).unwrap();
        assert_eq!(routine.to_bytes().unwrap(), payload);

        // Wide format.
        let mut wide = vec![0u8, 3u8];
        wide.extend_from_slice(&1u16.to_le_bytes());
        wide.extend_from_slice(&0x8003u16.to_le_bytes());
        wide.extend_from_slice(&0x2001u16.to_le_bytes());
        wide.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        wide.extend_from_slice(&0xFFFEu16.to_le_bytes());
        wide.extend_from_slice(&0xFFFFu16.to_le_bytes());
        let (routine, _) = Routine::decode(2, Scope::SemiGlobal, &wide).unwrap();
        assert_eq!(routine.format, FormatVersion::V8003);
        assert_eq!(routine.to_bytes().unwrap(), wide);
    }
}
