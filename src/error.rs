// Error and finding types for the behavior-script analysis core.

use std::fmt;

/// How serious a broken-reference finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Hard decode failures. Scoped to the one affected chunk; sibling
/// chunks stay usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Container ended inside a chunk header.
    TruncatedChunkHeader { offset: usize },
    /// A chunk's declared payload length overruns the buffer.
    BadChunkLength {
        offset: usize,
        chunk_id: u16,
        declared: u32,
        available: usize,
    },
    /// Routine payload too short for the routine header.
    TruncatedRoutineHeader { chunk_id: u16, len: usize },
    /// Routine payload ended inside an instruction record.
    TruncatedInstruction {
        chunk_id: u16,
        index: u16,
        offset: usize,
    },
    /// Routine header carries a format version we do not know.
    UnsupportedVersion { chunk_id: u16, version: u16 },
    /// An instruction's operand block is not the width its format
    /// version requires (only possible for caller-built instructions).
    BadOperandWidth {
        chunk_id: u16,
        index: u16,
        expected: usize,
        found: usize,
    },
    /// A jump target index cannot be encoded in this format version's
    /// target width.
    TargetWidthOverflow {
        chunk_id: u16,
        index: u16,
        target: u16,
    },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatError::TruncatedChunkHeader { offset } => {
                write!(f, "truncated chunk header at byte offset {}", offset)
            }
            FormatError::BadChunkLength {
                offset,
                chunk_id,
                declared,
                available,
            } => write!(
                f,
                "chunk {} at byte offset {} declares {} payload bytes but only {} remain",
                chunk_id, offset, declared, available
            ),
            FormatError::TruncatedRoutineHeader { chunk_id, len } => write!(
                f,
                "routine chunk {} payload is {} bytes, too short for a routine header",
                chunk_id, len
            ),
            FormatError::TruncatedInstruction {
                chunk_id,
                index,
                offset,
            } => write!(
                f,
                "routine chunk {} ends inside instruction {} (payload offset {})",
                chunk_id, index, offset
            ),
            FormatError::UnsupportedVersion { chunk_id, version } => write!(
                f,
                "routine chunk {} has unsupported format version {:#06x}",
                chunk_id, version
            ),
            FormatError::BadOperandWidth {
                chunk_id,
                index,
                expected,
                found,
            } => write!(
                f,
                "routine {} instruction {}: operand block is {} bytes, format requires {}",
                chunk_id, index, found, expected
            ),
            FormatError::TargetWidthOverflow {
                chunk_id,
                index,
                target,
            } => write!(
                f,
                "routine {} instruction {}: target index {} does not fit the narrow target encoding",
                chunk_id, index, target
            ),
        }
    }
}

impl std::error::Error for FormatError {}

/// What kind of reference is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenReferenceKind {
    /// A jump target names an instruction index that does not exist.
    DanglingJumpTarget,
    /// A subroutine call resolved to no routine in any scope.
    UnresolvedCall,
    /// A semi-global call with no import link established.
    MissingImportLink,
    /// A call opcode falls outside every configured call range.
    UnclassifiedCallOpcode,
}

impl fmt::Display for BrokenReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokenReferenceKind::DanglingJumpTarget => write!(f, "dangling jump target"),
            BrokenReferenceKind::UnresolvedCall => write!(f, "unresolved subroutine call"),
            BrokenReferenceKind::MissingImportLink => write!(f, "semi-global call without import link"),
            BrokenReferenceKind::UnclassifiedCallOpcode => {
                write!(f, "call opcode outside configured ranges")
            }
        }
    }
}

/// A broken reference. This is a finding, not a failure: it is always
/// reported and never silently fixed, and it does not abort analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenReference {
    pub kind: BrokenReferenceKind,
    pub severity: Severity,
    /// Chunk (routine) the responsible field lives in.
    pub chunk_id: u16,
    /// Instruction index of the responsible field, when there is one.
    pub instruction: Option<u16>,
    /// The id or index that failed to resolve.
    pub referenced: u32,
}

impl fmt::Display for BrokenReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.instruction {
            Some(idx) => write!(
                f,
                "[{}] {}: chunk {} instruction {} references {}",
                self.severity, self.kind, self.chunk_id, idx, self.referenced
            ),
            None => write!(
                f,
                "[{}] {}: chunk {} references {}",
                self.severity, self.kind, self.chunk_id, self.referenced
            ),
        }
    }
}

/// Why an edit was rejected. Rejection is atomic: the routine snapshot
/// the edit was applied to is untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewireError {
    /// Insert position past the end of the instruction list.
    InsertOutOfRange { at: usize, len: usize },
    /// A delete index names no instruction.
    DeleteOutOfRange { index: usize, len: usize },
    /// Move endpoints outside the instruction list.
    MoveOutOfRange { from: usize, to: usize, len: usize },
    /// Reorder argument is not a permutation of 0..len.
    BadPermutation { len: usize },
    /// A fragment index names no instruction in the source routine.
    FragmentOutOfRange { index: usize, len: usize },
    /// Post-remap validation found dangling targets; the edit is
    /// rejected as a whole.
    Validation(Vec<BrokenReference>),
}

impl fmt::Display for RewireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RewireError::InsertOutOfRange { at, len } => {
                write!(f, "insert position {} exceeds instruction count {}", at, len)
            }
            RewireError::DeleteOutOfRange { index, len } => {
                write!(f, "delete index {} exceeds instruction count {}", index, len)
            }
            RewireError::MoveOutOfRange { from, to, len } => write!(
                f,
                "move {} -> {} outside instruction count {}",
                from, to, len
            ),
            RewireError::BadPermutation { len } => {
                write!(f, "reorder argument is not a permutation of 0..{}", len)
            }
            RewireError::FragmentOutOfRange { index, len } => write!(
                f,
                "fragment index {} exceeds source instruction count {}",
                index, len
            ),
            RewireError::Validation(refs) => {
                write!(f, "edit rejected, {} dangling target(s):", refs.len())?;
                for r in refs {
                    write!(f, "\n  {}", r)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RewireError {}
