// Pointer-safe instruction edits.
//
// Every edit runs against an immutable routine snapshot and produces a
// total index remapping plus a fully rewired replacement routine. The
// commit is all-or-nothing: validation rescans every jump target after
// remapping and rejects the whole edit on any dangling pointer, so a
// committed snapshot never contains one.

use crate::error::RewireError;
use crate::instruction::{Instruction, Target};
use crate::routine::Routine;
use log::debug;
use std::collections::HashSet;
use std::fmt;

/// One edit operation over a routine's instruction sequence.
#[derive(Debug, Clone)]
pub enum EditOp {
    /// Insert the given instructions before position `at`. Their jump
    /// targets are interpreted in post-insert coordinates.
    Insert {
        at: usize,
        instructions: Vec<Instruction>,
    },
    /// Delete the instructions at these indices.
    Delete { indices: Vec<usize> },
    /// Remove the instruction at `from` and reinsert it so it lands at
    /// index `to` in the result.
    Move { from: usize, to: usize },
    /// Rearrange all instructions; `permutation[new_index]` is the old
    /// index placed there.
    Reorder { permutation: Vec<usize> },
}

/// Where an old instruction index went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remap {
    To(u16),
    /// The instruction was deleted.
    Tombstone,
}

/// Total function from old instruction index to new position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewireMapping {
    entries: Vec<Remap>,
    new_len: usize,
}

impl RewireMapping {
    pub fn identity(len: usize) -> Self {
        RewireMapping {
            entries: (0..len).map(|i| Remap::To(i as u16)).collect(),
            new_len: len,
        }
    }

    pub fn lookup(&self, old_index: usize) -> Option<Remap> {
        self.entries.get(old_index).copied()
    }

    pub fn old_len(&self) -> usize {
        self.entries.len()
    }

    pub fn new_len(&self) -> usize {
        self.new_len
    }

    pub fn is_identity(&self) -> bool {
        self.new_len == self.entries.len()
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(i, r)| *r == Remap::To(i as u16))
    }

    /// Nearest surviving successor of a tombstoned index, in original
    /// order. None when every later instruction is also gone.
    fn surviving_successor(&self, old_index: usize) -> Option<u16> {
        self.entries[old_index + 1..]
            .iter()
            .find_map(|r| match r {
                Remap::To(new_index) => Some(*new_index),
                Remap::Tombstone => None,
            })
    }
}

/// Which target field of an instruction a warning refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetField {
    True,
    False,
}

impl fmt::Display for TargetField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TargetField::True => write!(f, "true_target"),
            TargetField::False => write!(f, "false_target"),
        }
    }
}

/// A target substitution the engine made on the caller's behalf. Never
/// silent: every redirected pointer is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewireWarning {
    /// Index of the rewired instruction in the new sequence.
    pub instruction: u16,
    pub field: TargetField,
    /// The old target index that no longer exists.
    pub old_target: u16,
    /// Where the pointer was redirected.
    pub new_target: Target,
}

impl fmt::Display for RewireWarning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "instruction {} {}: deleted target {} redirected to {}",
            self.instruction, self.field, self.old_target, self.new_target
        )
    }
}

/// A committed edit: the replacement snapshot, the mapping that
/// produced it, and every substitution made along the way.
#[derive(Debug, Clone)]
pub struct RewireOutcome {
    pub routine: Routine,
    pub mapping: RewireMapping,
    pub warnings: Vec<RewireWarning>,
}

/// Where each slot of the new instruction sequence comes from.
enum SlotSource {
    Old(usize),
    New(usize),
}

/// Apply one edit to a routine snapshot. On error nothing has been
/// mutated; the input snapshot is untouched either way.
pub fn apply_edit(routine: &Routine, op: &EditOp) -> Result<RewireOutcome, RewireError> {
    let old_len = routine.len();
    let order = plan_order(old_len, op)?;

    // Total mapping over all old positions.
    let mut entries = vec![Remap::Tombstone; old_len];
    for (new_index, source) in order.iter().enumerate() {
        if let SlotSource::Old(old_index) = source {
            entries[*old_index] = Remap::To(new_index as u16);
        }
    }
    let mapping = RewireMapping {
        entries,
        new_len: order.len(),
    };

    let inserted = match op {
        EditOp::Insert { instructions, .. } => instructions.as_slice(),
        _ => &[],
    };

    let mut warnings = Vec::new();
    let mut instructions = Vec::with_capacity(order.len());
    for (new_index, source) in order.iter().enumerate() {
        let mut inst = match source {
            SlotSource::Old(old_index) => routine.instructions[*old_index].clone(),
            SlotSource::New(insert_index) => inserted[*insert_index].clone(),
        };
        // Inserted instructions already carry new-sequence targets;
        // only survivors get remapped.
        if matches!(source, SlotSource::Old(_)) {
            inst.true_target = remap_target(
                inst.true_target,
                &mapping,
                new_index as u16,
                TargetField::True,
                &mut warnings,
            );
            inst.false_target = remap_target(
                inst.false_target,
                &mapping,
                new_index as u16,
                TargetField::False,
                &mut warnings,
            );
        }
        instructions.push(inst);
    }

    let new_routine = Routine {
        instructions,
        ..routine.clone()
    };
    validate(&new_routine)?;

    debug!(
        "routine {}: edit committed, {} -> {} instructions, {} warning(s)",
        routine.id,
        old_len,
        new_routine.len(),
        warnings.len()
    );

    Ok(RewireOutcome {
        routine: new_routine,
        mapping,
        warnings,
    })
}

/// Build the new slot order for an edit, bounds-checked.
fn plan_order(old_len: usize, op: &EditOp) -> Result<Vec<SlotSource>, RewireError> {
    match op {
        EditOp::Insert { at, instructions } => {
            if *at > old_len {
                return Err(RewireError::InsertOutOfRange {
                    at: *at,
                    len: old_len,
                });
            }
            let mut order: Vec<SlotSource> = (0..*at).map(SlotSource::Old).collect();
            order.extend((0..instructions.len()).map(SlotSource::New));
            order.extend((*at..old_len).map(SlotSource::Old));
            Ok(order)
        }
        EditOp::Delete { indices } => {
            let mut dead = HashSet::new();
            for &index in indices {
                if index >= old_len {
                    return Err(RewireError::DeleteOutOfRange {
                        index,
                        len: old_len,
                    });
                }
                dead.insert(index);
            }
            Ok((0..old_len)
                .filter(|i| !dead.contains(i))
                .map(SlotSource::Old)
                .collect())
        }
        EditOp::Move { from, to } => {
            if *from >= old_len || *to >= old_len {
                return Err(RewireError::MoveOutOfRange {
                    from: *from,
                    to: *to,
                    len: old_len,
                });
            }
            let mut order: Vec<usize> = (0..old_len).collect();
            let moved = order.remove(*from);
            order.insert(*to, moved);
            Ok(order.into_iter().map(SlotSource::Old).collect())
        }
        EditOp::Reorder { permutation } => {
            if permutation.len() != old_len {
                return Err(RewireError::BadPermutation { len: old_len });
            }
            let mut seen = vec![false; old_len];
            for &old_index in permutation {
                if old_index >= old_len || seen[old_index] {
                    return Err(RewireError::BadPermutation { len: old_len });
                }
                seen[old_index] = true;
            }
            Ok(permutation.iter().copied().map(SlotSource::Old).collect())
        }
    }
}

/// Remap one jump target through the mapping. Sentinels pass through;
/// a pointer into a deleted instruction is re-pointed at the nearest
/// surviving successor, or the ERROR sentinel when none survives, and
/// that substitution is always recorded.
fn remap_target(
    target: Target,
    mapping: &RewireMapping,
    instruction: u16,
    field: TargetField,
    warnings: &mut Vec<RewireWarning>,
) -> Target {
    let old_index = match target.index() {
        Some(idx) => idx as usize,
        None => return target,
    };
    match mapping.lookup(old_index) {
        Some(Remap::To(new_index)) => Target::Index(new_index),
        Some(Remap::Tombstone) => {
            let new_target = match mapping.surviving_successor(old_index) {
                Some(successor) => Target::Index(successor),
                None => Target::Error,
            };
            warnings.push(RewireWarning {
                instruction,
                field,
                old_target: old_index as u16,
                new_target,
            });
            new_target
        }
        // Already dangling before the edit; leave it for validation.
        None => target,
    }
}

/// Rescan all instructions for out-of-bounds, non-sentinel targets.
fn validate(routine: &Routine) -> Result<(), RewireError> {
    let broken = routine.dangling_targets();
    if broken.is_empty() {
        Ok(())
    } else {
        Err(RewireError::Validation(broken))
    }
}

/// Cross-routine copy: lift the instructions at `indices` (in source
/// order) out of `src` and insert them into `dst` before `at`.
///
/// Intra-fragment jump targets are remapped relative to the
/// destination. Subroutine calls reference routine ids, not
/// instruction indices, so opcodes and operand bytes pass through
/// untouched. A fragment target pointing outside the fragment cannot
/// survive the move; it is re-pointed at the ERROR sentinel and
/// reported, never kept silently.
pub fn copy_fragment(
    src: &Routine,
    indices: &[usize],
    dst: &Routine,
    at: usize,
) -> Result<RewireOutcome, RewireError> {
    let mut sorted: Vec<usize> = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    for &index in &sorted {
        if index >= src.len() {
            return Err(RewireError::FragmentOutOfRange {
                index,
                len: src.len(),
            });
        }
    }

    // Position of each source index within the fragment.
    let fragment_pos =
        |idx: usize| -> Option<usize> { sorted.binary_search(&idx).ok() };

    let mut escape_warnings = Vec::new();
    let mut instructions = Vec::with_capacity(sorted.len());
    for (pos, &src_index) in sorted.iter().enumerate() {
        let mut inst = src.instructions[src_index].clone();
        let new_index = (at + pos) as u16;
        for (field, target) in [
            (TargetField::True, &mut inst.true_target),
            (TargetField::False, &mut inst.false_target),
        ] {
            if let Some(idx) = target.index() {
                match fragment_pos(idx as usize) {
                    Some(inner) => *target = Target::Index((at + inner) as u16),
                    None => {
                        escape_warnings.push(RewireWarning {
                            instruction: new_index,
                            field,
                            old_target: idx,
                            new_target: Target::Error,
                        });
                        *target = Target::Error;
                    }
                }
            }
        }
        instructions.push(inst);
    }

    let mut outcome = apply_edit(dst, &EditOp::Insert { at, instructions })?;
    outcome.warnings.extend(escape_warnings);
    Ok(outcome)
}
