// Static execution tracer.
//
// Reconstructs a routine's control flow without executing it. A
// memoized depth-first walk from instruction 0 visits every
// instruction at most once, so cost is O(n) no matter how many logical
// paths exist and termination needs no iteration cap. Both branch arms
// are always explored; this is a structural over-approximation, not
// data-flow accuracy.

use crate::instruction::Instruction;
use crate::opcode_table::{ExitCategory, OpcodeTable};
use crate::routine::Routine;
use bitvec::prelude::*;
use log::debug;

/// A jump back to an instruction on the current DFS path: a loop
/// candidate. `from` is the looping instruction, `to` the loop header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackEdge {
    pub from: u16,
    pub to: u16,
    /// False when no instruction in the loop body can yield execution.
    pub bounded: bool,
}

/// Result of tracing one routine. Reachable and unreachable partition
/// the full index range.
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    len: usize,
    reachable: BitVec,
    pub back_edges: Vec<BackEdge>,
}

impl ExecutionTrace {
    pub fn is_reachable(&self, index: u16) -> bool {
        (index as usize) < self.len && self.reachable[index as usize]
    }

    pub fn reachable_indices(&self) -> Vec<u16> {
        self.reachable.iter_ones().map(|i| i as u16).collect()
    }

    /// Dead code: every index the walk never reached.
    pub fn unreachable_indices(&self) -> Vec<u16> {
        (0..self.len)
            .filter(|&i| !self.reachable[i])
            .map(|i| i as u16)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has_unbounded_loop(&self) -> bool {
        self.back_edges.iter().any(|e| !e.bounded)
    }
}

const UNVISITED: u8 = 0;
const ON_PATH: u8 = 1;
const EXPLORED: u8 = 2;

/// Successor indices of one instruction. Sentinel targets end the path;
/// dangling indices (already reported at decode) contribute nothing.
fn successors(inst: &Instruction, table: &OpcodeTable, len: usize, out: &mut Vec<u16>) {
    out.clear();
    let mut follow = |target: crate::instruction::Target| {
        if let Some(idx) = target.index() {
            if (idx as usize) < len {
                out.push(idx);
            }
        }
    };
    match table.category(inst.opcode) {
        ExitCategory::Terminal => {}
        ExitCategory::Branch => {
            follow(inst.true_target);
            follow(inst.false_target);
        }
        ExitCategory::Continue | ExitCategory::Yield => follow(inst.true_target),
    }
}

/// Trace a routine from instruction 0.
pub fn trace_routine(routine: &Routine, table: &OpcodeTable) -> ExecutionTrace {
    let len = routine.len();
    let mut reachable = bitvec![0; len];
    let mut back_edges = Vec::new();

    if len > 0 {
        let mut color = vec![UNVISITED; len];
        // Explicit stack of (node, next successor slot) so deep
        // routines cannot overflow the call stack.
        let mut stack: Vec<(u16, usize)> = vec![(0, 0)];
        color[0] = ON_PATH;
        reachable.set(0, true);

        let mut succ = Vec::with_capacity(2);
        while let Some(&mut (node, ref mut slot)) = stack.last_mut() {
            successors(&routine.instructions[node as usize], table, len, &mut succ);
            if *slot < succ.len() {
                let next = succ[*slot];
                *slot += 1;
                match color[next as usize] {
                    UNVISITED => {
                        color[next as usize] = ON_PATH;
                        reachable.set(next as usize, true);
                        stack.push((next, 0));
                    }
                    ON_PATH => {
                        // Loop candidate; do not re-descend.
                        back_edges.push(BackEdge {
                            from: node,
                            to: next,
                            bounded: false,
                        });
                    }
                    _ => {
                        // Already fully explored; counts toward
                        // reachability only.
                    }
                }
            } else {
                color[node as usize] = EXPLORED;
                stack.pop();
            }
        }

        back_edges.dedup();
        tag_bounded(routine, table, &mut back_edges);
    }

    debug!(
        "routine {}: {} reachable, {} unreachable, {} back edge(s)",
        routine.id,
        reachable.count_ones(),
        len - reachable.count_ones(),
        back_edges.len()
    );

    ExecutionTrace {
        len,
        reachable,
        back_edges,
    }
}

/// Mark each back edge bounded when its loop body contains a yielding
/// instruction. The body of a back edge (tail -> header) is every
/// instruction forward-reachable from the header that also reaches the
/// tail.
fn tag_bounded(routine: &Routine, table: &OpcodeTable, back_edges: &mut [BackEdge]) {
    let len = routine.len();
    if back_edges.is_empty() {
        return;
    }

    // Forward and reverse adjacency once, shared by all back edges.
    let mut forward: Vec<Vec<u16>> = vec![Vec::new(); len];
    let mut reverse: Vec<Vec<u16>> = vec![Vec::new(); len];
    let mut succ = Vec::with_capacity(2);
    for (index, inst) in routine.instructions.iter().enumerate() {
        successors(inst, table, len, &mut succ);
        for &next in &succ {
            forward[index].push(next);
            reverse[next as usize].push(index as u16);
        }
    }

    for edge in back_edges.iter_mut() {
        let from_header = flood(&forward, edge.to, len);
        let to_tail = flood(&reverse, edge.from, len);
        let mut bounded = false;
        for index in 0..len {
            let in_body =
                (from_header[index] && to_tail[index]) || index == edge.to as usize || index == edge.from as usize;
            if in_body
                && table.category(routine.instructions[index].opcode) == ExitCategory::Yield
            {
                bounded = true;
                break;
            }
        }
        edge.bounded = bounded;
    }
}

fn flood(adjacency: &[Vec<u16>], start: u16, len: usize) -> BitVec {
    let mut seen = bitvec![0; len];
    let mut queue = vec![start];
    seen.set(start as usize, true);
    while let Some(node) = queue.pop() {
        for &next in &adjacency[node as usize] {
            if !seen[next as usize] {
                seen.set(next as usize, true);
                queue.push(next);
            }
        }
    }
    seen
}
