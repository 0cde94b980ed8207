//! Static analysis and editing engine for a legacy game's binary
//! behavior-script bytecode ("routines").
//!
//! The core is purely static: routines are decoded from typed container
//! chunks, their control flow is reconstructed without execution, calls
//! are resolved into a cross-routine graph, structural cycles are
//! detected across heterogeneous resource references, and instruction
//! edits are applied pointer-safely so a committed snapshot never
//! contains a dangling jump target.
//!
//! Every operation runs over immutable snapshots; an edit produces a
//! new `Routine` and never mutates the prior one, and derived views
//! (traces, graphs, cycles) must be recomputed after a committed edit.

#[macro_use]
extern crate lazy_static;

pub mod call_graph;
pub mod chunk;
pub mod error;
pub mod instruction;
pub mod opcode_table;
pub mod resource_graph;
pub mod rewire;
pub mod routine;
pub mod tracer;
