// Cross-routine call graph.
//
// Scans decoded routines for subroutine-call opcodes, resolves them
// through an external scope resolver, and derives entry/orphan/utility
// flags per routine. Listings are sorted by (routine id, call-site
// index) so output is reproducible run to run.

use crate::error::{BrokenReference, BrokenReferenceKind, Severity};
use crate::opcode_table::OpcodeTable;
use crate::routine::{Routine, Scope};
use indexmap::IndexMap;
use log::debug;
use std::collections::HashSet;
use std::fmt::Write;

/// Default incoming-edge count at which a routine is flagged as a
/// shared utility.
pub const DEFAULT_UTILITY_THRESHOLD: usize = 5;

/// Resolves (scope, routine id) to a routine in the analyzed set.
/// Indexing of local, semi-global and global routine tables lives in
/// the collaborator, not here.
pub trait ScopeResolver {
    fn resolve(&self, scope: Scope, id: u16) -> Option<u16>;
}

/// Supplies the externally invocable routine ids: object lifecycle
/// hooks, interaction action/guard references. The set is provided,
/// never computed here.
pub trait EntryPointProvider {
    fn entry_points(&self) -> Vec<u16>;
}

/// An empty entry-point set, for callers with no interaction data.
pub struct NoEntryPoints;

impl EntryPointProvider for NoEntryPoints {
    fn entry_points(&self) -> Vec<u16> {
        Vec::new()
    }
}

/// One resolved call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEdge {
    pub caller: u16,
    pub callee: u16,
    /// Instruction index of the call in the caller.
    pub call_site: u16,
    /// Scope the call resolved through.
    pub scope: Scope,
}

/// Derived per-routine classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineFlags {
    pub incoming: usize,
    pub outgoing: usize,
    pub is_entry_point: bool,
    /// No incoming edges and not an entry point.
    pub is_orphan: bool,
    /// Fan-in at or above the utility threshold.
    pub is_utility: bool,
}

#[derive(Debug, Clone)]
pub struct CallGraph {
    nodes: IndexMap<u16, RoutineFlags>,
    edges: Vec<CallEdge>,
    findings: Vec<BrokenReference>,
}

impl CallGraph {
    /// Nodes in routine-id order.
    pub fn nodes(&self) -> impl Iterator<Item = (u16, &RoutineFlags)> {
        self.nodes.iter().map(|(id, flags)| (*id, flags))
    }

    pub fn flags(&self, id: u16) -> Option<&RoutineFlags> {
        self.nodes.get(&id)
    }

    /// Edges sorted by (caller id, call-site index).
    pub fn edges(&self) -> &[CallEdge] {
        &self.edges
    }

    pub fn findings(&self) -> &[BrokenReference] {
        &self.findings
    }

    pub fn callers_of(&self, id: u16) -> Vec<&CallEdge> {
        self.edges.iter().filter(|e| e.callee == id).collect()
    }

    pub fn callees_of(&self, id: u16) -> Vec<&CallEdge> {
        self.edges.iter().filter(|e| e.caller == id).collect()
    }

    pub fn orphans(&self) -> Vec<u16> {
        self.nodes
            .iter()
            .filter(|(_, f)| f.is_orphan)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Graph-description export in DOT form.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph calls {\n");
        for (id, flags) in self.nodes() {
            let mut marks = Vec::new();
            if flags.is_entry_point {
                marks.push("entry");
            }
            if flags.is_orphan {
                marks.push("orphan");
            }
            if flags.is_utility {
                marks.push("utility");
            }
            if marks.is_empty() {
                writeln!(out, "    r{} [label=\"{}\"];", id, id).unwrap();
            } else {
                writeln!(out, "    r{} [label=\"{} ({})\"];", id, id, marks.join(",")).unwrap();
            }
        }
        for edge in &self.edges {
            writeln!(
                out,
                "    r{} -> r{} [label=\"{}@{}\"];",
                edge.caller, edge.callee, edge.scope, edge.call_site
            )
            .unwrap();
        }
        out.push_str("}\n");
        out
    }
}

pub struct CallGraphBuilder<'a> {
    table: &'a OpcodeTable,
    resolver: &'a dyn ScopeResolver,
    entry_points: &'a dyn EntryPointProvider,
    utility_threshold: usize,
}

impl<'a> CallGraphBuilder<'a> {
    pub fn new(
        table: &'a OpcodeTable,
        resolver: &'a dyn ScopeResolver,
        entry_points: &'a dyn EntryPointProvider,
    ) -> Self {
        CallGraphBuilder {
            table,
            resolver,
            entry_points,
            utility_threshold: DEFAULT_UTILITY_THRESHOLD,
        }
    }

    pub fn with_utility_threshold(mut self, threshold: usize) -> Self {
        self.utility_threshold = threshold;
        self
    }

    /// Build the graph over a fully loaded, immutable routine set.
    pub fn build(&self, routines: &[Routine]) -> CallGraph {
        let mut ids: Vec<u16> = routines.iter().map(|r| r.id).collect();
        ids.sort_unstable();

        let mut by_id: Vec<&Routine> = routines.iter().collect();
        by_id.sort_by_key(|r| r.id);

        let mut edges = Vec::new();
        let mut findings = Vec::new();

        for routine in &by_id {
            for (index, inst) in routine.instructions.iter().enumerate() {
                if inst.opcode <= crate::opcode_table::PRIMITIVE_MAX {
                    continue;
                }
                let call_site = index as u16;
                // The call opcode value is the callee routine id.
                match self.table.call_ranges().classify(inst.opcode) {
                    Some(scope) => match self.resolver.resolve(scope, inst.opcode) {
                        Some(callee) => {
                            edges.push(CallEdge {
                                caller: routine.id,
                                callee,
                                call_site,
                                scope,
                            });
                        }
                        None => {
                            let kind = match scope {
                                Scope::SemiGlobal => BrokenReferenceKind::MissingImportLink,
                                _ => BrokenReferenceKind::UnresolvedCall,
                            };
                            findings.push(BrokenReference {
                                kind,
                                severity: Severity::Error,
                                chunk_id: routine.id,
                                instruction: Some(call_site),
                                referenced: inst.opcode as u32,
                            });
                        }
                    },
                    None => {
                        findings.push(BrokenReference {
                            kind: BrokenReferenceKind::UnclassifiedCallOpcode,
                            severity: Severity::Error,
                            chunk_id: routine.id,
                            instruction: Some(call_site),
                            referenced: inst.opcode as u32,
                        });
                    }
                }
            }
        }

        edges.sort_by_key(|e| (e.caller, e.call_site));

        let entry_set: HashSet<u16> = self.entry_points.entry_points().into_iter().collect();
        let mut nodes = IndexMap::new();
        for id in ids {
            let incoming = edges.iter().filter(|e| e.callee == id).count();
            let outgoing = edges.iter().filter(|e| e.caller == id).count();
            let is_entry_point = entry_set.contains(&id);
            nodes.insert(
                id,
                RoutineFlags {
                    incoming,
                    outgoing,
                    is_entry_point,
                    is_orphan: incoming == 0 && !is_entry_point,
                    is_utility: incoming >= self.utility_threshold,
                },
            );
        }

        debug!(
            "call graph: {} routines, {} edges, {} finding(s)",
            nodes.len(),
            edges.len(),
            findings.len()
        );

        CallGraph {
            nodes,
            edges,
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Target;
    use crate::opcode_table::DEFAULT_TABLE;
    use crate::routine::test_support::routine_from_triples;
    use std::collections::HashMap;

    const REFRESH: u16 = 0x0007;

    struct MapResolver {
        map: HashMap<(Scope, u16), u16>,
    }

    impl MapResolver {
        fn of_locals(ids: &[u16]) -> Self {
            let map = ids.iter().map(|&id| ((Scope::Local, id), id)).collect();
            MapResolver { map }
        }
    }

    impl ScopeResolver for MapResolver {
        fn resolve(&self, scope: Scope, id: u16) -> Option<u16> {
            self.map.get(&(scope, id)).copied()
        }
    }

    struct FixedEntries(Vec<u16>);

    impl EntryPointProvider for FixedEntries {
        fn entry_points(&self) -> Vec<u16> {
            self.0.clone()
        }
    }

    fn call_to(id: u16) -> (u16, Target, Target) {
        (id, Target::ReturnTrue, Target::ReturnFalse)
    }

    #[test]
    fn test_resolved_edges_sorted() {
        // 0x1000 calls 0x1001 twice, 0x1001 calls nothing.
        let a = routine_from_triples(
            0x1000,
            &[
                call_to(0x1001),
                (REFRESH, Target::Index(2), Target::ReturnFalse),
                call_to(0x1001),
            ],
        );
        let b = routine_from_triples(0x1001, &[(REFRESH, Target::ReturnTrue, Target::ReturnFalse)]);

        let resolver = MapResolver::of_locals(&[0x1000, 0x1001]);
        let entries = FixedEntries(vec![0x1000]);
        let graph = CallGraphBuilder::new(&DEFAULT_TABLE, &resolver, &entries).build(&[b, a]);

        assert!(graph.findings().is_empty());
        let edges = graph.edges();
        assert_eq!(edges.len(), 2);
        assert_eq!((edges[0].caller, edges[0].call_site), (0x1000, 0));
        assert_eq!((edges[1].caller, edges[1].call_site), (0x1000, 2));
        assert_eq!(edges[0].callee, 0x1001);
        assert_eq!(edges[0].scope, Scope::Local);
    }

    #[test]
    fn test_entry_orphan_flags() {
        let a = routine_from_triples(0x1000, &[call_to(0x1001)]);
        let b = routine_from_triples(0x1001, &[(REFRESH, Target::ReturnTrue, Target::ReturnFalse)]);
        let c = routine_from_triples(0x1002, &[(REFRESH, Target::ReturnTrue, Target::ReturnFalse)]);

        let resolver = MapResolver::of_locals(&[0x1000, 0x1001, 0x1002]);
        let entries = FixedEntries(vec![0x1000]);
        let graph = CallGraphBuilder::new(&DEFAULT_TABLE, &resolver, &entries).build(&[a, b, c]);

        let fa = graph.flags(0x1000).unwrap();
        assert!(fa.is_entry_point && !fa.is_orphan);
        let fb = graph.flags(0x1001).unwrap();
        assert!(!fb.is_entry_point && !fb.is_orphan);
        assert_eq!(fb.incoming, 1);
        let fc = graph.flags(0x1002).unwrap();
        assert!(fc.is_orphan);
        assert_eq!(graph.orphans(), vec![0x1002]);
    }

    #[test]
    fn test_utility_threshold() {
        // Three callers of 0x1001 with threshold 3.
        let callers: Vec<_> = (0..3)
            .map(|i| routine_from_triples(0x1002 + i, &[call_to(0x1001)]))
            .collect();
        let callee =
            routine_from_triples(0x1001, &[(REFRESH, Target::ReturnTrue, Target::ReturnFalse)]);
        let mut routines = callers;
        routines.push(callee);

        let resolver = MapResolver::of_locals(&[0x1001, 0x1002, 0x1003, 0x1004]);
        let graph = CallGraphBuilder::new(&DEFAULT_TABLE, &resolver, &NoEntryPoints)
            .with_utility_threshold(3)
            .build(&routines);

        assert!(graph.flags(0x1001).unwrap().is_utility);
        assert!(!graph.flags(0x1002).unwrap().is_utility);
    }

    #[test]
    fn test_unresolved_call_reported() {
        let a = routine_from_triples(0x1000, &[call_to(0x1ABC)]);
        let resolver = MapResolver::of_locals(&[0x1000]);
        let graph = CallGraphBuilder::new(&DEFAULT_TABLE, &resolver, &NoEntryPoints).build(&[a]);

        assert!(graph.edges().is_empty());
        assert_eq!(graph.findings().len(), 1);
        let finding = &graph.findings()[0];
        assert_eq!(finding.kind, BrokenReferenceKind::UnresolvedCall);
        assert_eq!(finding.chunk_id, 0x1000);
        assert_eq!(finding.instruction, Some(0));
        assert_eq!(finding.referenced, 0x1ABC);
    }

    #[test]
    fn test_semi_global_without_import_link() {
        let a = routine_from_triples(0x1000, &[call_to(0x2005)]);
        let resolver = MapResolver::of_locals(&[0x1000]);
        let graph = CallGraphBuilder::new(&DEFAULT_TABLE, &resolver, &NoEntryPoints).build(&[a]);

        assert_eq!(graph.findings().len(), 1);
        assert_eq!(
            graph.findings()[0].kind,
            BrokenReferenceKind::MissingImportLink
        );
    }

    #[test]
    fn test_call_opcode_outside_ranges() {
        let a = routine_from_triples(0x1000, &[call_to(0x9000)]);
        let resolver = MapResolver::of_locals(&[0x1000]);
        let graph = CallGraphBuilder::new(&DEFAULT_TABLE, &resolver, &NoEntryPoints).build(&[a]);

        assert_eq!(
            graph.findings()[0].kind,
            BrokenReferenceKind::UnclassifiedCallOpcode
        );
    }

    #[test]
    fn test_dot_export_mentions_flags() {
        let a = routine_from_triples(0x1000, &[call_to(0x1001)]);
        let b = routine_from_triples(0x1001, &[(REFRESH, Target::ReturnTrue, Target::ReturnFalse)]);
        let resolver = MapResolver::of_locals(&[0x1000, 0x1001]);
        let entries = FixedEntries(vec![0x1000]);
        let graph = CallGraphBuilder::new(&DEFAULT_TABLE, &resolver, &entries).build(&[a, b]);

        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph calls {"));
        assert!(dot.contains("entry"));
        assert!(dot.contains("r4096 -> r4097"));
    }
}
