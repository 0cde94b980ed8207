// Data-driven opcode table.
//
// The opcode numeric space partitions by range: 0..=255 are built-in
// primitives described by per-opcode table entries; everything above is
// a subroutine call, bucketed into configurable scope ranges. Nothing
// outside this module hardcodes operand layouts or range boundaries;
// new opcodes require only table entries.

use crate::routine::Scope;
use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt;

/// Highest opcode value that names a built-in primitive.
pub const PRIMITIVE_MAX: u16 = 0x00FF;

/// What an instruction does to the control-flow path once its work is
/// done. Subroutine calls branch on the callee's boolean result, so
/// they behave as `Branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCategory {
    /// Falls through via true_target; false_target is ignored.
    Continue,
    /// Branches on true_target/false_target.
    Branch,
    /// Ends the path outright.
    Terminal,
    /// Falls through, but can yield execution (timed-wait style).
    /// Presence inside a loop body makes the loop bounded.
    Yield,
}

impl fmt::Display for ExitCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitCategory::Continue => write!(f, "continue"),
            ExitCategory::Branch => write!(f, "branch"),
            ExitCategory::Terminal => write!(f, "terminal"),
            ExitCategory::Yield => write!(f, "yield"),
        }
    }
}

/// A named byte span within an instruction's operand block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OperandField {
    pub name: String,
    pub offset: usize,
    pub width: usize,
}

/// Table entry for one built-in primitive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrimitiveInfo {
    pub opcode: u16,
    pub name: String,
    pub category: ExitCategory,
    #[serde(default)]
    pub fields: Vec<OperandField>,
}

/// An inclusive opcode range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OpcodeRange {
    pub start: u16,
    pub end: u16,
}

impl OpcodeRange {
    pub fn contains(&self, opcode: u16) -> bool {
        opcode >= self.start && opcode <= self.end
    }
}

/// Scope bucketing for subroutine-call opcodes. The boundaries are
/// documented as fixed constants in the original material but vary by
/// format lineage, so they are configuration, never literals at call
/// sites. The call opcode value itself is the callee routine id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CallRanges {
    pub global: OpcodeRange,
    pub local: OpcodeRange,
    pub semi_global: OpcodeRange,
}

impl Default for CallRanges {
    fn default() -> Self {
        CallRanges {
            global: OpcodeRange {
                start: 0x0100,
                end: 0x0FFF,
            },
            local: OpcodeRange {
                start: 0x1000,
                end: 0x1FFF,
            },
            semi_global: OpcodeRange {
                start: 0x2000,
                end: 0x2FFF,
            },
        }
    }
}

impl CallRanges {
    /// Which scope a call opcode targets, or None when the opcode is a
    /// primitive or falls outside every configured range.
    pub fn classify(&self, opcode: u16) -> Option<Scope> {
        if opcode <= PRIMITIVE_MAX {
            return None;
        }
        if self.local.contains(opcode) {
            Some(Scope::Local)
        } else if self.semi_global.contains(opcode) {
            Some(Scope::SemiGlobal)
        } else if self.global.contains(opcode) {
            Some(Scope::Global)
        } else {
            None
        }
    }
}

/// TOML shape for a full table.
#[derive(Debug, Clone, Deserialize)]
struct TableConfig {
    #[serde(default)]
    call_ranges: CallRanges,
    #[serde(default)]
    primitive: Vec<PrimitiveInfo>,
}

/// The opcode table handed to the decoder, tracer and graph builders at
/// construction time. Immutable once built; no ambient global state.
#[derive(Debug, Clone)]
pub struct OpcodeTable {
    primitives: IndexMap<u16, PrimitiveInfo>,
    call_ranges: CallRanges,
}

impl OpcodeTable {
    pub fn new(primitives: Vec<PrimitiveInfo>, call_ranges: CallRanges) -> Result<Self, String> {
        let mut map = IndexMap::new();
        for p in primitives {
            if p.opcode > PRIMITIVE_MAX {
                return Err(format!(
                    "primitive entry {:#06x} ('{}') is outside the primitive range",
                    p.opcode, p.name
                ));
            }
            if let Some(prev) = map.insert(p.opcode, p) {
                return Err(format!(
                    "duplicate table entry for opcode {:#06x} ('{}')",
                    prev.opcode, prev.name
                ));
            }
        }
        map.sort_keys();
        Ok(OpcodeTable {
            primitives: map,
            call_ranges,
        })
    }

    /// Load a table from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, String> {
        let config: TableConfig = toml::from_str(text).map_err(|e| e.to_string())?;
        OpcodeTable::new(config.primitive, config.call_ranges)
    }

    pub fn call_ranges(&self) -> &CallRanges {
        &self.call_ranges
    }

    pub fn primitive(&self, opcode: u16) -> Option<&PrimitiveInfo> {
        self.primitives.get(&opcode)
    }

    /// Iterate table entries in opcode order.
    pub fn primitives(&self) -> impl Iterator<Item = &PrimitiveInfo> {
        self.primitives.values()
    }

    /// True when the opcode is a subroutine call in some configured
    /// scope range.
    pub fn is_call(&self, opcode: u16) -> bool {
        self.call_ranges.classify(opcode).is_some()
    }

    /// Exit category for any opcode. Calls branch on the callee's
    /// result. Unknown primitives are treated as plain fallthrough,
    /// which keeps the tracer's over-approximation conservative.
    pub fn category(&self, opcode: u16) -> ExitCategory {
        if opcode > PRIMITIVE_MAX {
            return ExitCategory::Branch;
        }
        match self.primitives.get(&opcode) {
            Some(info) => info.category,
            None => ExitCategory::Continue,
        }
    }

    /// Display name for an opcode.
    pub fn name(&self, opcode: u16) -> String {
        if let Some(info) = self.primitives.get(&opcode) {
            return info.name.clone();
        }
        match self.call_ranges.classify(opcode) {
            Some(scope) => format!("call_{} {:#06x}", scope, opcode),
            None if opcode <= PRIMITIVE_MAX => format!("unknown_{:#06x}", opcode),
            None => format!("bad_call_{:#06x}", opcode),
        }
    }
}

lazy_static! {
    /// Built-in default table. Callers that need a per-version or
    /// modded table load their own TOML instead.
    pub static ref DEFAULT_TABLE: OpcodeTable = OpcodeTable::from_toml(DEFAULT_TABLE_TOML)
        .expect("built-in opcode table is well-formed");
}

const DEFAULT_TABLE_TOML: &str = r#"
[call_ranges]
global = { start = 0x0100, end = 0x0FFF }
local = { start = 0x1000, end = 0x1FFF }
semi_global = { start = 0x2000, end = 0x2FFF }

[[primitive]]
opcode = 0x0000
name = "sleep"
category = "yield"
fields = [{ name = "ticks", offset = 0, width = 2 }]

[[primitive]]
opcode = 0x0001
name = "generic_call"
category = "branch"

[[primitive]]
opcode = 0x0002
name = "expression"
category = "branch"
fields = [
    { name = "lhs", offset = 0, width = 2 },
    { name = "rhs", offset = 2, width = 2 },
    { name = "flags", offset = 4, width = 1 },
    { name = "operator", offset = 5, width = 1 },
    { name = "lhs_owner", offset = 6, width = 1 },
    { name = "rhs_owner", offset = 7, width = 1 },
]

[[primitive]]
opcode = 0x0003
name = "find_best_object"
category = "branch"
fields = [{ name = "function", offset = 0, width = 2 }]

[[primitive]]
opcode = 0x0004
name = "grab"
category = "continue"

[[primitive]]
opcode = 0x0005
name = "drop"
category = "continue"

[[primitive]]
opcode = 0x0006
name = "change_suit"
category = "continue"
fields = [{ name = "suit", offset = 0, width = 2 }]

[[primitive]]
opcode = 0x0007
name = "refresh"
category = "continue"

[[primitive]]
opcode = 0x0008
name = "random_number"
category = "branch"
fields = [
    { name = "destination", offset = 0, width = 2 },
    { name = "modulus", offset = 2, width = 2 },
]

[[primitive]]
opcode = 0x000C
name = "idle_for_input"
category = "yield"
fields = [{ name = "ticks", offset = 0, width = 2 }]

[[primitive]]
opcode = 0x000D
name = "remove_object"
category = "continue"

[[primitive]]
opcode = 0x0011
name = "idle"
category = "yield"
fields = [{ name = "ticks", offset = 0, width = 2 }]

[[primitive]]
opcode = 0x0016
name = "set_motive"
category = "continue"
fields = [
    { name = "motive", offset = 0, width = 1 },
    { name = "amount", offset = 1, width = 2 },
]

[[primitive]]
opcode = 0x0018
name = "animate"
category = "yield"
fields = [{ name = "animation", offset = 0, width = 2 }]

[[primitive]]
opcode = 0x001A
name = "goto_relative"
category = "branch"
fields = [
    { name = "location", offset = 0, width = 2 },
    { name = "direction", offset = 2, width = 2 },
]

[[primitive]]
opcode = 0x001F
name = "abort"
category = "terminal"

[[primitive]]
opcode = 0x0020
name = "notify_out_of_idle"
category = "continue"

[[primitive]]
opcode = 0x0024
name = "set_to_next"
category = "branch"
fields = [
    { name = "target_kind", offset = 0, width = 1 },
    { name = "destination", offset = 1, width = 1 },
]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_lookups() {
        let table = &*DEFAULT_TABLE;
        assert_eq!(table.category(0x0000), ExitCategory::Yield);
        assert_eq!(table.category(0x0002), ExitCategory::Branch);
        assert_eq!(table.category(0x001F), ExitCategory::Terminal);
        // Unknown primitive falls through.
        assert_eq!(table.category(0x00FE), ExitCategory::Continue);
        assert_eq!(table.name(0x0002), "expression");
    }

    #[test]
    fn test_call_classification() {
        let ranges = CallRanges::default();
        assert_eq!(ranges.classify(0x0042), None);
        assert_eq!(ranges.classify(0x0100), Some(Scope::Global));
        assert_eq!(ranges.classify(0x1003), Some(Scope::Local));
        assert_eq!(ranges.classify(0x2001), Some(Scope::SemiGlobal));
        assert_eq!(ranges.classify(0x9000), None);
    }

    #[test]
    fn test_operand_fields_from_table() {
        let info = DEFAULT_TABLE.primitive(0x0002).unwrap();
        assert_eq!(info.fields.len(), 6);
        assert_eq!(info.fields[1].name, "rhs");
        assert_eq!(info.fields[1].offset, 2);
        assert_eq!(info.fields[1].width, 2);
    }

    #[test]
    fn test_custom_ranges_from_toml() {
        let table = OpcodeTable::from_toml(
            r#"
            [call_ranges]
            global = { start = 0x0100, end = 0x07FF }
            local = { start = 0x0800, end = 0x0FFF }
            semi_global = { start = 0x1000, end = 0x17FF }

            [[primitive]]
            opcode = 0x0000
            name = "sleep"
            category = "yield"
            "#,
        )
        .unwrap();
        assert_eq!(table.call_ranges().classify(0x0800), Some(Scope::Local));
        assert_eq!(table.call_ranges().classify(0x1234), Some(Scope::SemiGlobal));
    }

    #[test]
    fn test_duplicate_entry_rejected() {
        let result = OpcodeTable::from_toml(
            r#"
            [[primitive]]
            opcode = 0x0001
            name = "a"
            category = "continue"

            [[primitive]]
            opcode = 0x0001
            name = "b"
            category = "continue"
            "#,
        );
        assert!(result.is_err());
    }
}
