//! Callgraph analysis results attached to symbols.
//!
//! The front end's callgraph pass knows things a single scope cannot see:
//! whether a name is module-scoped somewhere up the chain and which
//! routines already receive it as a dummy argument. The resolver consumes
//! these as plain data.

use std::collections::BTreeSet;

/// First access direction of a scalar inside a kernel body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Access {
    Read,
    Write,
}

/// Cross-routine facts about one symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolAnalysis {
    /// Known to live at module scope somewhere in the callgraph.
    pub is_module_symbol: bool,
    /// Routines that take this symbol as an explicit dummy argument.
    pub argument_of: BTreeSet<String>,
}

impl SymbolAnalysis {
    /// Whether `routine` already receives this symbol explicitly.
    pub fn is_dummy_for(&self, routine: &str) -> bool {
        self.argument_of.contains(routine)
    }
}
