//! Routines, modules and their ordered code regions.
//!
//! The front end hands the code generator one of these per translation
//! unit; backends read them and the kernel extractor rewrites them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use heddle_lang::domain::ParallelRegionTemplate;

use crate::analysis::Access;
use crate::symbol::{DeclarationScope, DependencyEntry, DependencyTemplate, Symbol};

/// Where a routine stands relative to parallel regions in the callgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ParallelRegionPosition {
    /// Parallel regions live in callees of this routine.
    Inside,
    /// Parallel regions appear directly in this routine's body.
    Within,
    /// This routine is called from inside a parallel region.
    Outside,
}

/// Declaration context a symbol is being processed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    ModuleDeclaration,
    KernelCallerDeclaration,
    Other,
}

/// What a callee can run on, as far as callers need to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalleeCapabilities {
    /// Generated code for the callee executes on the accelerator.
    pub on_device: bool,
    /// The callee understands device-resident data in its interface.
    pub handles_device_data: bool,
    /// The callee keeps a synthesized host-callable copy.
    pub supports_host_only_copies: bool,
    /// The callee's backend duplicates routines rather than mixing host
    /// and device code.
    pub uses_host_routine_duplicates: bool,
}

/// One line of a routine's specification section together with the symbol
/// names the front end associated with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecLine {
    pub text: String,
    pub symbol_names: Vec<String>,
}

impl SpecLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), symbol_names: Vec::new() }
    }

    pub fn with_symbols(text: impl Into<String>, symbols: impl IntoIterator<Item = String>) -> Self {
        Self { text: text.into(), symbol_names: symbols.into_iter().collect() }
    }
}

/// A `use` relationship of a routine or module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    /// `None` imports the whole module.
    pub item: Option<ImportItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportItem {
    pub local: String,
    pub source: String,
}

impl Import {
    pub fn whole_module(module: impl Into<String>) -> Self {
        Self { module: module.into(), item: None }
    }

    pub fn named(module: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self { module: module.into(), item: Some(ImportItem { local: name.clone(), source: name }) }
    }

    pub fn renamed(
        module: impl Into<String>,
        local: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            item: Some(ImportItem { local: local.into(), source: source.into() }),
        }
    }
}

/// One region of a routine body, in source order.
#[derive(Debug, Clone)]
pub enum Region {
    Code(CodeRegion),
    Parallel(ParallelRegion),
    Call(CallRegion),
}

impl Region {
    pub fn code(lines: impl IntoIterator<Item = String>) -> Self {
        Self::Code(CodeRegion { lines: lines.into_iter().collect() })
    }
}

/// Plain code carried through untouched (modulo dialect adjustment).
#[derive(Debug, Clone, Default)]
pub struct CodeRegion {
    pub lines: Vec<String>,
}

/// An annotated parallel block.
#[derive(Debug, Clone)]
pub struct ParallelRegion {
    pub template: Arc<ParallelRegionTemplate>,
    pub body: Vec<Region>,
}

/// A call site, with arguments as written by the programmer.
#[derive(Debug, Clone)]
pub struct CallRegion {
    pub callee: String,
    pub arguments: Vec<String>,
}

/// The template/entry pair of one dependency annotation line.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDef {
    pub template: Arc<DependencyTemplate>,
    pub entry: DependencyEntry,
}

/// Key under which a symbol is filed in a scope's symbol table.
pub fn scoped_symbol_key(name: &str, scope: &str) -> String {
    format!("{name}@{scope}")
}

/// One routine as seen by the code generator.
#[derive(Debug, Clone, Default)]
pub struct Routine {
    pub name: String,
    pub module_name: String,
    pub position: Option<ParallelRegionPosition>,
    /// Rewritten to orchestrate kernel launches.
    pub is_kernel_caller: bool,
    /// Reachable from a host-only call path.
    pub is_used_in_host_only_context: bool,
    /// Typed capability summary when the callee is a translated routine.
    pub callee_caps: Option<CalleeCapabilities>,
    /// Dummy argument names in signature order.
    pub arguments: Vec<String>,
    pub imports: Vec<Import>,
    pub specification: Vec<SpecLine>,
    pub body: Vec<Region>,
    pub templates: Vec<Arc<ParallelRegionTemplate>>,
    pub dependency_defs: Vec<DependencyDef>,
    /// Symbols keyed by [`scoped_symbol_key`] or plain name.
    pub symbols: BTreeMap<String, Symbol>,
    /// Every symbol name the routine touches; `None` when the body is not
    /// available (external routine).
    pub used_symbol_names: Option<BTreeSet<String>>,
    /// Symbol names referenced inside parallel regions.
    pub used_symbol_names_in_kernels: BTreeSet<String>,
    /// First access direction of scalars inside kernel bodies.
    pub scalar_first_access: BTreeMap<String, Access>,
}

impl Routine {
    pub fn new(name: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self { name: name.into(), module_name: module_name.into(), ..Self::default() }
    }

    /// Resolve a symbol the way scopes nest: routine scope first, then
    /// module scope, then the plain name.
    pub fn symbol_key(&self, name: &str) -> Option<String> {
        for key in [
            scoped_symbol_key(name, &self.name),
            scoped_symbol_key(name, &self.module_name),
            name.to_string(),
        ] {
            if self.symbols.contains_key(&key) {
                return Some(key);
            }
        }
        None
    }

    pub fn lookup_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbol_key(name).and_then(|key| self.symbols.get(&key))
    }

    /// File a symbol under its declaring scope's key.
    pub fn insert_symbol(&mut self, symbol: Symbol) {
        let key = scoped_symbol_key(&symbol.name, symbol.scope.scope_name());
        self.symbols.insert(key, symbol);
    }

    /// Top-level parallel regions in body order.
    pub fn parallel_regions(&self) -> impl Iterator<Item = &ParallelRegion> {
        self.body.iter().filter_map(|r| match r {
            Region::Parallel(p) => Some(p),
            _ => None,
        })
    }

    pub fn first_parallel_template(&self) -> Option<&Arc<ParallelRegionTemplate>> {
        self.parallel_regions().map(|p| &p.template).next().or(self.templates.first())
    }

    pub fn uses_symbol_in_kernels(&self, name: &str) -> bool {
        self.used_symbol_names_in_kernels.contains(name)
    }

    /// Whether the routine is known to touch `name` at all. Unknown bodies
    /// count as using everything.
    pub fn may_use_symbol(&self, name: &str) -> bool {
        match &self.used_symbol_names {
            Some(used) => used.contains(name),
            None => true,
        }
    }

    pub fn first_access_of_scalar(&self, name: &str) -> Option<Access> {
        self.scalar_first_access.get(name).copied()
    }

    /// Kernel-use set for residency decisions. `None` when the body is
    /// unknown, so usage cannot be ruled out.
    pub fn kernel_usage(&self) -> Option<&BTreeSet<String>> {
        self.used_symbol_names.as_ref().map(|_| &self.used_symbol_names_in_kernels)
    }

    /// Clone under a new name, body and symbols included. Symbols filed
    /// under the routine's own scope move to the new scope so lookups
    /// keep resolving them.
    pub fn clone_renamed(&self, new_name: impl Into<String>) -> Self {
        let mut cloned = self.clone();
        let new_name: String = new_name.into();
        let mut symbols = BTreeMap::new();
        for (key, mut symbol) in std::mem::take(&mut cloned.symbols) {
            if key != scoped_symbol_key(&symbol.name, &self.name) {
                symbols.insert(key, symbol);
                continue;
            }
            if let DeclarationScope::Routine { routine, .. } = &mut symbol.scope {
                routine.clone_from(&new_name);
            }
            symbols.insert(scoped_symbol_key(&symbol.name, &new_name), symbol);
        }
        cloned.symbols = symbols;
        cloned.name = new_name;
        cloned
    }

    pub fn reset_body(&mut self) {
        self.body.clear();
    }

    pub fn push_region(&mut self, region: Region) {
        self.body.push(region);
    }

    /// Declaration context this routine provides to residency decisions.
    pub fn region_kind(&self) -> RegionKind {
        if self.is_kernel_caller {
            RegionKind::KernelCallerDeclaration
        } else {
            RegionKind::Other
        }
    }
}

/// The module a routine belongs to, reduced to what symbol resolution
/// needs.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub dependency_defs: Vec<DependencyDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), dependency_defs: Vec::new() }
    }

    /// Dependency entry for `name`, matching declared or source names.
    pub fn entry_named(&self, name: &str) -> Option<&DependencyDef> {
        self.dependency_defs.iter().find(|def| {
            def.entry.name == name || def.entry.source_symbol.as_deref() == Some(name)
        })
    }
}
