//! The backend contract for target-dialect lowering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use heddle_lang::arch::ArchTag;
use heddle_lang::domain::{ParallelDomain, ParallelRegionTemplate};
use heddle_model::{
    CalleeCapabilities, Module, ParallelRegionPosition, RegionKind, Routine, Symbol,
};

use crate::common::{device_routine_name, host_routine_name, import_statements};
use crate::context::PassContext;
use crate::error::Result;

/// Static description of what a backend's generated code can do.
///
/// Callers branch on these flags instead of probing the backend type;
/// the flag set mirrors the differences between the four dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Names this backend answers to in architecture selection.
    pub architectures: &'static [&'static str],
    /// Which architecture tag its parallel regions apply to.
    pub target: ArchTag,
    /// Generated parallel blocks execute on the accelerator.
    pub on_device: bool,
    /// The backend adjusts declarations and transfers for device data.
    pub handles_device_data: bool,
    pub multiple_parallel_regions_allowed: bool,
    pub scalar_writes_in_kernels_allowed: bool,
    pub arbitrary_data_access_outside_kernels: bool,
    pub module_imports_in_kernels_allowed: bool,
    /// Host and device code may share a routine body.
    pub mixed_host_device_code_allowed: bool,
    /// Routines are duplicated per execution side instead of mixed.
    pub uses_host_routine_duplicates: bool,
    /// A host-callable copy is synthesized for host-reachable routines.
    pub supports_host_only_routine_copies: bool,
    /// Debug prints around kernels use the kernel-numbered names.
    pub kernel_prefixes_in_debug_print: bool,
    /// Debug prints read device data through OpenACC update directives.
    pub openacc_debug_prints: bool,
}

impl Capabilities {
    /// The permissive host-dialect baseline.
    pub const fn host_defaults() -> Self {
        Self {
            architectures: &["cpu", "host"],
            target: ArchTag::Cpu,
            on_device: false,
            handles_device_data: false,
            multiple_parallel_regions_allowed: true,
            scalar_writes_in_kernels_allowed: true,
            arbitrary_data_access_outside_kernels: true,
            module_imports_in_kernels_allowed: true,
            mixed_host_device_code_allowed: true,
            uses_host_routine_duplicates: false,
            supports_host_only_routine_copies: false,
            kernel_prefixes_in_debug_print: true,
            openacc_debug_prints: true,
        }
    }

    /// The subset callers need to know about a translated callee.
    pub fn callee_view(&self) -> CalleeCapabilities {
        CalleeCapabilities {
            on_device: self.on_device,
            handles_device_data: self.handles_device_data,
            supports_host_only_copies: self.supports_host_only_routine_copies,
            uses_host_routine_duplicates: self.uses_host_routine_duplicates,
        }
    }
}

/// Dialect a produced routine must be rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDialect {
    /// The backend that split the routine renders it.
    Native,
    /// Rendered as plain host code (synthesized host copies).
    HostCopy,
}

/// One routine produced by [`Backend::split_into_routines`].
#[derive(Debug, Clone)]
pub struct SplitRoutine {
    pub routine: Routine,
    pub dialect: SplitDialect,
}

impl SplitRoutine {
    pub fn native(routine: Routine) -> Self {
        Self { routine, dialect: SplitDialect::Native }
    }

    pub fn host_copy(routine: Routine) -> Self {
        Self { routine, dialect: SplitDialect::HostCopy }
    }
}

/// Symbols a kernel needs beyond its programmer-written arguments,
/// grouped by how the launching scope obtains them.
#[derive(Debug, Clone, Default)]
pub struct AdditionalParameters {
    /// Obtained through module imports in the launching scope.
    pub imports: Vec<Symbol>,
    /// Visible in the launching scope's own module.
    pub declarations: Vec<Symbol>,
    /// Local data objects passed through as plain dummies.
    pub dummies: Vec<Symbol>,
}

impl AdditionalParameters {
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty() && self.declarations.is_empty() && self.dummies.is_empty()
    }

    /// All resolved symbols in signature order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.imports.iter().chain(self.declarations.iter()).chain(self.dummies.iter())
    }
}

/// One target dialect's lowering operations.
///
/// Implementations are stateless; everything mutable during a routine's
/// pass lives in the [`PassContext`] the driver threads through. Default
/// bodies implement the host-dialect behavior so device backends only
/// override what differs.
pub trait Backend {
    fn capabilities(&self) -> Capabilities;

    /// Text prepended once per generated file.
    fn file_preamble(&self, _filename: &str) -> String {
        "#include \"storage_order.F90\"".to_string()
    }

    /// Extra `use` lines every routine of this dialect needs.
    fn additional_includes(&self) -> String {
        String::new()
    }

    /// Text before the `subroutine` keyword (device attributes).
    fn routine_prefix(&self, _routine: &Routine) -> String {
        String::new()
    }

    fn call_invocation_prefix(&self, callee_name: &str) -> String {
        format!("call {callee_name}")
    }

    /// Name a call site uses for `callee`, switching to the synthesized
    /// host or device copy where the callee's backend keeps duplicates.
    fn adjust_callee_name(&self, caller: &Routine, callee: &Routine) -> String {
        let name = callee.name.clone();
        let Some(callee_caps) = callee.callee_caps else {
            return name;
        };
        if !callee_caps.uses_host_routine_duplicates {
            return name;
        }
        let caps = self.capabilities();
        let callee_in_parallel_graph = matches!(
            callee.position,
            Some(ParallelRegionPosition::Within | ParallelRegionPosition::Outside)
        );
        if (callee_in_parallel_graph && caller.position.is_none())
            || (!caps.on_device && callee.position.is_some())
        {
            return host_routine_name(&name);
        }
        if callee.is_used_in_host_only_context
            && !name.contains("_hdk")
            && caps.handles_device_data
            && callee_caps.handles_device_data
            && callee_caps.supports_host_only_copies
        {
            return device_routine_name(&name);
        }
        name
    }

    /// Adjust a bare specification directive (`private`, `public`, ...).
    fn adjust_specification(&self, line: &str, directive: &str) -> String {
        if self.capabilities().uses_host_routine_duplicates && directive == "private" {
            return String::new();
        }
        line.to_string()
    }

    /// Filter symbol-less specification lines for the target dialect.
    fn adjust_data_specification_lines(
        &self,
        lines: Vec<String>,
        _routine: &Routine,
    ) -> Vec<String> {
        lines
    }

    /// Recompute one symbol's residency flags for this dialect.
    fn update_symbol_device_state(
        &self,
        symbol: &mut Symbol,
        _used_in_kernels: Option<&BTreeSet<String>>,
        _region_kind: RegionKind,
        _position: Option<ParallelRegionPosition>,
    ) {
        symbol.is_using_device_postfix = false;
        symbol.is_on_device = false;
    }

    /// Rewrite one declaration line for the target dialect. `symbols`
    /// are the data objects the line declares, mutated in place when
    /// residency changes.
    fn adjust_declaration(
        &self,
        _ctx: &mut PassContext,
        line: &str,
        _symbols: &mut [Symbol],
        _routine: Option<&Routine>,
        _region_kind: RegionKind,
        _position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        Ok(line.trim_end().to_string())
    }

    /// Render the `use` specification for one group of imported symbols.
    fn import_specification(
        &self,
        symbols: &mut [Symbol],
        _region_kind: RegionKind,
        _position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        Ok(import_statements(symbols, false))
    }

    /// Statements between the declaration section and the body.
    fn declaration_end(
        &self,
        ctx: &mut PassContext,
        symbols: &[Symbol],
        routine: &Routine,
    ) -> Result<String>;

    /// Statements before a `return` or the routine end.
    fn routine_exit_point(
        &self,
        _ctx: &mut PassContext,
        _symbols: &[Symbol],
        _is_kernel_caller: bool,
        _is_routine_end: bool,
    ) -> Result<String> {
        Ok(String::new())
    }

    /// Open one parallel block.
    fn parallel_region_begin(
        &self,
        ctx: &mut PassContext,
        routine: &Routine,
        symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String>;

    /// Close one parallel block and advance the kernel number.
    fn parallel_region_end(
        &self,
        ctx: &mut PassContext,
        routine: &Routine,
        template: &ParallelRegionTemplate,
    ) -> Result<String>;

    /// Open a run-once stand-in block for a parallel region that does
    /// not apply to this dialect, keeping early exits working.
    fn parallel_region_stub_begin(&self, ctx: &mut PassContext) -> String {
        format!("{}: do", ctx.outer_loop_label())
    }

    fn parallel_region_stub_end(&self, ctx: &mut PassContext) -> String {
        let label = ctx.outer_loop_label();
        ctx.kernel_number += 1;
        format!("exit {label}\nend do {label}")
    }

    /// Replacement for a `return` inside or near parallel blocks.
    fn early_exit(&self, ctx: &PassContext, _position: Option<ParallelRegionPosition>) -> String {
        format!("exit {}", ctx.outer_loop_label())
    }

    /// Directive in front of sequential loops inside parallel blocks.
    fn loop_preparation(&self) -> String {
        String::new()
    }

    /// Iterator initialization preceding a kernel body.
    fn iterator_definition(&self, _domains: &[ParallelDomain]) -> Result<String> {
        Ok(String::new())
    }

    /// Bounds check aborting threads outside the iteration space.
    fn guard_outside_region(&self, _domains: &[ParallelDomain]) -> String {
        String::new()
    }

    /// Iterator names a parallel block of this dialect consumes.
    fn iterators(&self, template: &ParallelRegionTemplate) -> Vec<String> {
        if !template.applies_to_arch(self.capabilities().target) {
            return Vec::new();
        }
        template.domain_names().map(str::to_string).collect()
    }

    /// Launch configuration between callee name and argument list.
    fn kernel_call_config(&self) -> String {
        String::new()
    }

    /// Statements preparing a kernel launch (grid geometry).
    fn kernel_call_preparation(
        &self,
        ctx: &mut PassContext,
        template: Option<&Arc<ParallelRegionTemplate>>,
        _callee: Option<&Routine>,
    ) -> Result<String> {
        ctx.current_template = template.cloned();
        Ok(String::new())
    }

    /// Statements following a kernel launch (error checks).
    fn kernel_call_post(
        &self,
        ctx: &mut PassContext,
        _caller: &Routine,
        _callee: &Routine,
    ) -> String {
        ctx.current_template = None;
        String::new()
    }

    fn call_preparation_for_passed_symbol(
        &self,
        _routine: &Routine,
        _symbol_in_caller: &Symbol,
    ) -> String {
        String::new()
    }

    fn call_post_for_passed_symbol(
        &self,
        _routine: &Routine,
        _symbol_in_caller: &Symbol,
    ) -> String {
        String::new()
    }

    /// Symbols `callee` needs beyond its written argument list.
    fn additional_parameters(
        &self,
        _caller: &Routine,
        _callee: &Routine,
        _modules: &BTreeMap<String, Module>,
    ) -> Result<AdditionalParameters> {
        Ok(AdditionalParameters::default())
    }

    /// Break one routine into the routines this dialect compiles it as.
    fn split_into_routines(
        &self,
        routine: Routine,
        _peers: &BTreeMap<String, Routine>,
        _modules: &BTreeMap<String, Module>,
    ) -> Result<Vec<SplitRoutine>> {
        Ok(vec![SplitRoutine::native(routine)])
    }
}
