//! Instrumentation decorators.
//!
//! Both types wrap an arbitrary [`Backend`] and splice their statements
//! around the inner backend's output, so any dialect can be instrumented
//! without its own debug or trace variant. Methods not listed here pass
//! straight through.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use itertools::Itertools;
use snafu::ensure;

use heddle_lang::domain::{ParallelDomain, ParallelRegionTemplate};
use heddle_lang::specline;
use heddle_model::{Intent, Module, ParallelRegionPosition, RegionKind, Routine, Symbol};

use crate::common::kernel_routine_name;
use crate::context::PassContext;
use crate::cuda::{DIM_NAMES, cuda_error_check};
use crate::error::{MissingKernelIteratorsSnafu, Result};
use crate::traits::{AdditionalParameters, Backend, Capabilities, SplitRoutine};

fn join_parts(parts: Vec<String>) -> String {
    parts.into_iter().filter(|p| !p.is_empty()).join("\n")
}

// ---------------------------------------------------------------------
// debug printing

/// Adds entry announcements, kernel-call announcements and per-variable
/// value dumps to the wrapped dialect's output.
///
/// The emulated variant additionally validates iterator initialization
/// at kernel entry and dumps monitored inputs from the first iteration,
/// for kernels compiled in emulation mode where ordinary host printing
/// works inside the parallel block.
pub struct DebugDecorator {
    inner: Box<dyn Backend>,
    emulated: bool,
}

impl DebugDecorator {
    pub fn new(inner: Box<dyn Backend>) -> Self {
        Self { inner, emulated: false }
    }

    pub fn emulated(inner: Box<dyn Backend>) -> Self {
        Self { inner, emulated: true }
    }

    /// `sum` the array into the debug temporary and print it, fetching
    /// device data first where the dialect reads it through OpenACC.
    fn value_dump(&self, label: &str, symbol: &Symbol) -> Option<String> {
        if !symbol.is_array() || !symbol.intent.is_output() {
            return None;
        }
        let slice = match symbol.whole_array_slice() {
            Ok(slice) => slice,
            Err(error) => {
                tracing::warn!(symbol = %symbol.name, %error, "skipping debug value dump");
                return None;
            }
        };
        let mut lines = Vec::new();
        if symbol.is_present && self.inner.capabilities().openacc_debug_prints {
            lines.push(format!("!$acc update host({})", symbol.device_name()));
        }
        lines.push(format!("hd_dbg_tmp = real(sum({slice}), 8)"));
        lines.push(format!("write(0, *) '{label}: {} =', hd_dbg_tmp", symbol.name));
        Some(lines.join("\n"))
    }

    fn emulated_region_begin(
        &self,
        routine: &Routine,
        symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let domains = template.domains();
        let iterators = self.inner.iterators(template);
        ensure!(
            !iterators.is_empty(),
            MissingKernelIteratorsSnafu { routine: routine.name.clone() }
        );
        let mut parts = vec![self.inner.iterator_definition(domains)?];

        let invalid = iterators.iter().map(|i| format!("{i} .LT. 1")).join(" .OR. ");
        parts.push(format!("if ({invalid}) then"));
        parts.push(format!(
            "write(0, *) 'ERROR: invalid initialization of iterators in kernel {} \
             - check kernel domain setup'",
            routine.name
        ));
        let echo = iterators.iter().map(|i| format!("'{i}', {i}")).join(", ");
        parts.push(format!("write(0, *) {echo}"));
        parts.push("end if".to_string());

        // Print from exactly one thread, the first iteration of every
        // parallel dimension.
        let first = iterators.iter().map(|i| format!("{i} .EQ. 1")).join(" .AND. ");
        parts.push(format!(
            "if ({first}) write(0, *) '*********** entering kernel {} ***************'",
            routine.name
        ));
        let iterator_refs: Vec<&str> = iterators.iter().map(String::as_str).collect();
        for symbol in symbols {
            if !symbol.is_array() || !symbol.intent.is_input() {
                continue;
            }
            let inactive = symbol.domains().len().saturating_sub(iterator_refs.len());
            let offsets = vec!["1"; inactive];
            match symbol.access_expression(&iterator_refs, &offsets) {
                Ok(access) => parts.push(format!(
                    "if ({first}) then\nwrite(0, *) '{access}', {access}\nend if"
                )),
                Err(error) => {
                    tracing::warn!(symbol = %symbol.name, %error, "skipping kernel entry dump");
                }
            }
        }
        parts.push(format!(
            "if ({first}) write(0, *) '**********************************************'"
        ));
        parts.push(format!("if ({first}) write(0, *) ''"));
        parts.push(self.inner.guard_outside_region(domains));
        Ok(join_parts(parts))
    }
}

impl Backend for DebugDecorator {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn file_preamble(&self, filename: &str) -> String {
        self.inner.file_preamble(filename)
    }

    fn additional_includes(&self) -> String {
        self.inner.additional_includes()
    }

    fn routine_prefix(&self, routine: &Routine) -> String {
        self.inner.routine_prefix(routine)
    }

    fn call_invocation_prefix(&self, callee_name: &str) -> String {
        self.inner.call_invocation_prefix(callee_name)
    }

    fn adjust_callee_name(&self, caller: &Routine, callee: &Routine) -> String {
        self.inner.adjust_callee_name(caller, callee)
    }

    fn adjust_specification(&self, line: &str, directive: &str) -> String {
        self.inner.adjust_specification(line, directive)
    }

    fn adjust_data_specification_lines(&self, lines: Vec<String>, routine: &Routine) -> Vec<String> {
        self.inner.adjust_data_specification_lines(lines, routine)
    }

    fn update_symbol_device_state(
        &self,
        symbol: &mut Symbol,
        used_in_kernels: Option<&BTreeSet<String>>,
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) {
        self.inner.update_symbol_device_state(symbol, used_in_kernels, region_kind, position);
    }

    fn adjust_declaration(
        &self,
        ctx: &mut PassContext,
        line: &str,
        symbols: &mut [Symbol],
        routine: Option<&Routine>,
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        self.inner.adjust_declaration(ctx, line, symbols, routine, region_kind, position)
    }

    fn import_specification(
        &self,
        symbols: &mut [Symbol],
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        self.inner.import_specification(symbols, region_kind, position)
    }

    fn declaration_end(
        &self,
        ctx: &mut PassContext,
        symbols: &[Symbol],
        routine: &Routine,
    ) -> Result<String> {
        let caps = self.inner.capabilities();
        let mut parts = vec!["real(8) :: hd_dbg_tmp".to_string()];
        if !caps.on_device {
            // The iteration counter lives on the host side only.
            parts.push("#ifndef GPU".to_string());
            parts.push("integer(4), save :: hd_dbg_iter = 0".to_string());
            parts.push("#endif".to_string());
            ctx.debug_iterator_declared = true;
        }
        parts.push(self.inner.declaration_end(ctx, symbols, routine)?);

        // Kernels cannot print to host stderr; announce entry only where
        // the dialect's routines run host code.
        let announce = if !caps.handles_device_data {
            false
        } else if caps.openacc_debug_prints {
            routine.position != Some(ParallelRegionPosition::Outside)
        } else {
            routine.position == Some(ParallelRegionPosition::Inside)
        };
        if announce {
            parts.push(format!("write(0, *) 'entering subroutine {}'", routine.name));
        }
        Ok(join_parts(parts))
    }

    fn routine_exit_point(
        &self,
        ctx: &mut PassContext,
        symbols: &[Symbol],
        is_kernel_caller: bool,
        is_routine_end: bool,
    ) -> Result<String> {
        let mut parts =
            vec![self.inner.routine_exit_point(ctx, symbols, is_kernel_caller, is_routine_end)?];
        if ctx.debug_iterator_declared {
            parts.push("#ifndef GPU\nhd_dbg_iter = hd_dbg_iter + 1\n#endif".to_string());
        }
        Ok(join_parts(parts))
    }

    fn parallel_region_begin(
        &self,
        ctx: &mut PassContext,
        routine: &Routine,
        symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        if self.emulated {
            return self.emulated_region_begin(routine, symbols, template);
        }
        self.inner.parallel_region_begin(ctx, routine, symbols, template)
    }

    fn parallel_region_end(
        &self,
        ctx: &mut PassContext,
        routine: &Routine,
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let kernel_number = ctx.kernel_number;
        let mut parts = vec![self.inner.parallel_region_end(ctx, routine, template)?];
        let caps = self.inner.capabilities();
        if caps.mixed_host_device_code_allowed {
            let label = if caps.kernel_prefixes_in_debug_print {
                kernel_routine_name(&routine.name, kernel_number)
            } else {
                routine.name.clone()
            };
            for symbol in routine.symbols.values() {
                parts.extend(self.value_dump(&label, symbol));
            }
        }
        Ok(join_parts(parts))
    }

    fn parallel_region_stub_begin(&self, ctx: &mut PassContext) -> String {
        self.inner.parallel_region_stub_begin(ctx)
    }

    fn parallel_region_stub_end(&self, ctx: &mut PassContext) -> String {
        self.inner.parallel_region_stub_end(ctx)
    }

    fn early_exit(&self, ctx: &PassContext, position: Option<ParallelRegionPosition>) -> String {
        self.inner.early_exit(ctx, position)
    }

    fn loop_preparation(&self) -> String {
        self.inner.loop_preparation()
    }

    fn iterator_definition(&self, domains: &[ParallelDomain]) -> Result<String> {
        self.inner.iterator_definition(domains)
    }

    fn guard_outside_region(&self, domains: &[ParallelDomain]) -> String {
        self.inner.guard_outside_region(domains)
    }

    fn iterators(&self, template: &ParallelRegionTemplate) -> Vec<String> {
        self.inner.iterators(template)
    }

    fn kernel_call_config(&self) -> String {
        self.inner.kernel_call_config()
    }

    fn kernel_call_preparation(
        &self,
        ctx: &mut PassContext,
        template: Option<&Arc<ParallelRegionTemplate>>,
        callee: Option<&Routine>,
    ) -> Result<String> {
        let mut parts = vec![self.inner.kernel_call_preparation(ctx, template, callee)?];
        let caps = self.inner.capabilities();
        if let Some(callee) = callee.filter(|_| caps.handles_device_data) {
            if caps.openacc_debug_prints {
                parts.push(format!("write(0, *) 'calling kernel {}'", callee.name));
            } else if let Some(template) =
                template.filter(|t| t.applies_to_arch(caps.target))
            {
                let sizes = DIM_NAMES
                    .iter()
                    .take(template.domains().len())
                    .map(|d| format!("hd_gridsize_{d}"))
                    .join(", ");
                parts.push(format!(
                    "write(0, *) 'calling kernel {} with grid size', {sizes}",
                    callee.name
                ));
            }
        }
        Ok(join_parts(parts))
    }

    fn kernel_call_post(&self, ctx: &mut PassContext, caller: &Routine, callee: &Routine) -> String {
        let mut parts = Vec::new();
        if callee.position == Some(ParallelRegionPosition::Within) {
            let caps = self.inner.capabilities();
            if caps.on_device && !caps.openacc_debug_prints {
                // Launches are asynchronous; wait before reading results.
                parts.push("hd_cuerr = cudaThreadSynchronize()".to_string());
                parts.push("hd_cuerr = cudaGetLastError()".to_string());
                parts.push(cuda_error_check(&format!(
                    "CUDA error when synchronizing after kernel {}",
                    callee.name
                )));
            }
            for symbol in callee.symbols.values() {
                if !symbol.is_array() || !symbol.intent.is_output() {
                    continue;
                }
                let in_caller = caller.lookup_symbol(&symbol.name).unwrap_or(symbol);
                parts.extend(self.value_dump(&callee.name, in_caller));
            }
        }
        parts.push(self.inner.kernel_call_post(ctx, caller, callee));
        join_parts(parts)
    }

    fn call_preparation_for_passed_symbol(
        &self,
        routine: &Routine,
        symbol_in_caller: &Symbol,
    ) -> String {
        self.inner.call_preparation_for_passed_symbol(routine, symbol_in_caller)
    }

    fn call_post_for_passed_symbol(&self, routine: &Routine, symbol_in_caller: &Symbol) -> String {
        self.inner.call_post_for_passed_symbol(routine, symbol_in_caller)
    }

    fn additional_parameters(
        &self,
        caller: &Routine,
        callee: &Routine,
        modules: &BTreeMap<String, Module>,
    ) -> Result<AdditionalParameters> {
        self.inner.additional_parameters(caller, callee, modules)
    }

    fn split_into_routines(
        &self,
        routine: Routine,
        peers: &BTreeMap<String, Routine>,
        modules: &BTreeMap<String, Module>,
    ) -> Result<Vec<SplitRoutine>> {
        self.inner.split_into_routines(routine, peers, modules)
    }
}

// ---------------------------------------------------------------------
// data tracing

/// What the trace statements do with the captured reference data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Write every captured array to `./datatrace/` (reference run).
    Record,
    /// Read the recorded data back and report mismatches.
    Compare,
}

/// Captures array values at routine entry and every exit point, keyed by
/// module, routine, symbol, direction and a per-routine invocation
/// counter, so a host reference run can be replayed against an
/// accelerated one.
pub struct TraceDecorator {
    inner: Box<dyn Backend>,
    mode: TraceMode,
}

impl TraceDecorator {
    pub fn new(inner: Box<dyn Backend>, mode: TraceMode) -> Self {
        Self { inner, mode }
    }

    fn temp_declaration(symbol: &Symbol) -> Option<String> {
        let prefix = symbol.declaration_prefix.as_deref()?;
        let purged = specline::purge_directives(
            prefix,
            &["intent", "dimension", "save", "optional", "parameter", "device", "allocatable"],
        );
        let purged = purged.trim_end().trim_end_matches("::").trim_end();
        let mut temp = symbol.clone();
        temp.name = trace_temp_name(&symbol.name);
        temp.is_automatic = false;
        temp.is_using_device_postfix = false;
        Some(format!("{purged} :: {}", temp.domain_representation()))
    }

    /// Capture or check one array against its stored reference.
    fn capture(
        &self,
        module_name: &str,
        routine_name: &str,
        symbol: &Symbol,
        direction: &str,
    ) -> Option<String> {
        let slice = match symbol.whole_array_slice() {
            Ok(slice) => slice,
            Err(error) => {
                tracing::warn!(symbol = %symbol.name, %error, "skipping trace capture");
                return None;
            }
        };
        let temp = trace_temp_name(&symbol.name);
        let mut lines = Vec::new();
        lines.push(format!(
            "write(hd_trace_path, '(A,I3.3,A)') \
             './datatrace/{module_name}_{routine_name}_{}_{direction}_', \
             hd_trace_counter, '.dat'",
            symbol.name
        ));
        match self.mode {
            TraceMode::Record => {
                lines.push(format!("{temp} = {slice}"));
                lines.push(format!("call write_to_file(hd_trace_path, {temp})"));
            }
            TraceMode::Compare => {
                if symbol.is_present && self.inner.capabilities().openacc_debug_prints {
                    lines.push(format!("!$acc update host({})", symbol.device_name()));
                }
                lines.push(format!("call read_from_file(hd_trace_path, {temp})"));
                lines.push(format!("if (any({temp} .NE. {slice})) then"));
                lines.push(format!(
                    "write(0, *) 'trace mismatch in {routine_name} for {} ({direction})'",
                    symbol.name
                ));
                lines.push("end if".to_string());
            }
        }
        Some(lines.join("\n"))
    }
}

fn trace_temp_name(name: &str) -> String {
    let mut temp = format!("hd_trace_{name}");
    temp.truncate(31);
    temp
}

fn traceable(symbol: &Symbol) -> bool {
    symbol.is_array()
        && !symbol.is_compacted
        && symbol.declaration_prefix.is_some()
        && !symbol.has_undecided_domain_sizes()
}

impl Backend for TraceDecorator {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn file_preamble(&self, filename: &str) -> String {
        self.inner.file_preamble(filename)
    }

    fn additional_includes(&self) -> String {
        join_parts(vec![self.inner.additional_includes(), "use hd_trace_helpers".to_string()])
    }

    fn routine_prefix(&self, routine: &Routine) -> String {
        self.inner.routine_prefix(routine)
    }

    fn call_invocation_prefix(&self, callee_name: &str) -> String {
        self.inner.call_invocation_prefix(callee_name)
    }

    fn adjust_callee_name(&self, caller: &Routine, callee: &Routine) -> String {
        self.inner.adjust_callee_name(caller, callee)
    }

    fn adjust_specification(&self, line: &str, directive: &str) -> String {
        self.inner.adjust_specification(line, directive)
    }

    fn adjust_data_specification_lines(&self, lines: Vec<String>, routine: &Routine) -> Vec<String> {
        self.inner.adjust_data_specification_lines(lines, routine)
    }

    fn update_symbol_device_state(
        &self,
        symbol: &mut Symbol,
        used_in_kernels: Option<&BTreeSet<String>>,
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) {
        self.inner.update_symbol_device_state(symbol, used_in_kernels, region_kind, position);
    }

    fn adjust_declaration(
        &self,
        ctx: &mut PassContext,
        line: &str,
        symbols: &mut [Symbol],
        routine: Option<&Routine>,
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        self.inner.adjust_declaration(ctx, line, symbols, routine, region_kind, position)
    }

    fn import_specification(
        &self,
        symbols: &mut [Symbol],
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        self.inner.import_specification(symbols, region_kind, position)
    }

    fn declaration_end(
        &self,
        ctx: &mut PassContext,
        symbols: &[Symbol],
        routine: &Routine,
    ) -> Result<String> {
        let traced: Vec<Symbol> = symbols.iter().filter(|s| traceable(s)).cloned().collect();
        let mut parts = Vec::new();
        if !traced.is_empty() {
            parts.push("character(len=256) :: hd_trace_path".to_string());
            parts.push("integer(4), save :: hd_trace_counter = 0".to_string());
            for symbol in &traced {
                parts.extend(Self::temp_declaration(symbol));
            }
        }
        tracing::debug!(
            routine = %routine.name,
            traced = ?traced.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "symbols declared for tracing"
        );
        parts.push(self.inner.declaration_end(ctx, symbols, routine)?);
        for symbol in &traced {
            if symbol.intent.is_input() {
                parts.extend(self.capture(&routine.module_name, &routine.name, symbol, "begin"));
            }
        }
        ctx.traced_symbols = traced;
        Ok(join_parts(parts))
    }

    fn routine_exit_point(
        &self,
        ctx: &mut PassContext,
        symbols: &[Symbol],
        is_kernel_caller: bool,
        is_routine_end: bool,
    ) -> Result<String> {
        let direction = if is_routine_end {
            "end".to_string()
        } else {
            format!("exit{}", ctx.early_return_count + 1)
        };
        let mut parts = Vec::new();
        for symbol in &ctx.traced_symbols {
            if !matches!(symbol.intent, Intent::In) {
                parts.extend(self.capture(&ctx.module_name, &ctx.routine_name, symbol, &direction));
            }
        }
        if !ctx.traced_symbols.is_empty() {
            parts.push("hd_trace_counter = hd_trace_counter + 1".to_string());
        }
        parts.push(self.inner.routine_exit_point(ctx, symbols, is_kernel_caller, is_routine_end)?);
        Ok(join_parts(parts))
    }

    fn parallel_region_begin(
        &self,
        ctx: &mut PassContext,
        routine: &Routine,
        symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        self.inner.parallel_region_begin(ctx, routine, symbols, template)
    }

    fn parallel_region_end(
        &self,
        ctx: &mut PassContext,
        routine: &Routine,
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        self.inner.parallel_region_end(ctx, routine, template)
    }

    fn parallel_region_stub_begin(&self, ctx: &mut PassContext) -> String {
        self.inner.parallel_region_stub_begin(ctx)
    }

    fn parallel_region_stub_end(&self, ctx: &mut PassContext) -> String {
        self.inner.parallel_region_stub_end(ctx)
    }

    fn early_exit(&self, ctx: &PassContext, position: Option<ParallelRegionPosition>) -> String {
        self.inner.early_exit(ctx, position)
    }

    fn loop_preparation(&self) -> String {
        self.inner.loop_preparation()
    }

    fn iterator_definition(&self, domains: &[ParallelDomain]) -> Result<String> {
        self.inner.iterator_definition(domains)
    }

    fn guard_outside_region(&self, domains: &[ParallelDomain]) -> String {
        self.inner.guard_outside_region(domains)
    }

    fn iterators(&self, template: &ParallelRegionTemplate) -> Vec<String> {
        self.inner.iterators(template)
    }

    fn kernel_call_config(&self) -> String {
        self.inner.kernel_call_config()
    }

    fn kernel_call_preparation(
        &self,
        ctx: &mut PassContext,
        template: Option<&Arc<ParallelRegionTemplate>>,
        callee: Option<&Routine>,
    ) -> Result<String> {
        self.inner.kernel_call_preparation(ctx, template, callee)
    }

    fn kernel_call_post(&self, ctx: &mut PassContext, caller: &Routine, callee: &Routine) -> String {
        self.inner.kernel_call_post(ctx, caller, callee)
    }

    fn call_preparation_for_passed_symbol(
        &self,
        routine: &Routine,
        symbol_in_caller: &Symbol,
    ) -> String {
        self.inner.call_preparation_for_passed_symbol(routine, symbol_in_caller)
    }

    fn call_post_for_passed_symbol(&self, routine: &Routine, symbol_in_caller: &Symbol) -> String {
        self.inner.call_post_for_passed_symbol(routine, symbol_in_caller)
    }

    fn additional_parameters(
        &self,
        caller: &Routine,
        callee: &Routine,
        modules: &BTreeMap<String, Module>,
    ) -> Result<AdditionalParameters> {
        self.inner.additional_parameters(caller, callee, modules)
    }

    fn split_into_routines(
        &self,
        routine: Routine,
        peers: &BTreeMap<String, Routine>,
        modules: &BTreeMap<String, Module>,
    ) -> Result<Vec<SplitRoutine>> {
        self.inner.split_into_routines(routine, peers, modules)
    }
}
