//! The lowering driver.
//!
//! Splitting runs first for every routine of a module so call sites can
//! resolve the kernels and host copies their callees turn into; the
//! produced routines are then rendered one by one, each with a fresh
//! [`PassContext`].

use std::collections::BTreeMap;

use snafu::ResultExt;

use heddle_lang::specline;
use heddle_model::{CallRegion, Module, ParallelRegionPosition, Region, Routine, Symbol};

use crate::common;
use crate::context::PassContext;
use crate::error::{InRoutineSnafu, Result};
use crate::sequential::SequentialBackend;
use crate::traits::{Backend, Capabilities, SplitDialect};

/// One finished routine of a generated file.
#[derive(Debug, Clone)]
pub struct RenderedRoutine {
    pub name: String,
    pub code: String,
}

/// Text the surrounding emitter prepends once per output file.
pub fn file_preamble(backend: &dyn Backend, filename: &str) -> String {
    backend.file_preamble(filename)
}

/// Lower all routines of one module to the backend's dialect.
pub fn lower_module(
    module: &Module,
    routines: Vec<Routine>,
    modules: &BTreeMap<String, Module>,
    backend: &dyn Backend,
) -> Result<Vec<RenderedRoutine>> {
    let callee_caps = backend.capabilities().callee_view();
    let mut inputs = routines;
    let mut peers: BTreeMap<String, Routine> = BTreeMap::new();
    for routine in &mut inputs {
        routine.callee_caps = Some(callee_caps);
        peers.insert(routine.name.clone(), routine.clone());
    }

    let mut produced = Vec::new();
    for routine in inputs {
        let split = backend.split_into_routines(routine, &peers, modules)?;
        for item in &split {
            peers.insert(item.routine.name.clone(), item.routine.clone());
        }
        produced.extend(split);
    }

    let host_copy_renderer = SequentialBackend::host_copy();
    let mut rendered = Vec::with_capacity(produced.len());
    for item in produced {
        let renderer: &dyn Backend = match item.dialect {
            SplitDialect::Native => backend,
            SplitDialect::HostCopy => &host_copy_renderer,
        };
        let name = item.routine.name.clone();
        let code = render_routine(renderer, &item.routine, &peers)
            .context(InRoutineSnafu { routine: name.as_str() })?;
        rendered.push(RenderedRoutine { name, code });
    }
    tracing::debug!(module = %module.name, routines = rendered.len(), "module lowered");
    Ok(rendered)
}

fn render_routine(
    backend: &dyn Backend,
    source: &Routine,
    peers: &BTreeMap<String, Routine>,
) -> Result<String> {
    let caps = backend.capabilities();
    let mut ctx = PassContext::for_routine(source);
    let mut routine = source.clone();
    let mut lines: Vec<String> = Vec::new();

    let head = if routine.arguments.is_empty() {
        format!("subroutine {}", routine.name)
    } else {
        format!("subroutine {}({})", routine.name, routine.arguments.join(", "))
    };
    let prefix = backend.routine_prefix(&routine);
    lines.push(if prefix.is_empty() { head } else { format!("{prefix} {head}") });

    let includes = backend.additional_includes();
    if !includes.is_empty() {
        lines.push(includes);
    }

    // Residency first: every later decision reads these flags.
    let region_kind = routine.region_kind();
    let position = routine.position;
    let usage = routine.kernel_usage().cloned();
    let mut symbols = std::mem::take(&mut routine.symbols);
    for symbol in symbols.values_mut() {
        backend.update_symbol_device_state(symbol, usage.as_ref(), region_kind, position);
    }
    routine.symbols = symbols;

    for import in routine.imports.clone() {
        let Some(item) = &import.item else {
            lines.push(common::import_statement(&import));
            continue;
        };
        let group_source = routine.symbol_key(&item.local).and_then(|key| {
            routine.symbols.get(&key).map(|symbol| (key, symbol.clone()))
        });
        let Some((key, symbol)) = group_source else {
            lines.push(common::import_statement(&import));
            continue;
        };
        let mut group = vec![symbol];
        let text = backend.import_specification(&mut group, region_kind, position)?;
        if let Some(updated) = group.into_iter().next() {
            routine.symbols.insert(key, updated);
        }
        if !text.trim().is_empty() {
            lines.push(text);
        }
    }

    for spec in routine.specification.clone() {
        if spec.symbol_names.is_empty() {
            let trimmed = spec.text.trim();
            let mut words = trimmed.split_whitespace();
            match (words.next(), words.next()) {
                (Some(directive), None) => {
                    let adjusted =
                        backend.adjust_specification(&spec.text, &directive.to_ascii_lowercase());
                    if !adjusted.is_empty() {
                        lines.push(adjusted);
                    }
                }
                _ => lines.extend(
                    backend.adjust_data_specification_lines(vec![spec.text.clone()], &routine),
                ),
            }
            continue;
        }
        let mut keys = Vec::new();
        let mut group = Vec::new();
        for name in &spec.symbol_names {
            if let Some(key) = routine.symbol_key(name)
                && let Some(symbol) = routine.symbols.get(&key)
            {
                keys.push(key);
                group.push(symbol.clone());
            }
        }
        if group.is_empty() {
            tracing::warn!(
                routine = %routine.name,
                line = %spec.text,
                "declared symbols not in scope, passing the line through"
            );
            lines.push(spec.text.trim_end().to_string());
            continue;
        }
        let adjusted = backend.adjust_declaration(
            &mut ctx,
            &spec.text,
            &mut group,
            Some(&routine),
            region_kind,
            position,
        )?;
        for (key, symbol) in keys.into_iter().zip(group) {
            routine.symbols.insert(key, symbol);
        }
        if !adjusted.trim().is_empty() {
            lines.push(adjusted);
        }
    }

    let symbol_snapshot: Vec<Symbol> = routine.symbols.values().cloned().collect();
    let end = backend.declaration_end(&mut ctx, &symbol_snapshot, &routine)?;
    if !end.is_empty() {
        lines.push(end);
    }

    let renderer = RegionRenderer {
        backend,
        caps,
        routine: &routine,
        peers,
        symbols: &symbol_snapshot,
    };
    renderer.render(&mut ctx, &routine.body, false, &mut lines)?;

    let exit =
        backend.routine_exit_point(&mut ctx, &symbol_snapshot, routine.is_kernel_caller, true)?;
    if !exit.is_empty() {
        lines.push(exit);
    }
    lines.push(format!("end subroutine {}", routine.name));
    tracing::debug!(routine = %routine.name, lines = lines.len(), "routine rendered");
    Ok(lines.join("\n"))
}

struct RegionRenderer<'a> {
    backend: &'a dyn Backend,
    caps: Capabilities,
    routine: &'a Routine,
    peers: &'a BTreeMap<String, Routine>,
    symbols: &'a [Symbol],
}

impl RegionRenderer<'_> {
    fn render(
        &self,
        ctx: &mut PassContext,
        regions: &[Region],
        in_parallel: bool,
        out: &mut Vec<String>,
    ) -> Result<()> {
        for region in regions {
            match region {
                Region::Code(code) => self.render_code(ctx, &code.lines, in_parallel, out)?,
                Region::Parallel(parallel) => {
                    if parallel.template.applies_to_arch(self.caps.target) {
                        let begin = self.backend.parallel_region_begin(
                            ctx,
                            self.routine,
                            self.symbols,
                            &parallel.template,
                        )?;
                        if !begin.is_empty() {
                            out.push(begin);
                        }
                        self.render(ctx, &parallel.body, true, out)?;
                        let end = self
                            .backend
                            .parallel_region_end(ctx, self.routine, &parallel.template)?;
                        if !end.is_empty() {
                            out.push(end);
                        }
                    } else {
                        // Blocks for another target still run, just once;
                        // the stub keeps their early exits working.
                        out.push(self.backend.parallel_region_stub_begin(ctx));
                        self.render(ctx, &parallel.body, true, out)?;
                        out.push(self.backend.parallel_region_stub_end(ctx));
                    }
                }
                Region::Call(call) => self.render_call(ctx, call, out)?,
            }
        }
        Ok(())
    }

    fn render_code(
        &self,
        ctx: &mut PassContext,
        code_lines: &[String],
        in_parallel: bool,
        out: &mut Vec<String>,
    ) -> Result<()> {
        for text in code_lines {
            let trimmed = text.trim();
            if trimmed.eq_ignore_ascii_case("return") {
                if in_parallel {
                    out.push(self.backend.early_exit(ctx, self.routine.position));
                } else {
                    let exit = self.backend.routine_exit_point(
                        ctx,
                        self.symbols,
                        self.routine.is_kernel_caller,
                        false,
                    )?;
                    if !exit.is_empty() {
                        out.push(exit);
                    }
                    out.push(text.clone());
                    ctx.early_return_count += 1;
                }
                continue;
            }
            if in_parallel && is_loop_start(trimmed) {
                let preparation = self.backend.loop_preparation();
                if !preparation.is_empty() {
                    out.push(preparation);
                }
            }
            out.push(text.clone());
        }
        Ok(())
    }

    fn render_call(
        &self,
        ctx: &mut PassContext,
        call: &CallRegion,
        out: &mut Vec<String>,
    ) -> Result<()> {
        let arguments = call.arguments.join(", ");
        let Some(callee) = self.peers.get(&call.callee) else {
            tracing::warn!(
                caller = %self.routine.name,
                callee = %call.callee,
                "call to unknown routine passed through"
            );
            let invocation = self.backend.call_invocation_prefix(&call.callee);
            out.push(invocation_line(&invocation, "", &arguments));
            return Ok(());
        };

        let callee_is_kernel = callee.position == Some(ParallelRegionPosition::Within);
        let adjusted = self.backend.adjust_callee_name(self.routine, callee);
        // A renamed call site targets a synthesized host or device
        // wrapper; only a call under the kernel's own name launches it.
        let launches_kernel = callee_is_kernel && adjusted == callee.name;
        let template = if launches_kernel { callee.first_parallel_template() } else { None };
        let preparation = self.backend.kernel_call_preparation(ctx, template, Some(callee))?;
        if !preparation.is_empty() {
            out.push(preparation);
        }
        for symbol in self.passed_symbols(call) {
            let text = self.backend.call_preparation_for_passed_symbol(self.routine, symbol);
            if !text.is_empty() {
                out.push(text);
            }
        }

        let config = if launches_kernel && self.caps.on_device {
            self.backend.kernel_call_config()
        } else {
            String::new()
        };
        let invocation = self.backend.call_invocation_prefix(&adjusted);
        out.push(invocation_line(&invocation, &config, &arguments));

        for symbol in self.passed_symbols(call) {
            let text = self.backend.call_post_for_passed_symbol(self.routine, symbol);
            if !text.is_empty() {
                out.push(text);
            }
        }
        if launches_kernel {
            let post = self.backend.kernel_call_post(ctx, self.routine, callee);
            if !post.is_empty() {
                out.push(post);
            }
        }
        Ok(())
    }

    fn passed_symbols<'b>(&'b self, call: &'b CallRegion) -> impl Iterator<Item = &'b Symbol> {
        call.arguments
            .iter()
            .filter_map(|argument| specline::first_identifier(argument))
            .filter_map(|name| self.routine.lookup_symbol(name))
    }
}

fn invocation_line(invocation: &str, config: &str, arguments: &str) -> String {
    if config.is_empty() && arguments.is_empty() {
        return invocation.to_string();
    }
    format!("{invocation}{config}({arguments})")
}

/// A `do` statement, with or without a construct label.
fn is_loop_start(line: &str) -> bool {
    let rest = match line.split_once(':') {
        Some((label, rest)) if specline::first_identifier(label.trim()) == Some(label.trim()) => {
            rest
        }
        _ => line,
    };
    rest.split_whitespace().next().is_some_and(|word| word.eq_ignore_ascii_case("do"))
}
