//! Kernel extraction for backends that compile parallel regions as
//! separately launched routines.
//!
//! One routine with parallel regions becomes a launcher (the original
//! body with regions replaced by calls), one kernel routine per region,
//! and optionally a host-dialect copy for host-only call paths. Kernels
//! cannot see module or caller scope, so every value they need beyond
//! the written argument list is resolved here and appended as an
//! additional parameter.

use std::collections::{BTreeMap, BTreeSet};

use snafu::{OptionExt, ResultExt};

use heddle_lang::arch::ArchTag;
use heddle_lang::specline;
use heddle_model::{
    Access, CallRegion, DeclarationKind, DeclarationScope, DependencyDef, Import, Module,
    ParallelRegionPosition, Region, RegionKind, Routine, SpecLine, Symbol, SymbolOrigin,
    mark_type_parameter_among,
};

use crate::common::{
    device_routine_name, host_routine_name, is_use_statement, kernel_routine_name,
};
use crate::error::{IllegalCallArgumentSnafu, ModelSnafu, Result, UnknownCalleeModuleSnafu};
use crate::residency;
use crate::traits::{AdditionalParameters, Capabilities, SplitRoutine};

/// Split one routine into the routines a kernel-extracting backend
/// compiles it as: `[launcher, host copy?, kernels...]`.
///
/// Routines without parallel regions of their own pass through (plus
/// their host copy where one is required).
pub fn split_kernel_routines(
    caps: &Capabilities,
    mut routine: Routine,
    peers: &BTreeMap<String, Routine>,
    modules: &BTreeMap<String, Module>,
) -> Result<Vec<SplitRoutine>> {
    let host = routine.is_used_in_host_only_context.then(|| host_shell(&routine, peers));
    if host.is_some() {
        // Kernel and launcher names derive from the device name.
        routine = routine.clone_renamed(device_routine_name(&routine.name));
    }

    if routine.position != Some(ParallelRegionPosition::Within) {
        let mut produced = vec![SplitRoutine::native(routine)];
        produced.extend(host.map(SplitRoutine::host_copy));
        return Ok(produced);
    }

    let source_body = std::mem::take(&mut routine.body);
    let mut kernels: Vec<Routine> = Vec::new();
    let mut launcher_body: Vec<Region> = Vec::new();
    for region in source_body {
        match region {
            Region::Parallel(parallel) if parallel.template.applies_to_arch(ArchTag::Gpu) => {
                let kernel_name = kernel_routine_name(&routine.name, kernels.len());
                let mut kernel = routine.clone_renamed(&kernel_name);
                kernel.position = Some(ParallelRegionPosition::Within);
                kernel.is_kernel_caller = false;
                kernel.templates = vec![parallel.template.clone()];
                kernel.body = vec![Region::Parallel(parallel)];
                filter_kernel_specification(&mut kernel);
                filter_kernel_imports(&mut kernel);

                let additional = resolve_additional_parameters(&routine, &kernel, modules)?;
                let mut call_arguments = routine.arguments.clone();
                for symbol in additional.iter() {
                    kernel.arguments.push(symbol.name_in_scope(false));
                    let mut dummy = rescoped_to(symbol.clone(), &kernel);
                    dummy.is_argument = true;
                    kernel.specification.push(SpecLine::with_symbols(
                        dummy.automatic_declaration_line().context(ModelSnafu)?,
                        [dummy.name.clone()],
                    ));
                    kernel.insert_symbol(dummy);

                    // The launcher names the value as it looks after the
                    // boundary transfers have run.
                    let mut passed = symbol.clone();
                    residency::update_device_state(
                        caps,
                        &mut passed,
                        routine.kernel_usage(),
                        RegionKind::KernelCallerDeclaration,
                        Some(ParallelRegionPosition::Inside),
                        true,
                    );
                    call_arguments.push(passed.name_in_scope(true));
                }
                for symbol in additional.imports {
                    let import = launcher_import(&symbol);
                    if !routine.imports.contains(&import) {
                        routine.imports.push(import);
                    }
                    routine.insert_symbol(rescoped_to(symbol, &routine));
                }
                launcher_body.push(Region::Call(CallRegion {
                    callee: kernel_name,
                    arguments: call_arguments,
                }));
                kernels.push(kernel);
            }
            Region::Parallel(parallel) => {
                launcher_body.extend(parallel.body);
            }
            other => launcher_body.push(other),
        }
    }
    routine.body = launcher_body;
    routine.position = Some(ParallelRegionPosition::Inside);
    routine.is_kernel_caller = true;
    routine.templates.clear();

    let mut produced = vec![SplitRoutine::native(routine)];
    produced.extend(host.map(SplitRoutine::host_copy));
    produced.extend(kernels.into_iter().map(SplitRoutine::native));
    Ok(produced)
}

/// Host-dialect copy of a routine that is reachable from host-only call
/// paths. When a callee only exists on the device, the copy degrades to
/// an abort stub.
fn host_shell(routine: &Routine, peers: &BTreeMap<String, Routine>) -> Routine {
    let mut shell = routine.clone_renamed(host_routine_name(&routine.name));
    for region in &routine.body {
        let Region::Call(call) = region else { continue };
        let Some(callee_caps) = peers.get(&call.callee).and_then(|callee| callee.callee_caps)
        else {
            continue;
        };
        if callee_caps.on_device && !callee_caps.supports_host_only_copies {
            shell.reset_body();
            shell.push_region(Region::code([
                format!(
                    "write(0, *) 'Error: {} does not have a callable host version - aborting'",
                    shell.name
                ),
                "stop 2".to_string(),
            ]));
            shell.position = None;
            shell.templates.clear();
            return shell;
        }
    }
    if routine.position == Some(ParallelRegionPosition::Within)
        && routine
            .parallel_regions()
            .next()
            .is_some_and(|region| !region.template.applies_to_arch(ArchTag::Gpu))
    {
        shell.position = None;
    }
    shell
}

/// Re-file a resolved symbol under the scope of the routine that now
/// carries it, so scoped lookups find it there.
fn rescoped_to(mut symbol: Symbol, routine: &Routine) -> Symbol {
    symbol.scope = DeclarationScope::Routine {
        routine: routine.name.clone(),
        module: routine.module_name.clone(),
    };
    symbol
}

fn launcher_import(symbol: &Symbol) -> Import {
    let (module, source_name) = match &symbol.origin {
        SymbolOrigin::ForeignModule { module, source_name } => (module.clone(), source_name.clone()),
        _ => (symbol.scope.module_name().to_string(), None),
    };
    match source_name {
        Some(source) if source != symbol.name => Import::renamed(module, &symbol.name, source),
        _ => Import::named(module, &symbol.name),
    }
}

/// Drop `use` text lines the front end attached no symbols to; the
/// import list decides what an extracted kernel may import.
fn filter_kernel_specification(kernel: &mut Routine) {
    kernel
        .specification
        .retain(|line| !line.symbol_names.is_empty() || !is_use_statement(&line.text));
}

/// Keep whole-module imports, imports of data the kernel knows, and
/// imports of routines it still calls; everything else is caller scope
/// the kernel lost.
fn filter_kernel_imports(kernel: &mut Routine) {
    let wholly_imported: BTreeSet<&str> = kernel
        .imports
        .iter()
        .filter(|import| import.item.is_none())
        .map(|import| import.module.as_str())
        .collect();
    let called = called_names(&kernel.body);
    let kept = kernel
        .imports
        .iter()
        .filter(|import| {
            let Some(item) = &import.item else { return true };
            wholly_imported.contains(import.module.as_str())
                || kernel.lookup_symbol(&item.local).is_some()
                || kernel.lookup_symbol(&item.source).is_some()
                || called.contains(&item.local)
                || called.contains(&item.source)
        })
        .cloned()
        .collect();
    kernel.imports = kept;
}

fn called_names(regions: &[Region]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_called(regions, &mut names);
    names
}

fn collect_called(regions: &[Region], names: &mut BTreeSet<String>) {
    for region in regions {
        match region {
            Region::Call(call) => {
                names.insert(call.callee.clone());
            }
            Region::Parallel(parallel) => collect_called(&parallel.body, names),
            Region::Code(_) => {}
        }
    }
}

/// Resolve the symbols `callee` needs beyond its written argument list.
///
/// Dependency definitions of the callee's module scope are walked first,
/// then the callee's own; a routine-scope resolution of the same name
/// absorbs the module-scope one. Each surviving symbol is classified by
/// how the launching scope obtains it.
pub fn resolve_additional_parameters(
    caller: &Routine,
    callee: &Routine,
    modules: &BTreeMap<String, Module>,
) -> Result<AdditionalParameters> {
    if callee.position != Some(ParallelRegionPosition::Within) || callee.templates.is_empty() {
        return Ok(AdditionalParameters::default());
    }
    let module = modules.get(&callee.module_name).context(UnknownCalleeModuleSnafu {
        callee: callee.name.clone(),
        module: callee.module_name.clone(),
    })?;

    let mut argument_names: BTreeSet<String> = BTreeSet::new();
    for argument in &callee.arguments {
        let name = specline::first_identifier(argument)
            .context(IllegalCallArgumentSnafu { argument: argument.clone() })?;
        argument_names.insert(name.to_string());
    }

    let module_scope = DeclarationScope::Module { module: callee.module_name.clone() };
    let (module_imports, module_declarations, module_dummies) = classify_scope_definitions(
        caller,
        callee,
        modules,
        &module.dependency_defs,
        &module_scope,
        &argument_names,
    )?;
    if !module_dummies.is_empty() {
        let names: Vec<&str> = module_dummies.iter().map(|s| s.name.as_str()).collect();
        panic!("module-scope definitions resolved to kernel dummies: {}", names.join(", "));
    }
    let mut module_imports = index_by_scoped_name(module_imports);
    let mut module_declarations = index_by_scoped_name(module_declarations);

    let routine_scope = DeclarationScope::Routine {
        routine: callee.name.clone(),
        module: callee.module_name.clone(),
    };
    let (mut imports, mut declarations, mut dummies) = classify_scope_definitions(
        caller,
        callee,
        modules,
        &callee.dependency_defs,
        &routine_scope,
        &argument_names,
    )?;
    merge_indexed(&mut imports, &mut module_imports);
    merge_indexed(&mut declarations, &mut module_declarations);
    merge_indexed(&mut dummies, &mut module_imports);
    merge_indexed(&mut dummies, &mut module_declarations);

    imports.extend(module_imports.into_values());
    declarations.extend(module_declarations.into_values());
    imports.sort_by_key(|s| s.name_in_scope(false));
    declarations.sort_by_key(|s| s.name_in_scope(false));
    dummies.sort_by_key(|s| s.name_in_scope(false));
    Ok(AdditionalParameters { imports, declarations, dummies })
}

type ClassifiedSymbols = (Vec<Symbol>, Vec<Symbol>, Vec<Symbol>);

fn classify_scope_definitions(
    caller: &Routine,
    callee: &Routine,
    modules: &BTreeMap<String, Module>,
    definitions: &[DependencyDef],
    scope: &DeclarationScope,
    argument_names: &BTreeSet<String>,
) -> Result<ClassifiedSymbols> {
    let mut imports = Vec::new();
    let mut declarations = Vec::new();
    let mut dummies = Vec::new();
    for def in definitions {
        let name = def.entry.name.as_str();
        if argument_names.contains(name) {
            // Slices passed under different names are the author's
            // responsibility.
            continue;
        }
        let mut symbol = match caller.lookup_symbol(name) {
            Some(found) => found.clone(),
            None => {
                tracing::debug!(
                    symbol.name = name,
                    scope = scope.scope_name(),
                    caller = %caller.name,
                    "additional parameter not in caller scope, loading freshly"
                );
                let mut fresh = Symbol::new(name, def.template.clone(), scope.clone());
                fresh.load_dependency_attributes(&def.entry);
                fresh
                    .load_routine_context(&callee.name, callee.position, &callee.templates)
                    .context(ModelSnafu)?;
                mark_type_parameter_among(&mut fresh, caller.symbols.values());
                fresh
            }
        };
        if symbol.is_type_parameter && !symbol.is_dimension_parameter {
            continue;
        }
        if symbol.is_dummy_for(scope.scope_name()) {
            continue;
        }
        if callee.used_symbol_names.is_some() && !callee.may_use_symbol(name) {
            continue;
        }
        // The raw host annotation decides here; present/transfer state is
        // resolved separately per routine.
        if symbol.declared_host()
            && !caller.uses_symbol_in_kernels(name)
            && !callee.uses_symbol_in_kernels(name)
        {
            continue;
        }
        if !symbol.is_array()
            && !symbol.is_dimension_parameter
            && callee.first_access_of_scalar(name) == Some(Access::Write)
        {
            continue;
        }
        let kind = symbol.declaration_kind();
        let module_scoped = kind.is_module_scoped();
        if !symbol.is_array() && !module_scoped && symbol.is_constant() {
            continue;
        }
        let source_module = match &symbol.origin {
            SymbolOrigin::ForeignModule { module, .. } => Some(module.clone()),
            SymbolOrigin::CurrentModule => Some(symbol.scope.module_name().to_string()),
            SymbolOrigin::RoutineLocal => None,
        };
        if module_scoped && source_module.as_deref() == Some(caller.module_name.as_str()) {
            declarations.push(symbol);
        } else if symbol.analysis.as_ref().is_some_and(|a| a.is_module_symbol) || module_scoped {
            if let Some(source) = source_module.as_deref()
                && source != callee.module_name
            {
                let lookup = match &symbol.origin {
                    SymbolOrigin::ForeignModule { source_name: Some(source_name), .. } => {
                        source_name.clone()
                    }
                    _ => symbol.name.clone(),
                };
                let entry = modules.get(source).and_then(|m| m.entry_named(&lookup));
                symbol.load_import(source, entry.map(|def| &def.entry));
            }
            imports.push(symbol);
        } else if matches!(
            kind,
            DeclarationKind::LocalArray | DeclarationKind::LocalScalar | DeclarationKind::OtherScalar
        ) {
            dummies.push(symbol);
        }
    }
    Ok((imports, declarations, dummies))
}

fn index_by_scoped_name(symbols: Vec<Symbol>) -> BTreeMap<String, Symbol> {
    symbols.into_iter().map(|s| (s.name_in_scope(false), s)).collect()
}

/// Absorb module-scope resolutions into same-named routine-scope ones.
fn merge_indexed(primary: &mut [Symbol], index: &mut BTreeMap<String, Symbol>) {
    for symbol in primary {
        if let Some(other) = index.remove(&symbol.name_in_scope(false)) {
            symbol.merge(&other);
        }
    }
}
