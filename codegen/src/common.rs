//! Text helpers shared by several backends.

use heddle_lang::arch::ArchTag;
use heddle_lang::domain::ParallelRegionTemplate;
use heddle_lang::specline;
use heddle_model::symbol::DEVICE_POSTFIX;
use heddle_model::{Import, Routine, Symbol, SymbolOrigin};

/// Identifier length cap of the emitted dialect.
const MAX_IDENTIFIER_LEN: usize = 31;

/// Preprocessor names for the default kernel block extents, x/y/z order.
pub const BLOCK_SIZE_NAMES: [&str; 3] =
    ["HD_BLOCK_SIZE_X", "HD_BLOCK_SIZE_Y", "HD_BLOCK_SIZE_Z"];

/// Append `postfix`, truncating the base name so the result stays within
/// the identifier limit.
fn with_postfix(base: &str, postfix: &str) -> String {
    let keep = MAX_IDENTIFIER_LEN.saturating_sub(postfix.len());
    let base: String = base.chars().take(keep).collect();
    format!("{base}{postfix}")
}

/// Name of the synthesized host copy of a routine.
pub fn host_routine_name(name: &str) -> String {
    with_postfix(name, "_hdhost")
}

/// Name of the device version of a routine.
pub fn device_routine_name(name: &str) -> String {
    with_postfix(name, "_hddev")
}

/// Name of the `number`th kernel extracted from a routine.
pub fn kernel_routine_name(name: &str, number: usize) -> String {
    with_postfix(name, &format!("_hdk{number}"))
}

/// Render one `use` relationship back to source text.
pub fn import_statement(import: &Import) -> String {
    match &import.item {
        None => format!("use {}", import.module),
        Some(item) if item.local == item.source => {
            format!("use {}, only: {}", import.module, item.local)
        }
        Some(item) => format!("use {}, only: {} => {}", import.module, item.local, item.source),
    }
}

/// `use` lines importing `symbols` from their source modules, one line per
/// symbol. With `device_version`, the device copies are imported instead
/// (both local and source names carry the device postfix).
pub fn import_statements(symbols: &[Symbol], device_version: bool) -> String {
    let mut lines: Vec<String> = Vec::new();
    for symbol in symbols {
        let SymbolOrigin::ForeignModule { module, source_name } = &symbol.origin else {
            continue;
        };
        let source = source_name.as_deref().unwrap_or(&symbol.name);
        let (local, source) = if device_version {
            (
                format!("{}{}", symbol.name, DEVICE_POSTFIX),
                format!("{source}{DEVICE_POSTFIX}"),
            )
        } else {
            (symbol.name.clone(), source.to_string())
        };
        let line = if local == source {
            format!("use {module}, only: {local}")
        } else {
            format!("use {module}, only: {local} => {source}")
        };
        if !lines.contains(&line) {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Declaration for the iterators the routine's parallel regions use on
/// `target`, empty when none apply.
pub fn iterator_declaration(routine: &Routine, target: ArchTag) -> String {
    let mut names: Vec<&str> = Vec::new();
    let templates =
        routine.templates.iter().chain(routine.parallel_regions().map(|p| &p.template));
    for template in templates {
        if !template.applies_to_arch(target) {
            continue;
        }
        for name in template.domain_names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        return String::new();
    }
    format!("integer(4) :: {}", names.join(", "))
}

/// Per-dimension launch extents: template overrides where given, the
/// preprocessor defaults otherwise.
pub fn block_size_specs(template: &ParallelRegionTemplate) -> [String; 3] {
    [
        template.block_size_spec(0, BLOCK_SIZE_NAMES[0]),
        template.block_size_spec(1, BLOCK_SIZE_NAMES[1]),
        template.block_size_spec(2, BLOCK_SIZE_NAMES[2]),
    ]
}

/// Guard against operating on zero-sized arrays, closed with `end if` by
/// the caller.
pub fn array_size_guard(symbol: &Symbol) -> String {
    format!("if (size({}) .GT. 0) then", symbol.name)
}

pub fn is_use_statement(line: &str) -> bool {
    specline::first_identifier(line).is_some_and(|id| id.eq_ignore_ascii_case("use"))
}
