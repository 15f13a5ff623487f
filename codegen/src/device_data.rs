//! Declaration rewriting and boundary transfers for device-resident
//! data, shared by the backends that target an accelerator.

use heddle_lang::specline;
use heddle_model::{Intent, ParallelRegionPosition, RegionKind, Routine, Symbol};
use itertools::Itertools;
use snafu::ResultExt;

use crate::common::{array_size_guard, import_statements};
use crate::error::{ImportIntoDeviceCalleeSnafu, InDeclarationSnafu, Result, SpeclineSnafu};
use crate::residency;
use crate::traits::Capabilities;

/// Name postfix for device copies of derived types.
const DEVICE_TYPE_POSTFIX: &str = "_hddev";

/// Rewrite a `type(x)` attribute to the device copy of the derived type.
pub fn device_type_prefix(prefix: &str) -> String {
    specline::split_top_level(prefix, ',')
        .into_iter()
        .map(|component| {
            let component = component.trim();
            let renamed = specline::first_identifier(component)
                .filter(|head| head.eq_ignore_ascii_case("type"))
                .and_then(|_| specline::directive_argument(component, "type"))
                .map(|name| format!("type({name}{DEVICE_TYPE_POSTFIX})"));
            renamed.unwrap_or_else(|| component.to_string())
        })
        .join(", ")
}

fn is_derived_type(prefix: &str) -> bool {
    specline::directive_argument(prefix, "type").is_some()
}

/// Host and device whole-array slices of one symbol, postfix state aside.
fn transfer_pair(symbol: &Symbol) -> Result<(String, String)> {
    let mut host = symbol.clone();
    host.is_using_device_postfix = false;
    let mut device = symbol.clone();
    device.is_using_device_postfix = true;
    Ok((host.whole_array_slice()?, device.whole_array_slice()?))
}

/// Rewrite one declaration line for a device dialect.
///
/// Symbols are re-resolved to their post-transfer residency first where
/// the routine boundary implies a copy, then the line is adapted: scalars
/// become `value` or `device` dummies, device-resident arrays replace the
/// host declaration, transferred arrays keep it and gain a device shadow.
pub fn adjust_declaration(
    caps: &Capabilities,
    line: &str,
    symbols: &mut [Symbol],
    routine: Option<&Routine>,
    region_kind: RegionKind,
    position: Option<ParallelRegionPosition>,
) -> Result<String> {
    assert!(!symbols.is_empty(), "declaration line arrived without its symbols: {line}");

    let usage = routine.and_then(Routine::kernel_usage);
    for symbol in symbols.iter_mut() {
        if symbol.declaration_kind().is_module_array()
            || region_kind == RegionKind::KernelCallerDeclaration
            || symbol.is_to_be_transfered
        {
            residency::update_device_state(caps, symbol, usage, region_kind, position, true);
        }
    }
    let line_residency = residency::check_declaration_conformity(symbols)
        .context(InDeclarationSnafu { line: line.to_string() })?;

    let split = specline::split(line).context(SpeclineSnafu)?;
    let mut purge: Vec<&str> = vec!["intent", "dimension", "save", "optional"];
    if symbols[0].is_array() {
        purge.push("parameter");
    }
    if routine.is_some() {
        purge.push("public");
        purge.push("private");
    }
    let purged_prefix = specline::purge_directives(&split.prefix, &purge);
    let names = symbols.iter().map(|s| s.name.as_str()).join(", ");

    if symbols.iter().any(|s| s.is_compacted) {
        return Ok(format!("{purged_prefix} :: {names}"));
    }

    let representative = &symbols[0];
    let in_parallel = matches!(
        position,
        Some(ParallelRegionPosition::Within | ParallelRegionPosition::Outside)
    );
    let kernel_caller = region_kind == RegionKind::KernelCallerDeclaration;

    if !representative.is_array() {
        if !(position == Some(ParallelRegionPosition::Within) || representative.is_on_device) {
            return Ok(line.trim_end().to_string());
        }
        if representative.is_constant() {
            return Ok(line.trim_end().to_string());
        }
        let character = specline::contains_identifier(&split.prefix, "character");
        let written_back = representative.intent.is_output();
        if (!written_back || !caps.scalar_writes_in_kernels_allowed) && !character {
            let declared_intent =
                matches!(representative.intent, Intent::In | Intent::Out | Intent::InOut);
            let attribute = if representative.is_on_device && declared_intent {
                "device"
            } else {
                "value"
            };
            return Ok(format!(
                "{}, {} :: {}",
                device_type_prefix(&purged_prefix),
                attribute,
                names
            ));
        }
        if matches!(representative.intent, Intent::In | Intent::Out | Intent::InOut) {
            let device = if representative.is_on_device { "device, " } else { "" };
            return Ok(format!(
                "{}, {}intent({}) :: {}",
                purged_prefix, device, representative.intent, names
            ));
        }
        return Ok(line.trim_end().to_string());
    }

    if line_residency.already_on_device
        || (matches!(representative.intent, Intent::Unspecified | Intent::Local) && kernel_caller)
    {
        let directives = if in_parallel { purged_prefix.clone() } else { split.prefix.clone() };
        let directives = device_type_prefix(&directives);
        let declarations: Vec<String> = symbols
            .iter()
            .map(|s| format!("{directives}, device :: {}", s.domain_representation()))
            .collect();
        return Ok(declarations.join("\n"));
    }

    if line_residency.copy_here || kernel_caller || region_kind == RegionKind::ModuleDeclaration {
        let attribute = if is_derived_type(&split.prefix) { "managed" } else { "device" };
        let mut rendered = vec![line.trim_end().to_string()];
        for symbol in symbols.iter() {
            let mut shadow = symbol.clone();
            shadow.is_using_device_postfix = true;
            rendered.push(format!(
                "{}, {} :: {}",
                device_type_prefix(&purged_prefix),
                attribute,
                shadow.domain_representation()
            ));
        }
        return Ok(rendered.join("\n"));
    }

    Ok(line.trim_end().to_string())
}

/// Device allocations and host-to-device copies at the end of the
/// declaration section.
pub fn declaration_end_transfers(symbols: &[Symbol], routine: &Routine) -> Result<String> {
    let mut lines: Vec<String> = Vec::new();
    for symbol in symbols {
        if !symbol.is_array() || !symbol.is_on_device || symbol.is_present {
            continue;
        }
        if !(routine.is_kernel_caller || symbol.is_to_be_transfered) {
            continue;
        }
        let sizes_resolved = symbol.domain_sizes().all(|size| !size.contains(':'));
        if symbol.has_undecided_domain_sizes() && sizes_resolved {
            tracing::debug!(
                symbol.name = %symbol.name,
                routine = %routine.name,
                "allocating device copy at routine entry"
            );
            let mut device = symbol.clone();
            device.is_using_device_postfix = true;
            lines.push(array_size_guard(symbol));
            lines.push(format!("allocate({})", device.allocation_representation()));
            lines.push("end if".to_string());
        }
        if symbol.intent.is_input() || symbol.declaration_kind().is_module_array() {
            if sizes_resolved {
                let (host, device) = transfer_pair(symbol)?;
                lines.push(array_size_guard(symbol));
                lines.push(format!("{device} = {host}"));
                lines.push("end if".to_string());
            }
        } else {
            lines.push(format!("{} = 0", symbol.whole_array_slice()?));
        }
    }
    Ok(lines.join("\n"))
}

/// Device-to-host copies and deallocations mirroring
/// [`declaration_end_transfers`] at a routine exit.
pub fn routine_exit_transfers(symbols: &[Symbol], is_kernel_caller: bool) -> Result<String> {
    let mut lines: Vec<String> = Vec::new();
    for symbol in symbols {
        if !symbol.is_array() || !symbol.is_on_device || symbol.is_present {
            continue;
        }
        if !(is_kernel_caller || symbol.is_to_be_transfered) {
            continue;
        }
        let sizes_resolved = symbol.domain_sizes().all(|size| !size.contains(':'));
        if (symbol.intent.is_output() || symbol.declaration_kind().is_module_array())
            && sizes_resolved
        {
            let (host, device) = transfer_pair(symbol)?;
            lines.push(array_size_guard(symbol));
            lines.push(format!("{host} = {device}"));
            lines.push("end if".to_string());
        }
        if symbol.has_undecided_domain_sizes() && sizes_resolved {
            let mut device = symbol.clone();
            device.is_using_device_postfix = true;
            lines.push(array_size_guard(symbol));
            lines.push(format!("deallocate({})", device.device_name()));
            lines.push("end if".to_string());
        }
    }
    Ok(lines.join("\n"))
}

/// Render the `use` specification for imported symbols in a device
/// dialect: next to the host import, device-resident data needs its
/// device copy imported as well, and routines running inside kernels can
/// import nothing at all.
pub fn import_specification(
    caps: &Capabilities,
    symbols: &mut [Symbol],
    region_kind: RegionKind,
    position: Option<ParallelRegionPosition>,
) -> Result<String> {
    if symbols.is_empty() {
        return Ok(String::new());
    }
    for symbol in symbols.iter_mut() {
        if symbol.is_to_be_transfered
            || symbol.declaration_kind().is_module_array()
            || region_kind == RegionKind::KernelCallerDeclaration
        {
            residency::update_device_state(caps, symbol, None, RegionKind::Other, position, true);
        }
    }

    // Type parameters that do not size arrays stay plain host imports.
    if symbols.iter().all(|s| s.is_type_parameter && !s.is_dimension_parameter) {
        return Ok(import_statements(symbols, false));
    }
    match position {
        Some(ParallelRegionPosition::Within) => return Ok(String::new()),
        Some(ParallelRegionPosition::Outside) => {
            return ImportIntoDeviceCalleeSnafu {
                symbols: symbols.iter().map(|s| s.name.as_str()).join(", "),
                scope: symbols[0].scope.scope_name().to_string(),
            }
            .fail();
        }
        _ => {}
    }

    let mut rendered: Vec<String> = Vec::new();
    for symbol in symbols.iter() {
        let group = std::slice::from_ref(symbol);
        if symbol.is_host_symbol() {
            rendered.push(import_statements(group, false));
            continue;
        }
        if symbol.is_present
            || symbol.is_to_be_transfered
            || region_kind == RegionKind::KernelCallerDeclaration
            || symbol.declaration_kind().is_module_array()
        {
            rendered.push(import_statements(group, true));
        }
        rendered.push(import_statements(group, false));
    }
    Ok(rendered.into_iter().filter(|l| !l.is_empty()).join("\n"))
}
