//! Device-residency decisions.
//!
//! Residency is decided per symbol from its annotation attributes, its
//! declaration context and the routine's position relative to parallel
//! regions, then cross-checked per declaration line: every symbol a line
//! declares must agree, since the line can only be rewritten one way.

use std::collections::BTreeSet;

use itertools::Itertools;
use snafu::ensure;

use heddle_model::{DependencyAttribute, Intent, ParallelRegionPosition, RegionKind, Symbol};

use crate::error::{
    ConflictingResidencyDeclarationSnafu, MixedResidencyDeclarationSnafu, Result,
};
use crate::traits::Capabilities;

/// Residency facts shared by every symbol on one declaration line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineResidency {
    /// The caller guarantees the data already lives on the device.
    pub already_on_device: bool,
    /// The host/device copy happens at this routine's boundary.
    pub copy_here: bool,
    /// Pinned to the host.
    pub on_host: bool,
}

fn joined_names(symbols: &[Symbol]) -> String {
    symbols.iter().map(|s| s.name.as_str()).join(", ")
}

/// Fold one flag over a declaration line's symbols; all must agree.
fn uniform(
    symbols: &[Symbol],
    attribute: &str,
    flag: impl Fn(&Symbol) -> bool,
) -> Result<bool> {
    let mut values = symbols.iter().map(&flag);
    let Some(first) = values.next() else {
        return Ok(false);
    };
    ensure!(
        values.all(|value| value == first),
        MixedResidencyDeclarationSnafu { attribute, symbols: joined_names(symbols) }
    );
    Ok(first)
}

/// Verify that one declaration line's symbols share their residency
/// attributes and that no two mutually exclusive attributes are set.
pub fn check_declaration_conformity(symbols: &[Symbol]) -> Result<LineResidency> {
    let already_on_device =
        uniform(symbols, &DependencyAttribute::Present.to_string(), |s| s.is_present)?;
    let copy_here = uniform(symbols, &DependencyAttribute::TransferHere.to_string(), |s| {
        s.is_to_be_transfered
    })?;
    let on_host =
        uniform(symbols, &DependencyAttribute::Host.to_string(), |s| s.is_host_symbol())?;
    uniform(symbols, "type parameter", |s| s.is_type_parameter)?;

    let exclusions = [
        (copy_here, DependencyAttribute::TransferHere, already_on_device, DependencyAttribute::Present),
        (copy_here, DependencyAttribute::TransferHere, on_host, DependencyAttribute::Host),
        (already_on_device, DependencyAttribute::Present, on_host, DependencyAttribute::Host),
    ];
    for (first_set, first, second_set, second) in exclusions {
        ensure!(
            !(first_set && second_set),
            ConflictingResidencyDeclarationSnafu {
                first: first.to_string(),
                second: second.to_string(),
                symbols: joined_names(symbols),
            }
        );
    }
    Ok(LineResidency { already_on_device, copy_here, on_host })
}

/// Recompute one symbol's residency flags for a device dialect.
///
/// Deterministic in its inputs and idempotent: re-running with the same
/// arguments leaves the symbol unchanged. `post_transfer` asks for the
/// state after the boundary copy has happened instead of before it.
pub fn update_device_state(
    caps: &Capabilities,
    symbol: &mut Symbol,
    used_in_kernels: Option<&BTreeSet<String>>,
    region_kind: RegionKind,
    position: Option<ParallelRegionPosition>,
    post_transfer: bool,
) {
    if symbol.is_compacted {
        return;
    }
    if symbol.is_host_symbol() && caps.mixed_host_device_code_allowed {
        return;
    }
    let in_parallel = matches!(
        position,
        Some(ParallelRegionPosition::Within | ParallelRegionPosition::Outside)
    );
    if in_parallel {
        symbol.is_to_be_transfered = false;
    }

    if !symbol.is_array() {
        if in_parallel && symbol.intent.pass_by_value_safe() {
            symbol.is_on_device = true;
        }
        return;
    }

    if in_parallel {
        symbol.is_present = true;
    }
    let kernel_caller = region_kind == RegionKind::KernelCallerDeclaration;
    if symbol.declared_host() && region_kind == RegionKind::ModuleDeclaration {
        symbol.is_using_device_postfix = true;
        symbol.is_on_device = false;
    } else if symbol.declared_host()
        && kernel_caller
        && used_in_kernels.is_none_or(|used| used.contains(&symbol.name))
    {
        symbol.is_using_device_postfix = true;
        symbol.is_on_device = true;
    } else if symbol.declared_host() {
        symbol.is_using_device_postfix = false;
        symbol.is_on_device = false;
    } else if symbol.declaration_kind().is_module_array() {
        symbol.is_using_device_postfix = true;
        symbol.is_on_device = true;
    } else if symbol.is_present
        || (matches!(symbol.intent, Intent::Unspecified | Intent::Local) && kernel_caller)
    {
        symbol.is_using_device_postfix = false;
        symbol.is_on_device = true;
    } else if symbol.is_to_be_transfered || kernel_caller {
        symbol.is_using_device_postfix = post_transfer;
        symbol.is_on_device = post_transfer;
    }
    tracing::trace!(
        symbol.name = %symbol.name,
        on_device = symbol.is_on_device,
        device_postfix = symbol.is_using_device_postfix,
        present = symbol.is_present,
        "device residency updated"
    );
}
