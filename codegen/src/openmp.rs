//! OpenMP lowering: the host loop nests under a work-sharing directive.

use heddle_lang::domain::ParallelRegionTemplate;
use heddle_model::{DimTag, Routine, Symbol};

use crate::common::iterator_declaration;
use crate::context::PassContext;
use crate::error::Result;
use crate::sequential::{loop_nest_begin, loop_nest_end};
use crate::traits::{Backend, Capabilities};

/// Arrays the directive must list as shared: everything dimensioned over
/// the region's domains (plus module arrays), since `firstprivate` would
/// copy them per thread.
fn shared_symbols(symbols: &[Symbol], template: &ParallelRegionTemplate) -> Vec<String> {
    let domain_names: Vec<&str> = template.domain_names().collect();
    let mut names: Vec<String> = symbols
        .iter()
        .filter(|s| s.is_array() && !s.name.contains('%'))
        .filter(|s| {
            s.declaration_kind().is_module_array()
                || s.domains().iter().any(|d| match &d.tag {
                    DimTag::Domain(name) => domain_names.contains(&name.as_str()),
                    DimTag::Inactive => false,
                })
        })
        .map(|s| s.name_in_scope(false))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Multicore host backend.
#[derive(Debug, Clone)]
pub struct OpenMpBackend {
    caps: Capabilities,
}

impl OpenMpBackend {
    pub fn new() -> Self {
        let mut caps = Capabilities::host_defaults();
        caps.architectures = &["openmp", "multicore"];
        Self { caps }
    }
}

impl Default for OpenMpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for OpenMpBackend {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn declaration_end(
        &self,
        _ctx: &mut PassContext,
        _symbols: &[Symbol],
        routine: &Routine,
    ) -> Result<String> {
        Ok(iterator_declaration(routine, self.caps.target))
    }

    fn parallel_region_begin(
        &self,
        ctx: &mut PassContext,
        _routine: &Routine,
        symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let mut directive = format!(
            "!$OMP PARALLEL DO SIMD DEFAULT(firstprivate) COLLAPSE({}) ",
            template.domains().len()
        );
        let reduction = template.reduction_clause().to_uppercase();
        if !reduction.is_empty() {
            directive.push_str(&reduction);
            directive.push(' ');
        }
        let shared = shared_symbols(symbols, template);
        if !shared.is_empty() {
            directive.push_str(&format!("SHARED({})", shared.join(", ")));
        }
        Ok(format!("{directive}\n{}", loop_nest_begin(ctx, template)))
    }

    fn parallel_region_end(
        &self,
        ctx: &mut PassContext,
        _routine: &Routine,
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let closed = loop_nest_end(ctx, template);
        ctx.kernel_number += 1;
        Ok(format!("{closed}\n!$OMP END PARALLEL DO SIMD"))
    }
}
