//! Plain host lowering: parallel blocks become ordinary loop nests.

use heddle_lang::arch::ArchTag;
use heddle_lang::domain::ParallelRegionTemplate;
use heddle_model::{Routine, Symbol};

use crate::common::iterator_declaration;
use crate::context::PassContext;
use crate::error::Result;
use crate::traits::{Backend, Capabilities};

/// `do` lines opening one loop per domain, innermost domain first in the
/// annotation (storage order puts the fastest-varying domain first, so
/// the nest opens with the last domain). The outermost loop carries the
/// construct label early exits jump to.
pub(crate) fn loop_nest_begin(ctx: &PassContext, template: &ParallelRegionTemplate) -> String {
    let domains = template.domains();
    let mut lines = Vec::with_capacity(domains.len());
    for (pos, domain) in domains.iter().enumerate().rev() {
        let label = if pos == domains.len() - 1 {
            format!("{}: ", ctx.outer_loop_label())
        } else {
            String::new()
        };
        lines.push(format!("{label}do {}={},{}", domain.name, domain.begin(), domain.end()));
    }
    lines.join("\n")
}

/// Matching `end do` lines, the labelled one closing the nest.
pub(crate) fn loop_nest_end(ctx: &PassContext, template: &ParallelRegionTemplate) -> String {
    let count = template.domains().len();
    let mut lines = Vec::with_capacity(count);
    for pos in 0..count {
        if pos == count - 1 {
            lines.push(format!("end do {}", ctx.outer_loop_label()));
        } else {
            lines.push("end do".to_string());
        }
    }
    lines.join("\n")
}

/// The reference host backend.
#[derive(Debug, Clone)]
pub struct SequentialBackend {
    caps: Capabilities,
}

impl SequentialBackend {
    pub fn new() -> Self {
        Self { caps: Capabilities::host_defaults() }
    }

    /// Renderer for the synthesized host copies of device-dialect
    /// routines: same loop lowering, but applied to the device-flavored
    /// region templates and without kernel names in debug prints.
    pub fn host_copy() -> Self {
        let mut caps = Capabilities::host_defaults();
        caps.target = ArchTag::Gpu;
        caps.kernel_prefixes_in_debug_print = false;
        Self { caps }
    }
}

impl Default for SequentialBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SequentialBackend {
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
        _symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        Ok(loop_nest_begin(ctx, template))
    }

    fn parallel_region_end(
        &self,
        ctx: &mut PassContext,
        _routine: &Routine,
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let closed = loop_nest_end(ctx, template);
        ctx.kernel_number += 1;
        Ok(closed)
    }
}
