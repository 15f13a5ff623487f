//! OpenACC lowering: `!$acc kernels` blocks over device-resident data,
//! kept inside the original routine bodies.

use std::collections::BTreeSet;
use std::path::Path;

use heddle_lang::arch::ArchTag;
use heddle_lang::domain::ParallelRegionTemplate;
use heddle_model::{ParallelRegionPosition, RegionKind, Routine, Symbol};

use crate::common::{block_size_specs, iterator_declaration};
use crate::context::PassContext;
use crate::device_data;
use crate::error::Result;
use crate::residency;
use crate::sequential::loop_nest_end;
use crate::traits::{Backend, Capabilities};

#[derive(Debug, Clone)]
pub struct OpenAccBackend {
    caps: Capabilities,
}

impl OpenAccBackend {
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                architectures: &["openacc"],
                target: ArchTag::Gpu,
                on_device: true,
                handles_device_data: true,
                multiple_parallel_regions_allowed: true,
                scalar_writes_in_kernels_allowed: true,
                arbitrary_data_access_outside_kernels: true,
                module_imports_in_kernels_allowed: true,
                mixed_host_device_code_allowed: true,
                uses_host_routine_duplicates: false,
                supports_host_only_routine_copies: false,
                kernel_prefixes_in_debug_print: true,
                openacc_debug_prints: true,
            },
        }
    }
}

impl Default for OpenAccBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for OpenAccBackend {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn file_preamble(&self, filename: &str) -> String {
        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        format!(
            "#include \"storage_order.F90\"\n\
             attributes(global) subroutine HD_DUMMYKERNEL_{stem}()\n\
             use cudafor\n\
             ! unused kernel that keeps this object linkable when CUDA flags are active\n\
             end subroutine"
        )
    }

    fn additional_includes(&self) -> String {
        "use openacc\nuse cudafor".to_string()
    }

    fn update_symbol_device_state(
        &self,
        symbol: &mut Symbol,
        used_in_kernels: Option<&BTreeSet<String>>,
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) {
        residency::update_device_state(
            &self.caps,
            symbol,
            used_in_kernels,
            region_kind,
            position,
            false,
        );
    }

    fn adjust_declaration(
        &self,
        _ctx: &mut PassContext,
        line: &str,
        symbols: &mut [Symbol],
        routine: Option<&Routine>,
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        device_data::adjust_declaration(&self.caps, line, symbols, routine, region_kind, position)
    }

    fn import_specification(
        &self,
        symbols: &mut [Symbol],
        region_kind: RegionKind,
        position: Option<ParallelRegionPosition>,
    ) -> Result<String> {
        device_data::import_specification(&self.caps, symbols, region_kind, position)
    }

    fn declaration_end(
        &self,
        _ctx: &mut PassContext,
        symbols: &[Symbol],
        routine: &Routine,
    ) -> Result<String> {
        let mut parts = Vec::new();
        let iterators = iterator_declaration(routine, self.caps.target);
        if !iterators.is_empty() {
            parts.push(iterators);
        }
        let transfers = device_data::declaration_end_transfers(symbols, routine)?;
        if !transfers.is_empty() {
            parts.push(transfers);
        }
        Ok(parts.join("\n"))
    }

    fn routine_exit_point(
        &self,
        _ctx: &mut PassContext,
        symbols: &[Symbol],
        is_kernel_caller: bool,
        _is_routine_end: bool,
    ) -> Result<String> {
        device_data::routine_exit_transfers(symbols, is_kernel_caller)
    }

    fn parallel_region_begin(
        &self,
        ctx: &mut PassContext,
        _routine: &Routine,
        symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let mut header = String::from("!$acc kernels ");
        for symbol in symbols {
            if symbol.is_array() && symbol.is_on_device {
                header.push_str(&format!("deviceptr({}) ", symbol.device_name()));
            }
        }
        let blocks = block_size_specs(template);
        let domains = template.domains();
        let mut lines = vec![header.trim_end().to_string()];
        for (pos, domain) in domains.iter().enumerate().rev() {
            lines.push(format!("!$acc loop independent vector({})", blocks[pos]));
            let label = if pos == domains.len() - 1 {
                format!("{}: ", ctx.outer_loop_label())
            } else {
                String::new()
            };
            lines.push(format!("{label}do {}={},{}", domain.name, domain.begin(), domain.end()));
        }
        Ok(lines.join("\n"))
    }

    fn parallel_region_end(
        &self,
        ctx: &mut PassContext,
        _routine: &Routine,
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let closed = loop_nest_end(ctx, template);
        ctx.kernel_number += 1;
        Ok(format!("{closed}\n!$acc end kernels"))
    }

    fn loop_preparation(&self) -> String {
        "!$acc loop seq".to_string()
    }
}
