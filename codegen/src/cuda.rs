//! CUDA Fortran lowering: parallel regions are split out into
//! `attributes(global)` kernels launched through a synthesized caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use snafu::ensure;

use heddle_lang::arch::ArchTag;
use heddle_lang::domain::{ParallelDomain, ParallelRegionTemplate};
use heddle_model::{Module, ParallelRegionPosition, RegionKind, Routine, Symbol};

use crate::common::{block_size_specs, iterator_declaration};
use crate::config::{CodegenOptions, OptionFlag};
use crate::context::PassContext;
use crate::device_data;
use crate::error::{Result, TooManyKernelDimensionsSnafu};
use crate::extract;
use crate::residency;
use crate::traits::{AdditionalParameters, Backend, Capabilities, SplitRoutine};

/// Launch grid dimension names, kernel dimension order.
pub(crate) const DIM_NAMES: [&str; 3] = ["x", "y", "z"];

/// Abort sequence for a failed CUDA runtime call. Expects the error code
/// in `hd_cuerr`.
pub(crate) fn cuda_error_check(message: &str) -> String {
    format!(
        "if(hd_cuerr .NE. cudaSuccess) then\n\
         write(0, *) '{message}:', cudaGetErrorString(hd_cuerr)\n\
         stop 1\n\
         end if"
    )
}

#[derive(Debug, Clone)]
pub struct CudaBackend {
    caps: Capabilities,
    options: CodegenOptions,
}

impl CudaBackend {
    pub fn new(options: CodegenOptions) -> Self {
        Self {
            caps: Capabilities {
                architectures: &["cuda"],
                target: ArchTag::Gpu,
                on_device: true,
                handles_device_data: true,
                multiple_parallel_regions_allowed: false,
                scalar_writes_in_kernels_allowed: false,
                arbitrary_data_access_outside_kernels: false,
                module_imports_in_kernels_allowed: false,
                mixed_host_device_code_allowed: false,
                uses_host_routine_duplicates: true,
                supports_host_only_routine_copies: true,
                kernel_prefixes_in_debug_print: true,
                openacc_debug_prints: false,
            },
            options,
        }
    }
}

impl Backend for CudaBackend {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn additional_includes(&self) -> String {
        "use cudafor".to_string()
    }

    fn routine_prefix(&self, routine: &Routine) -> String {
        match routine.position {
            Some(ParallelRegionPosition::Within) => "attributes(global)".to_string(),
            Some(ParallelRegionPosition::Outside) => "attributes(device)".to_string(),
            _ => String::new(),
        }
    }

    fn adjust_data_specification_lines(
        &self,
        lines: Vec<String>,
        routine: &Routine,
    ) -> Vec<String> {
        // Initializers are only legal in host code; kernels and device
        // subroutines lose them.
        if routine.position == Some(ParallelRegionPosition::Inside) {
            return lines;
        }
        Vec::new()
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
        if routine.is_kernel_caller {
            parts.push("type(dim3) :: hd_grid, hd_block".to_string());
            parts.push(
                "integer(4) :: hd_gridsize_x, hd_gridsize_y, hd_gridsize_z, hd_cuerr".to_string(),
            );
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
        _ctx: &mut PassContext,
        _routine: &Routine,
        _symbols: &[Symbol],
        template: &ParallelRegionTemplate,
    ) -> Result<String> {
        let domains = template.domains();
        let mut parts = Vec::new();
        let definitions = self.iterator_definition(domains)?;
        if !definitions.is_empty() {
            parts.push(definitions);
        }
        let guard = self.guard_outside_region(domains);
        if !guard.is_empty() {
            parts.push(guard);
        }
        Ok(parts.join("\n"))
    }

    fn parallel_region_end(
        &self,
        _ctx: &mut PassContext,
        _routine: &Routine,
        _template: &ParallelRegionTemplate,
    ) -> Result<String> {
        // Threads run the body once; nothing to close.
        Ok(String::new())
    }

    fn early_exit(&self, _ctx: &PassContext, _position: Option<ParallelRegionPosition>) -> String {
        "return".to_string()
    }

    fn iterator_definition(&self, domains: &[ParallelDomain]) -> Result<String> {
        ensure!(
            domains.len() <= DIM_NAMES.len(),
            TooManyKernelDimensionsSnafu { specified: domains.len(), limit: DIM_NAMES.len() }
        );
        let lines: Vec<String> = domains
            .iter()
            .enumerate()
            .map(|(pos, domain)| {
                let dim = DIM_NAMES[pos];
                format!(
                    "{} = (blockidx%{dim} - 1) * blockDim%{dim} + threadidx%{dim} + {} - 1",
                    domain.name,
                    domain.begin()
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }

    fn guard_outside_region(&self, domains: &[ParallelDomain]) -> String {
        if domains.is_empty() {
            return String::new();
        }
        let conditions: Vec<String> =
            domains.iter().map(|d| format!("{} .GT. {}", d.name, d.end())).collect();
        format!("if ({}) then\nreturn\nend if", conditions.join(" .OR. "))
    }

    fn kernel_call_config(&self) -> String {
        "<<< hd_grid, hd_block >>>".to_string()
    }

    fn kernel_call_preparation(
        &self,
        ctx: &mut PassContext,
        template: Option<&Arc<ParallelRegionTemplate>>,
        callee: Option<&Routine>,
    ) -> Result<String> {
        ctx.current_template = template.cloned();
        let Some(template) = template else {
            return Ok(String::new());
        };
        if !template.applies_to_arch(ArchTag::Gpu) {
            return Ok(String::new());
        }
        let domains = template.domains();
        ensure!(
            domains.len() <= DIM_NAMES.len(),
            TooManyKernelDimensionsSnafu { specified: domains.len(), limit: DIM_NAMES.len() }
        );
        let mut lines = Vec::new();
        if let Some(callee) = callee {
            if !self.options.has(OptionFlag::KeepGpuCacheConfig) {
                lines.push(format!(
                    "hd_cuerr = cudaFuncSetCacheConfig({}, cudaFuncCachePreferL1)",
                    callee.name
                ));
                lines.push("hd_cuerr = cudaGetLastError()".to_string());
                lines.push(cuda_error_check(&format!(
                    "CUDA error when setting cache configuration for kernel {}",
                    callee.name
                )));
            }
        }
        let blocks = block_size_specs(template);
        let mut grid_args = Vec::new();
        let mut block_args = Vec::new();
        for pos in 0..DIM_NAMES.len() {
            let grid_var = format!("hd_gridsize_{}", DIM_NAMES[pos]);
            match domains.get(pos) {
                Some(domain) => {
                    lines.push(format!(
                        "{grid_var} = ceiling(real({}) / real({}))",
                        domain.extent(),
                        blocks[pos]
                    ));
                    block_args.push(blocks[pos].clone());
                }
                None => {
                    lines.push(format!("{grid_var} = 1"));
                    block_args.push("1".to_string());
                }
            }
            grid_args.push(grid_var);
        }
        lines.push(format!("hd_grid = dim3({})", grid_args.join(", ")));
        lines.push(format!("hd_block = dim3({})", block_args.join(", ")));
        Ok(lines.join("\n"))
    }

    fn kernel_call_post(&self, ctx: &mut PassContext, _caller: &Routine, callee: &Routine) -> String {
        ctx.current_template = None;
        if callee.position != Some(ParallelRegionPosition::Within) {
            return String::new();
        }
        format!(
            "hd_cuerr = cudaGetLastError()\n{}",
            cuda_error_check(&format!("CUDA error in kernel {}", callee.name))
        )
    }

    fn additional_parameters(
        &self,
        caller: &Routine,
        callee: &Routine,
        modules: &BTreeMap<String, Module>,
    ) -> Result<AdditionalParameters> {
        extract::resolve_additional_parameters(caller, callee, modules)
    }

    fn split_into_routines(
        &self,
        routine: Routine,
        peers: &BTreeMap<String, Routine>,
        modules: &BTreeMap<String, Module>,
    ) -> Result<Vec<SplitRoutine>> {
        extract::split_kernel_routines(&self.caps, routine, peers, modules)
    }
}
