use std::sync::Arc;

use heddle_lang::arch::ArchTag;
use heddle_model::{ParallelRegionPosition, RegionKind};

use crate::context::PassContext;
use crate::openacc::OpenAccBackend;
use crate::test::fixtures;
use crate::traits::Backend;

const PLANE: &[(&str, &str)] = &[("i", "nx"), ("j", "ny")];

#[test]
fn targets_the_gpu_without_routine_duplicates() {
    let caps = OpenAccBackend::new().capabilities();
    assert_eq!(caps.architectures, &["openacc"]);
    assert_eq!(caps.target, ArchTag::Gpu);
    assert!(caps.on_device);
    assert!(caps.handles_device_data);
    assert!(caps.mixed_host_device_code_allowed);
    assert!(!caps.uses_host_routine_duplicates);
    assert!(caps.openacc_debug_prints);
}

#[test]
fn preamble_carries_a_dummy_kernel_for_the_linker() {
    let preamble = OpenAccBackend::new().file_preamble("physics.F90");
    assert!(preamble.contains("#include \"storage_order.F90\""), "missing include:\n{preamble}");
    assert!(
        preamble.contains("attributes(global) subroutine HD_DUMMYKERNEL_physics()"),
        "missing dummy kernel:\n{preamble}"
    );
    assert!(preamble.contains("use cudafor"), "missing cudafor:\n{preamble}");
    assert!(preamble.ends_with("end subroutine"), "kernel left open:\n{preamble}");
}

#[test]
fn every_routine_imports_the_accelerator_modules() {
    assert_eq!(OpenAccBackend::new().additional_includes(), "use openacc\nuse cudafor");
}

#[test]
fn region_begin_nests_vector_loops_inside_a_kernels_block() {
    let backend = OpenAccBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut ctx = PassContext::for_routine(&routine);
    let begin = backend.parallel_region_begin(&mut ctx, &routine, &[], &template).unwrap();
    assert_eq!(
        begin,
        "!$acc kernels\n\
         !$acc loop independent vector(HD_BLOCK_SIZE_Y)\n\
         outer_parallel_loop0: do j=1,ny\n\
         !$acc loop independent vector(HD_BLOCK_SIZE_X)\n\
         do i=1,nx"
    );
}

#[test]
fn device_resident_arrays_are_passed_as_device_pointers() {
    let backend = OpenAccBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut on_device = fixtures::symbol_in(&routine, "a", "in", "real(8)", PLANE);
    on_device.is_on_device = true;
    let mut module = fixtures::module_array_in(&routine, "lookup", PLANE);
    module.is_on_device = true;
    module.is_using_device_postfix = true;
    let host_only = fixtures::symbol_in(&routine, "b", "out", "real(8)", PLANE);
    let symbols = [on_device, module, host_only];

    let mut ctx = PassContext::for_routine(&routine);
    let begin = backend.parallel_region_begin(&mut ctx, &routine, &symbols, &template).unwrap();
    let header = begin.lines().next().unwrap();
    assert_eq!(header, "!$acc kernels deviceptr(a) deviceptr(lookup_d)");
}

#[test]
fn template_block_sizes_override_the_vector_defaults() {
    let backend = OpenAccBackend::new();
    let template = Arc::new(
        fixtures::plane()
            .as_ref()
            .clone()
            .with_block_sizes(["32".to_string(), "16".to_string(), "1".to_string()]),
    );
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut ctx = PassContext::for_routine(&routine);
    let begin = backend.parallel_region_begin(&mut ctx, &routine, &[], &template).unwrap();
    assert!(begin.contains("!$acc loop independent vector(16)\nouter_parallel_loop0: do j=1,ny"));
    assert!(begin.contains("!$acc loop independent vector(32)\ndo i=1,nx"));
}

#[test]
fn region_end_closes_the_kernels_block() {
    let backend = OpenAccBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut ctx = PassContext::for_routine(&routine);
    backend.parallel_region_begin(&mut ctx, &routine, &[], &template).unwrap();
    let end = backend.parallel_region_end(&mut ctx, &routine, &template).unwrap();
    assert_eq!(end, "end do\nend do outer_parallel_loop0\n!$acc end kernels");
    assert_eq!(ctx.kernel_number, 1);
}

#[test]
fn sequential_loops_inside_regions_are_pinned() {
    assert_eq!(OpenAccBackend::new().loop_preparation(), "!$acc loop seq");
}

#[test]
fn device_state_updates_keep_data_on_the_host_until_the_region() {
    let backend = OpenAccBackend::new();
    let routine = fixtures::routine_with_region("advance", fixtures::plane(), &[]);
    let mut symbol = fixtures::module_array_in(&routine, "density", PLANE);
    backend.update_symbol_device_state(
        &mut symbol,
        None,
        RegionKind::KernelCallerDeclaration,
        Some(ParallelRegionPosition::Inside),
    );
    assert!(symbol.is_on_device);
    assert!(symbol.is_using_device_postfix);
}
