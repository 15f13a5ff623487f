use std::collections::BTreeMap;
use std::sync::Arc;

use heddle_lang::arch::ArchTag;
use heddle_model::{
    CallRegion, DependencyAttribute, Import, Module, ParallelRegion, ParallelRegionPosition,
    Region, Routine, SpecLine, Symbol,
};

use crate::config::CodegenOptions;
use crate::cuda::CudaBackend;
use crate::driver::{RenderedRoutine, file_preamble, lower_module};
use crate::error::Error;
use crate::openacc::OpenAccBackend;
use crate::sequential::SequentialBackend;
use crate::test::fixtures;
use crate::traits::Backend;

const PLANE: &[(&str, &str)] = &[("i", "nx"), ("j", "ny")];

fn physics() -> Module {
    Module::new("physics")
}

fn modules() -> BTreeMap<String, Module> {
    BTreeMap::from([("physics".to_string(), physics())])
}

fn lower_one(routine: Routine, backend: &dyn Backend) -> Vec<RenderedRoutine> {
    lower_module(&physics(), vec![routine], &modules(), backend).expect("lowering")
}

/// Transfer-annotated argument of `routine`, resolved against the
/// parallel context of the kernels it feeds.
fn transfer_symbol(routine: &Routine, name: &str, intent: &str) -> Symbol {
    let context = fixtures::routine_with_region(&routine.name, fixtures::plane(), &[]);
    fixtures::annotated_symbol_in(
        &context,
        name,
        intent,
        "real(8)",
        PLANE,
        DependencyAttribute::TransferHere.into(),
    )
}

// =====================================================================
// whole-routine rendering
// =====================================================================

#[test]
fn sequential_lowering_renders_the_complete_routine() {
    let mut routine =
        fixtures::routine_with_region("advance", fixtures::plane(), &["a(i, j) = b(i, j)"]);
    routine.arguments = vec!["a".to_string(), "b".to_string()];

    let rendered = lower_one(routine, &SequentialBackend::new());

    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].name, "advance");
    assert_eq!(
        rendered[0].code,
        "subroutine advance(a, b)\n\
         integer(4) :: i, j\n\
         outer_parallel_loop0: do j=1,ny\n\
         do i=1,nx\n\
         a(i, j) = b(i, j)\n\
         end do\n\
         end do outer_parallel_loop0\n\
         end subroutine advance"
    );
}

#[test]
fn argument_free_routines_omit_the_parentheses() {
    let mut routine = fixtures::routine("init");
    routine.push_region(Region::code(["hd_ready = .true.".to_string()]));

    let rendered = lower_one(routine, &SequentialBackend::new());

    assert_eq!(rendered[0].code, "subroutine init\nhd_ready = .true.\nend subroutine init");
}

#[test]
fn foreign_templates_render_as_run_once_stubs() {
    let gpu_only =
        Arc::new(fixtures::template(&[("i", "nx")]).as_ref().clone().restricted_to(ArchTag::Gpu));
    let mut routine = fixtures::routine("filter");
    routine.arguments = vec!["a".to_string()];
    routine.position = Some(ParallelRegionPosition::Within);
    routine.templates = vec![gpu_only.clone()];
    routine.push_region(Region::Parallel(ParallelRegion {
        template: gpu_only,
        body: vec![Region::code([
            "if (a(i) .GT. 0.) then".to_string(),
            "return".to_string(),
            "end if".to_string(),
        ])],
    }));

    let rendered = lower_one(routine, &SequentialBackend::new());

    assert_eq!(
        rendered[0].code,
        "subroutine filter(a)\n\
         outer_parallel_loop0: do\n\
         if (a(i) .GT. 0.) then\n\
         exit outer_parallel_loop0\n\
         end if\n\
         exit outer_parallel_loop0\n\
         end do outer_parallel_loop0\n\
         end subroutine filter"
    );
}

#[test]
fn each_routine_restarts_the_kernel_numbering() {
    let first = fixtures::routine_with_region("advance", fixtures::plane(), &["a(i, j) = 0"]);
    let second = fixtures::routine_with_region("relax", fixtures::plane(), &["b(i, j) = 0"]);

    let rendered =
        lower_module(&physics(), vec![first, second], &modules(), &SequentialBackend::new())
            .expect("lowering");

    assert_eq!(rendered.len(), 2);
    for item in &rendered {
        assert!(
            item.code.contains("outer_parallel_loop0: do j=1,ny"),
            "stale kernel numbering in {}:\n{}",
            item.name,
            item.code
        );
    }
}

#[test]
fn device_loops_inside_regions_get_sequential_pins() {
    let mut routine = fixtures::routine_with_region(
        "column_sweep",
        fixtures::plane(),
        &["columns: do k=1,nz", "q(i, j) = q(i, j) + 1", "end do columns"],
    );
    routine.arguments = vec!["q".to_string()];

    let rendered = lower_one(routine, &OpenAccBackend::new());

    assert_eq!(
        rendered[0].code,
        "subroutine column_sweep(q)\n\
         use openacc\n\
         use cudafor\n\
         integer(4) :: i, j\n\
         !$acc kernels\n\
         !$acc loop independent vector(HD_BLOCK_SIZE_Y)\n\
         outer_parallel_loop0: do j=1,ny\n\
         !$acc loop independent vector(HD_BLOCK_SIZE_X)\n\
         do i=1,nx\n\
         !$acc loop seq\n\
         columns: do k=1,nz\n\
         q(i, j) = q(i, j) + 1\n\
         end do columns\n\
         end do\n\
         end do outer_parallel_loop0\n\
         !$acc end kernels\n\
         end subroutine column_sweep"
    );
}

// =====================================================================
// call sites
// =====================================================================

#[test]
fn calls_to_unknown_routines_pass_through() {
    let mut routine = fixtures::routine("orchestrate");
    routine.push_region(Region::Call(CallRegion {
        callee: "mystery".to_string(),
        arguments: vec!["x".to_string()],
    }));

    let rendered = lower_one(routine, &SequentialBackend::new());

    assert_eq!(
        rendered[0].code,
        "subroutine orchestrate\ncall mystery(x)\nend subroutine orchestrate"
    );
}

#[test]
fn argument_free_calls_drop_the_parentheses() {
    let mut routine = fixtures::routine("orchestrate");
    routine
        .push_region(Region::Call(CallRegion { callee: "finish".to_string(), arguments: vec![] }));

    let rendered = lower_one(routine, &SequentialBackend::new());

    assert!(
        rendered[0].code.contains("\ncall finish\n"),
        "missing bare call:\n{}",
        rendered[0].code
    );
}

#[test]
fn cuda_lowering_splits_the_kernel_and_launches_it() {
    let mut routine =
        fixtures::routine_with_region("advance", fixtures::plane(), &["a(i, j) = b(i, j)"]);
    routine.arguments = vec!["a".to_string(), "b".to_string()];
    let backend = CudaBackend::new(CodegenOptions::default());

    let rendered = lower_one(routine, &backend);

    let names: Vec<&str> = rendered.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["advance", "advance_hdk0"]);

    let launcher = &rendered[0].code;
    assert!(
        launcher.starts_with(
            "subroutine advance(a, b)\n\
             use cudafor\n\
             type(dim3) :: hd_grid, hd_block\n\
             integer(4) :: hd_gridsize_x, hd_gridsize_y, hd_gridsize_z, hd_cuerr"
        ),
        "missing launcher head:\n{launcher}"
    );
    assert!(
        launcher.contains("hd_gridsize_x = ceiling(real(nx) / real(HD_BLOCK_SIZE_X))"),
        "missing grid sizing:\n{launcher}"
    );
    assert!(
        launcher.contains("call advance_hdk0<<< hd_grid, hd_block >>>(a, b)"),
        "missing launch:\n{launcher}"
    );
    assert!(
        launcher.contains("CUDA error in kernel advance_hdk0"),
        "missing launch check:\n{launcher}"
    );
    assert!(launcher.ends_with("end subroutine advance"), "unterminated launcher:\n{launcher}");
}

#[test]
fn cuda_kernels_render_as_global_subroutines() {
    let mut routine =
        fixtures::routine_with_region("advance", fixtures::plane(), &["a(i, j) = b(i, j)"]);
    routine.arguments = vec!["a".to_string(), "b".to_string()];
    let backend = CudaBackend::new(CodegenOptions::default());

    let rendered = lower_one(routine, &backend);

    assert_eq!(
        rendered[1].code,
        "attributes(global) subroutine advance_hdk0(a, b)\n\
         use cudafor\n\
         integer(4) :: i, j\n\
         i = (blockidx%x - 1) * blockDim%x + threadidx%x + 1 - 1\n\
         j = (blockidx%y - 1) * blockDim%y + threadidx%y + 1 - 1\n\
         if (i .GT. nx .OR. j .GT. ny) then\n\
         return\n\
         end if\n\
         a(i, j) = b(i, j)\n\
         end subroutine advance_hdk0"
    );
}

#[test]
fn host_reachable_routines_gain_a_sequential_host_copy() {
    let gpu_plane = Arc::new(fixtures::plane().as_ref().clone().restricted_to(ArchTag::Gpu));
    let mut routine = fixtures::routine("advance");
    routine.arguments = vec!["a".to_string(), "b".to_string()];
    routine.position = Some(ParallelRegionPosition::Within);
    routine.templates = vec![gpu_plane.clone()];
    routine.push_region(Region::Parallel(ParallelRegion {
        template: gpu_plane,
        body: vec![Region::code(["a(i, j) = b(i, j)".to_string()])],
    }));
    routine.is_used_in_host_only_context = true;
    let backend = CudaBackend::new(CodegenOptions::default());

    let rendered = lower_one(routine, &backend);

    let names: Vec<&str> = rendered.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["advance_hddev", "advance_hdhost", "advance_hddev_hdk0"]);
    // The host copy runs the device-flavored region as a plain nest.
    assert_eq!(
        rendered[1].code,
        "subroutine advance_hdhost(a, b)\n\
         integer(4) :: i, j\n\
         outer_parallel_loop0: do j=1,ny\n\
         do i=1,nx\n\
         a(i, j) = b(i, j)\n\
         end do\n\
         end do outer_parallel_loop0\n\
         end subroutine advance_hdhost"
    );
    assert!(
        rendered[0].code.contains("call advance_hddev_hdk0<<< hd_grid, hd_block >>>(a, b)"),
        "missing device launch:\n{}",
        rendered[0].code
    );
}

#[test]
fn host_context_calls_reach_the_host_copy_without_a_launch() {
    let mut worker =
        fixtures::routine_with_region("advance", fixtures::plane(), &["a(i, j) = b(i, j)"]);
    worker.arguments = vec!["a".to_string(), "b".to_string()];
    worker.is_used_in_host_only_context = true;
    let mut orchestrate = fixtures::routine("orchestrate");
    orchestrate.push_region(Region::Call(CallRegion {
        callee: "advance".to_string(),
        arguments: vec!["a".to_string(), "b".to_string()],
    }));
    let backend = CudaBackend::new(CodegenOptions::default());

    let rendered = lower_module(&physics(), vec![worker, orchestrate], &modules(), &backend)
        .expect("lowering");

    let names: Vec<&str> = rendered.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["advance_hddev", "advance_hdhost", "advance_hddev_hdk0", "orchestrate"]);
    assert_eq!(
        rendered[3].code,
        "subroutine orchestrate\n\
         use cudafor\n\
         call advance_hdhost(a, b)\n\
         end subroutine orchestrate"
    );
}

// =====================================================================
// specification dispatch
// =====================================================================

#[test]
fn specification_lines_follow_the_dialect_filters() {
    let mut routine = fixtures::routine("helpers_init");
    routine.specification.push(SpecLine::new("private"));
    routine.specification.push(SpecLine::new("implicit none"));

    let rendered = lower_one(routine.clone(), &SequentialBackend::new());
    assert_eq!(
        rendered[0].code,
        "subroutine helpers_init\nprivate\nimplicit none\nend subroutine helpers_init"
    );

    let backend = CudaBackend::new(CodegenOptions::default());
    let rendered = lower_one(routine, &backend);
    assert_eq!(
        rendered[0].code,
        "subroutine helpers_init\nuse cudafor\nend subroutine helpers_init"
    );
}

#[test]
fn imports_render_through_their_symbol_groups() {
    let mut routine = fixtures::routine("advance");
    let mut factor = fixtures::symbol_in(&routine, "factor", "", "real(8)", &[]);
    factor.load_import("tables", Some(&fixtures::entry("factor", "", "real(8)", &[])));
    routine.insert_symbol(factor);
    routine.imports.push(Import::named("tables", "factor"));
    routine.imports.push(Import::whole_module("helpers"));
    routine.imports.push(Import::renamed("tables", "f", "flux"));

    let rendered = lower_one(routine, &SequentialBackend::new());

    assert_eq!(
        rendered[0].code,
        "subroutine advance\n\
         use tables, only: factor\n\
         use helpers\n\
         use tables, only: f => flux\n\
         end subroutine advance"
    );
}

#[test]
fn unresolved_declaration_groups_pass_through() {
    let mut routine = fixtures::routine("advance");
    routine.specification.push(SpecLine::with_symbols("real(8) :: ghost  ", ["ghost".to_string()]));

    let rendered = lower_one(routine, &SequentialBackend::new());

    assert_eq!(rendered[0].code, "subroutine advance\nreal(8) :: ghost\nend subroutine advance");
}

#[test]
fn declaration_rewrites_feed_the_boundary_transfers() {
    let mut routine = fixtures::routine("flush_edges");
    routine.arguments = vec!["b".to_string()];
    routine.insert_symbol(transfer_symbol(&routine, "b", "out"));
    routine
        .specification
        .push(SpecLine::with_symbols("real(8), intent(out) :: b", ["b".to_string()]));
    routine.push_region(Region::code([
        "if (hd_ready) then".to_string(),
        "return".to_string(),
        "end if".to_string(),
    ]));
    let backend = CudaBackend::new(CodegenOptions::default());

    let rendered = lower_one(routine, &backend);

    assert_eq!(
        rendered[0].code,
        "subroutine flush_edges(b)\n\
         use cudafor\n\
         real(8), intent(out) :: b\n\
         real(8), device :: b_d(nx,ny)\n\
         b_d(:,:) = 0\n\
         if (hd_ready) then\n\
         if (size(b) .GT. 0) then\n\
         b(:,:) = b_d(:,:)\n\
         end if\n\
         return\n\
         end if\n\
         if (size(b) .GT. 0) then\n\
         b(:,:) = b_d(:,:)\n\
         end if\n\
         end subroutine flush_edges"
    );
}

// =====================================================================
// failure reporting
// =====================================================================

#[test]
fn lowering_errors_carry_the_failing_routine_name() {
    let mut routine = fixtures::routine("deep_helper");
    routine.position = Some(ParallelRegionPosition::Outside);
    routine.templates = vec![fixtures::plane()];
    let mut lookup = fixtures::symbol_in(&routine, "lookup", "", "real(8)", PLANE);
    lookup.load_import("tables", Some(&fixtures::entry("lookup", "", "real(8)", &["nx", "ny"])));
    routine.insert_symbol(lookup);
    routine.imports.push(Import::named("tables", "lookup"));
    let backend = CudaBackend::new(CodegenOptions::default());

    let err =
        lower_module(&physics(), vec![routine], &modules(), &backend).unwrap_err();

    let Error::InRoutine { routine: failing, source } = err else {
        panic!("expected the routine-context wrapper");
    };
    assert_eq!(failing, "deep_helper");
    let Error::ImportIntoDeviceCallee { symbols, scope } = *source else {
        panic!("expected the device-callee import error");
    };
    assert_eq!(symbols, "lookup");
    assert_eq!(scope, "deep_helper");
}

#[test]
fn file_preambles_delegate_to_the_backend() {
    let sequential = file_preamble(&SequentialBackend::new(), "physics.F90");
    assert_eq!(sequential, "#include \"storage_order.F90\"");

    let acc = file_preamble(&OpenAccBackend::new(), "physics.F90");
    assert!(acc.contains("HD_DUMMYKERNEL_physics()"), "missing dummy kernel:\n{acc}");
}
