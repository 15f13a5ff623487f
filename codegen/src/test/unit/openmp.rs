use std::sync::Arc;

use test_case::test_case;

use heddle_lang::arch::ArchTag;
use heddle_lang::domain::{ParallelRegionTemplate, ReductionClause};

use crate::context::PassContext;
use crate::openmp::OpenMpBackend;
use crate::test::fixtures;
use crate::traits::Backend;

const PLANE: &[(&str, &str)] = &[("i", "nx"), ("j", "ny")];

#[test]
fn answers_to_the_multicore_names() {
    let caps = OpenMpBackend::new().capabilities();
    assert_eq!(caps.architectures, &["openmp", "multicore"]);
    assert_eq!(caps.target, ArchTag::Cpu);
    assert!(!caps.on_device);
    assert!(caps.mixed_host_device_code_allowed);
}

#[test_case(&[("i", "nx")], 1; "one domain")]
#[test_case(&[("i", "nx"), ("j", "ny")], 2; "two domains")]
#[test_case(&[("i", "nx"), ("j", "ny"), ("k", "nz")], 3; "three domains")]
fn directive_collapses_over_all_domains(dims: &[(&str, &str)], collapse: usize) {
    let backend = OpenMpBackend::new();
    let template = fixtures::template(dims);
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut ctx = PassContext::for_routine(&routine);
    let begin = backend.parallel_region_begin(&mut ctx, &routine, &[], &template).unwrap();
    let expected = format!("!$OMP PARALLEL DO SIMD DEFAULT(firstprivate) COLLAPSE({collapse})");
    assert!(begin.starts_with(&expected), "missing directive:\n{begin}");
}

#[test]
fn directive_precedes_the_host_loop_nest() {
    let backend = OpenMpBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut ctx = PassContext::for_routine(&routine);
    let begin = backend.parallel_region_begin(&mut ctx, &routine, &[], &template).unwrap();
    assert!(
        begin.ends_with("outer_parallel_loop0: do j=1,ny\ndo i=1,nx"),
        "missing loop nest:\n{begin}"
    );
}

#[test]
fn reduction_clause_is_uppercased() {
    let backend = OpenMpBackend::new();
    let template = Arc::new(
        fixtures::template(PLANE)
            .as_ref()
            .clone()
            .with_reduction(ReductionClause::new("+", "total")),
    );
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut ctx = PassContext::for_routine(&routine);
    let begin = backend.parallel_region_begin(&mut ctx, &routine, &[], &template).unwrap();
    assert!(begin.contains("REDUCTION(+:TOTAL)"), "missing reduction:\n{begin}");
}

#[test]
fn arrays_over_region_domains_are_shared() {
    let backend = OpenMpBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let symbols = [
        fixtures::symbol_in(&routine, "b", "out", "real(8)", PLANE),
        fixtures::symbol_in(&routine, "a", "in", "real(8)", PLANE),
    ];
    let mut ctx = PassContext::for_routine(&routine);
    let begin =
        backend.parallel_region_begin(&mut ctx, &routine, &symbols, &template).unwrap();
    assert!(begin.contains("SHARED(a, b)"), "missing sorted shared list:\n{begin}");
}

#[test]
fn module_arrays_are_shared_regardless_of_their_domains() {
    let backend = OpenMpBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let symbols = [fixtures::module_array_in(&routine, "lookup", &[("k", "nz")])];
    let mut ctx = PassContext::for_routine(&routine);
    let begin =
        backend.parallel_region_begin(&mut ctx, &routine, &symbols, &template).unwrap();
    assert!(begin.contains("SHARED(lookup)"), "missing module array:\n{begin}");
}

#[test]
fn private_data_stays_out_of_the_shared_list() {
    let backend = OpenMpBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let symbols = [
        // Scalar, never shared.
        fixtures::symbol_in(&routine, "factor", "in", "real(8)", &[]),
        // Dimensioned over a domain the region does not iterate.
        fixtures::symbol_in(&routine, "column", "in", "real(8)", &[("k", "nz")]),
        // Derived-type member access.
        fixtures::symbol_in(&routine, "state%q", "in", "real(8)", PLANE),
    ];
    let mut ctx = PassContext::for_routine(&routine);
    let begin =
        backend.parallel_region_begin(&mut ctx, &routine, &symbols, &template).unwrap();
    assert!(!begin.contains("SHARED"), "unexpected shared list:\n{begin}");
}

#[test]
fn region_end_closes_nest_and_directive() {
    let backend = OpenMpBackend::new();
    let template = fixtures::plane();
    let routine = fixtures::routine_with_region("advance", template.clone(), &[]);
    let mut ctx = PassContext::for_routine(&routine);
    backend.parallel_region_begin(&mut ctx, &routine, &[], &template).unwrap();
    let end = backend.parallel_region_end(&mut ctx, &routine, &template).unwrap();
    assert_eq!(end, "end do\nend do outer_parallel_loop0\n!$OMP END PARALLEL DO SIMD");
    assert_eq!(ctx.kernel_number, 1);
}

#[test]
fn templates_for_other_architectures_yield_no_iterators() {
    let backend = OpenMpBackend::new();
    let gpu_only = ParallelRegionTemplate::new(
        PLANE.iter().map(|(n, s)| heddle_lang::domain::ParallelDomain::new(*n, *s)),
    )
    .unwrap()
    .restricted_to(ArchTag::Gpu);
    assert!(backend.iterators(&gpu_only).is_empty());
}
