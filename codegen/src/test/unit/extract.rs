use std::collections::BTreeMap;

use heddle_lang::arch::ArchTag;
use heddle_model::{
    Access, CalleeCapabilities, DependencyAttribute, DependencyDef, Import, Module,
    ParallelRegion, ParallelRegionPosition, Region, Routine, SpecLine,
};

use crate::config::CodegenOptions;
use crate::cuda::CudaBackend;
use crate::error::Error;
use crate::extract::{resolve_additional_parameters, split_kernel_routines};
use crate::test::fixtures;
use crate::traits::{Backend, Capabilities, SplitDialect};

const PLANE: &[(&str, &str)] = &[("i", "nx"), ("j", "ny")];

fn caps() -> Capabilities {
    CudaBackend::new(CodegenOptions::default()).capabilities()
}

fn region_over(template: &std::sync::Arc<heddle_lang::domain::ParallelRegionTemplate>) -> Region {
    Region::Parallel(ParallelRegion {
        template: template.clone(),
        body: vec![Region::code(["a(i, j) = b(i, j)".to_string()])],
    })
}

/// Routine with parallel regions directly in its body, as the analyzer
/// hands it over.
fn kernel_bearing(name: &str, regions: usize) -> Routine {
    let template = fixtures::plane();
    let mut routine = Routine::new(name, "physics");
    routine.position = Some(ParallelRegionPosition::Within);
    routine.templates = vec![template.clone()];
    routine.arguments = vec!["a".to_string(), "b".to_string()];
    for number in 0..regions {
        if number > 0 {
            routine.push_region(Region::code(["call flush_buffers".to_string()]));
        }
        routine.push_region(region_over(&template));
    }
    routine
}

fn physics_modules() -> BTreeMap<String, Module> {
    let mut modules = BTreeMap::new();
    modules.insert("physics".to_string(), Module::new("physics"));
    modules
}

#[test]
fn routines_without_regions_pass_through() {
    let routine = Routine::new("prepare", "physics");
    let produced =
        split_kernel_routines(&caps(), routine, &BTreeMap::new(), &physics_modules()).unwrap();
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].routine.name, "prepare");
    assert_eq!(produced[0].dialect, SplitDialect::Native);
}

#[test]
fn split_produces_a_launcher_and_one_kernel_per_region() {
    let routine = kernel_bearing("advance", 2);
    let produced =
        split_kernel_routines(&caps(), routine, &BTreeMap::new(), &physics_modules()).unwrap();
    let names: Vec<&str> = produced.iter().map(|p| p.routine.name.as_str()).collect();
    assert_eq!(names, ["advance", "advance_hdk0", "advance_hdk1"]);

    let launcher = &produced[0].routine;
    assert_eq!(launcher.position, Some(ParallelRegionPosition::Inside));
    assert!(launcher.is_kernel_caller);
    assert!(launcher.templates.is_empty());
    let [Region::Call(first), Region::Code(_), Region::Call(second)] = launcher.body.as_slice()
    else {
        panic!("unexpected launcher body: {:?}", launcher.body);
    };
    assert_eq!(first.callee, "advance_hdk0");
    assert_eq!(first.arguments, ["a", "b"]);
    assert_eq!(second.callee, "advance_hdk1");

    for kernel in &produced[1..] {
        let kernel = &kernel.routine;
        assert_eq!(kernel.position, Some(ParallelRegionPosition::Within));
        assert!(!kernel.is_kernel_caller);
        assert_eq!(kernel.templates.len(), 1);
        assert!(matches!(kernel.body.as_slice(), [Region::Parallel(_)]));
    }
}

#[test]
fn host_reachable_routines_keep_a_host_copy() {
    let mut routine = kernel_bearing("advance", 1);
    routine.is_used_in_host_only_context = true;
    let produced =
        split_kernel_routines(&caps(), routine, &BTreeMap::new(), &physics_modules()).unwrap();
    let names: Vec<&str> = produced.iter().map(|p| p.routine.name.as_str()).collect();
    assert_eq!(names, ["advance_hddev", "advance_hdhost", "advance_hddev_hdk0"]);
    assert_eq!(produced[0].dialect, SplitDialect::Native);
    assert_eq!(produced[1].dialect, SplitDialect::HostCopy);

    // The host copy keeps the original region body.
    let host = &produced[1].routine;
    assert_eq!(host.position, Some(ParallelRegionPosition::Within));
    assert!(matches!(host.body.as_slice(), [Region::Parallel(_)]));
}

#[test]
fn host_copies_abort_when_a_callee_is_device_only() {
    let mut routine = Routine::new("step_driver", "physics");
    routine.is_used_in_host_only_context = true;
    routine.push_region(Region::Call(heddle_model::CallRegion {
        callee: "gpu_step".to_string(),
        arguments: vec!["a".to_string()],
    }));

    let mut gpu_step = Routine::new("gpu_step", "physics");
    gpu_step.callee_caps = Some(CalleeCapabilities {
        on_device: true,
        handles_device_data: true,
        supports_host_only_copies: false,
        uses_host_routine_duplicates: false,
    });
    let peers = BTreeMap::from([("gpu_step".to_string(), gpu_step)]);

    let produced =
        split_kernel_routines(&caps(), routine, &peers, &physics_modules()).unwrap();
    assert_eq!(produced[0].routine.name, "step_driver_hddev");
    let host = &produced[1].routine;
    assert_eq!(host.name, "step_driver_hdhost");
    let [Region::Code(code)] = host.body.as_slice() else {
        panic!("expected an abort stub: {:?}", host.body);
    };
    assert_eq!(
        code.lines,
        [
            "write(0, *) 'Error: step_driver_hdhost does not have a callable host version \
             - aborting'",
            "stop 2"
        ]
    );
}

#[test]
fn non_gpu_regions_are_inlined_into_the_launcher() {
    let cpu_template = std::sync::Arc::new(
        heddle_lang::domain::ParallelRegionTemplate::new([
            heddle_lang::domain::ParallelDomain::new("i", "nx"),
        ])
        .unwrap()
        .restricted_to(ArchTag::Cpu),
    );
    let mut routine = Routine::new("advance", "physics");
    routine.position = Some(ParallelRegionPosition::Within);
    routine.templates = vec![cpu_template.clone()];
    routine.push_region(Region::Parallel(ParallelRegion {
        template: cpu_template,
        body: vec![Region::code(["a(i) = 0".to_string()])],
    }));

    let produced =
        split_kernel_routines(&caps(), routine, &BTreeMap::new(), &physics_modules()).unwrap();
    assert_eq!(produced.len(), 1, "no kernel should be extracted");
    let launcher = &produced[0].routine;
    assert!(launcher.is_kernel_caller);
    let [Region::Code(code)] = launcher.body.as_slice() else {
        panic!("region body not inlined: {:?}", launcher.body);
    };
    assert_eq!(code.lines, ["a(i) = 0"]);
}

#[test]
fn additional_parameters_flow_into_kernel_and_call() {
    let mut routine = kernel_bearing("advance", 1);
    // Routine-local work array.
    routine.dependency_defs.push(fixtures::def("coef", "in", "real(8)", PLANE));
    // Import from another module.
    let mut coeffs = fixtures::def("coeffs", "", "real(8)", PLANE);
    coeffs.entry.source_module = Some("tables".to_string());
    routine.dependency_defs.push(coeffs);

    let mut modules = physics_modules();
    // Module-scope array of the caller's own module.
    modules
        .get_mut("physics")
        .unwrap()
        .dependency_defs
        .push(fixtures::def("lookup", "", "real(8)", PLANE));
    let mut tables = Module::new("tables");
    tables.dependency_defs.push(fixtures::def("coeffs", "", "real(8)", PLANE));
    modules.insert("tables".to_string(), tables);

    let produced = split_kernel_routines(&caps(), routine, &BTreeMap::new(), &modules).unwrap();
    let launcher = &produced[0].routine;
    let kernel = &produced[1].routine;

    assert_eq!(kernel.arguments, ["a", "b", "coeffs", "lookup", "coef"]);
    let [Region::Call(call)] = launcher.body.as_slice() else {
        panic!("unexpected launcher body: {:?}", launcher.body);
    };
    assert_eq!(call.arguments, ["a", "b", "coeffs_d", "lookup_d", "coef_d"]);

    let declared: Vec<&str> =
        kernel.specification.iter().map(|line| line.text.as_str()).collect();
    assert!(
        declared.contains(&"real(8) :: coef(nx,ny)"),
        "kernel dummy not declared: {declared:?}"
    );
    assert!(
        declared.contains(&"real(8) :: lookup(nx,ny)"),
        "module array dummy not declared: {declared:?}"
    );
    assert!(
        launcher.imports.contains(&Import::named("tables", "coeffs")),
        "launcher import missing: {:?}",
        launcher.imports
    );
}

#[test]
fn argument_named_definitions_resolve_to_nothing() {
    let routine = {
        let mut routine = kernel_bearing("advance", 1);
        routine.dependency_defs.push(fixtures::def("a", "in", "real(8)", PLANE));
        routine
    };
    let mut kernel = routine.clone_renamed("advance_hdk0");
    kernel.position = Some(ParallelRegionPosition::Within);
    let additional =
        resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    assert!(additional.is_empty());
}

#[test]
fn host_annotated_definitions_follow_kernel_usage() {
    let mut routine = kernel_bearing("advance", 1);
    routine.dependency_defs.push(DependencyDef {
        template: fixtures::dependency(PLANE, DependencyAttribute::Host.into()),
        entry: fixtures::entry("pinned", "", "real(8)", &["nx", "ny"]),
    });
    let mut kernel = routine.clone_renamed("advance_hdk0");
    kernel.position = Some(ParallelRegionPosition::Within);

    let skipped =
        resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    assert!(skipped.is_empty(), "host-pinned data leaked into the kernel");

    kernel.used_symbol_names_in_kernels.insert("pinned".to_string());
    let kept = resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    assert_eq!(kept.dummies.len(), 1);
    assert_eq!(kept.dummies[0].name, "pinned");
}

#[test]
fn write_first_scalars_stay_out_of_the_kernel() {
    let mut routine = kernel_bearing("advance", 1);
    routine.dependency_defs.push(fixtures::def("tmp", "", "real(8)", &[]));
    let mut kernel = routine.clone_renamed("advance_hdk0");
    kernel.position = Some(ParallelRegionPosition::Within);

    kernel.scalar_first_access.insert("tmp".to_string(), Access::Write);
    let skipped =
        resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    assert!(skipped.is_empty(), "write-first scalar leaked into the kernel");

    kernel.scalar_first_access.insert("tmp".to_string(), Access::Read);
    let kept = resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    assert_eq!(kept.dummies.len(), 1);
    assert_eq!(kept.dummies[0].name, "tmp");
}

#[test]
fn unused_definitions_are_skipped_when_usage_is_known() {
    let mut routine = kernel_bearing("advance", 1);
    routine.dependency_defs.push(fixtures::def("coef", "in", "real(8)", PLANE));
    let mut kernel = routine.clone_renamed("advance_hdk0");
    kernel.position = Some(ParallelRegionPosition::Within);
    kernel.used_symbol_names = Some(["a".to_string(), "b".to_string()].into_iter().collect());

    let additional =
        resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    assert!(additional.is_empty());
}

#[test]
fn unknown_callee_module_is_rejected() {
    let routine = kernel_bearing("advance", 1);
    let mut kernel = routine.clone_renamed("advance_hdk0");
    kernel.position = Some(ParallelRegionPosition::Within);
    let err =
        resolve_additional_parameters(&routine, &kernel, &BTreeMap::new()).unwrap_err();
    let Error::UnknownCalleeModule { callee, module } = err else {
        panic!("wrong error: {err}");
    };
    assert_eq!(callee, "advance_hdk0");
    assert_eq!(module, "physics");
}

#[test]
fn resolution_is_deterministic() {
    let mut routine = kernel_bearing("advance", 1);
    routine.dependency_defs.push(fixtures::def("zeta", "in", "real(8)", PLANE));
    routine.dependency_defs.push(fixtures::def("alpha", "in", "real(8)", PLANE));
    let mut kernel = routine.clone_renamed("advance_hdk0");
    kernel.position = Some(ParallelRegionPosition::Within);

    let names = |params: &crate::traits::AdditionalParameters| -> Vec<String> {
        params.iter().map(|s| s.name.clone()).collect()
    };
    let first =
        resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    let second =
        resolve_additional_parameters(&routine, &kernel, &physics_modules()).unwrap();
    assert_eq!(names(&first), names(&second));
    assert_eq!(names(&first), ["alpha", "zeta"], "dummies not sorted by name");
}

#[test]
fn kernels_keep_whole_module_imports_and_known_items() {
    let mut routine = kernel_bearing("advance", 1);
    routine.imports = vec![
        Import::whole_module("cudafor"),
        Import::named("tables", "coeffs"),
        Import::named("helpers", "unrelated"),
    ];
    routine.insert_symbol(fixtures::symbol_in(&routine, "coeffs", "", "real(8)", PLANE));

    let produced =
        split_kernel_routines(&caps(), routine, &BTreeMap::new(), &physics_modules()).unwrap();
    let kernel = &produced[1].routine;
    assert!(kernel.imports.contains(&Import::whole_module("cudafor")));
    assert!(kernel.imports.contains(&Import::named("tables", "coeffs")));
    assert!(
        !kernel.imports.contains(&Import::named("helpers", "unrelated")),
        "caller-scope import leaked into the kernel"
    );
    let launcher = &produced[0].routine;
    assert!(launcher.imports.contains(&Import::named("helpers", "unrelated")));
}

#[test]
fn symbolless_use_lines_are_dropped_from_kernels() {
    let mut routine = kernel_bearing("advance", 1);
    routine.specification = vec![
        SpecLine::new("use helpers"),
        SpecLine::with_symbols("real(8), intent(in) :: a", ["a".to_string()]),
    ];
    let produced =
        split_kernel_routines(&caps(), routine, &BTreeMap::new(), &physics_modules()).unwrap();
    let kernel = &produced[1].routine;
    let texts: Vec<&str> = kernel.specification.iter().map(|l| l.text.as_str()).collect();
    assert!(!texts.contains(&"use helpers"), "symbolless use line kept: {texts:?}");
    assert!(texts.contains(&"real(8), intent(in) :: a"));
}
