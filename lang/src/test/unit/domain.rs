use std::str::FromStr;

use test_case::test_case;

use crate::arch::ArchTag;
use crate::domain::{ParallelDomain, ParallelRegionTemplate, ReductionClause};
use crate::error::Error;

fn domains(n: usize) -> Vec<ParallelDomain> {
    ["i", "j", "k", "l"][..n]
        .iter()
        .zip(["nx", "ny", "nz", "nw"])
        .map(|(name, size)| ParallelDomain::new(*name, size))
        .collect()
}

#[test]
fn template_requires_at_least_one_domain() {
    let err = ParallelRegionTemplate::new([]).unwrap_err();
    assert!(matches!(err, Error::NoParallelDomains));
}

#[test]
fn template_rejects_four_domains() {
    let err = ParallelRegionTemplate::new(domains(4)).unwrap_err();
    let Error::TooManyParallelDomains { max, specified } = err else {
        panic!("wrong error: {err}");
    };
    assert_eq!(max, 3);
    assert_eq!(specified, 4);
}

#[test_case(1; "one domain")]
#[test_case(2; "two domains")]
#[test_case(3; "three domains")]
fn template_accepts_supported_domain_counts(n: usize) {
    let template = ParallelRegionTemplate::new(domains(n)).unwrap();
    assert_eq!(template.domains().len(), n);
    let names: Vec<&str> = template.domain_names().collect();
    assert_eq!(names, ["i", "j", "k"][..n].to_vec());
}

#[test]
fn unrestricted_template_applies_everywhere() {
    let template = ParallelRegionTemplate::new(domains(1)).unwrap();
    assert!(template.applies_to_arch(ArchTag::Cpu));
    assert!(template.applies_to_arch(ArchTag::Gpu));
}

#[test]
fn restricted_template_excludes_other_targets() {
    let template = ParallelRegionTemplate::new(domains(1)).unwrap().restricted_to(ArchTag::Gpu);
    assert!(template.applies_to_arch(ArchTag::Gpu));
    assert!(!template.applies_to_arch(ArchTag::Cpu));
}

#[test]
fn domain_bounds_default_to_one_and_size() {
    let d = ParallelDomain::new("i", "nx");
    assert_eq!(d.begin(), "1");
    assert_eq!(d.end(), "nx");
    assert_eq!(d.extent(), "nx");
}

#[test]
fn domain_extent_prefers_explicit_bounds() {
    let d = ParallelDomain::with_bounds("i", "nx", "2", "nx - 1");
    assert_eq!(d.begin(), "2");
    assert_eq!(d.end(), "nx - 1");
    assert_eq!(d.extent(), "nx - 1 - (2) + 1");
}

#[test]
fn domain_extent_folds_range_sizes() {
    let d = ParallelDomain::new("i", "i_start : i_end");
    assert_eq!(d.extent(), "i_end - (i_start) + 1");
}

#[test]
fn reduction_clause_renders_operator_and_symbol() {
    let clause = ReductionClause::new("+", "total");
    assert_eq!(clause.render(), "reduction(+:total)");

    let template =
        ParallelRegionTemplate::new(domains(1)).unwrap().with_reduction(clause);
    assert_eq!(template.reduction_clause(), "reduction(+:total)");
}

#[test]
fn block_size_spec_falls_back_to_default() {
    let plain = ParallelRegionTemplate::new(domains(2)).unwrap();
    assert_eq!(plain.block_size_spec(0, "HD_BLOCK_SIZE_X"), "HD_BLOCK_SIZE_X");

    let sized = ParallelRegionTemplate::new(domains(2))
        .unwrap()
        .with_block_sizes(["32".into(), "16".into(), "1".into()]);
    assert_eq!(sized.block_size_spec(1, "HD_BLOCK_SIZE_Y"), "16");
}

#[test_case("cpu", ArchTag::Cpu)]
#[test_case("GPU", ArchTag::Gpu)]
fn arch_tags_parse_case_insensitively(text: &str, expected: ArchTag) {
    assert_eq!(ArchTag::from_str(text).unwrap(), expected);
}
