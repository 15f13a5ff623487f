//! Target architecture tags.

use enumset::EnumSet;

/// Hardware class a parallel region template can be restricted to.
///
/// Annotation text uses lowercase tag names (`appliesTo(gpu)`); backends
/// advertise which class they generate for.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter)]
#[derive(enumset::EnumSetType)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ArchTag {
    Cpu,
    Gpu,
}

/// Whether a template restricted to `applies_to` holds for `target`.
///
/// An empty restriction set means the template applies everywhere.
pub fn applies_to(applies_to: EnumSet<ArchTag>, target: ArchTag) -> bool {
    applies_to.is_empty() || applies_to.contains(target)
}
