//! Shared language-level building blocks for the heddle translator.
//!
//! This crate holds the pieces both the analysis model and the code
//! generation backends agree on:
//!
//! - **Architecture tags**: which hardware class a parallel region targets
//! - **Domains & templates**: the annotated parallel iteration spaces
//! - **Specification lines**: paren-aware splitting of declaration text
//!
//! Nothing here depends on the routine/symbol model; it is the leaf of the
//! workspace.

pub mod arch;
pub mod domain;
pub mod error;
pub mod specline;


pub use arch::ArchTag;
pub use domain::{MAX_PARALLEL_DOMAINS, ParallelDomain, ParallelRegionTemplate, ReductionClause};
pub use error::{Error, Result};
