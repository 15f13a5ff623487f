//! Routine, module and symbol model for the heddle translator.
//!
//! The front end parses annotated source into the object graph defined
//! here; the code generation backends read and rewrite it. The central
//! entity is [`Symbol`], a staged descriptor of one data dependency:
//! attributes arrive in a fixed order (dependency annotation, then routine
//! context, then the textual declaration) and each stage unlocks further
//! queries.

pub mod analysis;
pub mod error;
pub mod routine;
pub mod symbol;


pub use analysis::{Access, SymbolAnalysis};
pub use error::{Error, Result};
pub use routine::{
    CallRegion, CalleeCapabilities, CodeRegion, DependencyDef, Import, ImportItem, Module,
    ParallelRegion, ParallelRegionPosition, Region, RegionKind, Routine, SpecLine,
    scoped_symbol_key,
};
pub use symbol::{
    DataDimension, DeclarationKind, DeclarationScope, DependencyAttribute, DependencyEntry,
    DependencyTemplate, DimTag, InitStage, Intent, Symbol, SymbolOrigin,
    mark_type_parameter_among, mark_type_parameters,
};
