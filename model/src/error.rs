//! Error types for the symbol and routine model.

use snafu::Snafu;

use crate::symbol::InitStage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Usage errors: the input program or its annotations violate a documented
/// constraint. Internal invariant violations panic instead.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A lifecycle stage was skipped.
    #[snafu(display(
        "symbol {symbol}: {operation} requires initialization stage {required}, but only {actual} is loaded"
    ))]
    StageSkipped { symbol: String, operation: String, required: InitStage, actual: InitStage },

    /// More than one active parallel region where only one is allowed.
    #[snafu(display(
        "only one active parallel region definition is allowed within a subroutine or in an outside callgraph position, {count} found for {routine}"
    ))]
    MultipleActiveTemplates { routine: String, count: usize },

    /// A parallel domain was declared by hand in a routine whose parallel
    /// region sits outside its body.
    #[snafu(display(
        "parallel domain {domain} is declared for array {symbol} in a subroutine where the parallel region is positioned outside; these domains are inserted automatically"
    ))]
    ParallelDomainDeclaredOutside { domain: String, symbol: String },

    /// A template-listed non-parallel dimension is missing from the
    /// declaration.
    #[snafu(display(
        "symbol {symbol}: dependency domain size {size} is not declared as one of its dimensions"
    ))]
    InactiveDomainNotDeclared { symbol: String, size: String },

    /// Declared dimensions the dependency template does not account for.
    #[snafu(display(
        "symbol {symbol} does not use automatic dimensions, but its template matches only {matched} of {declared} declared dimensions; either use the autoDom attribute or list every dimension in the directive"
    ))]
    UnmatchedDeclaredDimensions { symbol: String, declared: usize, matched: usize },

    /// Automatic dimensions combined with hand-listed non-parallel ones.
    #[snafu(display(
        "symbol {symbol} uses automatic dimensions, but non-parallel dimensions appear in its template; remove dimensions from the template that are also declared in the specification part"
    ))]
    AutoDomWithTemplateDimensions { symbol: String },

    /// Wrong number of iterators/offsets for an access expression.
    #[snafu(display(
        "unexpected number of offsets ({offsets}) and iterators ({iterators}) specified for symbol {symbol} with {dimensions} dimensions ({parallel} parallel)"
    ))]
    AccessArityMismatch {
        symbol: String,
        offsets: usize,
        iterators: usize,
        dimensions: usize,
        parallel: usize,
    },

    /// A symbol must be declared automatically but its type is unknown.
    #[snafu(display(
        "symbol {symbol} needs to be declared automatically, but there is no information about its type; specify it with a declarationPrefix attribute"
    ))]
    MissingDeclarationPrefix { symbol: String },

    /// Invalid parallel region position value from the front end.
    #[snafu(display("invalid parallel region position '{position}' for routine {routine}"))]
    InvalidRegionPosition { position: String, routine: String },
}
