//! Error types for code generation.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while lowering routines to a target dialect.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The requested target architecture has no backend.
    #[snafu(display("unknown target architecture: {name}"))]
    UnknownArchitecture { name: String },

    /// A declaration line mixes symbols with incompatible residency
    /// attributes.
    #[snafu(display(
        "declaration line mixes {attribute} and non-{attribute} symbols: {symbols}"
    ))]
    MixedResidencyDeclaration { attribute: String, symbols: String },

    /// Two residency attributes that exclude each other appear on the
    /// same declaration line.
    #[snafu(display(
        "symbols with the {first} attribute cannot share a declaration line \
         with {second} symbols: {symbols}"
    ))]
    ConflictingResidencyDeclaration { first: String, second: String, symbols: String },

    /// A kernel uses more parallel dimensions than the launch grid has.
    #[snafu(display(
        "only up to {limit} parallel dimensions are supported, {specified} are specified"
    ))]
    TooManyKernelDimensions { specified: usize, limit: usize },

    /// An emulated kernel has no iterators whose initialization could
    /// be validated.
    #[snafu(display("kernel {routine} has no parallel iterators for its target"))]
    MissingKernelIterators { routine: String },

    /// Module imports cannot reach routines that run inside kernels.
    #[snafu(display(
        "importing {symbols} into device routine {scope} (called within a kernel) \
         is not supported; pass the data as arguments instead"
    ))]
    ImportIntoDeviceCallee { symbols: String, scope: String },

    /// A kernel is called from a module whose metadata was not loaded.
    #[snafu(display(
        "calling kernel {callee} requires its defining module {module} to be loaded; \
         split the caller instead of calling across modules"
    ))]
    UnknownCalleeModule { callee: String, module: String },

    /// A call argument does not start with a recognizable data object.
    #[snafu(display("illegal call argument: {argument}"))]
    IllegalCallArgument { argument: String },

    /// Error while adjusting one declaration line.
    #[snafu(display("in declaration `{line}`: {source}"))]
    InDeclaration {
        line: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Error while lowering one routine.
    #[snafu(display("in routine {routine}: {source}"))]
    InRoutine {
        routine: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Error from the symbol model.
    #[snafu(display("symbol model error: {source}"))]
    Model {
        #[snafu(source)]
        source: heddle_model::Error,
    },

    /// Error from declaration-line parsing.
    #[snafu(display("declaration parsing error: {source}"))]
    Specline {
        #[snafu(source)]
        source: heddle_lang::Error,
    },
}

impl From<heddle_model::Error> for Error {
    fn from(source: heddle_model::Error) -> Self {
        Error::Model { source }
    }
}
