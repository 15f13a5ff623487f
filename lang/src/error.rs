//! Error types for the language-level utilities.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Parallel region template without any iteration domain.
    #[snafu(display("parallel region template declares no domains"))]
    NoParallelDomains,

    /// More parallel dimensions than any backend can map.
    #[snafu(display("only up to {max} parallel dimensions are supported, {specified} are specified"))]
    TooManyParallelDomains { max: usize, specified: usize },

    /// Specification line that cannot be divided into prefix and symbol list.
    #[snafu(display("declaration line has no top-level '::' separator: {line}"))]
    MalformedDeclaration { line: String },

    /// Unbalanced parentheses in a specification line.
    #[snafu(display("unbalanced parentheses in specification text: {text}"))]
    UnbalancedParentheses { text: String },
}
