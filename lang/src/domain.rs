//! Parallel iteration domains and region templates.

use enumset::EnumSet;
use smallvec::SmallVec;
use snafu::ensure;

use crate::arch::{self, ArchTag};
use crate::error::{NoParallelDomainsSnafu, Result, TooManyParallelDomainsSnafu};

/// Hard limit shared by every backend: three mappable parallel dimensions.
pub const MAX_PARALLEL_DOMAINS: usize = 3;

/// One parallel dimension of an annotated region.
///
/// `size` is the authoritative extent expression. Explicit bounds are
/// optional; iteration defaults to `1..=size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParallelDomain {
    pub name: String,
    pub size: String,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
}

impl ParallelDomain {
    pub fn new(name: impl Into<String>, size: impl Into<String>) -> Self {
        Self { name: name.into(), size: size.into(), starts_at: None, ends_at: None }
    }

    pub fn with_bounds(
        name: impl Into<String>,
        size: impl Into<String>,
        starts_at: impl Into<String>,
        ends_at: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            size: size.into(),
            starts_at: Some(starts_at.into()),
            ends_at: Some(ends_at.into()),
        }
    }

    /// Loop lower bound expression.
    pub fn begin(&self) -> &str {
        self.starts_at.as_deref().unwrap_or("1")
    }

    /// Loop upper bound expression.
    pub fn end(&self) -> &str {
        self.ends_at.as_deref().unwrap_or(&self.size)
    }

    /// Iteration count as an expression.
    ///
    /// Explicit bounds win over the size spec; a `low:high` size spec is
    /// folded into `high - (low) + 1`.
    pub fn extent(&self) -> String {
        if let (Some(start), Some(end)) = (&self.starts_at, &self.ends_at) {
            return format!("{end} - ({start}) + 1");
        }
        match self.size.split_once(':') {
            Some((low, high)) => format!("{} - ({}) + 1", high.trim(), low.trim()),
            None => self.size.clone(),
        }
    }
}

/// Reduction requested for a parallel region, e.g. `reduction(+:total)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReductionClause {
    pub operator: String,
    pub symbol: String,
}

impl ReductionClause {
    pub fn new(operator: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self { operator: operator.into(), symbol: symbol.into() }
    }

    /// Directive clause text.
    pub fn render(&self) -> String {
        format!("reduction({}:{})", self.operator, self.symbol)
    }
}

/// An annotated parallel region: 1 to 3 domains plus target restrictions.
///
/// Constructed through [`ParallelRegionTemplate::new`], which enforces the
/// domain-count limit, so every downstream consumer can index domains
/// without re-checking.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelRegionTemplate {
    domains: SmallVec<[ParallelDomain; 3]>,
    pub applies_to: EnumSet<ArchTag>,
    pub reduction: Option<ReductionClause>,
    /// Per-dimension launch extents overriding the backend's preprocessor
    /// defaults, x/y/z order.
    pub block_sizes: Option<[String; 3]>,
    /// Storage-order macro wrapping declared dimension lists.
    pub dom_macro: Option<String>,
    /// Storage-order macro wrapping access index lists.
    pub acc_macro: Option<String>,
}

impl ParallelRegionTemplate {
    pub fn new(domains: impl IntoIterator<Item = ParallelDomain>) -> Result<Self> {
        let domains: SmallVec<[ParallelDomain; 3]> = domains.into_iter().collect();
        ensure!(!domains.is_empty(), NoParallelDomainsSnafu);
        ensure!(
            domains.len() <= MAX_PARALLEL_DOMAINS,
            TooManyParallelDomainsSnafu { max: MAX_PARALLEL_DOMAINS, specified: domains.len() }
        );
        Ok(Self {
            domains,
            applies_to: EnumSet::empty(),
            reduction: None,
            block_sizes: None,
            dom_macro: None,
            acc_macro: None,
        })
    }

    pub fn restricted_to(mut self, tags: impl Into<EnumSet<ArchTag>>) -> Self {
        self.applies_to = tags.into();
        self
    }

    pub fn with_reduction(mut self, clause: ReductionClause) -> Self {
        self.reduction = Some(clause);
        self
    }

    pub fn with_block_sizes(mut self, sizes: [String; 3]) -> Self {
        self.block_sizes = Some(sizes);
        self
    }

    pub fn domains(&self) -> &[ParallelDomain] {
        &self.domains
    }

    pub fn domain_names(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(|d| d.name.as_str())
    }

    pub fn domain_named(&self, name: &str) -> Option<&ParallelDomain> {
        self.domains.iter().find(|d| d.name == name)
    }

    /// See [`arch::applies_to`].
    pub fn applies_to_arch(&self, target: ArchTag) -> bool {
        arch::applies_to(self.applies_to, target)
    }

    /// Directive reduction clause, empty when none is requested.
    pub fn reduction_clause(&self) -> String {
        self.reduction.as_ref().map(ReductionClause::render).unwrap_or_default()
    }

    /// Launch extent spec for dimension `dim` (0..3): the template override
    /// or the given preprocessor default.
    pub fn block_size_spec(&self, dim: usize, default: &str) -> String {
        match &self.block_sizes {
            Some(sizes) => sizes[dim].clone(),
            None => default.to_string(),
        }
    }
}
