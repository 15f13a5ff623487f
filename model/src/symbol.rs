//! The staged data-dependency descriptor.
//!
//! A [`Symbol`] is created once per declared dependency per scope and
//! filled in three strictly ordered stages:
//!
//! 1. [`Symbol::load_dependency_attributes`]: the annotation entry
//! 2. [`Symbol::load_routine_context`]: active parallel templates
//! 3. [`Symbol::load_declaration`]: the textual declaration line
//!
//! Skipping a stage is a usage error; re-loading a stage that already
//! passed logs a warning and overwrites the previous derived state.

use std::sync::Arc;

use enumset::EnumSet;
use smallvec::SmallVec;
use snafu::ensure;

use heddle_lang::domain::ParallelRegionTemplate;
use heddle_lang::specline::{self, SplitDeclaration};

use crate::analysis::SymbolAnalysis;
use crate::error::{
    AccessArityMismatchSnafu, AutoDomWithTemplateDimensionsSnafu, InactiveDomainNotDeclaredSnafu,
    MissingDeclarationPrefixSnafu, MultipleActiveTemplatesSnafu, ParallelDomainDeclaredOutsideSnafu,
    Result, StageSkippedSnafu, UnmatchedDeclaredDimensionsSnafu,
};
use crate::routine::ParallelRegionPosition;

/// Identifier length cap of the emitted dialect.
const MAX_IDENTIFIER_LEN: usize = 31;

/// Name suffix for device copies of data objects.
pub const DEVICE_POSTFIX: &str = "_d";

/// Initialization stages, in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display)]
pub enum InitStage {
    #[strum(serialize = "nothing-loaded")]
    NothingLoaded,
    #[strum(serialize = "dependency-entry-loaded")]
    DependencyEntryLoaded,
    #[strum(serialize = "routine-context-loaded")]
    RoutineContextLoaded,
    #[strum(serialize = "declaration-loaded")]
    DeclarationLoaded,
}

/// Declared intent of a symbol in its routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Intent {
    In,
    Out,
    InOut,
    Local,
    #[default]
    Unspecified,
}

impl Intent {
    pub fn parse(text: Option<&str>) -> Self {
        match text.map(|t| t.trim().to_ascii_lowercase()).as_deref() {
            Some("in") => Self::In,
            Some("out") => Self::Out,
            Some("inout") => Self::InOut,
            Some("local") => Self::Local,
            _ => Self::Unspecified,
        }
    }

    /// Value flows into the routine.
    pub fn is_input(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    /// Value flows out of the routine.
    pub fn is_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }

    /// Safe to pass into a kernel by value: never written back, not a
    /// kernel-local temporary.
    pub fn pass_by_value_safe(self) -> bool {
        !matches!(self, Self::Out | Self::InOut | Self::Local)
    }
}

/// Attribute flags of a dependency annotation template.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumString)]
#[derive(enumset::EnumSetType)]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum DependencyAttribute {
    /// Dimensions are inferred from active templates plus the declaration.
    AutoDom,
    /// Caller guarantees device residency.
    Present,
    /// Generated code must copy across the host/device boundary here.
    TransferHere,
    /// Pinned to the host despite living in a device-capable scope.
    Host,
}

/// The template half of a dependency annotation, shared by every symbol
/// the annotation lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyTemplate {
    pub attributes: EnumSet<DependencyAttribute>,
    /// Dependency dimensions as `(domain name, size)` pairs, in storage
    /// order.
    pub domains: Vec<(String, String)>,
    /// Type text override for automatic declarations.
    pub declaration_prefix: Option<String>,
    /// Storage-order macro for declarations.
    pub dom_macro: Option<String>,
    /// Storage-order macro for accesses.
    pub acc_macro: Option<String>,
}

/// One named symbol inside a dependency annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyEntry {
    pub name: String,
    pub intent: Option<String>,
    pub declaration_prefix: Option<String>,
    /// Module the symbol originates from, when imported or module-scoped.
    pub source_module: Option<String>,
    /// Name in the source module when imported under a different name.
    pub source_symbol: Option<String>,
    /// Dimension sizes already known from earlier passes.
    pub declared_sizes: Vec<String>,
}

/// Scope a symbol instance was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclarationScope {
    Module { module: String },
    Routine { routine: String, module: String },
}

impl DeclarationScope {
    pub fn module_name(&self) -> &str {
        match self {
            Self::Module { module } | Self::Routine { module, .. } => module,
        }
    }

    pub fn scope_name(&self) -> &str {
        match self {
            Self::Module { module } => module,
            Self::Routine { routine, .. } => routine,
        }
    }
}

/// Where a symbol's defining declaration lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolOrigin {
    /// Declared inside the routine being processed.
    RoutineLocal,
    /// Declared at the scope of the routine's own module.
    CurrentModule,
    /// Belongs to another module.
    ForeignModule { module: String, source_name: Option<String> },
}

impl SymbolOrigin {
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::ForeignModule { module, .. } => Some(module),
            _ => None,
        }
    }
}

/// Mutually exclusive declaration classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
pub enum DeclarationKind {
    Undefined,
    LocalArray,
    LocalScalar,
    ModuleArray,
    ModuleArgumentArray,
    LocalModuleScalar,
    ImportedScalar,
    ForeignModuleScalar,
    OtherScalar,
}

impl DeclarationKind {
    /// Module-scoped kinds, wherever the module is.
    pub fn is_module_scoped(self) -> bool {
        matches!(
            self,
            Self::ModuleArray
                | Self::ModuleArgumentArray
                | Self::LocalModuleScalar
                | Self::ForeignModuleScalar
        )
    }

    pub fn is_module_array(self) -> bool {
        matches!(self, Self::ModuleArray | Self::ModuleArgumentArray)
    }
}

/// Identity of one symbol dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimTag {
    /// Follows a named parallel domain.
    Domain(String),
    /// Carried through storage order untouched.
    Inactive,
}

/// One dimension of a symbol: the domain it follows and its extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDimension {
    pub tag: DimTag,
    pub size: String,
}

impl DataDimension {
    pub fn named(name: impl Into<String>, size: impl Into<String>) -> Self {
        Self { tag: DimTag::Domain(name.into()), size: size.into() }
    }

    pub fn inactive(size: impl Into<String>) -> Self {
        Self { tag: DimTag::Inactive, size: size.into() }
    }
}

/// The staged data-dependency descriptor for one variable in one scope.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub scope: DeclarationScope,
    pub origin: SymbolOrigin,
    pub intent: Intent,
    pub declaration_prefix: Option<String>,
    pub analysis: Option<SymbolAnalysis>,

    /// Dimensions inferred rather than fully spelled out by the author.
    pub is_auto_dom: bool,
    /// Declared by the translator instead of the author (synthesized
    /// module copies inside kernels).
    pub is_automatic: bool,
    /// Dummy argument of its routine scope.
    pub is_argument: bool,
    /// Packed/opaque, excluded from residency analysis.
    pub is_compacted: bool,
    pub is_type_parameter: bool,
    pub is_dimension_parameter: bool,
    /// Pulled in by an explicit use statement of the routine.
    pub imported_locally: bool,

    // Residency state, managed by the device-residency resolver.
    pub is_on_device: bool,
    pub is_using_device_postfix: bool,
    pub is_present: bool,
    pub is_to_be_transfered: bool,
    declared_host: bool,

    template: Arc<DependencyTemplate>,
    stage: InitStage,
    position: Option<ParallelRegionPosition>,
    routine_name: Option<String>,
    domains: SmallVec<[DataDimension; 4]>,
    parallel_active_dims: Vec<String>,
    /// Dimension identities outside the active parallel domains: template
    /// domain names in explicit mode, declared size expressions appended
    /// in automatic mode.
    parallel_inactive_dims: Vec<String>,
    /// Stage-2 snapshot of the template-listed inactive names, so stage 3
    /// re-runs rebuild instead of accumulating.
    template_inactive_dims: Vec<String>,
    /// Active domain name to resolved size, template order.
    aggregated_domain_sizes: Vec<(String, String)>,
    num_parallel_domains: usize,
    /// Sizes as written in the declaration.
    declared_sizes: Vec<String>,
    /// Declaration left the shape deferred (`:` entries).
    has_undecided_sizes: bool,
}

impl Symbol {
    pub fn new(
        name: impl Into<String>,
        template: Arc<DependencyTemplate>,
        scope: DeclarationScope,
    ) -> Self {
        let is_auto_dom = template.attributes.contains(DependencyAttribute::AutoDom);
        let is_present = template.attributes.contains(DependencyAttribute::Present);
        let is_to_be_transfered = template.attributes.contains(DependencyAttribute::TransferHere);
        let declared_host = template.attributes.contains(DependencyAttribute::Host);
        let origin = match &scope {
            DeclarationScope::Module { .. } => SymbolOrigin::CurrentModule,
            DeclarationScope::Routine { .. } => SymbolOrigin::RoutineLocal,
        };
        Self {
            name: name.into(),
            scope,
            origin,
            intent: Intent::Unspecified,
            declaration_prefix: None,
            analysis: None,
            is_auto_dom,
            is_automatic: false,
            is_argument: false,
            is_compacted: false,
            is_type_parameter: false,
            is_dimension_parameter: false,
            imported_locally: false,
            is_on_device: false,
            is_using_device_postfix: false,
            is_present,
            is_to_be_transfered,
            declared_host,
            template,
            stage: InitStage::NothingLoaded,
            position: None,
            routine_name: None,
            domains: SmallVec::new(),
            parallel_active_dims: Vec::new(),
            parallel_inactive_dims: Vec::new(),
            template_inactive_dims: Vec::new(),
            aggregated_domain_sizes: Vec::new(),
            num_parallel_domains: 0,
            declared_sizes: Vec::new(),
            has_undecided_sizes: false,
        }
    }

    /// Convenience constructor covering the common load sequence start.
    pub fn from_dependency(
        template: Arc<DependencyTemplate>,
        entry: &DependencyEntry,
        scope: DeclarationScope,
    ) -> Self {
        let mut symbol = Self::new(entry.name.clone(), template, scope);
        symbol.load_dependency_attributes(entry);
        symbol
    }

    pub fn stage(&self) -> InitStage {
        self.stage
    }

    pub fn template(&self) -> &DependencyTemplate {
        &self.template
    }

    pub fn domains(&self) -> &[DataDimension] {
        &self.domains
    }

    pub fn domain_sizes(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(|d| d.size.as_str())
    }

    pub fn parallel_active_dims(&self) -> &[String] {
        &self.parallel_active_dims
    }

    pub fn parallel_inactive_dims(&self) -> &[String] {
        &self.parallel_inactive_dims
    }

    pub fn num_parallel_domains(&self) -> usize {
        self.num_parallel_domains
    }

    pub fn parallel_region_position(&self) -> Option<ParallelRegionPosition> {
        self.position
    }

    pub fn is_array(&self) -> bool {
        !self.domains.is_empty()
    }

    /// Raw pinned-host annotation, unaffected by residency state.
    pub fn declared_host(&self) -> bool {
        self.declared_host
    }

    /// Pinned to the host: annotated host and not overridden by a
    /// residency guarantee or pending transfer.
    pub fn is_host_symbol(&self) -> bool {
        self.declared_host && !self.is_present && !self.is_to_be_transfered
    }

    /// Shape left open by the declaration (deferred `:` entries).
    pub fn has_undecided_domain_sizes(&self) -> bool {
        self.has_undecided_sizes
    }

    // ----- lifecycle -------------------------------------------------

    /// Stage 1: attributes from the dependency annotation entry.
    pub fn load_dependency_attributes(&mut self, entry: &DependencyEntry) {
        if self.stage > InitStage::NothingLoaded {
            tracing::warn!(
                symbol.name = %self.name,
                stage = %self.stage,
                "dependency entry attributes reloaded after initialization advanced"
            );
        }
        self.intent = Intent::parse(entry.intent.as_deref());
        if entry.declaration_prefix.is_some() {
            self.declaration_prefix = entry.declaration_prefix.clone();
        }
        if let Some(module) = &entry.source_module {
            self.origin = if module == self.scope.module_name() {
                SymbolOrigin::CurrentModule
            } else {
                SymbolOrigin::ForeignModule {
                    module: module.clone(),
                    source_name: entry.source_symbol.clone(),
                }
            };
        }
        self.domains.clear();
        for size in &entry.declared_sizes {
            if !size.trim().is_empty() {
                self.domains.push(DataDimension::inactive(size.trim()));
            }
        }
        self.stage = self.stage.max(InitStage::DependencyEntryLoaded);
    }

    /// Stage 2: derive the active/inactive dimension split from the
    /// routine's parallel region templates.
    ///
    /// At most one active template is allowed unless the routine's
    /// parallel region position is [`ParallelRegionPosition::Inside`]
    /// (parallel blocks live in callees), where templates aggregate.
    pub fn load_routine_context(
        &mut self,
        routine_name: &str,
        position: Option<ParallelRegionPosition>,
        templates: &[Arc<ParallelRegionTemplate>],
    ) -> Result<()> {
        ensure!(
            self.stage >= InitStage::DependencyEntryLoaded,
            StageSkippedSnafu {
                symbol: self.name.clone(),
                operation: "load_routine_context",
                required: InitStage::DependencyEntryLoaded,
                actual: self.stage,
            }
        );
        if self.stage > InitStage::DependencyEntryLoaded {
            tracing::warn!(
                symbol.name = %self.name,
                stage = %self.stage,
                "routine context reloaded after initialization advanced"
            );
        }
        self.routine_name = Some(routine_name.to_string());
        // Derived state is rebuilt from scratch so re-loading replaces
        // instead of accumulating.
        self.parallel_active_dims.clear();
        self.parallel_inactive_dims.clear();
        self.template_inactive_dims.clear();
        self.aggregated_domain_sizes.clear();
        self.num_parallel_domains = 0;

        if let Some(prefix) = &self.template.declaration_prefix
            && !prefix.trim().is_empty()
        {
            self.declaration_prefix = Some(prefix.clone());
        }

        let Some(position) = position else {
            tracing::warn!(
                symbol.name = %self.name,
                routine = routine_name,
                "no parallel region position analyzed where dependants are defined"
            );
            self.stage = self.stage.max(InitStage::RoutineContextLoaded);
            return Ok(());
        };
        self.position = Some(position);

        if templates.is_empty() {
            tracing::warn!(
                symbol.name = %self.name,
                routine = routine_name,
                "no active parallel region found where dependants are defined"
            );
            self.stage = self.stage.max(InitStage::RoutineContextLoaded);
            return Ok(());
        }
        ensure!(
            templates.len() == 1 || position == ParallelRegionPosition::Inside,
            MultipleActiveTemplatesSnafu { routine: routine_name.to_string(), count: templates.len() }
        );

        for template in templates {
            for domain in template.domains() {
                let entry = (domain.name.clone(), domain.size.clone());
                if let Some(existing) =
                    self.aggregated_domain_sizes.iter_mut().find(|(n, _)| *n == domain.name)
                {
                    *existing = entry;
                } else {
                    self.aggregated_domain_sizes.push(entry);
                }
            }
        }

        for (name, _) in &self.template.domains {
            if self.aggregated_domain_sizes.iter().any(|(n, _)| n == name) {
                self.parallel_active_dims.push(name.clone());
            } else {
                self.parallel_inactive_dims.push(name.clone());
            }
        }
        self.template_inactive_dims = self.parallel_inactive_dims.clone();

        if position != ParallelRegionPosition::Outside {
            self.num_parallel_domains = self.parallel_active_dims.len();
        }

        let dims_before_reset = std::mem::take(&mut self.domains);
        for (name, size) in &self.template.domains {
            self.domains.push(DataDimension::named(name, size));
        }
        if self.is_auto_dom {
            self.domains.extend(dims_before_reset.iter().cloned());
        }
        if self.domains.len() < dims_before_reset.len() {
            panic!(
                "symbol {} lost dimensions while loading routine context: had {:?}, now {:?}",
                self.name, dims_before_reset, self.domains
            );
        }

        self.stage = self.stage.max(InitStage::RoutineContextLoaded);
        Ok(())
    }

    /// Stage 3: cross-check and finalize dimensions from the declaration.
    pub fn load_declaration(&mut self, declaration: &SplitDeclaration) -> Result<()> {
        ensure!(
            self.stage >= InitStage::RoutineContextLoaded,
            StageSkippedSnafu {
                symbol: self.name.clone(),
                operation: "load_declaration",
                required: InitStage::RoutineContextLoaded,
                actual: self.stage,
            }
        );
        if self.stage > InitStage::RoutineContextLoaded {
            tracing::warn!(
                symbol.name = %self.name,
                stage = %self.stage,
                "declaration reloaded after initialization advanced"
            );
        }

        self.declaration_prefix =
            Some(specline::purge_directives(&declaration.prefix, &["dimension"]));
        self.intent = Intent::parse(declaration.intent().as_deref());

        let declared_sizes = declaration.declared_dimensions(&self.name);
        self.has_undecided_sizes = declared_sizes.iter().any(|s| s.contains(':'));
        self.declared_sizes = declared_sizes;

        // Rebuild from the stage-2 snapshot; a re-load replaces the
        // previous result instead of appending to it.
        self.parallel_inactive_dims = self.template_inactive_dims.clone();
        self.domains.clear();

        let position = self.position;
        for name in &self.parallel_active_dims {
            let size = self
                .aggregated_domain_sizes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, s)| s.clone())
                .unwrap_or_else(|| {
                    panic!("symbol {}: active domain {name} has no aggregated size", self.name)
                });
            if position == Some(ParallelRegionPosition::Outside) {
                ensure!(
                    !self.declared_sizes.contains(&size),
                    ParallelDomainDeclaredOutsideSnafu {
                        domain: name.clone(),
                        symbol: self.name.clone(),
                    }
                );
            } else {
                self.domains.push(DataDimension::named(name, size));
            }
        }

        let mut matched_in_template = 0usize;
        for (name, size) in &self.template.domains {
            if !self.parallel_inactive_dims.contains(name) {
                continue;
            }
            ensure!(
                self.declared_sizes.contains(size),
                InactiveDomainNotDeclaredSnafu { symbol: self.name.clone(), size: size.clone() }
            );
            self.domains.push(DataDimension::named(name, size));
            matched_in_template += 1;
        }

        if self.is_auto_dom {
            for size in &self.declared_sizes {
                self.parallel_inactive_dims.push(size.clone());
                self.domains.push(DataDimension::inactive(size));
            }
        }

        if self.domains.len() < self.declared_sizes.len() {
            panic!(
                "symbol {} finished declaration loading with fewer dimensions ({:?}) than declared ({:?})",
                self.name, self.domains, self.declared_sizes
            );
        }
        ensure!(
            self.is_auto_dom || self.declared_sizes.len() == matched_in_template,
            UnmatchedDeclaredDimensionsSnafu {
                symbol: self.name.clone(),
                declared: self.declared_sizes.len(),
                matched: matched_in_template,
            }
        );
        ensure!(
            !self.is_auto_dom || matched_in_template == 0,
            AutoDomWithTemplateDimensionsSnafu { symbol: self.name.clone() }
        );

        self.stage = InitStage::DeclarationLoaded;
        Ok(())
    }

    /// Adopt import metadata from the source module's own dependency
    /// annotation, filling in whatever this scope did not declare.
    pub fn load_import(&mut self, source_module: &str, source_entry: Option<&DependencyEntry>) {
        if let SymbolOrigin::RoutineLocal | SymbolOrigin::CurrentModule = self.origin
            && source_module != self.scope.module_name()
        {
            self.origin = SymbolOrigin::ForeignModule {
                module: source_module.to_string(),
                source_name: source_entry.map(|e| e.name.clone()),
            };
        }
        if let Some(entry) = source_entry {
            if self.declaration_prefix.as_deref().unwrap_or("").is_empty() {
                self.declaration_prefix = entry.declaration_prefix.clone();
            }
            if self.intent == Intent::Unspecified {
                self.intent = Intent::parse(entry.intent.as_deref());
            }
        }
        self.imported_locally = true;
    }

    // ----- classification --------------------------------------------

    pub fn declaration_kind(&self) -> DeclarationKind {
        if self.stage == InitStage::NothingLoaded {
            return DeclarationKind::Undefined;
        }
        let array = self.is_array();
        match &self.origin {
            SymbolOrigin::CurrentModule | SymbolOrigin::ForeignModule { .. } if array => {
                if self.is_argument {
                    DeclarationKind::ModuleArgumentArray
                } else {
                    DeclarationKind::ModuleArray
                }
            }
            SymbolOrigin::CurrentModule => DeclarationKind::LocalModuleScalar,
            SymbolOrigin::ForeignModule { .. } => {
                if self.imported_locally && self.declaration_prefix.is_some() {
                    DeclarationKind::ImportedScalar
                } else {
                    DeclarationKind::ForeignModuleScalar
                }
            }
            SymbolOrigin::RoutineLocal if array => DeclarationKind::LocalArray,
            SymbolOrigin::RoutineLocal => {
                if self.stage >= InitStage::DeclarationLoaded && self.intent == Intent::Unspecified
                {
                    DeclarationKind::LocalScalar
                } else {
                    DeclarationKind::OtherScalar
                }
            }
        }
    }

    /// Whether the symbol is a compile-time constant (`parameter`).
    pub fn is_constant(&self) -> bool {
        self.declaration_prefix
            .as_deref()
            .is_some_and(|p| specline::contains_identifier(p, "parameter"))
    }

    // ----- naming ----------------------------------------------------

    /// Plain or device-qualified name, depending on residency.
    pub fn device_name(&self) -> String {
        if self.is_using_device_postfix {
            format!("{}{}", self.name, DEVICE_POSTFIX)
        } else {
            self.name.clone()
        }
    }

    /// Synthesized name for translator-declared copies, capped at the
    /// dialect's identifier limit.
    pub fn automatic_name(&self) -> String {
        if self.declaration_kind() == DeclarationKind::LocalModuleScalar {
            return self.name.clone();
        }
        let routine = self.routine_name.as_deref().unwrap_or_else(|| {
            panic!("automatic name requested for symbol {} without routine context", self.name)
        });
        let mut name = format!("{}_hdauto_{}", self.name, routine);
        name.truncate(MAX_IDENTIFIER_LEN);
        name
    }

    /// The name this scope refers to the symbol by.
    pub fn name_in_scope(&self, use_device_version: bool) -> String {
        if self.is_automatic {
            return self.automatic_name();
        }
        if use_device_version {
            return self.device_name();
        }
        self.name.clone()
    }

    // ----- rendering -------------------------------------------------

    fn require_stage(&self, operation: &str, required: InitStage) -> Result<()> {
        ensure!(
            self.stage >= required,
            StageSkippedSnafu {
                symbol: self.name.clone(),
                operation,
                required,
                actual: self.stage,
            }
        );
        Ok(())
    }

    fn acc_macro(&self) -> Option<String> {
        if let Some(m) = self.template.acc_macro.as_deref() {
            return Some(m.to_string());
        }
        default_storage_macro(self.is_auto_dom, self.domains.len(), "AT")
    }

    fn dom_macro(&self) -> Option<String> {
        if let Some(m) = self.template.dom_macro.as_deref() {
            return Some(m.to_string());
        }
        default_storage_macro(self.is_auto_dom, self.domains.len(), "DOM")
    }

    /// `name(:,:,...)` selecting the whole array.
    pub fn whole_array_slice(&self) -> Result<String> {
        self.require_stage("whole_array_slice", InitStage::RoutineContextLoaded)?;
        if self.domains.is_empty() {
            return Ok(self.device_name());
        }
        let colons = vec![":"; self.domains.len()].join(",");
        Ok(format!("{}({})", self.device_name(), colons))
    }

    /// Index expression in declared-domain order.
    ///
    /// `iterators` feed the parallel dimensions, `offsets` the inactive
    /// ones; with no iterators, offsets either cover every dimension or
    /// exactly the inactive ones (parallel dimensions render as `:`).
    pub fn access_expression(&self, iterators: &[&str], offsets: &[&str]) -> Result<String> {
        self.require_stage("access_expression", InitStage::RoutineContextLoaded)?;
        let dims = self.domains.len();
        let parallel = self.num_parallel_domains;
        let arity_ok = if iterators.is_empty() {
            offsets.len() == dims || offsets.len() == dims - parallel
        } else {
            offsets.len() == dims || offsets.len() + iterators.len() == dims
        };
        ensure!(
            arity_ok,
            AccessArityMismatchSnafu {
                symbol: self.name.clone(),
                offsets: offsets.len(),
                iterators: iterators.len(),
                dimensions: dims,
                parallel,
            }
        );

        let base = if self.is_automatic { self.automatic_name() } else { self.device_name() };
        if dims == 0 {
            return Ok(base);
        }

        let mut indices: Vec<&str> = Vec::with_capacity(dims);
        for i in 0..dims {
            if iterators.is_empty() {
                if offsets.len() == dims {
                    indices.push(offsets[i]);
                } else if i < parallel {
                    indices.push(":");
                } else {
                    indices.push(offsets[i - parallel]);
                }
            } else if offsets.len() == dims {
                indices.push(offsets[i]);
            } else if i < iterators.len() {
                indices.push(iterators[i]);
            } else {
                indices.push(offsets[i - parallel]);
            }
        }

        let joined = indices.join(",");
        let wrapped = match self.acc_macro() {
            Some(m) if parallel != 0 => format!("{m}({joined})"),
            _ => joined,
        };
        Ok(format!("{base}({wrapped})"))
    }

    /// Declaration-side representation: name plus dimension sizes, wrapped
    /// in the storage-order macro where parallel domains are active.
    pub fn domain_representation(&self) -> String {
        let base = if self.is_automatic { self.automatic_name() } else { self.device_name() };
        if self.domains.is_empty() {
            return base;
        }
        let sizes: Vec<&str> = self.domains.iter().map(|d| d.size.as_str()).collect();
        let joined = sizes.join(",");
        match self.dom_macro() {
            Some(m) if self.num_parallel_domains != 0 => format!("{base}({m}({joined}))"),
            _ => format!("{base}({joined})"),
        }
    }

    /// `name(size,...)` as needed by an allocation statement.
    pub fn allocation_representation(&self) -> String {
        let base = if self.is_automatic { self.automatic_name() } else { self.device_name() };
        if self.domains.is_empty() {
            return base;
        }
        let sizes: Vec<&str> = self.domains.iter().map(|d| d.size.as_str()).collect();
        format!("{}({})", base, sizes.join(","))
    }

    /// Declared type text with a guaranteed trailing `::`.
    pub fn sanitized_declaration_prefix(&self) -> Result<String> {
        let prefix = self.declaration_prefix.as_deref().unwrap_or("").trim();
        ensure!(!prefix.is_empty(), MissingDeclarationPrefixSnafu { symbol: self.name.clone() });
        if prefix.contains("::") {
            return Ok(prefix.to_string());
        }
        Ok(format!("{prefix} ::"))
    }

    /// Full declaration line for a translator-declared symbol.
    pub fn automatic_declaration_line(&self) -> Result<String> {
        let prefix = self.sanitized_declaration_prefix()?;
        Ok(format!("{} {}", prefix, self.domain_representation()))
    }

    // ----- cross-symbol passes ---------------------------------------

    /// Absorb another scope's descriptor for the same data object.
    ///
    /// Flags of `self` win; only unset identity and declaration facts are
    /// filled in from `other`.
    pub fn merge(&mut self, other: &Symbol) {
        if self.intent == Intent::Unspecified {
            self.intent = other.intent;
        }
        if self.declaration_prefix.as_deref().unwrap_or("").is_empty()
            && other.declaration_prefix.is_some()
        {
            self.declaration_prefix = other.declaration_prefix.clone();
        }
        if self.domains.is_empty() && !other.domains.is_empty() {
            self.domains = other.domains.clone();
            self.parallel_active_dims = other.parallel_active_dims.clone();
            self.parallel_inactive_dims = other.parallel_inactive_dims.clone();
            self.template_inactive_dims = other.template_inactive_dims.clone();
            self.aggregated_domain_sizes = other.aggregated_domain_sizes.clone();
            self.num_parallel_domains = other.num_parallel_domains;
        }
        if self.origin == SymbolOrigin::RoutineLocal && other.origin != SymbolOrigin::RoutineLocal
        {
            self.origin = other.origin.clone();
        }
        if self.analysis.is_none() {
            self.analysis = other.analysis.clone();
        }
        self.stage = self.stage.max(other.stage);
    }

    /// Whether `routine` already receives this symbol as an explicit
    /// dummy argument.
    pub fn is_dummy_for(&self, routine: &str) -> bool {
        self.analysis.as_ref().is_some_and(|a| a.is_dummy_for(routine))
    }
}

/// Storage-order macro names synthesized for automatic-dimension symbols.
fn default_storage_macro(auto_dom: bool, dims: usize, base: &str) -> Option<String> {
    if !auto_dom || dims < 3 {
        return None;
    }
    if dims == 3 { Some(base.to_string()) } else { Some(format!("{base}{dims}")) }
}

/// Mark type and dimension parameters across one scope's symbols.
///
/// A symbol whose name appears in a sibling's dimension sizes becomes a
/// dimension parameter (and thereby a type parameter); one whose name
/// appears in a sibling's declared type text becomes a type parameter
/// only.
pub fn mark_type_parameters(symbols: &mut [Symbol]) {
    let names: Vec<String> = symbols.iter().map(|s| s.name.clone()).collect();
    for i in 0..symbols.len() {
        let name = &names[i];
        let mut dimension = false;
        let mut kind_param = false;
        for (j, other) in symbols.iter().enumerate() {
            if i == j {
                continue;
            }
            if other.domain_sizes().any(|size| specline::contains_identifier(size, name)) {
                dimension = true;
            }
            if let Some(prefix) = &other.declaration_prefix
                && specline::contains_identifier(prefix, name)
            {
                kind_param = true;
            }
        }
        if dimension {
            symbols[i].is_dimension_parameter = true;
            symbols[i].is_type_parameter = true;
        } else if kind_param {
            symbols[i].is_type_parameter = true;
        }
    }
}

/// [`mark_type_parameters`] for one symbol against an existing scope.
pub fn mark_type_parameter_among<'a>(
    symbol: &mut Symbol,
    siblings: impl Iterator<Item = &'a Symbol>,
) {
    let mut dimension = false;
    let mut kind_param = false;
    for other in siblings {
        if other.name == symbol.name {
            continue;
        }
        if other.domain_sizes().any(|size| specline::contains_identifier(size, &symbol.name)) {
            dimension = true;
        }
        if let Some(prefix) = &other.declaration_prefix
            && specline::contains_identifier(prefix, &symbol.name)
        {
            kind_param = true;
        }
    }
    if dimension {
        symbol.is_dimension_parameter = true;
        symbol.is_type_parameter = true;
    } else if kind_param {
        symbol.is_type_parameter = true;
    }
}
