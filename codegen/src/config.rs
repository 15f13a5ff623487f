//! Code generation options and target architecture selection.

use enumset::EnumSet;

use crate::cuda::CudaBackend;
use crate::error::{Result, UnknownArchitectureSnafu};
use crate::instrument::{DebugDecorator, TraceDecorator, TraceMode};
use crate::openacc::OpenAccBackend;
use crate::openmp::OpenMpBackend;
use crate::sequential::SequentialBackend;
use crate::traits::Backend;

/// Togglable behaviors of the generated code.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter)]
#[derive(enumset::EnumSetType)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum OptionFlag {
    /// Instrument routines with iteration markers and data checksums.
    DebugPrint,
    /// Instrument routines with array snapshots written to disk.
    Trace,
    /// Leave the GPU cache configuration untouched before kernel launches.
    KeepGpuCacheConfig,
}

/// Option flags threaded into backend construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodegenOptions {
    pub flags: EnumSet<OptionFlag>,
}

impl CodegenOptions {
    pub fn new(flags: EnumSet<OptionFlag>) -> Self {
        Self { flags }
    }

    pub fn with_flag(mut self, flag: OptionFlag) -> Self {
        self.flags |= flag;
        self
    }

    pub fn has(&self, flag: OptionFlag) -> bool {
        self.flags.contains(flag)
    }
}

/// Build the backend for an architecture spec like `cuda` or
/// `openmp.debug`.
///
/// The part after the first `.` selects an instrumentation variant and
/// overrides the flag-driven wrapping; without one, [`OptionFlag`]s in
/// `options` decide which decorators wrap the dialect backend.
pub fn backend_for(architecture: &str, options: CodegenOptions) -> Result<Box<dyn Backend>> {
    let (base, variant) = match architecture.split_once('.') {
        Some((base, variant)) => (base.to_lowercase(), variant.to_lowercase()),
        None => (architecture.to_lowercase(), String::new()),
    };
    let candidates: Vec<Box<dyn Backend>> = vec![
        Box::new(SequentialBackend::new()),
        Box::new(OpenMpBackend::new()),
        Box::new(OpenAccBackend::new()),
        Box::new(CudaBackend::new(options)),
    ];
    let Some(backend) =
        candidates.into_iter().find(|b| b.capabilities().architectures.contains(&base.as_str()))
    else {
        return UnknownArchitectureSnafu { name: architecture }.fail();
    };
    let on_device = backend.capabilities().on_device;
    let record_or_compare = if on_device { TraceMode::Compare } else { TraceMode::Record };
    match variant.as_str() {
        "" => {
            let mut backend = backend;
            if options.has(OptionFlag::DebugPrint) {
                backend = Box::new(DebugDecorator::new(backend));
            }
            if options.has(OptionFlag::Trace) {
                backend = Box::new(TraceDecorator::new(backend, record_or_compare));
            }
            Ok(backend)
        }
        "debug" => Ok(Box::new(DebugDecorator::new(backend))),
        "emulated" => Ok(Box::new(DebugDecorator::emulated(backend))),
        "trace" => Ok(Box::new(TraceDecorator::new(backend, record_or_compare))),
        _ => UnknownArchitectureSnafu { name: architecture }.fail(),
    }
}
