//! Per-routine lowering state.

use std::sync::Arc;

use heddle_lang::domain::ParallelRegionTemplate;
use heddle_model::{Routine, Symbol};

/// Mutable state threaded through one routine's lowering pass.
///
/// The driver creates a fresh context per routine; nothing in here may
/// survive from one routine to the next.
#[derive(Debug, Clone, Default)]
pub struct PassContext {
    /// Routine being lowered, for instrumentation labels.
    pub routine_name: String,
    /// Its defining module.
    pub module_name: String,
    /// Sequence number of the parallel block being lowered, used for
    /// loop labels and kernel bookkeeping.
    pub kernel_number: usize,
    /// Template of the kernel call currently being prepared.
    pub current_template: Option<Arc<ParallelRegionTemplate>>,
    /// A debug print iterator was declared for this routine.
    pub debug_iterator_declared: bool,
    /// Early returns seen so far, for exit-point labelling.
    pub early_return_count: usize,
    /// Symbols the trace instrumentation captured at declaration end.
    pub traced_symbols: Vec<Symbol>,
}

impl PassContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_routine(routine: &Routine) -> Self {
        Self {
            routine_name: routine.name.clone(),
            module_name: routine.module_name.clone(),
            ..Self::default()
        }
    }

    /// Loop label of the parallel block currently being lowered.
    pub fn outer_loop_label(&self) -> String {
        format!("outer_parallel_loop{}", self.kernel_number)
    }
}
