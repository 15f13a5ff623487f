//! Architecture-specific lowering of annotated parallel Fortran.
//!
//! This crate turns the analyzed routine model of `heddle-model` into
//! compilable Fortran for one target dialect at a time: plain host
//! loops, OpenMP, OpenACC, or CUDA Fortran with extracted kernels.
//!
//! # Architecture
//!
//! - **Traits**: the [`Backend`] contract plus the [`Capabilities`]
//!   flags callers branch on
//! - **Backends**: `sequential`, `openmp`, `openacc`, `cuda`, with
//!   debug/trace instrumentation as wrapping decorators
//! - **Driver**: splits routines (kernel extraction, host copies) and
//!   renders them line by line
//!
//! # Usage
//!
//! ```ignore
//! use heddle_codegen::{backend_for, lower_module, CodegenOptions};
//!
//! let backend = backend_for("cuda.debug", CodegenOptions::default())?;
//! let routines = lower_module(&module, routines, &modules, backend.as_ref())?;
//! ```

pub mod common;
pub mod config;
pub mod context;
pub mod cuda;
pub mod device_data;
pub mod driver;
pub mod error;
pub mod extract;
pub mod instrument;
pub mod openacc;
pub mod openmp;
pub mod residency;
pub mod sequential;
pub mod traits;


pub use config::{CodegenOptions, OptionFlag, backend_for};
pub use context::PassContext;
pub use driver::{RenderedRoutine, file_preamble, lower_module};
pub use error::*;
pub use traits::*;
