//! # Vole
//!
//! An inference-graph execution pipeline built in Rust.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vole::prelude::*;
//!
//! # fn main() -> vole::Result<()> {
//! let model_data = vole::onnx::load_onnx("model.onnx")?;
//!
//! let mut profiles = VariableProfileTableBuilder::new();
//! profiles.add_input_profile("input", DType::F32, vec![1, 3, 224, 224])?;
//! profiles.add_output_profile("output", DType::F32)?;
//! let table = Arc::new(profiles.build(&model_data)?);
//!
//! let input = Buffer::zeros_with_dims(&[1, 3, 224, 224]);
//! let mut builder = ModelBuilder::new(table);
//! builder.attach_external_buffer("input", input.clone())?;
//! let mut model = builder.build_model(&model_data, "cpu", "")?;
//! model.run()?;
//! let output = model.get_variable("output")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `vole-core` | DType, Shape, Error, Buffer, graph types, Backend/Kernel traits |
//! | `vole-cpu` | CPU backend (`"cpu"`) with rayon-parallel kernels |
//!
//! ## Modules
//!
//! - [`onnx`] — ONNX import into [`ModelData`]
//! - [`profile`] — variable profile inference
//! - [`optimize`] — graph rewrites (trim, BN folding, activation fusion, pruning)
//! - [`builder`] — backend binding, buffer binding and compilation
//! - [`model`] — running a compiled model
//! - [`registry`] — backends by name

/// Re-export core types.
pub use vole_core::{
    Attribute, Backend, BackendConfig, Buffer, DType, Error, ErrorKind, Kernel, KernelSpec,
    ModelData, Node, Parameter, RankPolicy, Result, Shape, VariableProfile,
};

/// Re-export the CPU backend.
pub use vole_cpu::{CpuBackend, CpuConfig};

mod infer;

/// ONNX — Import of ONNX graphs.
pub mod onnx;

/// Profiles — dtype and shape inference over a graph.
pub mod profile;

/// Optimize — backend-agnostic graph rewrites.
pub mod optimize;

/// Registry — backend lookup by name.
pub mod registry;

/// Plan — buffers and compiled schedule of a model.
pub mod plan;

/// Builder — turns a graph and a profile table into a model.
pub mod builder;

/// Model — runtime handle.
pub mod model;

pub use builder::ModelBuilder;
pub use model::{Model, ModelState};
pub use optimize::{Optimize, OptimizeStats};
pub use plan::{BufferOrigin, ExecutionPlan, Variable};
pub use profile::{VariableProfileTable, VariableProfileTableBuilder};

/// Everything needed to load, build and run a model.
pub mod prelude {
    pub use crate::builder::ModelBuilder;
    pub use crate::model::{Model, ModelState};
    pub use crate::optimize::{Optimize, OptimizeStats};
    pub use crate::plan::Variable;
    pub use crate::profile::{VariableProfileTable, VariableProfileTableBuilder};
    pub use vole_core::{Buffer, DType, Error, ErrorKind, ModelData, Node, RankPolicy, Result};
}
