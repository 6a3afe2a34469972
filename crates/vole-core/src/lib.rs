//! # vole-core
//!
//! Core types shared by every Vole crate.
//!
//! This crate provides:
//! - [`DType`] / [`Shape`] — element types and dimensions
//! - [`Error`] / [`ErrorKind`] — the error taxonomy, kind and message together
//! - [`Buffer`] — shared handle to contiguous f32 storage
//! - [`ModelData`] / [`Node`] / [`Attribute`] — the in-memory graph
//! - [`Backend`] / [`Kernel`] — abstraction over compute backends
// - dtype: element types and their sizes
// - shape: dimensions, strides, broadcasting
// - graph: nodes, attributes, parameters, variable profiles
// - window: conv/pool window geometry (kernel, strides, pads, dilations)
// - backend: backend/kernel traits, rank policy, backend configuration

pub mod backend;
pub mod buffer;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod shape;
pub mod window;

pub use backend::{Backend, BackendConfig, Kernel, KernelSpec, RankPolicy};
pub use buffer::{Buffer, BufferId};
pub use dtype::DType;
pub use error::{Error, ErrorKind, Result};
pub use graph::{Attribute, ModelData, Node, Parameter, VariableProfile};
pub use shape::{checked_elem_count, normalize_axis, Shape};
pub use window::Window2d;
