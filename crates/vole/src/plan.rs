// ExecutionPlan — bound buffers + compiled schedule
//
// The plan is what ModelBuilder produces and Model runs:
//
//   variables   name → Variable (dtype, dims, buffer handle) for every
//               variable the schedule touches, plus declared inputs/outputs
//   steps       one compiled kernel per node, in dependency order, with
//               its input/output buffers already resolved
//
// Running a step locks its buffers for the duration of one kernel: a read
// lock per distinct input buffer and a write lock per output buffer. An
// input that shares its buffer with one of the step's outputs is copied
// before the write locks are taken.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLockReadGuard;

use vole_core::{Backend, BackendConfig, Buffer, DType, Error, Kernel, Result};

/// Where a variable's buffer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Attached by the caller; never released by the model.
    External,
    /// Shared with a ModelData parameter.
    Parameter,
    /// Allocated for the model.
    Internal,
}

/// A variable as seen by a built model.
#[derive(Debug, Clone)]
pub struct Variable {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub buffer: Buffer,
    pub origin: BufferOrigin,
}

/// One compiled node.
pub(crate) struct Step {
    pub label: String,
    pub op_type: String,
    pub kernel: Box<dyn Kernel>,
    /// Aligned with the node's inputs; `None` for omitted or shape-only
    /// inputs.
    pub inputs: Vec<Option<Buffer>>,
    pub outputs: Vec<Buffer>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("label", &self.label)
            .field("op_type", &self.op_type)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

enum Source {
    Omitted,
    Locked(usize),
    Copied(usize),
}

impl Step {
    /// Reject a step whose outputs share a buffer.
    pub(crate) fn check_outputs_distinct(&self) -> Result<()> {
        for (i, a) in self.outputs.iter().enumerate() {
            if self.outputs[..i].iter().any(|b| Buffer::ptr_eq(a, b)) {
                return Err(Error::backend(format!(
                    "{} '{}': two outputs are bound to the same buffer",
                    self.op_type, self.label
                )));
            }
        }
        Ok(())
    }

    fn run(&self, backend: &dyn Backend) -> Result<()> {
        let mut locked: Vec<(Buffer, RwLockReadGuard<'_, Box<[f32]>>)> = Vec::new();
        let mut copied: Vec<Vec<f32>> = Vec::new();
        let mut sources = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let Some(buf) = input else {
                sources.push(Source::Omitted);
                continue;
            };
            if self.outputs.iter().any(|o| Buffer::ptr_eq(o, buf)) {
                copied.push(buf.to_vec()?);
                sources.push(Source::Copied(copied.len() - 1));
            } else if let Some(i) = locked.iter().position(|(b, _)| Buffer::ptr_eq(b, buf)) {
                sources.push(Source::Locked(i));
            } else {
                locked.push((buf.clone(), buf.read()?));
                sources.push(Source::Locked(locked.len() - 1));
            }
        }
        let inputs: Vec<&[f32]> = sources
            .iter()
            .map(|s| match *s {
                Source::Omitted => &[][..],
                Source::Locked(i) => &locked[i].1[..],
                Source::Copied(i) => copied[i].as_slice(),
            })
            .collect();

        let mut guards = self
            .outputs
            .iter()
            .map(Buffer::write)
            .collect::<Result<Vec<_>>>()?;
        let mut outputs: Vec<&mut [f32]> = guards.iter_mut().map(|g| &mut g[..]).collect();

        backend
            .execute(self.kernel.as_ref(), &inputs, &mut outputs)
            .map_err(|e| match e {
                Error::Backend(msg) => {
                    Error::backend(format!("{} '{}': {msg}", self.op_type, self.label))
                }
                other => Error::backend(format!("{} '{}': {other}", self.op_type, self.label)),
            })
    }
}

/// Backend binding, buffers and compiled schedule of one model.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub(crate) backend_name: String,
    pub(crate) backend_config: BackendConfig,
    pub(crate) variables: HashMap<String, Variable>,
    pub(crate) steps: Vec<Step>,
}

impl ExecutionPlan {
    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn backend_config(&self) -> &BackendConfig {
        &self.backend_config
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Variable names, sorted.
    pub fn variable_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.variables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of compiled steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Node labels in schedule order.
    pub fn schedule(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.label.as_str())
    }

    /// Run every step once, in order.
    pub(crate) fn run(&self, backend: &dyn Backend) -> Result<()> {
        for step in &self.steps {
            step.run(backend)?;
        }
        Ok(())
    }
}
