// Model — runtime handle over one ExecutionPlan
//
// Lifecycle:
//
//   Built ──run()──▶ Built ──run()──▶ ...
//     │
//     └──dispose() / drop──▶ Disposed
//
// dispose releases the compiled kernels, the backend instance (and any
// worker pool it owns) and the model's references to every buffer. Buffers
// the caller attached keep living through the caller's own handles.
// Anything but dispose on a Disposed model fails with UseAfterDispose.

use std::fmt;

use vole_core::{Backend, Error, Result};

use crate::plan::{BufferOrigin, ExecutionPlan, Variable};

/// Where a model is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Built,
    Disposed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::Built => write!(f, "built"),
            ModelState::Disposed => write!(f, "disposed"),
        }
    }
}

/// A compiled model, ready to run.
pub struct Model {
    backend_name: String,
    inner: Option<(Box<dyn Backend>, ExecutionPlan)>,
    runs: u64,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("backend", &self.backend_name)
            .field("state", &self.state())
            .field("runs", &self.runs)
            .finish()
    }
}

impl Model {
    pub(crate) fn new(backend: Box<dyn Backend>, plan: ExecutionPlan) -> Self {
        Self {
            backend_name: plan.backend_name().to_string(),
            inner: Some((backend, plan)),
            runs: 0,
        }
    }

    /// The compiled plan.
    pub fn plan(&self) -> Result<&ExecutionPlan> {
        self.inner
            .as_ref()
            .map(|(_, plan)| plan)
            .ok_or(Error::UseAfterDispose("Model"))
    }

    /// Execute the schedule once, in order. Kernel faults surface as
    /// `Backend` errors.
    pub fn run(&mut self) -> Result<()> {
        let (backend, plan) = self
            .inner
            .as_ref()
            .ok_or(Error::UseAfterDispose("Model"))?;
        plan.run(backend.as_ref())?;
        self.runs += 1;
        Ok(())
    }

    /// The variable `name` as bound in the plan. The returned buffer is the
    /// same handle the plan uses (for attached buffers, the caller's).
    pub fn get_variable(&self, name: &str) -> Result<Variable> {
        self.plan()?
            .variable(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("'{name}' is not part of the model")))
    }

    /// Variable names, sorted. Empty once disposed.
    pub fn variable_names(&self) -> Vec<&str> {
        self.plan()
            .map(ExecutionPlan::variable_names)
            .unwrap_or_default()
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn state(&self) -> ModelState {
        if self.inner.is_some() {
            ModelState::Built
        } else {
            ModelState::Disposed
        }
    }

    /// Completed `run` calls.
    pub fn run_count(&self) -> u64 {
        self.runs
    }

    /// Release kernels, internal buffers and the backend. Idempotent;
    /// attached buffers are never touched.
    pub fn dispose(&mut self) {
        if let Some((backend, plan)) = self.inner.take() {
            let internal = plan
                .variables
                .values()
                .filter(|v| v.origin == BufferOrigin::Internal)
                .count();
            tracing::debug!(
                backend = %backend.name(),
                steps = plan.len(),
                internal_buffers = internal,
                "disposed model"
            );
            drop(plan);
            drop(backend);
        }
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.dispose();
    }
}
