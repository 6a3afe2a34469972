// ModelBuilder — bind a backend and buffers, compile the graph
//
// build_model runs in a fixed order and stops at the first failure:
//
//   1. resolve the backend name in the registry
//   2. parse the backend configuration string (JSON object or empty)
//   3. check input ranks, operators and dtypes against the backend
//   4. bind buffers: attached (validated against the profile), parameter
//      (shared with the ModelData), or freshly allocated and zeroed
//   5. compile one kernel per node, in dependency order
//
// Everything acquired on the way is owned by locals until the Model is
// returned, so a failed build releases it all when the error propagates.
// The table, the builder and the ModelData stay usable afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use vole_core::{
    Backend, BackendConfig, Buffer, Error, KernelSpec, ModelData, Result, VariableProfile,
};

use crate::infer::is_static_input;
use crate::model::Model;
use crate::plan::{BufferOrigin, ExecutionPlan, Step, Variable};
use crate::profile::{dependency_order, VariableProfileTable};
use crate::registry;

/// Builds models from a profile table, a graph and a backend name.
#[derive(Debug)]
pub struct ModelBuilder {
    table: Option<Arc<VariableProfileTable>>,
    external: BTreeMap<String, Buffer>,
}

impl ModelBuilder {
    pub fn new(table: Arc<VariableProfileTable>) -> Self {
        Self {
            table: Some(table),
            external: BTreeMap::new(),
        }
    }

    fn table(&self) -> Result<&Arc<VariableProfileTable>> {
        self.table
            .as_ref()
            .ok_or(Error::UseAfterDispose("ModelBuilder"))
    }

    /// Bind a caller-owned buffer to `name`, replacing any earlier binding.
    /// The buffer is checked against the variable's profile at build time.
    pub fn attach_external_buffer(&mut self, name: impl Into<String>, buffer: Buffer) -> Result<()> {
        self.table()?;
        self.external.insert(name.into(), buffer);
        Ok(())
    }

    /// Names with an attached buffer, sorted.
    pub fn attached_names(&self) -> impl Iterator<Item = &str> {
        self.external.keys().map(String::as_str)
    }

    /// Compile `model` for the backend registered as `backend_name`.
    pub fn build_model(
        &self,
        model: &ModelData,
        backend_name: &str,
        backend_config: &str,
    ) -> Result<Model> {
        let table = self.table()?;
        if !registry::has_backend(backend_name) {
            return Err(Error::InvalidBackendName(backend_name.to_string()));
        }
        let config = BackendConfig::parse(backend_name, backend_config)?;
        let backend = registry::create_backend(backend_name, &config)?;

        // Parameters are authoritative for their own profiles: the optimizer
        // may have replaced or added some since the table was built.
        let mut profiles: HashMap<&str, VariableProfile> = table
            .iter()
            .map(|(name, p)| (name, p.clone()))
            .collect();
        for (name, p) in model.parameters() {
            profiles.insert(name, VariableProfile::new(p.dtype, p.dims.clone()));
        }

        let policy = backend.rank_policy();
        for name in table.input_names() {
            let rank = table.get(name)?.rank();
            if !policy.allows(rank) {
                return Err(Error::UnsupportedRank {
                    name: name.clone(),
                    rank,
                    supported: policy.describe(),
                });
            }
        }

        let order = dependency_order(model, |name| profiles.contains_key(name))?;
        for node in order.iter().map(|&i| &model.nodes()[i]) {
            if !backend.supports_operator(&node.op_type) {
                return Err(Error::unsupported_op(
                    &node.op_type,
                    format!("backend '{backend_name}' has no kernel (node '{}')", node.label()),
                ));
            }
        }
        let variables = bind_variables(
            model,
            table,
            &order,
            &profiles,
            &self.external,
            backend.as_ref(),
        )?;
        let steps = compile(model, &order, &profiles, &variables, backend.as_ref())?;

        tracing::info!(
            backend = %backend_name,
            steps = steps.len(),
            variables = variables.len(),
            external = self.external.len(),
            "built model"
        );
        let plan = ExecutionPlan {
            backend_name: backend_name.to_string(),
            backend_config: config,
            variables,
            steps,
        };
        Ok(Model::new(backend, plan))
    }

    /// Release attached buffers and the table. Later calls fail with
    /// `UseAfterDispose`; disposing again is a no-op.
    pub fn dispose(&mut self) {
        if self.table.take().is_some() {
            tracing::debug!(attached = self.external.len(), "disposed model builder");
        }
        self.external.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.table.is_none()
    }
}

/// Names the plan exposes: every non-shape input and every output of the
/// scheduled nodes, plus the table's declared inputs and outputs.
fn plan_variables<'a>(model: &'a ModelData, table: &'a VariableProfileTable, order: &[usize]) -> Vec<&'a str> {
    let mut names: Vec<&str> = Vec::new();
    let mut push = |name: &'a str| {
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    };
    for &i in order {
        let node = &model.nodes()[i];
        for (j, name) in node.inputs.iter().enumerate() {
            if !is_static_input(&node.op_type, j) {
                push(name.as_str());
            }
        }
        for name in &node.outputs {
            push(name.as_str());
        }
    }
    for name in table.input_names().iter().chain(table.output_names()) {
        push(name.as_str());
    }
    names
}

fn bind_variables(
    model: &ModelData,
    table: &VariableProfileTable,
    order: &[usize],
    profiles: &HashMap<&str, VariableProfile>,
    external: &BTreeMap<String, Buffer>,
    backend: &dyn Backend,
) -> Result<HashMap<String, Variable>> {
    let names = plan_variables(model, table, order);
    if let Some(name) = external.keys().find(|n| !names.contains(&n.as_str())) {
        return Err(Error::not_found(format!(
            "attached buffer '{name}' does not name a variable of the graph"
        )));
    }

    let mut variables = HashMap::with_capacity(names.len());
    for name in names {
        let profile = profiles
            .get(name)
            .ok_or_else(|| Error::not_found(format!("'{name}' has no profile")))?;
        if !backend.supports_dtype(profile.dtype) {
            return Err(Error::InvalidDtype(format!(
                "'{name}' is {}, which backend '{}' cannot execute",
                profile.dtype,
                backend.name()
            )));
        }

        let (buffer, origin) = if let Some(buffer) = external.get(name) {
            check_external(name, buffer, profile)?;
            (buffer.clone(), BufferOrigin::External)
        } else if let Some(param) = model.parameter(name) {
            (param.buffer.clone(), BufferOrigin::Parameter)
        } else {
            (Buffer::zeros_with_dims(&profile.dims), BufferOrigin::Internal)
        };
        variables.insert(
            name.to_string(),
            Variable {
                dtype: profile.dtype,
                dims: profile.dims.clone(),
                buffer,
                origin,
            },
        );
    }
    Ok(variables)
}

/// Buffers hold f32; a non-f32 profile never reaches this point because
/// the backend dtype check runs first.
fn check_external(name: &str, buffer: &Buffer, profile: &VariableProfile) -> Result<()> {
    if buffer.capacity_bytes() < profile.size_in_bytes() {
        return Err(Error::dim_mismatch(format!(
            "buffer attached to '{name}' holds {} bytes, profile {:?} needs {}",
            buffer.capacity_bytes(),
            profile.dims,
            profile.size_in_bytes()
        )));
    }
    if let Some(dims) = buffer.dims() {
        if dims != profile.dims.as_slice() {
            return Err(Error::dim_mismatch(format!(
                "buffer attached to '{name}' is declared {dims:?}, profile is {:?}",
                profile.dims
            )));
        }
    }
    Ok(())
}

fn compile(
    model: &ModelData,
    order: &[usize],
    profiles: &HashMap<&str, VariableProfile>,
    variables: &HashMap<String, Variable>,
    backend: &dyn Backend,
) -> Result<Vec<Step>> {
    let lookup = |name: &str| {
        variables
            .get(name)
            .ok_or_else(|| Error::not_found(format!("'{name}' is not bound")))
    };

    let mut steps = Vec::with_capacity(order.len());
    for &i in order {
        let node = &model.nodes()[i];

        let mut input_profiles = Vec::with_capacity(node.inputs.len());
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for (j, name) in node.inputs.iter().enumerate() {
            if name.is_empty() || is_static_input(&node.op_type, j) {
                input_profiles.push(None);
                inputs.push(None);
            } else {
                input_profiles.push(profiles.get(name.as_str()));
                inputs.push(Some(lookup(name)?.buffer.clone()));
            }
        }
        let mut output_profiles = Vec::with_capacity(node.outputs.len());
        let mut outputs = Vec::with_capacity(node.outputs.len());
        for name in &node.outputs {
            let profile = profiles
                .get(name.as_str())
                .ok_or_else(|| Error::not_found(format!("'{name}' has no profile")))?;
            output_profiles.push(profile);
            outputs.push(lookup(name)?.buffer.clone());
        }

        let spec = KernelSpec {
            node,
            inputs: input_profiles,
            outputs: output_profiles,
        };
        let kernel = backend.compile(&spec)?;
        tracing::debug!(node = %node.label(), op = %node.op_type, "compiled");
        let step = Step {
            label: node.label().to_string(),
            op_type: node.op_type.clone(),
            kernel,
            inputs,
            outputs,
        };
        step.check_outputs_distinct()?;
        steps.push(step);
    }
    Ok(steps)
}
