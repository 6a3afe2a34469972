// Variable profiles — dtype and shape of every variable in a graph
//
// A VariableProfileTableBuilder collects the profiles of the external inputs
// (dtype + dims) and the names of the outputs the caller wants, then walks a
// ModelData in data-dependency order, applying each operator's inference
// rule (see `infer`) to resolve every intermediate variable:
//
//   seeds     declared input profiles + parameters (inputs win on a clash)
//   order     Kahn's algorithm over producer → consumer edges, ties broken
//             by original node position, so the walk is deterministic
//   result    VariableProfileTable: name → VariableProfile for every
//             variable any node references
//
// A graph that is not a DAG is detected by the ordering pass; the nodes
// that can never run are named in the error.
//
// The input rank check is a backend capability: the default builder uses
// the CPU backend's policy (ranks 2 and 4), `with_rank_policy` and
// `for_backend` select another.

use std::collections::{BTreeSet, HashMap};

use vole_core::{
    BackendConfig, DType, Error, ModelData, RankPolicy, Result, Shape, VariableProfile,
};

use crate::infer::{infer_node, InferContext};
use crate::registry;

// Dependency order

/// Order node indices so every node comes after the producers of its
/// inputs. Names no node produces must satisfy `has_profile`.
pub(crate) fn dependency_order(
    model: &ModelData,
    has_profile: impl Fn(&str) -> bool,
) -> Result<Vec<usize>> {
    let nodes = model.nodes();
    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for out in node.outputs.iter().filter(|o| !o.is_empty()) {
            if producer.insert(out.as_str(), i).is_some() || model.is_parameter(out) {
                return Err(Error::DuplicateVariable(out.clone()));
            }
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for name in node.present_inputs() {
            match producer.get(name) {
                Some(&p) => {
                    indegree[i] += 1;
                    consumers[p].push(i);
                }
                None if has_profile(name) => {}
                None if model.input_names().iter().any(|n| n == name) => {
                    return Err(Error::not_found(format!(
                        "graph input '{name}' (read by node '{}') has no input profile",
                        node.label()
                    )))
                }
                None => {
                    return Err(Error::not_found(format!(
                        "'{name}' (read by node '{}') is not an input, a parameter or a node output",
                        node.label()
                    )))
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &c in &consumers[i] {
            indegree[c] -= 1;
            if indegree[c] == 0 {
                ready.insert(c);
            }
        }
    }

    if order.len() < nodes.len() {
        let stuck: Vec<&str> = (0..nodes.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| nodes[i].label())
            .collect();
        return Err(Error::not_found(format!(
            "graph has a cycle; nodes [{}] wait on each other's outputs",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

// VariableProfileTable

/// Resolved profile of every variable in a graph.
#[derive(Debug, Clone)]
pub struct VariableProfileTable {
    profiles: HashMap<String, VariableProfile>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl VariableProfileTable {
    /// Profile of `name`; `VariableNotFound` when the graph never mentions it.
    pub fn get(&self, name: &str) -> Result<&VariableProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| Error::not_found(format!("'{name}' has no profile")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// All variable names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Names given an input profile, in declaration order.
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Requested outputs, in declaration order.
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariableProfile)> {
        self.profiles.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Reject a profile whose byte size does not fit in a usize.
fn check_size(name: &str, profile: &VariableProfile) -> Result<()> {
    match profile.checked_size_in_bytes() {
        Some(_) => Ok(()),
        None => Err(Error::dim_mismatch(format!(
            "'{name}' of {} {:?} is too large to address",
            profile.dtype, profile.dims
        ))),
    }
}

// VariableProfileTableBuilder

/// Collects input profiles and requested outputs, then infers the rest.
#[derive(Debug, Clone)]
pub struct VariableProfileTableBuilder {
    rank_policy: RankPolicy,
    inputs: Vec<(String, VariableProfile)>,
    outputs: Vec<(String, DType)>,
}

impl Default for VariableProfileTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableProfileTableBuilder {
    /// A builder accepting the input ranks of the CPU backend.
    pub fn new() -> Self {
        Self::with_rank_policy(vole_cpu::input_rank_policy())
    }

    pub fn with_rank_policy(rank_policy: RankPolicy) -> Self {
        Self {
            rank_policy,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// A builder accepting the input ranks of the named backend.
    pub fn for_backend(backend_name: &str) -> Result<Self> {
        let backend = registry::create_backend(backend_name, &BackendConfig::default())?;
        Ok(Self::with_rank_policy(backend.rank_policy()))
    }

    pub fn rank_policy(&self) -> &RankPolicy {
        &self.rank_policy
    }

    /// Declare the profile of an external input. On error the builder is
    /// left as it was.
    pub fn add_input_profile(
        &mut self,
        name: impl Into<String>,
        dtype: DType,
        dims: impl Into<Shape>,
    ) -> Result<()> {
        let name = name.into();
        let shape: Shape = dims.into();
        if self.inputs.iter().any(|(n, _)| *n == name) {
            return Err(Error::DuplicateVariable(name));
        }
        if !self.rank_policy.allows(shape.rank()) {
            return Err(Error::UnsupportedRank {
                name,
                rank: shape.rank(),
                supported: self.rank_policy.describe(),
            });
        }
        if shape.dims().contains(&0) {
            return Err(Error::dim_mismatch(format!(
                "input '{name}' has a zero dimension: {shape}"
            )));
        }
        let profile = VariableProfile::new(dtype, shape.into_dims());
        check_size(&name, &profile)?;
        self.inputs.push((name, profile));
        Ok(())
    }

    /// Request an output. Its dims are inferred; `dtype` is checked against
    /// the inferred dtype at build time.
    pub fn add_output_profile(&mut self, name: impl Into<String>, dtype: DType) -> Result<()> {
        let name = name.into();
        if self.outputs.iter().any(|(n, _)| *n == name) {
            return Err(Error::DuplicateVariable(name));
        }
        self.outputs.push((name, dtype));
        Ok(())
    }

    /// Infer the profile of every variable in `model`.
    pub fn build(&self, model: &ModelData) -> Result<VariableProfileTable> {
        let mut profiles: HashMap<String, VariableProfile> = model
            .parameters()
            .map(|(name, p)| (name.to_string(), VariableProfile::new(p.dtype, p.dims.clone())))
            .collect();
        for (name, profile) in &profiles {
            check_size(name, profile)?;
        }
        for (name, profile) in &self.inputs {
            profiles.insert(name.clone(), profile.clone());
        }

        let order = dependency_order(model, |name| profiles.contains_key(name))?;
        for &i in &order {
            let node = &model.nodes()[i];
            if let Some(out) = node
                .outputs
                .iter()
                .find(|o| self.inputs.iter().any(|(n, _)| n == *o))
            {
                return Err(Error::DuplicateVariable(out.clone()));
            }

            let inferred = infer_node(&InferContext { profiles: &profiles, model }, node)?;
            if inferred.len() != node.outputs.len() {
                return Err(Error::unsupported_op(
                    &node.op_type,
                    format!(
                        "node '{}' has {} outputs, expected {}",
                        node.label(),
                        node.outputs.len(),
                        inferred.len()
                    ),
                ));
            }
            for (name, profile) in node.outputs.iter().zip(inferred) {
                if name.is_empty() {
                    continue;
                }
                check_size(name, &profile)?;
                tracing::debug!(
                    node = %node.label(),
                    op = %node.op_type,
                    variable = %name,
                    dims = ?profile.dims,
                    "inferred profile"
                );
                profiles.insert(name.clone(), profile);
            }
        }

        for (name, dtype) in &self.outputs {
            let profile = profiles
                .get(name)
                .ok_or_else(|| Error::not_found(format!("requested output '{name}' is never produced")))?;
            if profile.dtype != *dtype {
                return Err(Error::InvalidDtype(format!(
                    "output '{name}' requested as {dtype}, inferred {}",
                    profile.dtype
                )));
            }
        }

        tracing::info!(
            nodes = order.len(),
            variables = profiles.len(),
            "built variable profile table"
        );
        Ok(VariableProfileTable {
            profiles,
            input_names: self.inputs.iter().map(|(n, _)| n.clone()).collect(),
            output_names: self.outputs.iter().map(|(n, _)| n.clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{Attribute, ErrorKind, Node};

    fn relu(x: &str, y: &str) -> Node {
        Node::new("Relu").with_inputs([x]).with_outputs([y])
    }

    #[test]
    fn test_rank_policy_rejects_rank3() {
        let mut b = VariableProfileTableBuilder::new();
        let err = b.add_input_profile("x", DType::F32, vec![1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedRank);
        b.add_input_profile("y", DType::F32, vec![1, 2]).unwrap();
        // The failed name is still free.
        b.add_input_profile("x", DType::F32, vec![1, 2, 3, 4]).unwrap();

        let mut any = VariableProfileTableBuilder::with_rank_policy(RankPolicy::Any);
        any.add_input_profile("x", DType::F32, vec![1, 2, 3]).unwrap();
    }

    #[test]
    fn test_duplicate_and_zero_dim_inputs() {
        let mut b = VariableProfileTableBuilder::new();
        b.add_input_profile("x", DType::F32, vec![2, 2]).unwrap();
        let err = b.add_input_profile("x", DType::F32, vec![2, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateVariable);
        let err = b.add_input_profile("z", DType::F32, vec![0, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
        b.add_output_profile("y", DType::F32).unwrap();
        let err = b.add_output_profile("y", DType::F32).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateVariable);
    }

    #[test]
    fn test_oversized_profiles_are_rejected() {
        let mut b = VariableProfileTableBuilder::new();
        let err = b
            .add_input_profile("x", DType::F32, vec![1 << 33, 1 << 33])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
        assert!(b.inputs.is_empty());

        // Each input fits, the product does not.
        let mut model = ModelData::new();
        model.add_node(Node::new("Gemm").with_inputs(["a", "b"]).with_outputs(["y"]));
        b.add_input_profile("a", DType::F32, vec![1 << 33, 1]).unwrap();
        b.add_input_profile("b", DType::F32, vec![1, 1 << 33]).unwrap();
        let err = b.build(&model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_out_of_order_nodes_are_sorted() {
        let mut model = ModelData::new();
        model.add_node(relu("b", "c"));
        model.add_node(relu("a", "b"));
        let mut builder = VariableProfileTableBuilder::new();
        builder.add_input_profile("a", DType::F32, vec![3, 4]).unwrap();
        builder.add_output_profile("c", DType::F32).unwrap();
        let table = builder.build(&model).unwrap();
        assert_eq!(table.get("c").unwrap().dims, vec![3, 4]);
        assert_eq!(table.names(), vec!["a", "b", "c"]);
        assert_eq!(dependency_order(&model, |n| n == "a").unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut model = ModelData::new();
        model.add_node(
            Node::new("Add")
                .with_name("add")
                .with_inputs(["x", "r"])
                .with_outputs(["s"]),
        );
        model.add_node(relu("s", "r").with_name("loop"));
        let mut builder = VariableProfileTableBuilder::new();
        builder.add_input_profile("x", DType::F32, vec![2, 2]).unwrap();
        let err = builder.build(&model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VariableNotFound);
        let msg = err.to_string();
        assert!(msg.contains("add") && msg.contains("loop"), "{msg}");
    }

    #[test]
    fn test_unknown_variable_and_duplicate_producer() {
        let mut model = ModelData::new();
        model.add_node(relu("missing", "y"));
        let builder = VariableProfileTableBuilder::new();
        let err = builder.build(&model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VariableNotFound);

        let mut model = ModelData::new();
        model.add_node(relu("x", "y"));
        model.add_node(relu("x", "y"));
        let mut builder = VariableProfileTableBuilder::new();
        builder.add_input_profile("x", DType::F32, vec![2, 2]).unwrap();
        let err = builder.build(&model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateVariable);
    }

    #[test]
    fn test_parameters_are_seeded() {
        let mut model = ModelData::new();
        model.add_parameter("w", vec![4, 8], vec![0.0; 32]).unwrap();
        model.add_node(
            Node::new("Gemm")
                .with_inputs(["x", "w"])
                .with_outputs(["y"])
                .with_attr("alpha", Attribute::Float(2.0)),
        );
        let mut builder = VariableProfileTableBuilder::new();
        builder.add_input_profile("x", DType::F32, vec![3, 4]).unwrap();
        let table = builder.build(&model).unwrap();
        assert_eq!(table.get("w").unwrap().dims, vec![4, 8]);
        assert_eq!(table.get("y").unwrap().dims, vec![3, 8]);
        assert_eq!(table.get("nope").unwrap_err().kind(), ErrorKind::VariableNotFound);
    }

    #[test]
    fn test_requested_output_checks() {
        let mut model = ModelData::new();
        model.add_node(relu("x", "y"));
        let mut builder = VariableProfileTableBuilder::new();
        builder.add_input_profile("x", DType::F32, vec![2, 2]).unwrap();
        builder.add_output_profile("z", DType::F32).unwrap();
        assert_eq!(builder.build(&model).unwrap_err().kind(), ErrorKind::VariableNotFound);

        let mut builder = VariableProfileTableBuilder::new();
        builder.add_input_profile("x", DType::F32, vec![2, 2]).unwrap();
        builder.add_output_profile("y", DType::I64).unwrap();
        assert_eq!(builder.build(&model).unwrap_err().kind(), ErrorKind::InvalidDtype);
    }

    #[test]
    fn test_for_backend() {
        let b = VariableProfileTableBuilder::for_backend("cpu").unwrap();
        assert_eq!(b.rank_policy(), &RankPolicy::Only(vec![2, 4]));
        let err = VariableProfileTableBuilder::for_backend("nonexistent").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBackendName);
    }
}
