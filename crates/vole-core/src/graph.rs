use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::buffer::Buffer;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::{checked_elem_count, normalize_axis};

// Graph representation — what a loader produces and the pipeline consumes
//
//   Node       — one operator: type tag, ordered input/output variable names,
//                typed attributes
//   Attribute  — int, float, string, int-list or float-list value
//   Parameter  — a named constant tensor (e.g. an ONNX initializer)
//   ModelData  — ordered nodes + parameters + declared external inputs and
//                outputs
//
// Variables are identified by name only. A name is an external input, a
// parameter, or the output of exactly one node.

/// A typed operator attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

impl Attribute {
    fn type_name(&self) -> &'static str {
        match self {
            Attribute::Int(_) => "int",
            Attribute::Float(_) => "float",
            Attribute::String(_) => "string",
            Attribute::Ints(_) => "ints",
            Attribute::Floats(_) => "floats",
        }
    }
}

/// One operator in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Operator type tag (e.g. "Conv", "Relu").
    pub op_type: String,
    /// Node name (for diagnostics, may be empty).
    pub name: String,
    /// Input variable names, in operator order. Empty strings mark omitted
    /// optional inputs.
    pub inputs: Vec<String>,
    /// Output variable names, in operator order.
    pub outputs: Vec<String>,
    pub attributes: HashMap<String, Attribute>,
}

impl Node {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            name: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_inputs<S: Into<String>>(mut self, inputs: impl IntoIterator<Item = S>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<S: Into<String>>(mut self, outputs: impl IntoIterator<Item = S>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Name used in diagnostics: the node name, else its first output.
    pub fn label(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else {
            self.outputs.first().map(String::as_str).unwrap_or("<unnamed>")
        }
    }

    /// Input `i`, if present and not an omitted optional input.
    pub fn input(&self, i: usize) -> Option<&str> {
        self.inputs
            .get(i)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Input `i`, failing when absent.
    pub fn required_input(&self, i: usize) -> Result<&str> {
        self.input(i).ok_or_else(|| {
            Error::invalid_attribute(
                &self.op_type,
                format!("input[{i}]"),
                format!("node '{}' requires at least {} inputs", self.label(), i + 1),
            )
        })
    }

    /// Iterate over present (non-empty) input names.
    pub fn present_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    fn wrong_type(&self, key: &str, expected: &str, got: &Attribute) -> Error {
        Error::invalid_attribute(
            &self.op_type,
            key,
            format!("expected {expected}, got {}", got.type_name()),
        )
    }

    fn missing(&self, key: &str) -> Error {
        Error::invalid_attribute(&self.op_type, key, "required attribute is missing")
    }

    /// Get an integer attribute; missing or ill-typed is an error.
    pub fn attr_int(&self, key: &str) -> Result<i64> {
        match self.attributes.get(key) {
            Some(Attribute::Int(v)) => Ok(*v),
            Some(other) => Err(self.wrong_type(key, "int", other)),
            None => Err(self.missing(key)),
        }
    }

    /// Get an integer attribute with a default; ill-typed is an error.
    pub fn attr_int_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.attributes.get(key) {
            None => Ok(default),
            Some(_) => self.attr_int(key),
        }
    }

    pub fn attr_float_or(&self, key: &str, default: f32) -> Result<f32> {
        match self.attributes.get(key) {
            None => Ok(default),
            Some(Attribute::Float(v)) => Ok(*v),
            Some(Attribute::Int(v)) => Ok(*v as f32),
            Some(other) => Err(self.wrong_type(key, "float", other)),
        }
    }

    pub fn attr_string(&self, key: &str) -> Result<Option<&str>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(Attribute::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.wrong_type(key, "string", other)),
        }
    }

    /// Get an int-list attribute, if present.
    pub fn attr_ints(&self, key: &str) -> Result<Option<&[i64]>> {
        match self.attributes.get(key) {
            None => Ok(None),
            Some(Attribute::Ints(v)) => Ok(Some(v.as_slice())),
            Some(other) => Err(self.wrong_type(key, "ints", other)),
        }
    }

    /// First present int-list attribute among `keys` (e.g. "strides" / "stride").
    pub fn attr_ints_any(&self, keys: &[&str]) -> Result<Option<&[i64]>> {
        for key in keys {
            if let Some(v) = self.attr_ints(key)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// Transpose permutation for an input of `rank`: `perm`, or the
    /// reversed axes when absent. Anything else than a permutation fails.
    pub fn transpose_perm(&self, rank: usize) -> Result<Vec<usize>> {
        let perm: Vec<usize> = match self.attr_ints("perm")? {
            Some(p) => p
                .iter()
                .map(|&a| normalize_axis(&self.op_type, a, rank))
                .collect::<Result<_>>()?,
            None => (0..rank).rev().collect(),
        };
        let mut seen = vec![false; rank];
        if perm.len() != rank || perm.iter().any(|&a| std::mem::replace(&mut seen[a], true)) {
            return Err(Error::invalid_attribute(
                &self.op_type,
                "perm",
                format!("{perm:?} is not a permutation of rank {rank}"),
            ));
        }
        Ok(perm)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) -> ({})",
            self.op_type,
            self.inputs.join(", "),
            self.outputs.join(", ")
        )
    }
}

/// A named constant tensor carried by the model.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub buffer: Buffer,
}

/// In-memory graph: ordered nodes, parameters and declared external I/O.
#[derive(Debug, Clone, Default)]
pub struct ModelData {
    nodes: Vec<Node>,
    parameters: BTreeMap<String, Parameter>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl ModelData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Mutable access for in-place graph rewrites.
    pub fn nodes_mut(&mut self) -> &mut Vec<Node> {
        &mut self.nodes
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Add a constant tensor. The data length must match `dims`.
    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        dims: Vec<usize>,
        data: Vec<f32>,
    ) -> Result<()> {
        let name = name.into();
        if self.parameters.contains_key(&name) {
            return Err(Error::DuplicateVariable(name));
        }
        let buffer = Buffer::from_vec_with_dims(data, &dims)?;
        self.parameters.insert(
            name,
            Parameter {
                dtype: DType::F32,
                dims,
                buffer,
            },
        );
        Ok(())
    }

    /// Replace (or insert) a parameter.
    pub fn set_parameter(&mut self, name: impl Into<String>, parameter: Parameter) {
        self.parameters.insert(name.into(), parameter);
    }

    pub fn remove_parameter(&mut self, name: &str) -> Option<Parameter> {
        self.parameters.remove(name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn add_input_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.input_names.contains(&name) {
            self.input_names.push(name);
        }
    }

    pub fn add_output_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.output_names.contains(&name) {
            self.output_names.push(name);
        }
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Index of the node producing `name`, if any.
    pub fn producer_of(&self, name: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.outputs.iter().any(|o| o == name))
    }

    /// Number of node inputs that read `name`.
    pub fn use_count(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.present_inputs())
            .filter(|i| *i == name)
            .count()
    }

    /// Every variable name referenced by any node.
    pub fn referenced_names(&self) -> HashSet<&str> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.present_inputs()
                    .chain(n.outputs.iter().map(String::as_str))
            })
            .collect()
    }
}

/// Resolved dtype and dimensions of one variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableProfile {
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl VariableProfile {
    pub fn new(dtype: DType, dims: Vec<usize>) -> Self {
        Self { dtype, dims }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Bytes a buffer bound to this variable must hold.
    pub fn size_in_bytes(&self) -> usize {
        self.elem_count() * self.dtype.size_in_bytes()
    }

    /// `size_in_bytes`, or `None` when the size overflows a usize.
    pub fn checked_size_in_bytes(&self) -> Option<usize> {
        checked_elem_count(&self.dims)?.checked_mul(self.dtype.size_in_bytes())
    }
}
