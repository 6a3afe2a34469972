use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::{Node, VariableProfile};

// Backend — Abstraction over compute implementations
//
// A backend turns one graph node, whose variable profiles are already
// resolved, into a Kernel: an executable unit that reads input slices and
// writes output slices. Backends also advertise their capabilities so the
// model builder can reject a graph before compiling anything:
//
//   rank_policy       — which input ranks the backend accepts
//   supports_dtype    — which element types it can execute
//   supports_operator — which operator tags it has kernels for
//
// Backends are selected by name at model build time (see the registry in the
// `vole` crate) and configured from an opaque JSON string that only the
// backend interprets.

/// Which input ranks a backend accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankPolicy {
    /// Any rank.
    Any,
    /// Only the listed ranks.
    Only(Vec<usize>),
}

impl RankPolicy {
    pub fn allows(&self, rank: usize) -> bool {
        match self {
            RankPolicy::Any => true,
            RankPolicy::Only(ranks) => ranks.contains(&rank),
        }
    }

    /// Human-readable list of the accepted ranks.
    pub fn describe(&self) -> String {
        match self {
            RankPolicy::Any => "any".to_string(),
            RankPolicy::Only(ranks) => ranks
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(" or "),
        }
    }
}

/// Everything a backend needs to compile one node.
///
/// `inputs` is aligned with `node.inputs`; omitted optional inputs are `None`.
#[derive(Debug, Clone)]
pub struct KernelSpec<'a> {
    pub node: &'a Node,
    pub inputs: Vec<Option<&'a VariableProfile>>,
    pub outputs: Vec<&'a VariableProfile>,
}

impl<'a> KernelSpec<'a> {
    /// Profile of input `i`, failing when it was omitted.
    pub fn input(&self, i: usize) -> Result<&'a VariableProfile> {
        self.inputs.get(i).copied().flatten().ok_or_else(|| {
            Error::backend(format!(
                "{} node '{}' is missing input {}",
                self.node.op_type,
                self.node.label(),
                i
            ))
        })
    }

    pub fn output(&self, i: usize) -> Result<&'a VariableProfile> {
        self.outputs.get(i).copied().ok_or(Error::IndexOutOfRange {
            index: i,
            len: self.outputs.len(),
        })
    }
}

/// A compiled, executable operation.
///
/// `inputs` is aligned with the node's inputs; an omitted optional input is
/// an empty slice. `outputs` is aligned with the node's outputs.
pub trait Kernel: Send + Sync + fmt::Debug {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()>;
}

/// The interface every compute backend implements.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Name the backend was registered under.
    fn name(&self) -> &str;

    /// Input ranks this backend accepts.
    fn rank_policy(&self) -> RankPolicy {
        RankPolicy::Any
    }

    fn supports_dtype(&self, dtype: DType) -> bool;

    fn supports_operator(&self, op_type: &str) -> bool;

    /// Compile one node into a kernel.
    fn compile(&self, spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>>;

    /// Execute a kernel. Backends that own worker pools run it inside them.
    fn execute(
        &self,
        kernel: &dyn Kernel,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        kernel.run(inputs, outputs)
    }
}

// BackendConfig — parsed backend configuration string
//
// The core only checks that the string is a JSON object; keys and values are
// the backend's business. An empty string means "all defaults".

/// Backend configuration as a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendConfig {
    entries: Map<String, Value>,
}

impl BackendConfig {
    /// Parse a configuration string. Malformed JSON is a `JsonParse` error.
    pub fn parse(backend: &str, config: &str) -> Result<Self> {
        if config.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(config)? {
            Value::Object(entries) => Ok(Self { entries }),
            other => Err(Error::FailedToConfigureOperator {
                backend: backend.to_string(),
                reason: format!("configuration must be a JSON object, got {other}"),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Deserialize into a backend's typed configuration. Unknown keys and
    /// ill-typed values surface as `FailedToConfigureOperator`.
    pub fn deserialize<T: DeserializeOwned>(&self, backend: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.entries.clone())).map_err(|e| {
            Error::FailedToConfigureOperator {
                backend: backend.to_string(),
                reason: e.to_string(),
            }
        })
    }
}
