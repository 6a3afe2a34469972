// CPU Backend — Reference compute backend
//
// This crate implements the Vole Backend trait on the host CPU. Every
// operator the profile inference knows about has a kernel here; kernels are
// plain Rust loops parallelized with rayon over their outermost independent
// dimension (batch rows, output planes, ...).
//
// ARCHITECTURE:
// - CpuBackend holds its configuration and, when `num_threads` is set, a
//   dedicated rayon ThreadPool. Kernels execute inside that pool; without it
//   they use rayon's global pool.
// - compile() resolves every attribute once and stores pre-computed shapes
//   and strides in the kernel struct, so run() does no attribute lookups.
// - Only F32 is executable. Input ranks are restricted to 2 and 4, the
//   layouts the kernels were written for (matrix and NCHW).
//
// CONFIGURATION (JSON object, all keys optional):
//   { "num_threads": 4 }
//
// USAGE:
//   let backend = CpuBackend::from_config(&BackendConfig::parse("cpu", "")?)?;
//   let kernel = backend.compile(&spec)?;

mod conv;
mod kernels;
mod linalg;

use std::fmt;

use serde::Deserialize;

use vole_core::backend::{Backend, BackendConfig, Kernel, KernelSpec, RankPolicy};
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};

/// Name the CPU backend is registered under.
pub const BACKEND_NAME: &str = "cpu";

/// Operator tags with a CPU kernel.
pub const SUPPORTED_OPERATORS: &[&str] = &[
    "Abs",
    "Add",
    "AveragePool",
    "BatchNormalization",
    "Concat",
    "Conv",
    "ConvTranspose",
    "Div",
    "Dropout",
    "Elu",
    "Exp",
    "FC",
    "Flatten",
    "Gemm",
    "GlobalAveragePool",
    "GlobalMaxPool",
    "Identity",
    "LRN",
    "LeakyRelu",
    "Log",
    "MatMul",
    "Max",
    "MaxPool",
    "Min",
    "Mul",
    "Neg",
    "Relu",
    "Reshape",
    "Sigmoid",
    "Softmax",
    "Sqrt",
    "Squeeze",
    "Sub",
    "Sum",
    "Tanh",
    "Transpose",
    "Unsqueeze",
];

/// Input ranks the CPU kernels accept.
pub fn input_rank_policy() -> RankPolicy {
    RankPolicy::Only(vec![2, 4])
}

/// Typed CPU backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuConfig {
    /// Worker threads for a dedicated pool; rayon's global pool when absent.
    pub num_threads: Option<usize>,
}

/// The reference CPU backend.
pub struct CpuBackend {
    config: CpuConfig,
    pool: Option<rayon::ThreadPool>,
}

impl CpuBackend {
    /// Backend with default configuration.
    pub fn new() -> Self {
        Self {
            config: CpuConfig::default(),
            pool: None,
        }
    }

    /// Build a backend from its JSON configuration.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let config: CpuConfig = config.deserialize(BACKEND_NAME)?;
        let pool = match config.num_threads {
            None => None,
            Some(0) => {
                return Err(Error::FailedToConfigureOperator {
                    backend: BACKEND_NAME.to_string(),
                    reason: "num_threads must be at least 1".to_string(),
                })
            }
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("vole-cpu-{i}"))
                    .build()
                    .map_err(|e| Error::FailedToConfigureOperator {
                        backend: BACKEND_NAME.to_string(),
                        reason: format!("failed to build thread pool: {e}"),
                    })?,
            ),
        };
        tracing::debug!(num_threads = ?config.num_threads, "configured cpu backend");
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Threads kernels run on.
    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBackend")
            .field("config", &self.config)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn rank_policy(&self) -> RankPolicy {
        input_rank_policy()
    }

    fn supports_dtype(&self, dtype: DType) -> bool {
        dtype == DType::F32
    }

    fn supports_operator(&self, op_type: &str) -> bool {
        SUPPORTED_OPERATORS.contains(&op_type)
    }

    fn compile(&self, spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
        let op = spec.node.op_type.as_str();
        match op {
            "Identity" | "Dropout" | "Flatten" | "Reshape" | "Squeeze" | "Unsqueeze" => {
                kernels::copy(spec)
            }
            "Relu" | "LeakyRelu" | "Elu" | "Sigmoid" | "Tanh" | "Abs" | "Neg" | "Sqrt" | "Exp"
            | "Log" => kernels::unary(spec),
            "Add" | "Sub" | "Mul" | "Div" | "Sum" | "Max" | "Min" => kernels::broadcast(spec),
            "Softmax" => kernels::softmax(spec),
            "LRN" => kernels::lrn(spec),
            "BatchNormalization" => kernels::batch_norm(spec),
            "Transpose" => kernels::transpose(spec),
            "Concat" => kernels::concat(spec),
            "Conv" => conv::conv(spec),
            "ConvTranspose" => conv::conv_transpose(spec),
            "MaxPool" | "AveragePool" => conv::pool(spec),
            "GlobalAveragePool" | "GlobalMaxPool" => conv::global_pool(spec),
            "Gemm" => linalg::gemm(spec),
            "FC" => linalg::fc(spec),
            "MatMul" => linalg::matmul(spec),
            other => Err(Error::unsupported_op(
                other,
                format!("no {BACKEND_NAME} kernel"),
            )),
        }
    }

    fn execute(
        &self,
        kernel: &dyn Kernel,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.install(|| kernel.run(inputs, outputs)),
            None => kernel.run(inputs, outputs),
        }
    }
}

/// Fused activation applied by Conv/Gemm/FC after the main computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activation {
    None,
    Relu,
}

impl Activation {
    pub(crate) fn from_spec(spec: &KernelSpec<'_>) -> Result<Self> {
        match spec.node.attr_string("activation")? {
            None => Ok(Activation::None),
            Some("Relu") => Ok(Activation::Relu),
            Some(other) => Err(Error::invalid_attribute(
                &spec.node.op_type,
                "activation",
                format!("unsupported fused activation '{other}'"),
            )),
        }
    }

    #[inline]
    pub(crate) fn apply(self, v: f32) -> f32 {
        match self {
            Activation::None => v,
            Activation::Relu => v.max(0.0),
        }
    }
}

/// Check that every slice has the length its profile implies.
pub(crate) fn check_lengths(
    what: &str,
    inputs: &[&[f32]],
    expected_inputs: &[usize],
    outputs: &[&mut [f32]],
    expected_outputs: &[usize],
) -> Result<()> {
    for (i, (slice, &want)) in inputs.iter().zip(expected_inputs).enumerate() {
        if slice.len() < want {
            return Err(Error::backend(format!(
                "{what}: input {i} holds {} elements, expected {want}",
                slice.len()
            )));
        }
    }
    if inputs.len() < expected_inputs.len() {
        return Err(Error::backend(format!(
            "{what}: expected {} inputs, got {}",
            expected_inputs.len(),
            inputs.len()
        )));
    }
    for (i, (slice, &want)) in outputs.iter().zip(expected_outputs).enumerate() {
        if slice.len() < want {
            return Err(Error::backend(format!(
                "{what}: output {i} holds {} elements, expected {want}",
                slice.len()
            )));
        }
    }
    if outputs.len() < expected_outputs.len() {
        return Err(Error::backend(format!(
            "{what}: expected {} outputs, got {}",
            expected_outputs.len(),
            outputs.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::ErrorKind;

    #[test]
    fn test_capabilities() {
        let b = CpuBackend::new();
        assert_eq!(b.name(), "cpu");
        assert!(b.supports_operator("Conv"));
        assert!(!b.supports_operator("NonMaxSuppression"));
        assert!(b.supports_dtype(DType::F32));
        assert!(!b.supports_dtype(DType::F64));
        assert!(b.rank_policy().allows(4));
        assert!(!b.rank_policy().allows(3));
    }

    #[test]
    fn test_config() {
        let cfg = BackendConfig::parse("cpu", r#"{"num_threads": 2}"#).unwrap();
        let b = CpuBackend::from_config(&cfg).unwrap();
        assert_eq!(b.num_threads(), 2);

        let cfg = BackendConfig::parse("cpu", r#"{"num_threads": 0}"#).unwrap();
        let err = CpuBackend::from_config(&cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedToConfigureOperator);

        let cfg = BackendConfig::parse("cpu", r#"{"turbo": true}"#).unwrap();
        let err = CpuBackend::from_config(&cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedToConfigureOperator);
    }
}
