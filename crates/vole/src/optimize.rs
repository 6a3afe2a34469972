// Optimize — backend-agnostic graph rewrites before model building
//
// Four passes, each run to a fixed point, in this order:
//
//   1. trim       Identity and Dropout are no-ops at inference time. Their
//                 consumers are rewired to the input, or, when the output is
//                 a graph output, the producer is renamed to write it
//                 directly.
//   2. fold       BatchNormalization after a Conv whose weight (and bias)
//                 are parameters read by nothing else becomes part of the
//                 Conv:
//                   s  = scale / sqrt(var + eps)
//                   W' = W * s[m]            (per output channel m)
//                   b' = (b - mean) * s + B
//   3. fuse       Relu after Conv / Gemm / FC becomes the producer's
//                 `activation = "Relu"` attribute.
//   4. prune      nodes that feed no graph output, then parameters no node
//                 reads.
//
// Every rewrite keeps variable names that already have a profile, so the
// table the graph was optimized with still describes it. Parameters are
// replaced, never written in place: clones of a ModelData share parameter
// buffers.
//
// Running the optimizer twice reports zero rewrites the second time.

use std::collections::HashSet;

use vole_core::{Attribute, Buffer, Error, ModelData, Parameter, Result};

use crate::profile::VariableProfileTable;

/// What one `optimize` call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub trimmed: usize,
    pub folded_batch_norms: usize,
    pub fused_activations: usize,
    pub removed_nodes: usize,
    pub removed_parameters: usize,
}

impl OptimizeStats {
    pub fn total(&self) -> usize {
        self.trimmed
            + self.folded_batch_norms
            + self.fused_activations
            + self.removed_nodes
            + self.removed_parameters
    }

    pub fn is_noop(&self) -> bool {
        self.total() == 0
    }
}

/// In-place graph optimization.
pub trait Optimize {
    fn optimize(&mut self, table: &VariableProfileTable) -> Result<OptimizeStats>;
}

impl Optimize for ModelData {
    fn optimize(&mut self, table: &VariableProfileTable) -> Result<OptimizeStats> {
        let mut protected: HashSet<String> = HashSet::new();
        protected.extend(table.output_names().iter().cloned());
        protected.extend(table.input_names().iter().cloned());
        protected.extend(self.output_names().iter().cloned());
        protected.extend(self.input_names().iter().cloned());

        let mut stats = OptimizeStats::default();
        while trim_one(self, &protected) {
            stats.trimmed += 1;
        }
        while fold_one(self, table, &protected)? {
            stats.folded_batch_norms += 1;
        }
        while fuse_one(self, &protected) {
            stats.fused_activations += 1;
        }
        let (nodes, params) = prune(self, table, &protected);
        stats.removed_nodes = nodes;
        stats.removed_parameters = params;

        tracing::info!(
            trimmed = stats.trimmed,
            folded = stats.folded_batch_norms,
            fused = stats.fused_activations,
            removed_nodes = stats.removed_nodes,
            removed_parameters = stats.removed_parameters,
            "optimized graph"
        );
        Ok(stats)
    }
}

fn rewire_inputs(model: &mut ModelData, from: &str, to: &str) {
    for node in model.nodes_mut() {
        for input in node.inputs.iter_mut().filter(|i| *i == from) {
            *input = to.to_string();
        }
    }
}

/// A value another node may be merged into: produced by exactly one node,
/// read exactly once, and not visible outside the graph.
fn is_private(model: &ModelData, name: &str, protected: &HashSet<String>) -> bool {
    !protected.contains(name) && !model.is_parameter(name) && model.use_count(name) == 1
}

// ── Trim ────────────────────────────────────────────────────────────────────

fn trim_one(model: &mut ModelData, protected: &HashSet<String>) -> bool {
    for i in 0..model.nodes().len() {
        let node = &model.nodes()[i];
        if !matches!(node.op_type.as_str(), "Identity" | "Dropout") {
            continue;
        }
        let (Some(x), Some(y)) = (node.input(0), node.outputs.first()) else {
            continue;
        };
        if x == y.as_str() {
            continue;
        }
        let mask_used = node
            .outputs
            .iter()
            .skip(1)
            .any(|m| !m.is_empty() && (protected.contains(m) || model.use_count(m) > 0));
        if mask_used {
            continue;
        }
        let (x, y) = (x.to_string(), y.clone());

        if !protected.contains(&y) {
            tracing::debug!(node = %node.label(), op = %node.op_type, "trimmed");
            model.nodes_mut().remove(i);
            rewire_inputs(model, &y, &x);
            return true;
        }
        // `y` must survive: have `x`'s producer write it instead.
        let Some(p) = model.producer_of(&x) else {
            continue;
        };
        if !is_private(model, &x, protected) {
            continue;
        }
        tracing::debug!(node = %node.label(), op = %node.op_type, "trimmed into producer");
        model.nodes_mut().remove(i);
        let p = if p > i { p - 1 } else { p };
        for out in model.nodes_mut()[p].outputs.iter_mut().filter(|o| **o == x) {
            *out = y.clone();
        }
        return true;
    }
    false
}

// ── Fold BatchNormalization into Conv ───────────────────────────────────────

fn fold_one(
    model: &mut ModelData,
    table: &VariableProfileTable,
    protected: &HashSet<String>,
) -> Result<bool> {
    for bn_idx in 0..model.nodes().len() {
        let bn = &model.nodes()[bn_idx];
        if bn.op_type != "BatchNormalization" || bn.outputs.len() != 1 {
            continue;
        }
        let Some(x) = bn.input(0) else { continue };
        let Some(conv_idx) = model.producer_of(x) else { continue };
        let conv = &model.nodes()[conv_idx];
        if conv.op_type != "Conv"
            || conv.attributes.contains_key("activation")
            || !is_private(model, x, protected)
        {
            continue;
        }
        let Some(weight_name) = conv.input(1) else { continue };
        let bias_name = conv.input(2);
        let exclusive = |name: &str| model.is_parameter(name) && model.use_count(name) == 1;
        if !exclusive(weight_name) || bias_name.is_some_and(|b| !exclusive(b)) {
            continue;
        }
        let bn_params: Option<Vec<&Parameter>> =
            (1..5).map(|i| bn.input(i).and_then(|n| model.parameter(n))).collect();
        let Some(bn_params) = bn_params else { continue };

        let channels = table.get(x)?.dims[1];
        if bn_params.iter().any(|p| p.buffer.len() != channels) {
            continue;
        }
        let epsilon = bn.attr_float_or("epsilon", 1e-5)?;
        let scale = bn_params[0].buffer.to_vec()?;
        let shift = bn_params[1].buffer.to_vec()?;
        let mean = bn_params[2].buffer.to_vec()?;
        let var = bn_params[3].buffer.to_vec()?;
        let s: Vec<f32> = scale
            .iter()
            .zip(&var)
            .map(|(g, v)| g / (v + epsilon).sqrt())
            .collect();

        let weight = model
            .parameter(weight_name)
            .ok_or_else(|| Error::not_found(weight_name.to_string()))?;
        let mut w = weight.buffer.to_vec()?;
        let per_channel = w.len() / channels;
        for (m, chunk) in w.chunks_mut(per_channel.max(1)).enumerate() {
            chunk.iter_mut().for_each(|v| *v *= s[m]);
        }
        let old_bias = match bias_name.and_then(|b| model.parameter(b)) {
            Some(p) => p.buffer.to_vec()?,
            None => vec![0.0; channels],
        };
        let bias: Vec<f32> = (0..channels)
            .map(|m| (old_bias[m] - mean[m]) * s[m] + shift[m])
            .collect();

        let weight_dims = weight.dims.clone();
        let weight_dtype = weight.dtype;
        let weight_name = weight_name.to_string();
        let bias_name = match bias_name {
            Some(b) => b.to_string(),
            None => unique_name(model, &format!("{}_bias", bn.outputs[0])),
        };
        let y = bn.outputs[0].clone();
        let x = x.to_string();
        tracing::debug!(node = %bn.label(), conv = %conv.label(), "folded batch norm into conv");

        model.set_parameter(
            weight_name,
            Parameter {
                dtype: weight_dtype,
                buffer: Buffer::from_vec_with_dims(w, &weight_dims)?,
                dims: weight_dims,
            },
        );
        model.set_parameter(
            bias_name.clone(),
            Parameter {
                dtype: weight_dtype,
                buffer: Buffer::from_vec_with_dims(bias, &[channels])?,
                dims: vec![channels],
            },
        );
        let conv = &mut model.nodes_mut()[conv_idx];
        conv.inputs.resize(3, String::new());
        conv.inputs[2] = bias_name;
        for out in conv.outputs.iter_mut().filter(|o| **o == x) {
            *out = y.clone();
        }
        model.nodes_mut().remove(bn_idx);
        return Ok(true);
    }
    Ok(false)
}

fn unique_name(model: &ModelData, base: &str) -> String {
    let taken = |n: &str| model.is_parameter(n) || model.referenced_names().contains(n);
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|n| !taken(n))
        .unwrap_or_else(|| base.to_string())
}

// ── Fuse Relu ───────────────────────────────────────────────────────────────

fn fuse_one(model: &mut ModelData, protected: &HashSet<String>) -> bool {
    for relu_idx in 0..model.nodes().len() {
        let relu = &model.nodes()[relu_idx];
        if relu.op_type != "Relu" {
            continue;
        }
        let (Some(x), Some(y)) = (relu.input(0), relu.outputs.first()) else {
            continue;
        };
        let Some(p) = model.producer_of(x) else { continue };
        let producer = &model.nodes()[p];
        if !matches!(producer.op_type.as_str(), "Conv" | "Gemm" | "FC")
            || producer.attributes.contains_key("activation")
            || producer.outputs.len() != 1
            || !is_private(model, x, protected)
        {
            continue;
        }
        tracing::debug!(node = %relu.label(), into = %producer.label(), "fused relu");
        let y = y.clone();
        let producer = &mut model.nodes_mut()[p];
        producer.outputs[0] = y;
        producer
            .attributes
            .insert("activation".to_string(), Attribute::String("Relu".to_string()));
        model.nodes_mut().remove(relu_idx);
        return true;
    }
    false
}

// ── Prune ───────────────────────────────────────────────────────────────────

/// Remove dead nodes and unreferenced parameters; returns both counts.
fn prune(model: &mut ModelData, table: &VariableProfileTable, protected: &HashSet<String>) -> (usize, usize) {
    let mut removed_nodes = 0;
    let roots: Vec<&String> = table
        .output_names()
        .iter()
        .chain(model.output_names())
        .collect();
    // Without declared outputs every node counts as live.
    if !roots.is_empty() {
        let mut live: HashSet<String> = roots.into_iter().cloned().collect();
        let mut live_nodes = vec![false; model.nodes().len()];
        loop {
            let mut changed = false;
            for (i, node) in model.nodes().iter().enumerate() {
                if !live_nodes[i] && node.outputs.iter().any(|o| live.contains(o)) {
                    live_nodes[i] = true;
                    live.extend(node.present_inputs().map(str::to_string));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let before = model.nodes().len();
        let mut flags = live_nodes.into_iter();
        model.nodes_mut().retain(|_| flags.next().unwrap_or(true));
        removed_nodes = before - model.nodes().len();
    }

    let referenced: HashSet<String> = model
        .referenced_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let unused: Vec<String> = model
        .parameters()
        .map(|(name, _)| name)
        .filter(|name| !referenced.contains(*name) && !protected.contains(*name))
        .map(str::to_string)
        .collect();
    for name in &unused {
        model.remove_parameter(name);
    }
    (removed_nodes, unused.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::VariableProfileTableBuilder;
    use vole_core::{DType, Node};

    fn table_for(model: &ModelData, inputs: &[(&str, Vec<usize>)], outputs: &[&str]) -> VariableProfileTable {
        let mut b = VariableProfileTableBuilder::new();
        for (name, dims) in inputs {
            b.add_input_profile(*name, DType::F32, dims.clone()).unwrap();
        }
        for name in outputs {
            b.add_output_profile(*name, DType::F32).unwrap();
        }
        b.build(model).unwrap()
    }

    #[test]
    fn test_trim_identity_and_dropout() {
        let mut model = ModelData::new();
        model.add_node(Node::new("Relu").with_inputs(["x"]).with_outputs(["a"]));
        model.add_node(Node::new("Identity").with_inputs(["a"]).with_outputs(["b"]));
        model.add_node(Node::new("Sigmoid").with_inputs(["b"]).with_outputs(["c"]));
        model.add_node(Node::new("Dropout").with_inputs(["c"]).with_outputs(["y", "mask"]));
        model.add_output_name("y");
        let table = table_for(&model, &[("x", vec![2, 2])], &[]);

        let stats = model.optimize(&table).unwrap();
        assert_eq!(stats.trimmed, 2);
        let ops: Vec<&str> = model.nodes().iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Relu", "Sigmoid"]);
        assert_eq!(model.nodes()[1].inputs, vec!["a".to_string()]);
        assert_eq!(model.nodes()[1].outputs, vec!["y".to_string()]);
    }

    #[test]
    fn test_fuse_relu_into_gemm() {
        let mut model = ModelData::new();
        model.add_parameter("w", vec![3, 2], vec![1.0; 6]).unwrap();
        model.add_node(Node::new("Gemm").with_inputs(["x", "w"]).with_outputs(["h"]));
        model.add_node(Node::new("Relu").with_inputs(["h"]).with_outputs(["y"]));
        let table = table_for(&model, &[("x", vec![4, 3])], &["y"]);

        let stats = model.optimize(&table).unwrap();
        assert_eq!(stats.fused_activations, 1);
        assert_eq!(model.nodes().len(), 1);
        assert_eq!(model.nodes()[0].attr_string("activation").unwrap(), Some("Relu"));
        assert_eq!(model.nodes()[0].outputs, vec!["y".to_string()]);
    }

    #[test]
    fn test_no_fusion_when_intermediate_is_shared() {
        let mut model = ModelData::new();
        model.add_parameter("w", vec![3, 2], vec![1.0; 6]).unwrap();
        model.add_node(Node::new("Gemm").with_inputs(["x", "w"]).with_outputs(["h"]));
        model.add_node(Node::new("Relu").with_inputs(["h"]).with_outputs(["y"]));
        model.add_node(Node::new("Add").with_inputs(["h", "y"]).with_outputs(["z"]));
        let table = table_for(&model, &[("x", vec![4, 3])], &["z"]);
        let stats = model.optimize(&table).unwrap();
        assert!(stats.is_noop());
        assert_eq!(model.nodes().len(), 3);
    }

    #[test]
    fn test_prune_dead_nodes_and_parameters() {
        let mut model = ModelData::new();
        model.add_parameter("unused", vec![2], vec![0.0; 2]).unwrap();
        model.add_node(Node::new("Relu").with_inputs(["x"]).with_outputs(["y"]));
        model.add_node(Node::new("Tanh").with_inputs(["x"]).with_outputs(["dead"]));
        let table = table_for(&model, &[("x", vec![2, 2])], &["y"]);

        let stats = model.optimize(&table).unwrap();
        assert_eq!(stats.removed_nodes, 1);
        assert_eq!(stats.removed_parameters, 1);
        assert!(!model.is_parameter("unused"));
        assert!(model.optimize(&table).unwrap().is_noop());
    }
}
