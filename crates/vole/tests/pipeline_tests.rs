// Pipeline tests — ModelData → VariableProfileTable → ModelBuilder → Model

use std::sync::Arc;

use vole::prelude::*;
use vole::{Attribute, BufferOrigin};

// Helpers

fn table(
    model: &ModelData,
    inputs: &[(&str, Vec<usize>)],
    outputs: &[&str],
) -> Arc<VariableProfileTable> {
    let mut b = VariableProfileTableBuilder::new();
    for (name, dims) in inputs {
        b.add_input_profile(*name, DType::F32, dims.clone()).unwrap();
    }
    for name in outputs {
        b.add_output_profile(*name, DType::F32).unwrap();
    }
    Arc::new(b.build(model).unwrap())
}

fn ramp(n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|i| ((i % 7) as f32 - 3.0) * scale).collect()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
    }
}

fn conv_224() -> ModelData {
    let mut model = ModelData::new();
    model.add_node(
        Node::new("Conv")
            .with_name("conv")
            .with_inputs(["input"])
            .with_outputs(["conv_out"])
            .with_attr("kernel", Attribute::Ints(vec![3, 3]))
            .with_attr("stride", Attribute::Ints(vec![1, 1]))
            .with_attr("pad", Attribute::Ints(vec![1, 1]))
            .with_attr("out_channels", Attribute::Int(16)),
    );
    model.add_input_name("input");
    model.add_output_name("conv_out");
    model
}

// Concrete scenarios

#[test]
fn test_conv_profile_and_zero_run() {
    let model = conv_224();
    let table = table(&model, &[("input", vec![1, 3, 224, 224])], &["conv_out"]);
    let out = table.get("conv_out").unwrap();
    assert_eq!(out.dtype, DType::F32);
    assert_eq!(out.dims, vec![1, 16, 224, 224]);

    let input = Buffer::zeros_with_dims(&[1, 3, 224, 224]);
    let mut builder = ModelBuilder::new(table);
    builder.attach_external_buffer("input", input).unwrap();
    let mut model = builder.build_model(&model, "cpu", "").unwrap();
    model.run().unwrap();

    let conv_out = model.get_variable("conv_out").unwrap();
    assert_eq!(conv_out.dims, vec![1, 16, 224, 224]);
    assert_eq!(conv_out.buffer.len(), 16 * 224 * 224);
    assert_eq!(conv_out.origin, BufferOrigin::Internal);
}

#[test]
fn test_rank3_input_leaves_builder_usable() {
    let mut b = VariableProfileTableBuilder::new();
    let err = b.add_input_profile("x", DType::F32, vec![1, 2, 3]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedRank);
    b.add_input_profile("y", DType::F32, vec![1, 2]).unwrap();

    let mut model = ModelData::new();
    model.add_node(Node::new("Relu").with_inputs(["y"]).with_outputs(["z"]));
    let table = b.build(&model).unwrap();
    assert!(!table.contains("x"));
    assert_eq!(table.get("z").unwrap().dims, vec![1, 2]);
}

#[test]
fn test_unknown_backend_keeps_inputs_reusable() {
    let model = conv_224();
    let table = table(&model, &[("input", vec![1, 3, 8, 8])], &["conv_out"]);
    let builder = ModelBuilder::new(table.clone());

    let err = builder.build_model(&model, "nonexistent", "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidBackendName);
    assert!(err.to_string().contains("nonexistent"));

    // Table and graph are untouched and still build.
    assert_eq!(Arc::strong_count(&table), 2);
    assert_eq!(table.get("conv_out").unwrap().dims, vec![1, 16, 8, 8]);
    let mut built = builder.build_model(&model, "cpu", "").unwrap();
    built.run().unwrap();
}

// Buffers

#[test]
fn test_external_buffers_keep_identity() {
    let mut model = ModelData::new();
    model.add_parameter("w", vec![3, 2], vec![1.0, -1.0, 2.0, 0.5, -3.0, 1.0]).unwrap();
    model.add_node(
        Node::new("Gemm")
            .with_inputs(["x", "w"])
            .with_outputs(["h"]),
    );
    model.add_node(Node::new("Relu").with_inputs(["h"]).with_outputs(["y"]));
    let table = table(&model, &[("x", vec![2, 3])], &["y"]);

    let x = Buffer::from_vec(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
    let y = Buffer::zeros_with_dims(&[2, 2]);
    let mut builder = ModelBuilder::new(table);
    builder.attach_external_buffer("x", x.clone()).unwrap();
    builder.attach_external_buffer("y", y.clone()).unwrap();
    let mut built = builder.build_model(&model, "cpu", "").unwrap();

    let var = built.get_variable("y").unwrap();
    assert!(Buffer::ptr_eq(&var.buffer, &y));
    assert_eq!(var.origin, BufferOrigin::External);
    let w = built.get_variable("w").unwrap();
    assert!(Buffer::ptr_eq(&w.buffer, &model.parameter("w").unwrap().buffer));

    built.run().unwrap();
    // h = x @ w = [[1*1 + 2*2 + 3*-3, 1*-1 + 2*0.5 + 3*1], [-1 - 3, 1 + 1]]
    assert_eq!(y.to_vec().unwrap(), vec![0.0, 3.0, 0.0, 2.0]);

    // New input values are picked up without rebuilding.
    x.copy_from_slice(&[0.0, 0.0, -1.0, 0.0, 0.0, 0.0]).unwrap();
    built.run().unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![3.0, 0.0, 0.0, 0.0]);
    assert_eq!(built.run_count(), 2);
}

#[test]
fn test_mismatched_external_buffers() {
    let model = conv_224();
    let table = table(&model, &[("input", vec![1, 3, 8, 8])], &[]);
    let mut builder = ModelBuilder::new(table);

    builder
        .attach_external_buffer("input", Buffer::zeros_with_dims(&[1, 3, 4, 16]))
        .unwrap();
    let err = builder.build_model(&model, "cpu", "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);

    builder.attach_external_buffer("input", Buffer::zeros(10)).unwrap();
    let err = builder.build_model(&model, "cpu", "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);

    builder
        .attach_external_buffer("input", Buffer::zeros_with_dims(&[1, 3, 8, 8]))
        .unwrap();
    builder.build_model(&model, "cpu", "").unwrap();
}

#[test]
fn test_non_f32_variables_are_rejected() {
    let mut model = ModelData::new();
    model.add_node(Node::new("Relu").with_inputs(["x"]).with_outputs(["y"]));
    let mut b = VariableProfileTableBuilder::new();
    b.add_input_profile("x", DType::F64, vec![2, 2]).unwrap();
    let table = Arc::new(b.build(&model).unwrap());
    let err = ModelBuilder::new(table)
        .build_model(&model, "cpu", "")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDtype);
}

#[test]
fn test_int64_indices_output_is_rejected() {
    let mut model = ModelData::new();
    model.add_node(
        Node::new("MaxPool")
            .with_inputs(["x"])
            .with_outputs(["y", "indices"])
            .with_attr("kernel_shape", Attribute::Ints(vec![2, 2])),
    );
    let table = table(&model, &[("x", vec![1, 1, 4, 4])], &[]);
    // The indices output is I64, which the CPU backend cannot execute.
    let err = ModelBuilder::new(table)
        .build_model(&model, "cpu", "")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDtype);
}

// Lifecycle

#[test]
fn test_dispose_is_idempotent_and_spares_external_buffers() {
    let mut model = ModelData::new();
    model.add_node(Node::new("Neg").with_inputs(["x"]).with_outputs(["y"]));
    let table = table(&model, &[("x", vec![1, 4])], &["y"]);

    let x = Buffer::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
    let mut builder = ModelBuilder::new(table.clone());
    builder.attach_external_buffer("x", x.clone()).unwrap();
    let mut built = builder.build_model(&model, "cpu", "").unwrap();
    built.run().unwrap();
    let y = built.get_variable("y").unwrap().buffer;
    assert_eq!(y.to_vec().unwrap(), vec![-1.0, -2.0, -3.0, -4.0]);

    let handles_before = x.handle_count();
    built.dispose();
    built.dispose();
    assert_eq!(built.state(), ModelState::Disposed);
    assert!(x.handle_count() < handles_before);
    assert_eq!(x.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    assert_eq!(built.run().unwrap_err().kind(), ErrorKind::UseAfterDispose);
    assert_eq!(
        built.get_variable("y").unwrap_err().kind(),
        ErrorKind::UseAfterDispose
    );
    assert!(built.variable_names().is_empty());

    builder.dispose();
    builder.dispose();
    assert_eq!(Arc::strong_count(&table), 1);
}

#[test]
fn test_one_table_backs_many_models() {
    let mut model = ModelData::new();
    model.add_node(Node::new("Exp").with_inputs(["x"]).with_outputs(["y"]));
    let table = table(&model, &[("x", vec![2, 2])], &["y"]);

    let a = ModelBuilder::new(table.clone()).build_model(&model, "cpu", "").unwrap();
    let b = ModelBuilder::new(table.clone())
        .build_model(&model, "cpu", r#"{"num_threads": 2}"#)
        .unwrap();
    let ya = a.get_variable("y").unwrap().buffer;
    let yb = b.get_variable("y").unwrap().buffer;
    assert!(!Buffer::ptr_eq(&ya, &yb));
    assert_eq!(a.backend_name(), "cpu");
    let config = b.plan().unwrap().backend_config();
    assert_eq!(config.get("num_threads").and_then(|v| v.as_u64()), Some(2));
}

#[test]
fn test_variable_lookup() {
    let mut model = ModelData::new();
    model.add_node(Node::new("Relu").with_inputs(["x"]).with_outputs(["y"]));
    let table = table(&model, &[("x", vec![2, 2])], &[]);
    let built = ModelBuilder::new(table).build_model(&model, "cpu", "").unwrap();
    assert_eq!(built.variable_names(), vec!["x", "y"]);
    assert_eq!(
        built.get_variable("missing").unwrap_err().kind(),
        ErrorKind::VariableNotFound
    );
}

// Graph shape

#[test]
fn test_cycle_is_detected_not_looped() {
    let mut model = ModelData::new();
    model.add_node(Node::new("Relu").with_name("a").with_inputs(["c"]).with_outputs(["b"]));
    model.add_node(Node::new("Relu").with_name("b").with_inputs(["b"]).with_outputs(["c"]));
    let mut builder = VariableProfileTableBuilder::new();
    builder.add_input_profile("x", DType::F32, vec![1, 1]).unwrap();
    let err = builder.build(&model).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VariableNotFound);
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn test_zero_sized_conv_kernel_is_an_error() {
    let mut model = ModelData::new();
    model.add_parameter("w", vec![1, 1, 0, 3], Vec::new()).unwrap();
    model.add_node(Node::new("Conv").with_inputs(["x", "w"]).with_outputs(["y"]));
    let mut b = VariableProfileTableBuilder::new();
    b.add_input_profile("x", DType::F32, vec![1, 1, 4, 4]).unwrap();
    let err = b.build(&model).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
}

#[test]
fn test_unaddressable_input_is_an_error() {
    let mut b = VariableProfileTableBuilder::new();
    let err = b
        .add_input_profile("x", DType::F32, vec![1 << 33, 1 << 33])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);

    // The builder is still usable and the graph builds with a sane input.
    let mut model = ModelData::new();
    model.add_node(Node::new("Relu").with_inputs(["x"]).with_outputs(["y"]));
    b.add_input_profile("x", DType::F32, vec![2, 2]).unwrap();
    let table = Arc::new(b.build(&model).unwrap());
    ModelBuilder::new(table).build_model(&model, "cpu", "").unwrap();
}

#[test]
fn test_reshape_with_shape_parameter_runs() {
    let mut model = ModelData::new();
    model.add_parameter("shape", vec![2], vec![-1.0, 4.0]).unwrap();
    model.add_node(Node::new("Reshape").with_inputs(["x", "shape"]).with_outputs(["r"]));
    model.add_node(
        Node::new("Softmax")
            .with_inputs(["r"])
            .with_outputs(["y"])
            .with_attr("axis", Attribute::Int(1)),
    );
    let table = table(&model, &[("x", vec![1, 2, 2, 2])], &["y"]);
    assert_eq!(table.get("r").unwrap().dims, vec![2, 4]);

    let x = Buffer::from_vec(vec![0.0; 8]);
    let mut builder = ModelBuilder::new(table);
    builder.attach_external_buffer("x", x).unwrap();
    let mut built = builder.build_model(&model, "cpu", "").unwrap();
    built.run().unwrap();
    let y = built.get_variable("y").unwrap().buffer.to_vec().unwrap();
    assert_close(&y, &[0.25; 8], 1e-6);
}

// Optimize

fn conv_bn_relu() -> ModelData {
    let mut model = ModelData::new();
    model.add_parameter("w", vec![3, 2, 3, 3], ramp(54, 0.1)).unwrap();
    model.add_parameter("scale", vec![3], vec![1.5, 0.5, -1.0]).unwrap();
    model.add_parameter("shift", vec![3], vec![0.1, -0.2, 0.3]).unwrap();
    model.add_parameter("mean", vec![3], vec![0.05, -0.1, 0.2]).unwrap();
    model.add_parameter("var", vec![3], vec![1.0, 0.25, 4.0]).unwrap();
    model.add_node(
        Node::new("Conv")
            .with_name("conv")
            .with_inputs(["x", "w"])
            .with_outputs(["c"])
            .with_attr("pads", Attribute::Ints(vec![1, 1, 1, 1])),
    );
    model.add_node(Node::new("Identity").with_inputs(["c"]).with_outputs(["c2"]));
    model.add_node(
        Node::new("BatchNormalization")
            .with_name("bn")
            .with_inputs(["c2", "scale", "shift", "mean", "var"])
            .with_outputs(["n"]),
    );
    model.add_node(Node::new("Relu").with_inputs(["n"]).with_outputs(["y"]));
    model.add_output_name("y");
    model
}

fn run_with(model: &ModelData, table: &Arc<VariableProfileTable>, x: &Buffer) -> Vec<f32> {
    let mut builder = ModelBuilder::new(table.clone());
    builder.attach_external_buffer("x", x.clone()).unwrap();
    let mut built = builder.build_model(model, "cpu", "").unwrap();
    built.run().unwrap();
    let out = built.get_variable("y").unwrap().buffer.to_vec().unwrap();
    out
}

#[test]
fn test_optimize_preserves_results() {
    let original = conv_bn_relu();
    let table = table(&original, &[("x", vec![1, 2, 5, 5])], &["y"]);
    let x = Buffer::from_vec(ramp(50, 0.3));
    let expected = run_with(&original, &table, &x);

    let mut optimized = original.clone();
    let stats = optimized.optimize(&table).unwrap();
    assert_eq!(stats.trimmed, 1);
    assert_eq!(stats.folded_batch_norms, 1);
    assert_eq!(stats.fused_activations, 1);
    assert_eq!(stats.removed_parameters, 4);
    assert_eq!(optimized.nodes().len(), 1);
    assert_eq!(optimized.nodes()[0].outputs, vec!["y".to_string()]);

    // The original graph keeps its own parameters.
    assert_eq!(original.nodes().len(), 4);
    assert_eq!(original.parameter("w").unwrap().buffer.to_vec().unwrap(), ramp(54, 0.1));

    let actual = run_with(&optimized, &table, &x);
    assert_close(&actual, &expected, 1e-4);
}

#[test]
fn test_optimize_is_idempotent() {
    let mut model = conv_bn_relu();
    let table = table(&model, &[("x", vec![1, 2, 5, 5])], &["y"]);
    assert!(!model.optimize(&table).unwrap().is_noop());
    let nodes = model.nodes().to_vec();
    let params: Vec<String> = model.parameters().map(|(n, _)| n.to_string()).collect();

    let stats = model.optimize(&table).unwrap();
    assert!(stats.is_noop(), "{stats:?}");
    assert_eq!(model.nodes(), &nodes[..]);
    let after: Vec<String> = model.parameters().map(|(n, _)| n.to_string()).collect();
    assert_eq!(after, params);
}
