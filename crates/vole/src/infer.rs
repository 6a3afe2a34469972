// Shape inference — per-operator output profiles
//
// Given the profiles of a node's inputs, compute the profile of each of its
// outputs. Rules follow the ONNX operator definitions for the subset of ops
// Vole executes:
//
//   same-shape      Identity, Dropout, activations, Softmax, LRN, BatchNorm
//   broadcast       Add, Sub, Mul, Div, Sum, Max, Min (numpy rules)
//   windowed        Conv, ConvTranspose, MaxPool, AveragePool (Window2d)
//   global          GlobalAveragePool, GlobalMaxPool → [N, C, 1, 1]
//   matrix          Gemm, FC, MatMul
//   layout          Flatten, Reshape, Transpose, Concat, Squeeze, Unsqueeze
//
// Shape-carrying inputs (Reshape's target shape, Squeeze/Unsqueeze axes)
// must be parameters: their values are read here, at inference time, and
// the kernels never see them.

use std::collections::HashMap;

use vole_core::window::conv_geometry;
use vole_core::{
    checked_elem_count, normalize_axis, DType, Error, ModelData, Node, Result, Shape,
    VariableProfile, Window2d,
};

/// Whether input `index` of `op_type` carries a shape rather than data.
pub(crate) fn is_static_input(op_type: &str, index: usize) -> bool {
    matches!(
        (op_type, index),
        ("Reshape", 1) | ("Squeeze", 1) | ("Unsqueeze", 1)
    )
}

/// Read-only view of what inference needs: resolved profiles and parameter
/// values.
pub(crate) struct InferContext<'a> {
    pub profiles: &'a HashMap<String, VariableProfile>,
    pub model: &'a ModelData,
}

impl<'a> InferContext<'a> {
    fn input(&self, node: &Node, i: usize) -> Result<&'a VariableProfile> {
        let name = node.required_input(i)?;
        self.optional(name)
    }

    fn optional(&self, name: &str) -> Result<&'a VariableProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| Error::not_found(format!("variable '{name}' has no profile")))
    }

    fn input_opt(&self, node: &Node, i: usize) -> Result<Option<&'a VariableProfile>> {
        node.input(i).map(|name| self.optional(name)).transpose()
    }

    /// Integer values of a parameter used as a shape-carrying input.
    fn constant_ints(&self, node: &Node, i: usize, what: &str) -> Result<Option<Vec<i64>>> {
        let Some(name) = node.input(i) else {
            return Ok(None);
        };
        let param = self.model.parameter(name).ok_or_else(|| {
            Error::unsupported_op(
                &node.op_type,
                format!(
                    "node '{}': {what} input '{name}' must be a parameter",
                    node.label()
                ),
            )
        })?;
        let values = param.buffer.to_vec()?;
        Ok(Some(values.iter().map(|&v| v as i64).collect()))
    }
}

fn same_dtype(node: &Node, profiles: &[&VariableProfile]) -> Result<DType> {
    let dtype = profiles[0].dtype;
    if let Some(p) = profiles.iter().find(|p| p.dtype != dtype) {
        return Err(Error::InvalidDtype(format!(
            "{} '{}' mixes {} and {} inputs",
            node.op_type,
            node.label(),
            dtype,
            p.dtype
        )));
    }
    Ok(dtype)
}

fn rank4(node: &Node, p: &VariableProfile) -> Result<[usize; 4]> {
    match p.dims[..] {
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(Error::dim_mismatch(format!(
            "{} '{}' expects an NCHW input, got {:?}",
            node.op_type,
            node.label(),
            p.dims
        ))),
    }
}

fn rank2(node: &Node, what: &str, p: &VariableProfile) -> Result<[usize; 2]> {
    match p.dims[..] {
        [r, c] => Ok([r, c]),
        _ => Err(Error::dim_mismatch(format!(
            "{} '{}': {what} must be a matrix, got {:?}",
            node.op_type,
            node.label(),
            p.dims
        ))),
    }
}

fn expect_elems(node: &Node, what: &str, p: &VariableProfile, n: usize) -> Result<()> {
    if p.elem_count() != n {
        return Err(Error::dim_mismatch(format!(
            "{} '{}': {what} has {} elements, expected {n}",
            node.op_type,
            node.label(),
            p.elem_count()
        )));
    }
    Ok(())
}

/// Compute the profiles of every output of `node`, in output order.
pub(crate) fn infer_node(ctx: &InferContext<'_>, node: &Node) -> Result<Vec<VariableProfile>> {
    let op = node.op_type.as_str();
    let x = ctx.input(node, 0)?;
    let single = |dims: Vec<usize>| -> Result<Vec<VariableProfile>> {
        Ok(vec![VariableProfile::new(x.dtype, dims)])
    };

    match op {
        "Identity" | "Relu" | "LeakyRelu" | "Elu" | "Sigmoid" | "Tanh" | "Abs" | "Neg"
        | "Sqrt" | "Exp" | "Log" => single(x.dims.clone()),

        "Dropout" => {
            // Optional mask output gets the input's shape.
            Ok(node.outputs.iter().map(|_| x.clone()).collect())
        }

        "Softmax" => {
            normalize_axis(op, node.attr_int_or("axis", 1)?, x.rank())?;
            single(x.dims.clone())
        }

        "LRN" => {
            if x.rank() < 2 {
                return Err(Error::dim_mismatch(format!(
                    "LRN '{}' needs at least [N, C], got {:?}",
                    node.label(),
                    x.dims
                )));
            }
            if node.attr_int("size")? < 1 {
                return Err(Error::invalid_attribute(op, "size", "must be positive"));
            }
            single(x.dims.clone())
        }

        "BatchNormalization" => {
            if x.rank() < 2 {
                return Err(Error::dim_mismatch(format!(
                    "BatchNormalization '{}' needs at least [N, C], got {:?}",
                    node.label(),
                    x.dims
                )));
            }
            for (i, what) in [(1, "scale"), (2, "bias"), (3, "mean"), (4, "var")] {
                expect_elems(node, what, ctx.input(node, i)?, x.dims[1])?;
            }
            single(x.dims.clone())
        }

        "Add" | "Sub" | "Mul" | "Div" | "Sum" | "Max" | "Min" => {
            let operands: Vec<&VariableProfile> = node
                .present_inputs()
                .map(|name| ctx.optional(name))
                .collect::<Result<_>>()?;
            if matches!(op, "Add" | "Sub" | "Mul" | "Div") && operands.len() != 2 {
                return Err(Error::invalid_attribute(
                    op,
                    "inputs",
                    format!("expected 2 inputs, got {}", operands.len()),
                ));
            }
            let dtype = same_dtype(node, &operands)?;
            let mut shape = Shape::new(operands[0].dims.clone());
            for p in &operands[1..] {
                shape = Shape::broadcast_shape(&shape, &Shape::new(p.dims.clone()))?;
            }
            Ok(vec![VariableProfile::new(dtype, shape.into_dims())])
        }

        "Conv" => {
            let [n, c, h, w] = rank4(node, x)?;
            let weight = ctx.input_opt(node, 1)?;
            let (m, kernel) = conv_geometry(node, weight.map(|p| p.dims.as_slice()))?;
            let group = node.attr_int_or("group", 1)?;
            if group < 1 || c % group as usize != 0 || m % group as usize != 0 {
                return Err(Error::invalid_attribute(
                    op,
                    "group",
                    format!("{group} does not divide channels {c} and {m}"),
                ));
            }
            if let Some(wp) = weight {
                if wp.dims[1].checked_mul(group as usize) != Some(c) {
                    return Err(Error::dim_mismatch(format!(
                        "Conv '{}': weight expects {} input channels, input has {c}",
                        node.label(),
                        wp.dims[1].saturating_mul(group as usize)
                    )));
                }
            }
            if let Some(b) = ctx.input_opt(node, 2)? {
                expect_elems(node, "bias", b, m)?;
            }
            let window = Window2d::from_node(node, kernel, [h, w])?;
            single(vec![n, m, window.out_dim(0, h, false)?, window.out_dim(1, w, false)?])
        }

        "ConvTranspose" => {
            let [n, c, h, w] = rank4(node, x)?;
            let [wc, mpg, kh, kw] = rank4(node, ctx.input(node, 1)?)?;
            if wc != c {
                return Err(Error::dim_mismatch(format!(
                    "ConvTranspose '{}': weight has {wc} input channels, input has {c}",
                    node.label()
                )));
            }
            let group = node.attr_int_or("group", 1)?;
            if group < 1 || c % group as usize != 0 {
                return Err(Error::invalid_attribute(
                    op,
                    "group",
                    format!("{group} does not divide {c} input channels"),
                ));
            }
            let m = mpg.checked_mul(group as usize).ok_or_else(|| {
                Error::dim_mismatch(format!("ConvTranspose '{}': output channels overflow", node.label()))
            })?;
            if let Some(b) = ctx.input_opt(node, 2)? {
                expect_elems(node, "bias", b, m)?;
            }
            let output_padding = match node.attr_ints("output_padding")? {
                None => [0, 0],
                Some(&[a, b]) if a >= 0 && b >= 0 => [a as usize, b as usize],
                Some(other) => {
                    return Err(Error::invalid_attribute(
                        op,
                        "output_padding",
                        format!("expected two non-negative values, got {other:?}"),
                    ))
                }
            };
            let window = Window2d::from_node(node, Some([kh, kw]), [h, w])?;
            single(vec![
                n,
                m,
                window.transposed_out_dim(0, h, output_padding[0])?,
                window.transposed_out_dim(1, w, output_padding[1])?,
            ])
        }

        "MaxPool" | "AveragePool" => {
            let [n, c, h, w] = rank4(node, x)?;
            let window = Window2d::from_node(node, None, [h, w])?;
            let ceil_mode = node.attr_int_or("ceil_mode", 0)? != 0;
            let dims = vec![
                n,
                c,
                window.out_dim(0, h, ceil_mode)?,
                window.out_dim(1, w, ceil_mode)?,
            ];
            let mut outs = vec![VariableProfile::new(x.dtype, dims.clone())];
            if op == "MaxPool" && node.outputs.len() > 1 {
                outs.push(VariableProfile::new(DType::I64, dims));
            }
            Ok(outs)
        }

        "GlobalAveragePool" | "GlobalMaxPool" => {
            let [n, c, _, _] = rank4(node, x)?;
            single(vec![n, c, 1, 1])
        }

        "Gemm" => {
            let [ar, ac] = rank2(node, "A", x)?;
            let b = ctx.input(node, 1)?;
            let [br, bc] = rank2(node, "B", b)?;
            let (m, k) = if node.attr_int_or("transA", 0)? != 0 { (ac, ar) } else { (ar, ac) };
            let (kb, n) = if node.attr_int_or("transB", 0)? != 0 { (bc, br) } else { (br, bc) };
            if k != kb {
                return Err(Error::dim_mismatch(format!(
                    "Gemm '{}': inner dimensions differ ({k} vs {kb})",
                    node.label()
                )));
            }
            let dtype = same_dtype(node, &[x, b])?;
            if let Some(c) = ctx.input_opt(node, 2)? {
                let target = Shape::from((m, n));
                let out = Shape::broadcast_shape(&Shape::new(c.dims.clone()), &target)?;
                if out != target {
                    return Err(Error::dim_mismatch(format!(
                        "Gemm '{}': C {:?} does not broadcast to [{m}, {n}]",
                        node.label(),
                        c.dims
                    )));
                }
            }
            Ok(vec![VariableProfile::new(dtype, vec![m, n])])
        }

        "FC" => {
            if x.rank() < 2 {
                return Err(Error::dim_mismatch(format!(
                    "FC '{}' needs at least [batch, features], got {:?}",
                    node.label(),
                    x.dims
                )));
            }
            let batch = x.dims[0];
            let k: usize = x.dims[1..].iter().product();
            let [n, wk] = rank2(node, "weight", ctx.input(node, 1)?)?;
            if wk != k {
                return Err(Error::dim_mismatch(format!(
                    "FC '{}': weight expects {wk} features, input has {k}",
                    node.label()
                )));
            }
            if let Some(b) = ctx.input_opt(node, 2)? {
                expect_elems(node, "bias", b, n)?;
            }
            single(vec![batch, n])
        }

        "MatMul" => {
            let b = ctx.input(node, 1)?;
            let dtype = same_dtype(node, &[x, b])?;
            let shape = Shape::matmul_shape(&Shape::new(x.dims.clone()), &Shape::new(b.dims.clone()))?;
            Ok(vec![VariableProfile::new(dtype, shape.into_dims())])
        }

        "Flatten" => {
            let r = x.rank() as i64;
            let axis = node.attr_int_or("axis", 1)?;
            let axis = if axis < 0 { axis + r } else { axis };
            if !(0..=r).contains(&axis) {
                return Err(Error::invalid_attribute(
                    op,
                    "axis",
                    format!("axis {axis} out of range for rank {r}"),
                ));
            }
            let (outer, inner) = x.dims.split_at(axis as usize);
            single(vec![outer.iter().product(), inner.iter().product()])
        }

        "Reshape" => {
            let target = match node.attr_ints("shape")? {
                Some(s) => s.to_vec(),
                None => ctx.constant_ints(node, 1, "shape")?.ok_or_else(|| {
                    Error::invalid_attribute(op, "shape", "needs a `shape` attribute or input")
                })?,
            };
            single(reshape_dims(node, &x.dims, &target)?)
        }

        "Transpose" => {
            let perm = node.transpose_perm(x.rank())?;
            single(perm.iter().map(|&a| x.dims[a]).collect())
        }

        "Concat" => {
            let parts: Vec<&VariableProfile> = node
                .present_inputs()
                .map(|name| ctx.optional(name))
                .collect::<Result<_>>()?;
            let dtype = same_dtype(node, &parts)?;
            let axis = normalize_axis(op, node.attr_int("axis")?, x.rank())?;
            let mut dims = x.dims.clone();
            for p in &parts[1..] {
                let compatible = p.rank() == x.rank()
                    && p.dims
                        .iter()
                        .zip(&x.dims)
                        .enumerate()
                        .all(|(i, (a, b))| i == axis || a == b);
                if !compatible {
                    return Err(Error::dim_mismatch(format!(
                        "Concat '{}': {:?} and {:?} differ outside axis {axis}",
                        node.label(),
                        x.dims,
                        p.dims
                    )));
                }
                dims[axis] += p.dims[axis];
            }
            Ok(vec![VariableProfile::new(dtype, dims)])
        }

        "Squeeze" => {
            let axes = match node.attr_ints("axes")? {
                Some(a) => Some(a.to_vec()),
                None => ctx.constant_ints(node, 1, "axes")?,
            };
            let dims = match axes {
                None => x.dims.iter().copied().filter(|&d| d != 1).collect(),
                Some(axes) => {
                    let axes: Vec<usize> = axes
                        .iter()
                        .map(|&a| normalize_axis(op, a, x.rank()))
                        .collect::<Result<_>>()?;
                    if let Some(&a) = axes.iter().find(|&&a| x.dims[a] != 1) {
                        return Err(Error::dim_mismatch(format!(
                            "Squeeze '{}': axis {a} has size {}, not 1",
                            node.label(),
                            x.dims[a]
                        )));
                    }
                    x.dims
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| !axes.contains(i))
                        .map(|(_, &d)| d)
                        .collect()
                }
            };
            single(dims)
        }

        "Unsqueeze" => {
            let axes = match node.attr_ints("axes")? {
                Some(a) => a.to_vec(),
                None => ctx.constant_ints(node, 1, "axes")?.ok_or_else(|| {
                    Error::invalid_attribute(op, "axes", "required attribute is missing")
                })?,
            };
            let out_rank = x.rank() + axes.len();
            let mut ones = vec![false; out_rank];
            for &a in &axes {
                let a = normalize_axis(op, a, out_rank)?;
                if std::mem::replace(&mut ones[a], true) {
                    return Err(Error::invalid_attribute(
                        op,
                        "axes",
                        format!("axis {a} listed twice"),
                    ));
                }
            }
            let mut src = x.dims.iter();
            let dims = ones
                .iter()
                .map(|&one| if one { Some(1) } else { src.next().copied() })
                .collect::<Option<Vec<usize>>>()
                .ok_or_else(|| Error::msg("Unsqueeze axis bookkeeping out of sync"))?;
            single(dims)
        }

        other => Err(Error::unsupported_op(
            other,
            format!("no shape inference rule (node '{}')", node.label()),
        )),
    }
}

/// Resolve a Reshape target: `0` copies the input dim, one `-1` is inferred.
fn reshape_dims(node: &Node, input: &[usize], target: &[i64]) -> Result<Vec<usize>> {
    let total: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 if infer_at.is_none() => {
                infer_at = Some(i);
                dims.push(1);
            }
            -1 => {
                return Err(Error::invalid_attribute(
                    "Reshape",
                    "shape",
                    "more than one -1 in target shape",
                ))
            }
            0 => dims.push(*input.get(i).ok_or_else(|| {
                Error::invalid_attribute(
                    "Reshape",
                    "shape",
                    format!("0 at position {i} has no input dim to copy"),
                )
            })?),
            t if t > 0 => dims.push(t as usize),
            t => {
                return Err(Error::invalid_attribute(
                    "Reshape",
                    "shape",
                    format!("invalid dim {t}"),
                ))
            }
        }
    }
    let known = checked_elem_count(&dims).ok_or_else(|| {
        Error::dim_mismatch(format!(
            "Reshape '{}': target {:?} is too large",
            node.label(),
            target
        ))
    })?;
    if let Some(i) = infer_at {
        if known == 0 || total % known != 0 {
            return Err(Error::dim_mismatch(format!(
                "Reshape '{}': cannot infer -1 for {:?} from {:?}",
                node.label(),
                target,
                input
            )));
        }
        dims[i] = total / known;
    }
    if dims.iter().product::<usize>() != total {
        return Err(Error::dim_mismatch(format!(
            "Reshape '{}': {:?} has a different element count than {:?}",
            node.label(),
            dims,
            input
        )));
    }
    Ok(dims)
}
