// Elementwise, normalization and layout kernels
//
// Every kernel here is pure data movement or a per-element function, so
// parallelism is a straight rayon split of the output slice. Kernels that
// reduce along an axis (softmax, LRN, batch norm) split over the outer
// independent dimension instead.

use rayon::prelude::*;

use vole_core::backend::{Kernel, KernelSpec};
use vole_core::error::{Error, Result};
use vole_core::shape::{normalize_axis, Shape};

use crate::check_lengths;

// ── Copy ────────────────────────────────────────────────────────────────────

/// Identity, Dropout (inference), Flatten, Reshape, Squeeze, Unsqueeze: the
/// element order is unchanged, only the profile differs.
#[derive(Debug)]
struct CopyKernel {
    len: usize,
    /// Dropout's optional mask output, all ones at inference time.
    mask_len: Option<usize>,
}

impl Kernel for CopyKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let out_lens: Vec<usize> = std::iter::once(self.len).chain(self.mask_len).collect();
        check_lengths("copy", &inputs[..1.min(inputs.len())], &[self.len], outputs, &out_lens)?;
        outputs[0][..self.len].copy_from_slice(&inputs[0][..self.len]);
        if let Some(n) = self.mask_len {
            outputs[1][..n].fill(1.0);
        }
        Ok(())
    }
}

pub(crate) fn copy(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let x = spec.input(0)?;
    let y = spec.output(0)?;
    if x.elem_count() != y.elem_count() {
        return Err(Error::dim_mismatch(format!(
            "{} '{}': input {:?} and output {:?} differ in element count",
            spec.node.op_type,
            spec.node.label(),
            x.dims,
            y.dims
        )));
    }
    let mask_len = if spec.node.op_type == "Dropout" && spec.outputs.len() > 1 {
        Some(spec.output(1)?.elem_count())
    } else {
        None
    };
    Ok(Box::new(CopyKernel {
        len: y.elem_count(),
        mask_len,
    }))
}

// ── Unary ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Relu,
    LeakyRelu(f32),
    Elu(f32),
    Sigmoid,
    Tanh,
    Abs,
    Neg,
    Sqrt,
    Exp,
    Log,
}

impl UnaryOp {
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::LeakyRelu(alpha) => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            UnaryOp::Elu(alpha) => {
                if x >= 0.0 {
                    x
                } else {
                    alpha * (x.exp() - 1.0)
                }
            }
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Neg => -x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
        }
    }
}

#[derive(Debug)]
struct UnaryKernel {
    op: UnaryOp,
    len: usize,
}

impl Kernel for UnaryKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        check_lengths("unary", inputs, &[self.len], outputs, &[self.len])?;
        let op = self.op;
        outputs[0][..self.len]
            .par_iter_mut()
            .zip(inputs[0][..self.len].par_iter())
            .for_each(|(o, &x)| *o = op.apply(x));
        Ok(())
    }
}

pub(crate) fn unary(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let op = match node.op_type.as_str() {
        "Relu" => UnaryOp::Relu,
        "LeakyRelu" => UnaryOp::LeakyRelu(node.attr_float_or("alpha", 0.01)?),
        "Elu" => UnaryOp::Elu(node.attr_float_or("alpha", 1.0)?),
        "Sigmoid" => UnaryOp::Sigmoid,
        "Tanh" => UnaryOp::Tanh,
        "Abs" => UnaryOp::Abs,
        "Neg" => UnaryOp::Neg,
        "Sqrt" => UnaryOp::Sqrt,
        "Exp" => UnaryOp::Exp,
        "Log" => UnaryOp::Log,
        other => return Err(Error::unsupported_op(other, "not a unary operator")),
    };
    let len = spec.output(0)?.elem_count();
    if spec.input(0)?.elem_count() != len {
        return Err(Error::dim_mismatch(format!(
            "{} '{}': input and output differ in size",
            node.op_type,
            node.label()
        )));
    }
    Ok(Box::new(UnaryKernel { op, len }))
}

// ── Broadcast binary / variadic ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl BinaryOp {
    #[inline]
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
        }
    }
}

#[derive(Debug)]
struct Operand {
    len: usize,
    /// Strides into the operand for each output dimension (0 = broadcast).
    strides: Vec<usize>,
    /// Operand has exactly the output shape, index it directly.
    direct: bool,
}

/// Folds all operands left to right with one binary operator, numpy-style
/// broadcasting each to the output shape.
#[derive(Debug)]
struct BroadcastKernel {
    op: BinaryOp,
    out_dims: Vec<usize>,
    out_len: usize,
    operands: Vec<Operand>,
}

impl BroadcastKernel {
    #[inline]
    fn offset(&self, strides: &[usize], mut i: usize) -> usize {
        let mut off = 0;
        for d in (0..self.out_dims.len()).rev() {
            let dim = self.out_dims[d];
            off += (i % dim) * strides[d];
            i /= dim;
        }
        off
    }

    #[inline]
    fn load(&self, k: usize, data: &[f32], i: usize) -> f32 {
        let operand = &self.operands[k];
        if operand.direct {
            data[i]
        } else {
            data[self.offset(&operand.strides, i)]
        }
    }
}

impl Kernel for BroadcastKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let in_lens: Vec<usize> = self.operands.iter().map(|o| o.len).collect();
        check_lengths("broadcast", inputs, &in_lens, outputs, &[self.out_len])?;
        outputs[0][..self.out_len]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| {
                let mut acc = self.load(0, inputs[0], i);
                for (k, data) in inputs.iter().enumerate().take(self.operands.len()).skip(1) {
                    acc = self.op.apply(acc, self.load(k, data, i));
                }
                *o = acc;
            });
        Ok(())
    }
}

pub(crate) fn broadcast(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let op = match node.op_type.as_str() {
        "Add" | "Sum" => BinaryOp::Add,
        "Sub" => BinaryOp::Sub,
        "Mul" => BinaryOp::Mul,
        "Div" => BinaryOp::Div,
        "Max" => BinaryOp::Max,
        "Min" => BinaryOp::Min,
        other => return Err(Error::unsupported_op(other, "not a broadcast operator")),
    };
    let out = Shape::new(spec.output(0)?.dims.clone());
    let mut operands = Vec::with_capacity(spec.inputs.len());
    for i in 0..spec.inputs.len() {
        let profile = spec.input(i)?;
        let shape = Shape::new(profile.dims.clone());
        // Reject anything that does not broadcast to the output exactly.
        if Shape::broadcast_shape(&shape, &out)? != out {
            return Err(Error::dim_mismatch(format!(
                "{} '{}': operand {} does not broadcast to {}",
                node.op_type,
                node.label(),
                shape,
                out
            )));
        }
        operands.push(Operand {
            len: shape.elem_count(),
            strides: shape.broadcast_strides(&out),
            direct: shape == out,
        });
    }
    if operands.is_empty() {
        return Err(Error::invalid_attribute(
            &node.op_type,
            "input[0]",
            "at least one input is required",
        ));
    }
    Ok(Box::new(BroadcastKernel {
        op,
        out_len: out.elem_count(),
        out_dims: out.into_dims(),
        operands,
    }))
}

// ── Softmax ─────────────────────────────────────────────────────────────────

/// Softmax over the input coerced to 2D at `axis`: rows are
/// `prod(dims[..axis])`, each row has `prod(dims[axis..])` elements.
#[derive(Debug)]
struct SoftmaxKernel {
    rows: usize,
    cols: usize,
}

impl Kernel for SoftmaxKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let n = self.rows * self.cols;
        check_lengths("softmax", inputs, &[n], outputs, &[n])?;
        if self.cols == 0 {
            return Ok(());
        }
        outputs[0][..n]
            .par_chunks_mut(self.cols)
            .zip(inputs[0][..n].par_chunks(self.cols))
            .for_each(|(out, x)| {
                let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for (o, &v) in out.iter_mut().zip(x) {
                    *o = (v - max).exp();
                    sum += *o;
                }
                out.iter_mut().for_each(|o| *o /= sum);
            });
        Ok(())
    }
}

pub(crate) fn softmax(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let dims = &spec.input(0)?.dims;
    let axis = normalize_axis("Softmax", spec.node.attr_int_or("axis", 1)?, dims.len())?;
    Ok(Box::new(SoftmaxKernel {
        rows: dims[..axis].iter().product(),
        cols: dims[axis..].iter().product(),
    }))
}

// ── LRN ─────────────────────────────────────────────────────────────────────

/// Local response normalization across channels of an NCHW input.
#[derive(Debug)]
struct LrnKernel {
    n: usize,
    c: usize,
    plane: usize,
    size: usize,
    alpha: f32,
    beta: f32,
    bias: f32,
}

impl Kernel for LrnKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let total = self.n * self.c * self.plane;
        check_lengths("LRN", inputs, &[total], outputs, &[total])?;
        let x = inputs[0];
        let before = (self.size - 1) / 2;
        let after = self.size - 1 - before;
        let scale = self.alpha / self.size as f32;
        outputs[0][..total]
            .par_chunks_mut(self.plane.max(1))
            .enumerate()
            .for_each(|(nc, out)| {
                let batch = nc / self.c;
                let ch = nc % self.c;
                let lo = ch.saturating_sub(before);
                let hi = (ch + after).min(self.c - 1);
                let base = batch * self.c * self.plane;
                for (p, o) in out.iter_mut().enumerate() {
                    let mut sq = 0.0;
                    for k in lo..=hi {
                        let v = x[base + k * self.plane + p];
                        sq += v * v;
                    }
                    let v = x[base + ch * self.plane + p];
                    *o = v / (self.bias + scale * sq).powf(self.beta);
                }
            });
        Ok(())
    }
}

pub(crate) fn lrn(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let dims = &spec.input(0)?.dims;
    if dims.len() < 2 {
        return Err(Error::dim_mismatch(format!(
            "LRN '{}' needs at least [N, C], got {:?}",
            node.label(),
            dims
        )));
    }
    let size = node.attr_int("size")?;
    if size < 1 {
        return Err(Error::invalid_attribute("LRN", "size", "must be positive"));
    }
    Ok(Box::new(LrnKernel {
        n: dims[0],
        c: dims[1],
        plane: dims[2..].iter().product(),
        size: size as usize,
        alpha: node.attr_float_or("alpha", 1e-4)?,
        beta: node.attr_float_or("beta", 0.75)?,
        bias: node.attr_float_or("bias", 1.0)?,
    }))
}

// ── BatchNormalization ──────────────────────────────────────────────────────

/// Inference-mode batch norm: `scale * (x - mean) / sqrt(var + eps) + bias`
/// per channel. Inputs: X, scale, B, mean, var.
#[derive(Debug)]
struct BatchNormKernel {
    n: usize,
    c: usize,
    plane: usize,
    epsilon: f32,
}

impl Kernel for BatchNormKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let total = self.n * self.c * self.plane;
        let c = self.c;
        check_lengths(
            "BatchNormalization",
            inputs,
            &[total, c, c, c, c],
            outputs,
            &[total],
        )?;
        let (x, scale, bias, mean, var) = (inputs[0], inputs[1], inputs[2], inputs[3], inputs[4]);
        outputs[0][..total]
            .par_chunks_mut(self.plane.max(1))
            .enumerate()
            .for_each(|(nc, out)| {
                let ch = nc % c;
                let k = scale[ch] / (var[ch] + self.epsilon).sqrt();
                let shift = bias[ch] - mean[ch] * k;
                let base = nc * self.plane;
                for (p, o) in out.iter_mut().enumerate() {
                    *o = x[base + p] * k + shift;
                }
            });
        Ok(())
    }
}

pub(crate) fn batch_norm(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let dims = &spec.input(0)?.dims;
    if dims.len() < 2 {
        return Err(Error::dim_mismatch(format!(
            "BatchNormalization '{}' needs at least [N, C], got {:?}",
            spec.node.label(),
            dims
        )));
    }
    for i in 1..5 {
        let p = spec.input(i)?;
        if p.elem_count() != dims[1] {
            return Err(Error::dim_mismatch(format!(
                "BatchNormalization '{}': input {} has {} elements, expected {}",
                spec.node.label(),
                i,
                p.elem_count(),
                dims[1]
            )));
        }
    }
    Ok(Box::new(BatchNormKernel {
        n: dims[0],
        c: dims[1],
        plane: dims[2..].iter().product(),
        epsilon: spec.node.attr_float_or("epsilon", 1e-5)?,
    }))
}

// ── Transpose ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TransposeKernel {
    out_dims: Vec<usize>,
    /// Input stride for each output dimension.
    in_strides: Vec<usize>,
    len: usize,
}

impl Kernel for TransposeKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        check_lengths("Transpose", inputs, &[self.len], outputs, &[self.len])?;
        let x = inputs[0];
        outputs[0][..self.len]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| {
                let mut rem = i;
                let mut off = 0;
                for d in (0..self.out_dims.len()).rev() {
                    off += (rem % self.out_dims[d]) * self.in_strides[d];
                    rem /= self.out_dims[d];
                }
                *o = x[off];
            });
        Ok(())
    }
}

pub(crate) fn transpose(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let in_shape = Shape::new(spec.input(0)?.dims.clone());
    let perm = spec.node.transpose_perm(in_shape.rank())?;
    let strides = in_shape.stride_contiguous();
    Ok(Box::new(TransposeKernel {
        out_dims: perm.iter().map(|&a| in_shape.dims()[a]).collect(),
        in_strides: perm.iter().map(|&a| strides[a]).collect(),
        len: in_shape.elem_count(),
    }))
}

// ── Concat ──────────────────────────────────────────────────────────────────

/// Concatenation along `axis`: for each outer index, each input contributes
/// one contiguous block of `dims[axis] * inner` elements.
#[derive(Debug)]
struct ConcatKernel {
    outer: usize,
    blocks: Vec<usize>,
}

impl Kernel for ConcatKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let in_lens: Vec<usize> = self.blocks.iter().map(|b| b * self.outer).collect();
        let row: usize = self.blocks.iter().sum();
        check_lengths("Concat", inputs, &in_lens, outputs, &[row * self.outer])?;
        if row == 0 {
            return Ok(());
        }
        outputs[0][..row * self.outer]
            .par_chunks_mut(row)
            .enumerate()
            .for_each(|(o, out)| {
                let mut at = 0;
                for (x, &block) in inputs.iter().zip(&self.blocks) {
                    out[at..at + block].copy_from_slice(&x[o * block..(o + 1) * block]);
                    at += block;
                }
            });
        Ok(())
    }
}

pub(crate) fn concat(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let out = &spec.output(0)?.dims;
    let axis = normalize_axis("Concat", spec.node.attr_int("axis")?, out.len())?;
    let inner: usize = out[axis + 1..].iter().product();
    let mut blocks = Vec::with_capacity(spec.inputs.len());
    for i in 0..spec.inputs.len() {
        let dims = &spec.input(i)?.dims;
        if dims.len() != out.len() {
            return Err(Error::dim_mismatch(format!(
                "Concat '{}': input {} has rank {}, output rank {}",
                spec.node.label(),
                i,
                dims.len(),
                out.len()
            )));
        }
        blocks.push(dims[axis] * inner);
    }
    Ok(Box::new(ConcatKernel {
        outer: out[..axis].iter().product(),
        blocks,
    }))
}
