// Matrix kernels — Gemm, FC, MatMul
//
// All three reduce to a row-major product computed one output row per rayon
// task. The inner loop runs over k then j so both the B row and the output
// row are walked contiguously.
//
//   Gemm:   Y = alpha * op(A) * op(B) + beta * C     (C broadcast to [M, N])
//   FC:     Y = X * W^T + b                          (X flattened to [batch, K])
//   MatMul: Y[..] = A[..] * B[..]                    (batch dims broadcast)

use rayon::prelude::*;

use vole_core::backend::{Kernel, KernelSpec};
use vole_core::error::{Error, Result};
use vole_core::shape::Shape;

use crate::{check_lengths, Activation};

#[derive(Debug)]
struct Addend {
    len: usize,
    /// Strides of C over the [M, N] output (0 on broadcast axes).
    strides: [usize; 2],
    beta: f32,
}

#[derive(Debug)]
struct GemmKernel {
    m: usize,
    k: usize,
    n: usize,
    trans_a: bool,
    trans_b: bool,
    alpha: f32,
    /// C, read from input slot 2.
    c: Option<Addend>,
    activation: Activation,
}

impl GemmKernel {
    #[inline]
    fn a_at(&self, a: &[f32], i: usize, kk: usize) -> f32 {
        if self.trans_a {
            a[kk * self.m + i]
        } else {
            a[i * self.k + kk]
        }
    }
}

impl Kernel for GemmKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.n);
        let mut in_lens = vec![m * k, k * n];
        if let Some(c) = &self.c {
            in_lens.push(c.len);
        }
        check_lengths("Gemm", inputs, &in_lens, outputs, &[m * n])?;
        let a = inputs[0];
        let b = inputs[1];
        let c: &[f32] = if self.c.is_some() { inputs[2] } else { &[] };

        outputs[0][..m * n]
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, row)| {
                row.fill(0.0);
                for kk in 0..k {
                    let av = self.a_at(a, i, kk);
                    if self.trans_b {
                        for (j, o) in row.iter_mut().enumerate() {
                            *o += av * b[j * k + kk];
                        }
                    } else {
                        let brow = &b[kk * n..(kk + 1) * n];
                        for (o, &bv) in row.iter_mut().zip(brow) {
                            *o += av * bv;
                        }
                    }
                }
                for (j, o) in row.iter_mut().enumerate() {
                    let mut v = self.alpha * *o;
                    if let Some(addend) = &self.c {
                        v += addend.beta * c[i * addend.strides[0] + j * addend.strides[1]];
                    }
                    *o = self.activation.apply(v);
                }
            });
        Ok(())
    }
}

fn matrix(op: &str, label: &str, what: &str, dims: &[usize]) -> Result<[usize; 2]> {
    match *dims {
        [r, c] => Ok([r, c]),
        _ => Err(Error::dim_mismatch(format!(
            "{op} '{label}': {what} must be a matrix, got {dims:?}"
        ))),
    }
}

fn addend(op: &str, label: &str, dims: &[usize], m: usize, n: usize, beta: f32) -> Result<Addend> {
    let c = Shape::new(dims.to_vec());
    let out = Shape::new(vec![m, n]);
    if c.rank() > 2 || Shape::broadcast_shape(&c, &out)? != out {
        return Err(Error::dim_mismatch(format!(
            "{op} '{label}': C {c} does not broadcast to {out}"
        )));
    }
    let strides = c.broadcast_strides(&out);
    Ok(Addend {
        len: c.elem_count(),
        strides: [strides[0], strides[1]],
        beta,
    })
}

pub(crate) fn gemm(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let label = node.label();
    let trans_a = node.attr_int_or("transA", 0)? != 0;
    let trans_b = node.attr_int_or("transB", 0)? != 0;
    let [ar, ac] = matrix("Gemm", label, "A", &spec.input(0)?.dims)?;
    let [br, bc] = matrix("Gemm", label, "B", &spec.input(1)?.dims)?;
    let (m, k) = if trans_a { (ac, ar) } else { (ar, ac) };
    let (kb, n) = if trans_b { (bc, br) } else { (br, bc) };
    if k != kb {
        return Err(Error::dim_mismatch(format!(
            "Gemm '{label}': inner dimensions differ ({k} vs {kb})"
        )));
    }
    let beta = node.attr_float_or("beta", 1.0)?;
    let c = match spec.inputs.get(2).copied().flatten() {
        Some(p) => Some(addend("Gemm", label, &p.dims, m, n, beta)?),
        None => None,
    };
    if spec.output(0)?.dims != [m, n] {
        return Err(Error::dim_mismatch(format!(
            "Gemm '{label}': output profile {:?}, computed [{m}, {n}]",
            spec.output(0)?.dims
        )));
    }
    Ok(Box::new(GemmKernel {
        m,
        k,
        n,
        trans_a,
        trans_b,
        alpha: node.attr_float_or("alpha", 1.0)?,
        c,
        activation: Activation::from_spec(spec)?,
    }))
}

/// FC is Gemm with B transposed and the input flattened from axis 1.
pub(crate) fn fc(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let label = node.label();
    let x = &spec.input(0)?.dims;
    if x.is_empty() {
        return Err(Error::dim_mismatch(format!("FC '{label}': input is a scalar")));
    }
    let batch = x[0];
    let k: usize = x[1..].iter().product();
    let [n, wk] = matrix("FC", label, "weight", &spec.input(1)?.dims)?;
    if wk != k {
        return Err(Error::dim_mismatch(format!(
            "FC '{label}': weight expects {wk} features, input has {k}"
        )));
    }
    let c = match spec.inputs.get(2).copied().flatten() {
        Some(p) => Some(addend("FC", label, &p.dims, batch, n, 1.0)?),
        None => None,
    };
    if spec.output(0)?.dims != [batch, n] {
        return Err(Error::dim_mismatch(format!(
            "FC '{label}': output profile {:?}, computed [{batch}, {n}]",
            spec.output(0)?.dims
        )));
    }
    Ok(Box::new(GemmKernel {
        m: batch,
        k,
        n,
        trans_a: false,
        trans_b: true,
        alpha: 1.0,
        c,
        activation: Activation::from_spec(spec)?,
    }))
}

// ── MatMul ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct MatMulKernel {
    m: usize,
    k: usize,
    n: usize,
    batch_dims: Vec<usize>,
    /// Matrix strides of A and B over the output batch dims.
    a_batch_strides: Vec<usize>,
    b_batch_strides: Vec<usize>,
    a_len: usize,
    b_len: usize,
}

impl MatMulKernel {
    fn batch_offset(&self, strides: &[usize], mut batch: usize) -> usize {
        let mut off = 0;
        for d in (0..self.batch_dims.len()).rev() {
            off += (batch % self.batch_dims[d]) * strides[d];
            batch /= self.batch_dims[d];
        }
        off
    }
}

impl Kernel for MatMulKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.n);
        let batches: usize = self.batch_dims.iter().product();
        let total = batches * m * n;
        check_lengths("MatMul", inputs, &[self.a_len, self.b_len], outputs, &[total])?;
        let a = inputs[0];
        let b = inputs[1];

        outputs[0][..total]
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(r, row)| {
                let batch = r / m;
                let i = r % m;
                let a_off = self.batch_offset(&self.a_batch_strides, batch) * m * k;
                let b_off = self.batch_offset(&self.b_batch_strides, batch) * k * n;
                row.fill(0.0);
                for kk in 0..k {
                    let av = a[a_off + i * k + kk];
                    let brow = &b[b_off + kk * n..b_off + (kk + 1) * n];
                    for (o, &bv) in row.iter_mut().zip(brow) {
                        *o += av * bv;
                    }
                }
            });
        Ok(())
    }
}

pub(crate) fn matmul(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let label = spec.node.label();
    let a = &spec.input(0)?.dims;
    let b = &spec.input(1)?.dims;
    let out = Shape::matmul_shape(&Shape::from(a.as_slice()), &Shape::from(b.as_slice()))?.into_dims();
    if spec.output(0)?.dims != out {
        return Err(Error::dim_mismatch(format!(
            "MatMul '{label}': output profile {:?}, computed {:?}",
            spec.output(0)?.dims,
            out
        )));
    }
    let batch = Shape::from(&out[..out.len() - 2]);
    let a_batch = Shape::from(&a[..a.len() - 2]);
    let b_batch = Shape::from(&b[..b.len() - 2]);
    Ok(Box::new(MatMulKernel {
        m: a[a.len() - 2],
        k: a[a.len() - 1],
        n: b[b.len() - 1],
        a_batch_strides: a_batch.broadcast_strides(&batch),
        b_batch_strides: b_batch.broadcast_strides(&batch),
        batch_dims: batch.into_dims(),
        a_len: a.iter().product(),
        b_len: b.iter().product(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::graph::{Attribute, Node, VariableProfile};
    use vole_core::DType;

    fn f32p(dims: &[usize]) -> VariableProfile {
        VariableProfile::new(DType::F32, dims.to_vec())
    }

    #[test]
    fn test_gemm_with_bias_row() {
        let a = f32p(&[2, 2]);
        let b = f32p(&[2, 3]);
        let c = f32p(&[3]);
        let y = f32p(&[2, 3]);
        let node = Node::new("Gemm").with_inputs(["a", "b", "c"]).with_outputs(["y"]);
        let spec = KernelSpec {
            node: &node,
            inputs: vec![Some(&a), Some(&b), Some(&c)],
            outputs: vec![&y],
        };
        let k = gemm(&spec).unwrap();
        let mut out = vec![0.0; 6];
        k.run(
            &[&[1.0, 2.0, 3.0, 4.0], &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0], &[0.0, 0.0, 10.0]],
            &mut [&mut out[..]],
        )
        .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 13.0, 3.0, 4.0, 17.0]);
    }

    #[test]
    fn test_gemm_transposed_scaled() {
        let a = f32p(&[2, 1]);
        let b = f32p(&[2, 2]);
        let y = f32p(&[1, 2]);
        let node = Node::new("Gemm")
            .with_inputs(["a", "b"])
            .with_outputs(["y"])
            .with_attr("transA", Attribute::Int(1))
            .with_attr("transB", Attribute::Int(1))
            .with_attr("alpha", Attribute::Float(2.0));
        let spec = KernelSpec { node: &node, inputs: vec![Some(&a), Some(&b)], outputs: vec![&y] };
        let k = gemm(&spec).unwrap();
        let mut out = vec![0.0; 2];
        k.run(&[&[1.0, 2.0], &[1.0, 1.0, 3.0, 0.0]], &mut [&mut out[..]])
            .unwrap();
        // A^T = [1, 2]; B^T = [[1, 3], [1, 0]] -> [3, 3] * 2
        assert_eq!(out, vec![6.0, 6.0]);
    }

    #[test]
    fn test_fc_flattens_and_relu() {
        let x = f32p(&[1, 2, 1, 1]);
        let w = f32p(&[2, 2]);
        let b = f32p(&[2]);
        let y = f32p(&[1, 2]);
        let node = Node::new("FC")
            .with_inputs(["x", "w", "b"])
            .with_outputs(["y"])
            .with_attr("activation", Attribute::String("Relu".into()));
        let spec = KernelSpec {
            node: &node,
            inputs: vec![Some(&x), Some(&w), Some(&b)],
            outputs: vec![&y],
        };
        let k = fc(&spec).unwrap();
        let mut out = vec![0.0; 2];
        k.run(&[&[1.0, 2.0], &[1.0, 1.0, -1.0, -1.0], &[0.5, 0.5]], &mut [&mut out[..]])
            .unwrap();
        assert_eq!(out, vec![3.5, 0.0]);
    }

    #[test]
    fn test_batched_matmul_broadcast() {
        let a = f32p(&[2, 1, 2]);
        let b = f32p(&[2, 1]);
        let y = f32p(&[2, 1, 1]);
        let node = Node::new("MatMul").with_inputs(["a", "b"]).with_outputs(["y"]);
        let spec = KernelSpec { node: &node, inputs: vec![Some(&a), Some(&b)], outputs: vec![&y] };
        let k = matmul(&spec).unwrap();
        let mut out = vec![0.0; 2];
        k.run(&[&[1.0, 2.0, 3.0, 4.0], &[10.0, 1.0]], &mut [&mut out[..]])
            .unwrap();
        assert_eq!(out, vec![12.0, 34.0]);
    }

    #[test]
    fn test_matmul_rejects_wrong_output_profile() {
        let a = f32p(&[2, 3]);
        let b = f32p(&[3, 4]);
        let node = Node::new("MatMul").with_inputs(["a", "b"]).with_outputs(["y"]);
        let spec = KernelSpec { node: &node, inputs: vec![Some(&a), Some(&b)], outputs: vec![&a] };
        let err = matmul(&spec).unwrap_err();
        assert_eq!(err.kind(), vole_core::ErrorKind::DimensionMismatch);
    }
}
