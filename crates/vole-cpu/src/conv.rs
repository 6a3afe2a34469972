// Convolution and pooling kernels — NCHW, f32
//
// All kernels work on rank-4 NCHW data and take their geometry from
// Window2d, the same resolution the profile inference used, so the output
// sizes computed here always agree with the profile table. compile() checks
// that agreement anyway and reports DimensionMismatch if it does not hold.
//
// Parallelism: Conv and the pools split over output planes (one (n, c)
// pair per task). ConvTranspose scatters into its output, so it splits over
// the batch instead, one whole [M, OH, OW] image per task.

use rayon::prelude::*;

use vole_core::backend::{Kernel, KernelSpec};
use vole_core::error::{Error, Result};
use vole_core::window::{conv_geometry, Window2d};

use crate::{check_lengths, Activation};

fn nchw(op: &str, label: &str, dims: &[usize]) -> Result<[usize; 4]> {
    match *dims {
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(Error::dim_mismatch(format!(
            "{op} '{label}' expects an NCHW input, got {dims:?}"
        ))),
    }
}

fn check_output(spec: &KernelSpec<'_>, expected: &[usize]) -> Result<()> {
    let out = &spec.output(0)?.dims;
    if out.as_slice() != expected {
        return Err(Error::dim_mismatch(format!(
            "{} '{}': output profile {:?} disagrees with computed {:?}",
            spec.node.op_type,
            spec.node.label(),
            out,
            expected
        )));
    }
    Ok(())
}

// ── Conv ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ConvKernel {
    input: [usize; 4],
    out_channels: usize,
    out_hw: [usize; 2],
    group: usize,
    window: Window2d,
    /// False when the node has no weight input; the weights are then zero.
    has_weight: bool,
    has_bias: bool,
    activation: Activation,
}

impl Kernel for ConvKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let [n, c, h, w] = self.input;
        let m = self.out_channels;
        let [oh, ow] = self.out_hw;
        let [kh, kw] = self.window.kernel;
        let cpg = c / self.group;
        let mpg = m / self.group;

        let total = n * m * oh * ow;
        let mut in_lens = vec![n * c * h * w];
        if self.has_weight || self.has_bias {
            in_lens.push(if self.has_weight { m * cpg * kh * kw } else { 0 });
        }
        if self.has_bias {
            in_lens.push(m);
        }
        check_lengths("Conv", inputs, &in_lens, outputs, &[total])?;
        let x = inputs[0];
        let weight: &[f32] = if self.has_weight { inputs[1] } else { &[] };
        let bias: &[f32] = if self.has_bias { inputs[2] } else { &[] };

        let [sh, sw] = self.window.strides;
        let [dh, dw] = self.window.dilations;
        let pt = self.window.pad_begin(0) as isize;
        let pl = self.window.pad_begin(1) as isize;

        outputs[0][..total]
            .par_chunks_mut(oh * ow)
            .enumerate()
            .for_each(|(nm, plane)| {
                let b = nm / m;
                let oc = nm % m;
                let g = oc / mpg;
                let base = if self.has_bias { bias[oc] } else { 0.0 };
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = base;
                        if self.has_weight {
                            for icg in 0..cpg {
                                let ic = g * cpg + icg;
                                let xbase = (b * c + ic) * h * w;
                                let wbase = (oc * cpg + icg) * kh * kw;
                                for ky in 0..kh {
                                    let iy = (oy * sh + ky * dh) as isize - pt;
                                    if iy < 0 || iy >= h as isize {
                                        continue;
                                    }
                                    let row = xbase + iy as usize * w;
                                    for kx in 0..kw {
                                        let ix = (ox * sw + kx * dw) as isize - pl;
                                        if ix < 0 || ix >= w as isize {
                                            continue;
                                        }
                                        acc += x[row + ix as usize] * weight[wbase + ky * kw + kx];
                                    }
                                }
                            }
                        }
                        plane[oy * ow + ox] = self.activation.apply(acc);
                    }
                }
            });
        Ok(())
    }
}

pub(crate) fn conv(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let input = nchw("Conv", node.label(), &spec.input(0)?.dims)?;
    let weight = spec.inputs.get(1).copied().flatten();
    let bias = spec.inputs.get(2).copied().flatten();

    let (m, kernel) = conv_geometry(node, weight.map(|p| p.dims.as_slice()))?;
    let window = Window2d::from_node(node, kernel, [input[2], input[3]])?;
    let group = node.attr_int_or("group", 1)?;
    if group < 1 || input[1] % group as usize != 0 || m % group as usize != 0 {
        return Err(Error::invalid_attribute(
            "Conv",
            "group",
            format!("{group} does not divide channels {} and {m}", input[1]),
        ));
    }
    let group = group as usize;
    if let Some(w) = weight {
        if w.dims[1] * group != input[1] {
            return Err(Error::dim_mismatch(format!(
                "Conv '{}': weight expects {} input channels, input has {}",
                node.label(),
                w.dims[1] * group,
                input[1]
            )));
        }
    }
    if let Some(b) = bias {
        if b.elem_count() != m {
            return Err(Error::dim_mismatch(format!(
                "Conv '{}': bias has {} elements, expected {m}",
                node.label(),
                b.elem_count()
            )));
        }
    }

    let out_hw = [
        window.out_dim(0, input[2], false)?,
        window.out_dim(1, input[3], false)?,
    ];
    check_output(spec, &[input[0], m, out_hw[0], out_hw[1]])?;
    Ok(Box::new(ConvKernel {
        input,
        out_channels: m,
        out_hw,
        group,
        window,
        has_weight: weight.is_some(),
        has_bias: bias.is_some(),
        activation: Activation::from_spec(spec)?,
    }))
}

// ── ConvTranspose ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct ConvTransposeKernel {
    input: [usize; 4],
    out_channels: usize,
    out_hw: [usize; 2],
    group: usize,
    window: Window2d,
    has_bias: bool,
}

impl Kernel for ConvTransposeKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let [n, c, h, w] = self.input;
        let m = self.out_channels;
        let [oh, ow] = self.out_hw;
        let [kh, kw] = self.window.kernel;
        let cpg = c / self.group;
        let mpg = m / self.group;
        let image = m * oh * ow;

        let mut in_lens = vec![n * c * h * w, c * mpg * kh * kw];
        if self.has_bias {
            in_lens.push(m);
        }
        check_lengths("ConvTranspose", inputs, &in_lens, outputs, &[n * image])?;
        let x = inputs[0];
        let weight = inputs[1];
        let bias: &[f32] = if self.has_bias { inputs[2] } else { &[] };

        let [sh, sw] = self.window.strides;
        let [dh, dw] = self.window.dilations;
        let pt = self.window.pad_begin(0) as isize;
        let pl = self.window.pad_begin(1) as isize;

        outputs[0][..n * image]
            .par_chunks_mut(image)
            .enumerate()
            .for_each(|(b, out)| {
                for oc in 0..m {
                    let v = if self.has_bias { bias[oc] } else { 0.0 };
                    out[oc * oh * ow..(oc + 1) * oh * ow].fill(v);
                }
                for ic in 0..c {
                    let g = ic / cpg;
                    let xbase = (b * c + ic) * h * w;
                    for iy in 0..h {
                        for ix in 0..w {
                            let v = x[xbase + iy * w + ix];
                            for ocg in 0..mpg {
                                let oc = g * mpg + ocg;
                                let wbase = (ic * mpg + ocg) * kh * kw;
                                for ky in 0..kh {
                                    let oy = (iy * sh + ky * dh) as isize - pt;
                                    if oy < 0 || oy >= oh as isize {
                                        continue;
                                    }
                                    for kx in 0..kw {
                                        let ox = (ix * sw + kx * dw) as isize - pl;
                                        if ox < 0 || ox >= ow as isize {
                                            continue;
                                        }
                                        out[(oc * oh + oy as usize) * ow + ox as usize] +=
                                            v * weight[wbase + ky * kw + kx];
                                    }
                                }
                            }
                        }
                    }
                }
            });
        Ok(())
    }
}

pub(crate) fn conv_transpose(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let input = nchw("ConvTranspose", node.label(), &spec.input(0)?.dims)?;
    let weight = spec.input(1)?;
    let [wc, mpg, kh, kw] = nchw("ConvTranspose", node.label(), &weight.dims)?;
    let group = node.attr_int_or("group", 1)?;
    if group < 1 || input[1] % group as usize != 0 {
        return Err(Error::invalid_attribute(
            "ConvTranspose",
            "group",
            format!("{group} does not divide {} input channels", input[1]),
        ));
    }
    let group = group as usize;
    if wc != input[1] {
        return Err(Error::dim_mismatch(format!(
            "ConvTranspose '{}': weight has {wc} input channels, input has {}",
            node.label(),
            input[1]
        )));
    }
    let m = mpg.checked_mul(group).ok_or_else(|| {
        Error::dim_mismatch(format!("ConvTranspose '{}': output channels overflow", node.label()))
    })?;
    let bias = spec.inputs.get(2).copied().flatten();
    if let Some(b) = bias {
        if b.elem_count() != m {
            return Err(Error::dim_mismatch(format!(
                "ConvTranspose '{}': bias has {} elements, expected {m}",
                node.label(),
                b.elem_count()
            )));
        }
    }
    let window = Window2d::from_node(node, Some([kh, kw]), [input[2], input[3]])?;
    let output_padding = match node.attr_ints("output_padding")? {
        None => [0, 0],
        Some(&[a, b]) if a >= 0 && b >= 0 => [a as usize, b as usize],
        Some(other) => {
            return Err(Error::invalid_attribute(
                "ConvTranspose",
                "output_padding",
                format!("expected two non-negative values, got {other:?}"),
            ))
        }
    };
    let out_hw = [
        window.transposed_out_dim(0, input[2], output_padding[0])?,
        window.transposed_out_dim(1, input[3], output_padding[1])?,
    ];
    check_output(spec, &[input[0], m, out_hw[0], out_hw[1]])?;
    Ok(Box::new(ConvTransposeKernel {
        input,
        out_channels: m,
        out_hw,
        group,
        window,
        has_bias: bias.is_some(),
    }))
}

// ── MaxPool / AveragePool ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Max,
    Average { count_include_pad: bool },
}

#[derive(Debug)]
struct PoolKernel {
    kind: PoolKind,
    input: [usize; 4],
    out_hw: [usize; 2],
    window: Window2d,
}

impl Kernel for PoolKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        let [n, c, h, w] = self.input;
        let [oh, ow] = self.out_hw;
        let [kh, kw] = self.window.kernel;
        let [sh, sw] = self.window.strides;
        let [dh, dw] = self.window.dilations;
        let pt = self.window.pad_begin(0) as isize;
        let pl = self.window.pad_begin(1) as isize;
        let padded_h = (h + self.window.pad_end(0)) as isize;
        let padded_w = (w + self.window.pad_end(1)) as isize;
        let total = n * c * oh * ow;
        check_lengths("pool", inputs, &[n * c * h * w], outputs, &[total])?;
        let x = inputs[0];

        outputs[0][..total]
            .par_chunks_mut(oh * ow)
            .enumerate()
            .for_each(|(nc, plane)| {
                let xplane = &x[nc * h * w..(nc + 1) * h * w];
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut max = f32::NEG_INFINITY;
                        let mut sum = 0.0;
                        let mut inside = 0usize;
                        let mut padded = 0usize;
                        for ky in 0..kh {
                            let iy = (oy * sh + ky * dh) as isize - pt;
                            for kx in 0..kw {
                                let ix = (ox * sw + kx * dw) as isize - pl;
                                if iy < padded_h && ix < padded_w {
                                    padded += 1;
                                }
                                if iy < 0 || iy >= h as isize || ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let v = xplane[iy as usize * w + ix as usize];
                                max = max.max(v);
                                sum += v;
                                inside += 1;
                            }
                        }
                        plane[oy * ow + ox] = match self.kind {
                            PoolKind::Max => max,
                            PoolKind::Average { count_include_pad } => {
                                let count = if count_include_pad { padded } else { inside };
                                if count == 0 {
                                    0.0
                                } else {
                                    sum / count as f32
                                }
                            }
                        };
                    }
                }
            });
        Ok(())
    }
}

pub(crate) fn pool(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let node = spec.node;
    let kind = match node.op_type.as_str() {
        "MaxPool" => PoolKind::Max,
        _ => PoolKind::Average {
            count_include_pad: node.attr_int_or("count_include_pad", 0)? != 0,
        },
    };
    if spec.outputs.len() > 1 {
        return Err(Error::unsupported_op(
            &node.op_type,
            "the indices output is not supported",
        ));
    }
    let input = nchw(&node.op_type, node.label(), &spec.input(0)?.dims)?;
    let window = Window2d::from_node(node, None, [input[2], input[3]])?;
    let ceil_mode = node.attr_int_or("ceil_mode", 0)? != 0;
    let out_hw = [
        window.out_dim(0, input[2], ceil_mode)?,
        window.out_dim(1, input[3], ceil_mode)?,
    ];
    check_output(spec, &[input[0], input[1], out_hw[0], out_hw[1]])?;
    Ok(Box::new(PoolKernel {
        kind,
        input,
        out_hw,
        window,
    }))
}

// ── GlobalAveragePool / GlobalMaxPool ───────────────────────────────────────

#[derive(Debug)]
struct GlobalPoolKernel {
    max: bool,
    planes: usize,
    plane: usize,
}

impl Kernel for GlobalPoolKernel {
    fn run(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]]) -> Result<()> {
        check_lengths(
            "global pool",
            inputs,
            &[self.planes * self.plane],
            outputs,
            &[self.planes],
        )?;
        let x = inputs[0];
        let plane = self.plane.max(1);
        outputs[0][..self.planes]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, o)| {
                let values = &x[i * plane..(i + 1) * plane];
                *o = if self.max {
                    values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
                } else {
                    values.iter().sum::<f32>() / plane as f32
                };
            });
        Ok(())
    }
}

pub(crate) fn global_pool(spec: &KernelSpec<'_>) -> Result<Box<dyn Kernel>> {
    let dims = &spec.input(0)?.dims;
    if dims.len() < 3 {
        return Err(Error::dim_mismatch(format!(
            "{} '{}' expects [N, C, spatial...], got {:?}",
            spec.node.op_type,
            spec.node.label(),
            dims
        )));
    }
    Ok(Box::new(GlobalPoolKernel {
        max: spec.node.op_type == "GlobalMaxPool",
        planes: dims[0] * dims[1],
        plane: dims[2..].iter().product(),
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
    fn test_conv_identity_kernel() {
        // 1x1 kernel with weight 2 doubles the input.
        let x = f32p(&[1, 1, 2, 2]);
        let wp = f32p(&[1, 1, 1, 1]);
        let node = Node::new("Conv").with_inputs(["x", "w"]).with_outputs(["y"]);
        let spec = KernelSpec { node: &node, inputs: vec![Some(&x), Some(&wp)], outputs: vec![&x] };
        let k = conv(&spec).unwrap();
        let mut y = vec![0.0; 4];
        k.run(&[&[1.0, 2.0, 3.0, 4.0], &[2.0]], &mut [&mut y[..]]).unwrap();
        assert_eq!(y, vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_conv_padded_sum() {
        // 3x3 ones kernel, pad 1: each output is the sum of its neighbourhood.
        let x = f32p(&[1, 1, 2, 2]);
        let wp = f32p(&[1, 1, 3, 3]);
        let bp = f32p(&[1]);
        let node = Node::new("Conv")
            .with_inputs(["x", "w", "b"])
            .with_outputs(["y"])
            .with_attr("pads", Attribute::Ints(vec![1, 1, 1, 1]));
        let spec = KernelSpec {
            node: &node,
            inputs: vec![Some(&x), Some(&wp), Some(&bp)],
            outputs: vec![&x],
        };
        let k = conv(&spec).unwrap();
        let mut y = vec![0.0; 4];
        k.run(&[&[1.0, 2.0, 3.0, 4.0], &[1.0; 9], &[0.5]], &mut [&mut y[..]])
            .unwrap();
        assert_eq!(y, vec![10.5; 4]);
    }

    #[test]
    fn test_conv_without_weight_is_bias_only() {
        let x = f32p(&[1, 3, 4, 4]);
        let y = f32p(&[1, 2, 4, 4]);
        let node = Node::new("Conv")
            .with_inputs(["x"])
            .with_outputs(["y"])
            .with_attr("kernel", Attribute::Ints(vec![3, 3]))
            .with_attr("pad", Attribute::Ints(vec![1, 1]))
            .with_attr("out_channels", Attribute::Int(2));
        let spec = KernelSpec { node: &node, inputs: vec![Some(&x)], outputs: vec![&y] };
        let k = conv(&spec).unwrap();
        let mut out = vec![9.0; 32];
        k.run(&[&[1.0; 48]], &mut [&mut out[..]]).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_conv_fused_relu_and_groups() {
        // Depthwise: two channels, each scaled by its own weight.
        let x = f32p(&[1, 2, 1, 2]);
        let wp = f32p(&[2, 1, 1, 1]);
        let node = Node::new("Conv")
            .with_inputs(["x", "w"])
            .with_outputs(["y"])
            .with_attr("group", Attribute::Int(2))
            .with_attr("activation", Attribute::String("Relu".into()));
        let spec = KernelSpec { node: &node, inputs: vec![Some(&x), Some(&wp)], outputs: vec![&x] };
        let k = conv(&spec).unwrap();
        let mut y = vec![0.0; 4];
        k.run(&[&[1.0, -1.0, 2.0, 3.0], &[3.0, -1.0]], &mut [&mut y[..]])
            .unwrap();
        assert_eq!(y, vec![3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_conv_rejects_wrong_output_profile() {
        let x = f32p(&[1, 1, 4, 4]);
        let wp = f32p(&[1, 1, 3, 3]);
        let node = Node::new("Conv").with_inputs(["x", "w"]).with_outputs(["y"]);
        let spec = KernelSpec { node: &node, inputs: vec![Some(&x), Some(&wp)], outputs: vec![&x] };
        let err = conv(&spec).unwrap_err();
        assert_eq!(err.kind(), vole_core::ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_conv_transpose_stride2() {
        let x = f32p(&[1, 1, 2, 2]);
        let wp = f32p(&[1, 1, 2, 2]);
        let y = f32p(&[1, 1, 4, 4]);
        let node = Node::new("ConvTranspose")
            .with_inputs(["x", "w"])
            .with_outputs(["y"])
            .with_attr("strides", Attribute::Ints(vec![2, 2]));
        let spec = KernelSpec { node: &node, inputs: vec![Some(&x), Some(&wp)], outputs: vec![&y] };
        let k = conv_transpose(&spec).unwrap();
        let mut out = vec![0.0; 16];
        k.run(&[&[1.0, 2.0, 3.0, 4.0], &[1.0; 4]], &mut [&mut out[..]])
            .unwrap();
        // Each input pixel expands into a 2x2 block.
        assert_eq!(
            out,
            vec![
                1.0, 1.0, 2.0, 2.0, //
                1.0, 1.0, 2.0, 2.0, //
                3.0, 3.0, 4.0, 4.0, //
                3.0, 3.0, 4.0, 4.0,
            ]
        );
    }

    #[test]
    fn test_max_and_average_pool() {
        let x = f32p(&[1, 1, 2, 2]);
        let y = f32p(&[1, 1, 1, 1]);
        let data = [1.0, 5.0, 3.0, 2.0];
        for (op, expected) in [("MaxPool", 5.0), ("AveragePool", 2.75)] {
            let node = Node::new(op)
                .with_inputs(["x"])
                .with_outputs(["y"])
                .with_attr("kernel_shape", Attribute::Ints(vec![2, 2]));
            let spec = KernelSpec { node: &node, inputs: vec![Some(&x)], outputs: vec![&y] };
            let k = pool(&spec).unwrap();
            let mut out = vec![0.0; 1];
            k.run(&[&data], &mut [&mut out[..]]).unwrap();
            assert_eq!(out[0], expected, "{op}");
        }
    }

    #[test]
    fn test_average_pool_excludes_padding() {
        let x = f32p(&[1, 1, 2, 2]);
        let node = Node::new("AveragePool")
            .with_inputs(["x"])
            .with_outputs(["y"])
            .with_attr("kernel_shape", Attribute::Ints(vec![3, 3]))
            .with_attr("pads", Attribute::Ints(vec![1, 1, 1, 1]));
        let spec = KernelSpec { node: &node, inputs: vec![Some(&x)], outputs: vec![&x] };
        let k = pool(&spec).unwrap();
        let mut out = vec![0.0; 4];
        k.run(&[&[4.0; 4]], &mut [&mut out[..]]).unwrap();
        assert_eq!(out, vec![4.0; 4]);
    }

    #[test]
    fn test_global_average_pool() {
        let x = f32p(&[1, 2, 2, 2]);
        let y = f32p(&[1, 2, 1, 1]);
        let node = Node::new("GlobalAveragePool").with_inputs(["x"]).with_outputs(["y"]);
        let spec = KernelSpec { node: &node, inputs: vec![Some(&x)], outputs: vec![&y] };
        let k = global_pool(&spec).unwrap();
        let mut out = vec![0.0; 2];
        k.run(&[&[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 8.0]], &mut [&mut out[..]])
            .unwrap();
        assert_eq!(out, vec![2.5, 2.0]);
    }
}
