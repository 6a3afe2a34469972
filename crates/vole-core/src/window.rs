use crate::error::{Error, Result};
use crate::graph::Node;

// Window2d — sliding-window geometry shared by Conv, ConvTranspose and pooling
//
// Both shape inference and kernels need the same view of a node's window
// attributes, so they are resolved here once:
//
//   kernel     — from the weight tensor, or `kernel_shape` / `kernel`
//   strides    — `strides` / `stride`, default 1
//   pads       — `pads` / `pad`: 1 value (all sides), 2 values (symmetric
//                per axis) or 4 values [top, left, bottom, right]
//   dilations  — default 1
//   auto_pad   — NOTSET (default), VALID, SAME_UPPER, SAME_LOWER
//
// Output size along one spatial axis:
//
//   effective_k = dilation * (k - 1) + 1
//   out = (in + pad_begin + pad_end - effective_k) / stride + 1   (floor)
//
// With ceil_mode the division rounds up, but a window may not start inside
// the end padding.

/// Resolved 2-D window attributes. Index 0 is height, 1 is width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window2d {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    /// [top, left, bottom, right]
    pub pads: [usize; 4],
    pub dilations: [usize; 2],
}

fn pair(node: &Node, keys: &[&str], default: usize) -> Result<[usize; 2]> {
    let attr = keys[0];
    match node.attr_ints_any(keys)? {
        None => Ok([default, default]),
        Some(v) => {
            if v.iter().any(|&x| x < 1) {
                return Err(Error::invalid_attribute(
                    &node.op_type,
                    attr,
                    format!("values must be positive, got {v:?}"),
                ));
            }
            match *v {
                [a] => Ok([a as usize, a as usize]),
                [a, b] => Ok([a as usize, b as usize]),
                _ => Err(Error::invalid_attribute(
                    &node.op_type,
                    attr,
                    format!("expected 1 or 2 values, got {}", v.len()),
                )),
            }
        }
    }
}

fn pads(node: &Node) -> Result<[usize; 4]> {
    match node.attr_ints_any(&["pads", "pad"])? {
        None => Ok([0; 4]),
        Some(v) => {
            if v.iter().any(|&x| x < 0) {
                return Err(Error::invalid_attribute(
                    &node.op_type,
                    "pads",
                    format!("values must be non-negative, got {v:?}"),
                ));
            }
            let u: Vec<usize> = v.iter().map(|&x| x as usize).collect();
            match u[..] {
                [a] => Ok([a; 4]),
                [h, w] => Ok([h, w, h, w]),
                [t, l, b, r] => Ok([t, l, b, r]),
                _ => Err(Error::invalid_attribute(
                    &node.op_type,
                    "pads",
                    format!("expected 1, 2 or 4 values, got {}", u.len()),
                )),
            }
        }
    }
}

impl Window2d {
    /// Resolve the window of `node` over an input whose spatial size is
    /// `input_hw`. `kernel` overrides the kernel attributes (it comes from
    /// the weight tensor when there is one).
    pub fn from_node(node: &Node, kernel: Option<[usize; 2]>, input_hw: [usize; 2]) -> Result<Self> {
        let kernel = match kernel {
            Some(k) => k,
            None => {
                if node.attr_ints_any(&["kernel_shape", "kernel"])?.is_none() {
                    return Err(Error::invalid_attribute(
                        &node.op_type,
                        "kernel_shape",
                        "required attribute is missing",
                    ));
                }
                pair(node, &["kernel_shape", "kernel"], 1)?
            }
        };
        if kernel.contains(&0) {
            return Err(Error::dim_mismatch(format!(
                "{} '{}': kernel {kernel:?} has a zero dimension",
                node.op_type,
                node.label()
            )));
        }
        let strides = pair(node, &["strides", "stride"], 1)?;
        let dilations = pair(node, &["dilations"], 1)?;
        let mut window = Window2d {
            kernel,
            strides,
            pads: pads(node)?,
            dilations,
        };

        match node.attr_string("auto_pad")? {
            None | Some("NOTSET") | Some("") => {}
            Some("VALID") => window.pads = [0; 4],
            Some(mode @ ("SAME_UPPER" | "SAME_LOWER")) => {
                for axis in 0..2 {
                    let out = input_hw[axis].div_ceil(window.strides[axis]);
                    let needed = out
                        .saturating_sub(1)
                        .saturating_mul(window.strides[axis])
                        .saturating_add(window.effective_kernel(axis));
                    let total = needed.saturating_sub(input_hw[axis]);
                    let small = total / 2;
                    let (begin, end) = if mode == "SAME_UPPER" {
                        (small, total - small)
                    } else {
                        (total - small, small)
                    };
                    window.pads[axis] = begin;
                    window.pads[axis + 2] = end;
                }
            }
            Some(other) => {
                return Err(Error::invalid_attribute(
                    &node.op_type,
                    "auto_pad",
                    format!("unknown mode '{other}'"),
                ))
            }
        }
        Ok(window)
    }

    /// Kernel extent with dilation applied. Saturates instead of
    /// overflowing; an oversized window then fails the fit checks.
    pub fn effective_kernel(&self, axis: usize) -> usize {
        self.dilations[axis]
            .saturating_mul(self.kernel[axis].saturating_sub(1))
            .saturating_add(1)
    }

    pub fn pad_begin(&self, axis: usize) -> usize {
        self.pads[axis]
    }

    pub fn pad_end(&self, axis: usize) -> usize {
        self.pads[axis + 2]
    }

    /// Output size along `axis` for an input of size `input`.
    pub fn out_dim(&self, axis: usize, input: usize, ceil_mode: bool) -> Result<usize> {
        let padded = input
            .checked_add(self.pad_begin(axis))
            .and_then(|v| v.checked_add(self.pad_end(axis)))
            .ok_or_else(|| Error::dim_mismatch(format!("pads on axis {axis} overflow")))?;
        let k = self.effective_kernel(axis);
        if padded < k {
            return Err(Error::dim_mismatch(format!(
                "window {} does not fit padded input {} on axis {}",
                k, padded, axis
            )));
        }
        let s = self.strides[axis];
        let span = padded - k;
        if !ceil_mode {
            return Ok(span / s + 1);
        }
        let mut out = span.div_ceil(s) + 1;
        if (out - 1).saturating_mul(s) >= input + self.pad_begin(axis) {
            out -= 1;
        }
        Ok(out)
    }

    /// Output size along `axis` of the transposed (fractionally strided)
    /// convolution of an input of size `input`.
    pub fn transposed_out_dim(&self, axis: usize, input: usize, output_padding: usize) -> Result<usize> {
        let full = (input.max(1) - 1)
            .checked_mul(self.strides[axis])
            .and_then(|v| v.checked_add(self.effective_kernel(axis)))
            .and_then(|v| v.checked_add(output_padding))
            .ok_or_else(|| {
                Error::dim_mismatch(format!("transposed window on axis {axis} overflows"))
            })?;
        let trim = self.pad_begin(axis).saturating_add(self.pad_end(axis));
        if full <= trim {
            return Err(Error::dim_mismatch(format!(
                "transposed window on axis {axis} yields no output (size {full}, pads {trim})"
            )));
        }
        Ok(full - trim)
    }
}

/// Output channels and kernel of a Conv: from the weight input when
/// present, else from `out_channels` and the kernel attributes.
pub fn conv_geometry(node: &Node, weight: Option<&[usize]>) -> Result<(usize, Option<[usize; 2]>)> {
    match weight {
        Some(&[m, _, kh, kw]) if m > 0 && kh > 0 && kw > 0 => Ok((m, Some([kh, kw]))),
        Some(dims) => Err(Error::dim_mismatch(format!(
            "Conv '{}' weight must be [M, C/group, kH, kW] with positive M, kH and kW, got {:?}",
            node.label(),
            dims
        ))),
        None => {
            let m = node.attr_int("out_channels")?;
            if m < 1 {
                return Err(Error::invalid_attribute(
                    &node.op_type,
                    "out_channels",
                    "must be positive",
                ));
            }
            Ok((m as usize, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Attribute;

    fn conv(attrs: &[(&str, Attribute)]) -> Node {
        attrs
            .iter()
            .fold(Node::new("Conv"), |n, (k, v)| n.with_attr(*k, v.clone()))
    }

    #[test]
    fn test_same_size_3x3() {
        let n = conv(&[
            ("kernel", Attribute::Ints(vec![3, 3])),
            ("stride", Attribute::Ints(vec![1, 1])),
            ("pad", Attribute::Ints(vec![1, 1])),
        ]);
        let w = Window2d::from_node(&n, None, [224, 224]).unwrap();
        assert_eq!(w.pads, [1, 1, 1, 1]);
        assert_eq!(w.out_dim(0, 224, false).unwrap(), 224);
    }

    #[test]
    fn test_strided_asymmetric() {
        let n = conv(&[
            ("kernel_shape", Attribute::Ints(vec![3, 3])),
            ("strides", Attribute::Ints(vec![2, 2])),
            ("pads", Attribute::Ints(vec![0, 0, 1, 1])),
        ]);
        let w = Window2d::from_node(&n, None, [8, 8]).unwrap();
        assert_eq!(w.out_dim(0, 8, false).unwrap(), 4);
        assert_eq!(w.out_dim(1, 8, false).unwrap(), 4);
    }

    #[test]
    fn test_ceil_mode() {
        let n = conv(&[
            ("kernel_shape", Attribute::Ints(vec![2, 2])),
            ("strides", Attribute::Ints(vec![2, 2])),
        ]);
        let w = Window2d::from_node(&n, None, [5, 5]).unwrap();
        assert_eq!(w.out_dim(0, 5, false).unwrap(), 2);
        assert_eq!(w.out_dim(0, 5, true).unwrap(), 3);
    }

    #[test]
    fn test_dilation() {
        let n = conv(&[("dilations", Attribute::Ints(vec![2, 2]))]);
        let w = Window2d::from_node(&n, Some([3, 3]), [7, 7]).unwrap();
        assert_eq!(w.effective_kernel(0), 5);
        assert_eq!(w.out_dim(0, 7, false).unwrap(), 3);
    }

    #[test]
    fn test_auto_pad_same_upper() {
        let n = conv(&[
            ("strides", Attribute::Ints(vec![2, 2])),
            ("auto_pad", Attribute::String("SAME_UPPER".into())),
        ]);
        let w = Window2d::from_node(&n, Some([3, 3]), [5, 5]).unwrap();
        assert_eq!(w.out_dim(0, 5, false).unwrap(), 3);
        assert_eq!(w.pads, [1, 1, 1, 1]);
    }

    #[test]
    fn test_transposed() {
        let n = conv(&[("strides", Attribute::Ints(vec![2, 2]))]);
        let w = Window2d::from_node(&n, Some([3, 3]), [4, 4]).unwrap();
        assert_eq!(w.transposed_out_dim(0, 4, 0).unwrap(), 9);
        assert_eq!(w.transposed_out_dim(0, 4, 1).unwrap(), 10);
    }

    #[test]
    fn test_missing_kernel_and_bad_pads() {
        let err = Window2d::from_node(&conv(&[]), None, [4, 4]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidAttribute);

        let n = conv(&[("pads", Attribute::Ints(vec![1, 1, 1]))]);
        let err = Window2d::from_node(&n, Some([3, 3]), [4, 4]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_conv_geometry() {
        let n = conv(&[("out_channels", Attribute::Int(16))]);
        assert_eq!(conv_geometry(&n, None).unwrap(), (16, None));
        assert_eq!(
            conv_geometry(&n, Some(&[8, 3, 5, 5])).unwrap(),
            (8, Some([5, 5]))
        );
        assert!(conv_geometry(&conv(&[]), None).is_err());
        assert!(conv_geometry(&n, Some(&[8, 3])).is_err());
    }

    #[test]
    fn test_zero_kernel_rejected() {
        let n = conv(&[("out_channels", Attribute::Int(1))]);
        let err = conv_geometry(&n, Some(&[1, 1, 0, 3])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
        let err = conv_geometry(&n, Some(&[0, 1, 3, 3])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);

        // Kernels handed in directly (ConvTranspose weights) are checked too.
        let err = Window2d::from_node(&conv(&[]), Some([3, 0]), [4, 4]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_huge_geometry_is_an_error() {
        let n = conv(&[
            ("dilations", Attribute::Ints(vec![i64::MAX, 1])),
            ("pads", Attribute::Ints(vec![i64::MAX, 0, i64::MAX, 0])),
        ]);
        let w = Window2d::from_node(&n, Some([3, 3]), [4, 4]).unwrap();
        assert_eq!(w.out_dim(0, 4, false).unwrap_err().kind(), crate::ErrorKind::DimensionMismatch);

        let n = conv(&[("strides", Attribute::Ints(vec![i64::MAX, 1]))]);
        let w = Window2d::from_node(&n, Some([3, 3]), [4, 4]).unwrap();
        let err = w.transposed_out_dim(0, 4, 0).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_window_too_large() {
        let n = conv(&[]);
        let w = Window2d::from_node(&n, Some([5, 5]), [3, 3]).unwrap();
        let err = w.out_dim(0, 3, false).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
    }
}
