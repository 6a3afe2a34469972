use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional shape of a variable
//
// A Shape describes the size of each dimension of a variable. Profiles carry
// one per variable; it determines:
//   1. How many elements a buffer must hold (product of all dims)
//   2. The contiguous (row-major) strides kernels index with
//   3. Whether operands are compatible (broadcasting rules)

/// N-dimensional shape of a variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Compute the contiguous (row-major / C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::IndexOutOfRange {
            index: d,
            len: self.rank(),
        })
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy-style broadcasting rules:
    ///   1. Align shapes from the right (trailing dimensions).
    ///   2. Dimensions are compatible if they are equal or one of them is 1.
    ///   3. Missing leading dimensions are treated as 1.
    ///
    /// Examples:
    ///   [3, 4] and [4]     → [3, 4]
    ///   [2, 1] and [1, 3]  → [2, 3]
    ///   [3] and [4]        → Error (3 ≠ 4 and neither is 1)
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else if rd == 1 {
                result.push(ld);
            } else {
                return Err(Error::dim_mismatch(format!(
                    "shapes {} and {} are not broadcast-compatible (dim {} from right: {} vs {})",
                    lhs, rhs, i, ld, rd
                )));
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Return the broadcast strides for this shape to match a target broadcast shape.
    ///
    /// Dimensions of size 1 that are expanded, and missing leading
    /// dimensions, get stride 0 (the single element repeats).
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let self_dims = self.dims();
        let target_dims = target.dims();
        let self_strides = self.stride_contiguous();

        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len() - self_dims.len();

        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = self_strides[i];
            }
        }
        result
    }
}

impl Shape {
    /// Output shape of a (batched) matrix product: `[..batch, M, K] x
    /// [..batch, K, N] -> [..batch, M, N]`, batch dims broadcast.
    pub fn matmul_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let (a, b) = (lhs.dims(), rhs.dims());
        if a.len() < 2 || b.len() < 2 {
            return Err(Error::dim_mismatch(format!(
                "matmul operands must have rank >= 2, got {} and {}",
                lhs, rhs
            )));
        }
        let (a_batch, a_mat) = a.split_at(a.len() - 2);
        let (b_batch, b_mat) = b.split_at(b.len() - 2);
        if a_mat[1] != b_mat[0] {
            return Err(Error::dim_mismatch(format!(
                "matmul inner dimensions differ: {} vs {} ({} x {})",
                a_mat[1], b_mat[0], lhs, rhs
            )));
        }
        let batch = Shape::broadcast_shape(&Shape::from(a_batch), &Shape::from(b_batch))?;
        let mut dims = batch.into_dims();
        dims.extend([a_mat[0], b_mat[1]]);
        Ok(Shape::new(dims))
    }
}

/// Product of `dims`, or `None` when it does not fit in a usize.
pub fn checked_elem_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Normalize a possibly negative `axis` of operator `op` against `rank`.
pub fn normalize_axis(op: &str, axis: i64, rank: usize) -> Result<usize> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r.max(1) {
        return Err(Error::invalid_attribute(
            op,
            "axis",
            format!("axis {axis} out of range for rank {rank}"),
        ));
    }
    Ok(a as usize)
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis("Concat", -1, 4).unwrap(), 3);
        assert_eq!(normalize_axis("Concat", 1, 4).unwrap(), 1);
        assert!(normalize_axis("Concat", 4, 4).is_err());
        assert!(normalize_axis("Concat", -5, 4).is_err());
    }

    #[test]
    fn test_matrix_shape() {
        let s = Shape::from((3, 4));
        assert_eq!(s.rank(), 2);
        assert_eq!(s.elem_count(), 12);
        assert_eq!(s.stride_contiguous(), vec![4, 1]);
    }

    #[test]
    fn test_nchw_strides() {
        let s = Shape::from((1, 3, 4, 5));
        assert_eq!(s.stride_contiguous(), vec![60, 20, 5, 1]);
        assert_eq!(s.elem_count(), 60);
    }

    #[test]
    fn test_broadcast() {
        let a = Shape::from((2, 1));
        let b = Shape::new(vec![3]);
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap().dims(), &[2, 3]);
        assert_eq!(b.broadcast_strides(&Shape::from((2, 3))), vec![0, 1]);
    }

    #[test]
    fn test_broadcast_mismatch_kind() {
        let err = Shape::broadcast_shape(&Shape::new(vec![3]), &Shape::new(vec![4])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_matmul_shape() {
        let out = Shape::matmul_shape(&Shape::new(vec![4, 2, 3]), &Shape::from((3, 5))).unwrap();
        assert_eq!(out.dims(), &[4, 2, 5]);
        let err = Shape::matmul_shape(&Shape::from((2, 3)), &Shape::from((2, 3))).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DimensionMismatch);
    }

    #[test]
    fn test_dim_out_of_range() {
        let err = Shape::from((2, 2)).dim(5).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::IndexOutOfRange);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
