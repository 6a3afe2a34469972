use std::fmt;

use crate::error::{Error, Result};

// DType — Element types a variable can carry
//
// Every variable profile records a DType; it fixes the element size used to
// validate buffer capacities. Which dtypes are executable is a backend
// capability: the reference CPU backend runs F32 only.
//
//   F32 — 32-bit float, the default workhorse
//   F64 — 64-bit float
//   I32 — signed 32-bit int
//   I64 — signed 64-bit int (shape tensors, indices)

/// Enum of all element data types a profile may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Parse a dtype from its short name (`"f32"`, `"float"`, ...).
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "f32" | "float" | "float32" => Ok(DType::F32),
            "f64" | "double" | "float64" => Ok(DType::F64),
            "i32" | "int32" => Ok(DType::I32),
            "i64" | "int64" => Ok(DType::I64),
            other => Err(Error::InvalidDtype(format!("unknown dtype name '{other}'"))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(DType::from_name("float").unwrap(), DType::F32);
        assert_eq!(DType::from_name("i64").unwrap(), DType::I64);
        let err = DType::from_name("complex128").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidDtype);
    }

    #[test]
    fn test_display() {
        assert_eq!(DType::F32.to_string(), "f32");
    }
}
