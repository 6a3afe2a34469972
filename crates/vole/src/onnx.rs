// ONNX — Graph import (and a small writer for building test graphs)
//
// ONNX (Open Neural Network Exchange) is the interchange format Vole loads
// models from. Import turns a ModelProto into a ModelData:
//
//   NodeProto        → Node (op_type, name, inputs, outputs, attributes)
//   TensorProto      → Parameter (graph initializers and Constant nodes)
//   ValueInfoProto   → declared external input / output names
//
// Graph inputs that are also initializers are parameters, not external
// inputs. Only the tensor shapes of the input profiles matter downstream,
// so the shapes recorded in ValueInfoProto are not imported.
//
// ONNX files use Protocol Buffers encoding. We implement a minimal
// protobuf encoder/decoder (no external crate needed) that handles the
// subset of the ONNX schema we need.
//
// SUPPORTED INITIALIZER TYPES:
//   FLOAT, DOUBLE, FLOAT16, BFLOAT16 (all stored as f32)
//   INT32, INT64 (stored as f32 values; used for shape constants)
//
// REFERENCE:
//   https://onnx.ai/onnx/repo-docs/IR.html
//   https://protobuf.dev/programming-guides/encoding/

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use vole_core::{Attribute, Buffer, DType, Error, ModelData, Node, Parameter, Result};

// ONNX constants

/// ONNX IR version written by `OnnxModel`.
const ONNX_IR_VERSION: i64 = 8;
/// Opset version written by `OnnxModel`.
const ONNX_OPSET_VERSION: i64 = 13;
const ONNX_DOMAIN: &str = "";

// ONNX TensorProto data types
/// See https://onnx.ai/onnx/repo-docs/IR.html#tensor-data-types
pub const ONNX_FLOAT: i32 = 1;
pub const ONNX_INT32: i32 = 6;
pub const ONNX_INT64: i32 = 7;
pub const ONNX_FLOAT16: i32 = 10;
pub const ONNX_DOUBLE: i32 = 11;
pub const ONNX_BFLOAT16: i32 = 16;

// AttributeProto.AttributeType
const ATTR_FLOAT: u64 = 1;
const ATTR_INT: u64 = 2;
const ATTR_STRING: u64 = 3;
const ATTR_TENSOR: u64 = 4;
const ATTR_FLOATS: u64 = 6;
const ATTR_INTS: u64 = 7;

fn parse_err(msg: impl Into<String>) -> Error {
    Error::Parse(msg.into())
}

// Minimal protobuf encoder

/// A minimal protobuf wire-format encoder. Supports:
/// - Varint (field type 0)
/// - Length-delimited (field type 2: bytes, strings, nested messages)
/// - Fixed32 (field type 5)
struct PbEncoder {
    buf: Vec<u8>,
}

impl PbEncoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_varint(&mut self, mut val: u64) {
        loop {
            let byte = (val & 0x7F) as u8;
            val >>= 7;
            if val == 0 {
                self.buf.push(byte);
                break;
            } else {
                self.buf.push(byte | 0x80);
            }
        }
    }

    /// Write a field tag (field_number << 3 | wire_type).
    fn write_tag(&mut self, field: u32, wire_type: u32) {
        self.write_varint(((field as u64) << 3) | wire_type as u64);
    }

    fn write_varint_field(&mut self, field: u32, val: u64) {
        self.write_tag(field, 0);
        self.write_varint(val);
    }

    /// int64 fields are plain two's-complement varints (not zigzag).
    fn write_int64_field(&mut self, field: u32, val: i64) {
        self.write_varint_field(field, val as u64);
    }

    fn write_fixed32_field(&mut self, field: u32, val: f32) {
        self.write_tag(field, 5);
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    fn write_bytes_field(&mut self, field: u32, data: &[u8]) {
        self.write_tag(field, 2);
        self.write_varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    fn write_string_field(&mut self, field: u32, val: &str) {
        self.write_bytes_field(field, val.as_bytes());
    }

    fn write_message_field(&mut self, field: u32, encoder: &PbEncoder) {
        self.write_bytes_field(field, &encoder.buf);
    }
}

// Minimal protobuf decoder

/// A minimal protobuf wire-format decoder. Every read is bounds-checked and
/// reports truncation as a Parse error.
struct PbDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PbDecoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            if self.pos >= self.data.len() {
                return Err(parse_err("protobuf: unexpected end of data"));
            }
            let byte = self.data[self.pos];
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(parse_err("protobuf: varint too long"));
            }
        }
        Ok(result)
    }

    fn read_tag(&mut self) -> Result<(u32, u32)> {
        let val = self.read_varint()?;
        let field = (val >> 3) as u32;
        let wire_type = (val & 0x7) as u32;
        if field == 0 {
            return Err(parse_err("protobuf: field number 0"));
        }
        Ok((field, wire_type))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(parse_err("protobuf: field exceeds data"));
        }
        let result = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(result)
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| parse_err("protobuf: invalid UTF-8 string"))
    }

    fn read_fixed32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_fixed64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a repeated varint field, packed or not.
    fn read_varints(&mut self, wire_type: u32, out: &mut Vec<i64>) -> Result<()> {
        if wire_type == 2 {
            let mut sub = PbDecoder::new(self.read_bytes()?);
            while sub.remaining() > 0 {
                out.push(sub.read_varint()? as i64);
            }
        } else {
            out.push(self.read_varint()? as i64);
        }
        Ok(())
    }

    /// Read a repeated float field, packed or not.
    fn read_floats(&mut self, wire_type: u32, out: &mut Vec<f32>) -> Result<()> {
        if wire_type == 2 {
            let bytes = self.read_bytes()?;
            if bytes.len() % 4 != 0 {
                return Err(parse_err("protobuf: packed float field is not a multiple of 4 bytes"));
            }
            out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        } else {
            out.push(self.read_fixed32()?);
        }
        Ok(())
    }

    fn skip_field(&mut self, wire_type: u32) -> Result<()> {
        match wire_type {
            0 => {
                self.read_varint()?;
            }
            1 => {
                self.take(8)?;
            }
            2 => {
                self.read_bytes()?;
            }
            5 => {
                self.take(4)?;
            }
            _ => return Err(parse_err(format!("protobuf: unsupported wire type {wire_type}"))),
        }
        Ok(())
    }
}

// ONNX TensorProto

/// An ONNX TensorProto: a named tensor with shape and data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnnxTensor {
    pub name: String,
    /// ONNX data type (ONNX_FLOAT, ONNX_INT64, ...).
    pub data_type: i32,
    pub dims: Vec<i64>,
    pub float_data: Vec<f32>,
    pub double_data: Vec<f64>,
    pub int32_data: Vec<i64>,
    pub int64_data: Vec<i64>,
    /// Little-endian packed values, any data type.
    pub raw_data: Vec<u8>,
}

impl OnnxTensor {
    /// An f32 tensor (written as raw_data).
    pub fn from_f32(name: &str, dims: &[i64], data: &[f32]) -> Self {
        Self {
            name: name.to_string(),
            data_type: ONNX_FLOAT,
            dims: dims.to_vec(),
            raw_data: data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ..Default::default()
        }
    }

    /// An int64 tensor (written as int64_data).
    pub fn from_i64(name: &str, dims: &[i64], data: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            data_type: ONNX_INT64,
            dims: dims.to_vec(),
            int64_data: data.to_vec(),
            ..Default::default()
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut enc = PbEncoder::new();
        // field 1: dims
        for &d in &self.dims {
            enc.write_int64_field(1, d);
        }
        // field 2: data_type
        enc.write_varint_field(2, self.data_type as u64);
        // field 4: float_data (packed)
        if !self.float_data.is_empty() {
            let bytes: Vec<u8> = self.float_data.iter().flat_map(|v| v.to_le_bytes()).collect();
            enc.write_bytes_field(4, &bytes);
        }
        // field 5: int32_data, field 7: int64_data (packed varints)
        for (field, values) in [(5, &self.int32_data), (7, &self.int64_data)] {
            if !values.is_empty() {
                let mut packed = PbEncoder::new();
                for &v in values {
                    packed.write_varint(v as u64);
                }
                enc.write_message_field(field, &packed);
            }
        }
        // field 8: name
        if !self.name.is_empty() {
            enc.write_string_field(8, &self.name);
        }
        // field 9: raw_data
        if !self.raw_data.is_empty() {
            enc.write_bytes_field(9, &self.raw_data);
        }
        // field 10: double_data (packed)
        if !self.double_data.is_empty() {
            let bytes: Vec<u8> = self.double_data.iter().flat_map(|v| v.to_le_bytes()).collect();
            enc.write_bytes_field(10, &bytes);
        }
        enc.into_bytes()
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = PbDecoder::new(data);
        let mut tensor = OnnxTensor::default();
        while dec.remaining() > 0 {
            let (field, wire_type) = dec.read_tag()?;
            match (field, wire_type) {
                (1, 0 | 2) => dec.read_varints(wire_type, &mut tensor.dims)?,
                (2, 0) => tensor.data_type = dec.read_varint()? as i32,
                (4, 2 | 5) => dec.read_floats(wire_type, &mut tensor.float_data)?,
                (5, 0 | 2) => dec.read_varints(wire_type, &mut tensor.int32_data)?,
                (7, 0 | 2) => dec.read_varints(wire_type, &mut tensor.int64_data)?,
                (8, 2) => tensor.name = dec.read_string()?,
                (9, 2) => tensor.raw_data = dec.read_bytes()?.to_vec(),
                (10, 1) => tensor.double_data.push(dec.read_fixed64()?),
                (10, 2) => {
                    let bytes = dec.read_bytes()?;
                    let mut sub = PbDecoder::new(bytes);
                    while sub.remaining() > 0 {
                        tensor.double_data.push(sub.read_fixed64()?);
                    }
                }
                (14, 0) => {
                    if dec.read_varint()? == 1 {
                        return Err(parse_err(format!(
                            "tensor '{}' uses external data, which is not supported",
                            tensor.name
                        )));
                    }
                }
                _ => dec.skip_field(wire_type)?,
            }
        }
        Ok(tensor)
    }

    /// Element count implied by `dims`.
    fn elem_count(&self) -> Result<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| {
            if d < 0 {
                Err(parse_err(format!("tensor '{}' has negative dim {d}", self.name)))
            } else {
                acc.checked_mul(d as usize).ok_or_else(|| {
                    parse_err(format!("tensor '{}' dims {:?} overflow", self.name, self.dims))
                })
            }
        })
    }

    /// The dtype the tensor is imported as.
    pub fn dtype(&self) -> Result<DType> {
        match self.data_type {
            ONNX_FLOAT | ONNX_DOUBLE | ONNX_FLOAT16 | ONNX_BFLOAT16 => Ok(DType::F32),
            ONNX_INT32 => Ok(DType::I32),
            ONNX_INT64 => Ok(DType::I64),
            other => Err(Error::InvalidDtype(format!(
                "tensor '{}' has unsupported ONNX data type {other}",
                self.name
            ))),
        }
    }

    /// Values as f32, widening or narrowing from the stored type.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.dtype()?;
        let values: Vec<f32> = if !self.raw_data.is_empty() {
            let raw = &self.raw_data;
            match self.data_type {
                ONNX_FLOAT => raw
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
                ONNX_DOUBLE => raw
                    .chunks_exact(8)
                    .map(|c| {
                        f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                    })
                    .collect(),
                ONNX_FLOAT16 => raw
                    .chunks_exact(2)
                    .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                    .collect(),
                ONNX_BFLOAT16 => raw
                    .chunks_exact(2)
                    .map(|c| half::bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                    .collect(),
                ONNX_INT32 => raw
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                    .collect(),
                _ => raw
                    .chunks_exact(8)
                    .map(|c| {
                        i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                    })
                    .collect(),
            }
        } else {
            match self.data_type {
                ONNX_FLOAT => self.float_data.clone(),
                ONNX_DOUBLE => self.double_data.iter().map(|&v| v as f32).collect(),
                // FLOAT16 / BFLOAT16 / INT32 all live in int32_data
                ONNX_FLOAT16 => self
                    .int32_data
                    .iter()
                    .map(|&v| half::f16::from_bits(v as u16).to_f32())
                    .collect(),
                ONNX_BFLOAT16 => self
                    .int32_data
                    .iter()
                    .map(|&v| half::bf16::from_bits(v as u16).to_f32())
                    .collect(),
                ONNX_INT32 => self.int32_data.iter().map(|&v| v as f32).collect(),
                _ => self.int64_data.iter().map(|&v| v as f32).collect(),
            }
        };
        let expected = self.elem_count()?;
        if values.len() != expected {
            return Err(parse_err(format!(
                "tensor '{}' has {} values, dims {:?} require {}",
                self.name,
                values.len(),
                self.dims,
                expected
            )));
        }
        Ok(values)
    }

    /// Convert into a Parameter.
    fn into_parameter(self) -> Result<Parameter> {
        let dtype = self.dtype()?;
        let data = self.to_f32_vec()?;
        let dims: Vec<usize> = self.dims.iter().map(|&d| d as usize).collect();
        Ok(Parameter {
            dtype,
            buffer: Buffer::from_vec_with_dims(data, &dims)?,
            dims,
        })
    }
}

// NodeProto / AttributeProto

fn encode_node(node: &Node) -> Vec<u8> {
    let mut enc = PbEncoder::new();
    for input in &node.inputs {
        enc.write_string_field(1, input);
    }
    for output in &node.outputs {
        enc.write_string_field(2, output);
    }
    if !node.name.is_empty() {
        enc.write_string_field(3, &node.name);
    }
    enc.write_string_field(4, &node.op_type);
    // Sorted so the same node always encodes to the same bytes.
    let mut keys: Vec<&String> = node.attributes.keys().collect();
    keys.sort();
    for key in keys {
        let attr = encode_attribute(key, &node.attributes[key]);
        enc.write_message_field(5, &attr);
    }
    enc.into_bytes()
}

fn encode_attribute(name: &str, val: &Attribute) -> PbEncoder {
    let mut enc = PbEncoder::new();
    enc.write_string_field(1, name);
    match val {
        Attribute::Float(f) => {
            enc.write_fixed32_field(2, *f);
            enc.write_varint_field(20, ATTR_FLOAT);
        }
        Attribute::Int(i) => {
            enc.write_int64_field(3, *i);
            enc.write_varint_field(20, ATTR_INT);
        }
        Attribute::String(s) => {
            enc.write_bytes_field(4, s.as_bytes());
            enc.write_varint_field(20, ATTR_STRING);
        }
        Attribute::Floats(floats) => {
            for &f in floats {
                enc.write_fixed32_field(7, f);
            }
            enc.write_varint_field(20, ATTR_FLOATS);
        }
        Attribute::Ints(ints) => {
            for &i in ints {
                enc.write_int64_field(8, i);
            }
            enc.write_varint_field(20, ATTR_INTS);
        }
    }
    enc
}

/// A decoded attribute value; tensor attributes only appear on Constant.
enum DecodedAttribute {
    Value(Attribute),
    Tensor(OnnxTensor),
    Unsupported(u64),
}

fn decode_attribute(data: &[u8]) -> Result<(String, DecodedAttribute)> {
    let mut dec = PbDecoder::new(data);
    let mut name = String::new();
    let mut attr_type: Option<u64> = None;
    let mut float_val: Option<f32> = None;
    let mut int_val: Option<i64> = None;
    let mut string_val: Option<Vec<u8>> = None;
    let mut tensor_val: Option<OnnxTensor> = None;
    let mut floats_val: Vec<f32> = Vec::new();
    let mut ints_val: Vec<i64> = Vec::new();
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (1, 2) => name = dec.read_string()?,
            (2, 5) => float_val = Some(dec.read_fixed32()?),
            (3, 0) => int_val = Some(dec.read_varint()? as i64),
            (4, 2) => string_val = Some(dec.read_bytes()?.to_vec()),
            (5, 2) => tensor_val = Some(OnnxTensor::decode(dec.read_bytes()?)?),
            (7, 2 | 5) => dec.read_floats(wire_type, &mut floats_val)?,
            (8, 0 | 2) => dec.read_varints(wire_type, &mut ints_val)?,
            (20, 0) => attr_type = Some(dec.read_varint()?),
            _ => dec.skip_field(wire_type)?,
        }
    }

    // Writers that omit `type` are resolved by which field was set.
    let attr_type = attr_type.unwrap_or(if float_val.is_some() {
        ATTR_FLOAT
    } else if int_val.is_some() {
        ATTR_INT
    } else if string_val.is_some() {
        ATTR_STRING
    } else if tensor_val.is_some() {
        ATTR_TENSOR
    } else if !floats_val.is_empty() {
        ATTR_FLOATS
    } else {
        ATTR_INTS
    });

    let val = match attr_type {
        ATTR_FLOAT => DecodedAttribute::Value(Attribute::Float(float_val.unwrap_or(0.0))),
        ATTR_INT => DecodedAttribute::Value(Attribute::Int(int_val.unwrap_or(0))),
        ATTR_STRING => {
            let s = String::from_utf8(string_val.unwrap_or_default()).map_err(|_| {
                parse_err(format!("attribute '{name}' is not valid UTF-8"))
            })?;
            DecodedAttribute::Value(Attribute::String(s))
        }
        ATTR_TENSOR => match tensor_val {
            Some(t) => DecodedAttribute::Tensor(t),
            None => return Err(parse_err(format!("tensor attribute '{name}' has no tensor"))),
        },
        ATTR_FLOATS => DecodedAttribute::Value(Attribute::Floats(floats_val)),
        ATTR_INTS => DecodedAttribute::Value(Attribute::Ints(ints_val)),
        other => DecodedAttribute::Unsupported(other),
    };
    Ok((name, val))
}

/// A decoded node: the graph node plus any tensor attribute it carried.
fn decode_node(data: &[u8]) -> Result<(Node, Option<OnnxTensor>)> {
    let mut dec = PbDecoder::new(data);
    let mut node = Node::new("");
    let mut tensor = None;
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (1, 2) => node.inputs.push(dec.read_string()?),
            (2, 2) => node.outputs.push(dec.read_string()?),
            (3, 2) => node.name = dec.read_string()?,
            (4, 2) => node.op_type = dec.read_string()?,
            (5, 2) => match decode_attribute(dec.read_bytes()?)? {
                (key, DecodedAttribute::Value(val)) => {
                    node.attributes.insert(key, val);
                }
                (_, DecodedAttribute::Tensor(t)) => tensor = Some(t),
                (key, DecodedAttribute::Unsupported(ty)) => {
                    tracing::warn!(attribute = %key, attr_type = ty, "skipping unsupported ONNX attribute type");
                }
            },
            _ => dec.skip_field(wire_type)?,
        }
    }
    if node.op_type.is_empty() {
        return Err(parse_err(format!("node '{}' has no op_type", node.label())));
    }
    // Trailing optional outputs left unnamed are simply not produced.
    while node.outputs.last().is_some_and(|o| o.is_empty()) {
        node.outputs.pop();
    }
    Ok((node, tensor))
}

/// Extract just the name from a ValueInfoProto.
fn extract_value_info_name(data: &[u8]) -> Result<String> {
    let mut dec = PbDecoder::new(data);
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        if field == 1 && wire_type == 2 {
            return dec.read_string();
        }
        dec.skip_field(wire_type)?;
    }
    Err(parse_err("value info has no name"))
}

/// Parse a GraphProto into ModelData.
fn parse_graph_proto(data: &[u8]) -> Result<ModelData> {
    let mut dec = PbDecoder::new(data);
    let mut model = ModelData::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut initializers = Vec::new();

    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        match (field, wire_type) {
            (1, 2) => {
                let (node, tensor) = decode_node(dec.read_bytes()?)?;
                // Constant nodes become parameters named after their output.
                if node.op_type == "Constant" {
                    match (tensor, node.outputs.first()) {
                        (Some(mut t), Some(out)) => {
                            t.name = out.clone();
                            initializers.push(t);
                        }
                        _ => {
                            return Err(Error::unsupported_op(
                                "Constant",
                                format!("node '{}' has no tensor value", node.label()),
                            ))
                        }
                    }
                } else {
                    if tensor.is_some() {
                        tracing::warn!(node = %node.label(), op = %node.op_type, "ignoring tensor attribute");
                    }
                    model.add_node(node);
                }
            }
            (5, 2) => initializers.push(OnnxTensor::decode(dec.read_bytes()?)?),
            (11, 2) => inputs.push(extract_value_info_name(dec.read_bytes()?)?),
            (12, 2) => outputs.push(extract_value_info_name(dec.read_bytes()?)?),
            _ => dec.skip_field(wire_type)?,
        }
    }

    let mut constant_names = HashSet::new();
    for tensor in initializers {
        if tensor.name.is_empty() {
            tracing::warn!("skipping unnamed initializer");
            continue;
        }
        let name = tensor.name.clone();
        if model.is_parameter(&name) {
            return Err(Error::DuplicateVariable(name));
        }
        model.set_parameter(name.clone(), tensor.into_parameter()?);
        constant_names.insert(name);
    }
    for name in inputs {
        if !constant_names.contains(&name) {
            model.add_input_name(name);
        }
    }
    for name in outputs {
        model.add_output_name(name);
    }
    Ok(model)
}

// Import API

/// Load an ONNX model file into a ModelData.
///
/// A missing or unreadable file is a `FileNotFound` error; malformed
/// content is a `Parse` error.
pub fn load_onnx(path: impl AsRef<Path>) -> Result<ModelData> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
        _ => Error::FileNotFound(format!("{}: {e}", path.display())),
    })?;
    let model = load_onnx_from_bytes(&bytes)?;
    tracing::info!(
        path = %path.display(),
        nodes = model.nodes().len(),
        parameters = model.parameters().count(),
        "loaded ONNX model"
    );
    Ok(model)
}

/// Load an ONNX model from in-memory bytes.
pub fn load_onnx_from_bytes(data: &[u8]) -> Result<ModelData> {
    let mut dec = PbDecoder::new(data);
    let mut graph = None;
    while dec.remaining() > 0 {
        let (field, wire_type) = dec.read_tag()?;
        if field == 7 && wire_type == 2 {
            graph = Some(parse_graph_proto(dec.read_bytes()?)?);
        } else {
            dec.skip_field(wire_type)?;
        }
    }
    graph.ok_or_else(|| parse_err("ONNX model contains no graph"))
}

// Writer

/// Graph input/output description: name, dims (negative = dynamic), type.
pub type ValueInfo = (String, Vec<i64>, i32);

/// An ONNX model under construction; `to_bytes` yields a ModelProto.
#[derive(Debug, Clone)]
pub struct OnnxModel {
    pub producer_name: String,
    pub graph_name: String,
    pub nodes: Vec<Node>,
    pub initializers: Vec<OnnxTensor>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
}

impl OnnxModel {
    pub fn new(graph_name: &str) -> Self {
        Self {
            producer_name: "vole".to_string(),
            graph_name: graph_name.to_string(),
            nodes: Vec::new(),
            initializers: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_initializer(mut self, tensor: OnnxTensor) -> Self {
        self.initializers.push(tensor);
        self
    }

    /// Declare an f32 graph input.
    pub fn with_input(mut self, name: &str, dims: &[i64]) -> Self {
        self.inputs.push((name.to_string(), dims.to_vec(), ONNX_FLOAT));
        self
    }

    /// Declare an f32 graph output.
    pub fn with_output(mut self, name: &str, dims: &[i64]) -> Self {
        self.outputs.push((name.to_string(), dims.to_vec(), ONNX_FLOAT));
        self
    }

    /// Encode to ONNX protobuf binary format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut graph = PbEncoder::new();
        for node in &self.nodes {
            graph.write_bytes_field(1, &encode_node(node));
        }
        graph.write_string_field(2, &self.graph_name);
        for init in &self.initializers {
            graph.write_bytes_field(5, &init.encode());
        }
        for (name, dims, dtype) in &self.inputs {
            graph.write_message_field(11, &encode_value_info(name, dims, *dtype));
        }
        for (name, dims, dtype) in &self.outputs {
            graph.write_message_field(12, &encode_value_info(name, dims, *dtype));
        }

        let mut model = PbEncoder::new();
        model.write_int64_field(1, ONNX_IR_VERSION);
        model.write_string_field(2, &self.producer_name);
        model.write_message_field(7, &graph);
        let mut opset = PbEncoder::new();
        opset.write_string_field(1, ONNX_DOMAIN);
        opset.write_int64_field(2, ONNX_OPSET_VERSION);
        model.write_message_field(8, &opset);
        model.into_bytes()
    }

    /// Write the model to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path.as_ref(), self.to_bytes())
            .map_err(|e| Error::msg(format!("failed to write ONNX file: {e}")))
    }
}

/// Encode a ValueInfoProto (name + tensor type + shape).
fn encode_value_info(name: &str, dims: &[i64], data_type: i32) -> PbEncoder {
    let mut shape = PbEncoder::new();
    for &d in dims {
        let mut dim = PbEncoder::new();
        if d >= 0 {
            dim.write_int64_field(1, d);
        } else {
            dim.write_string_field(2, "dynamic");
        }
        shape.write_message_field(1, &dim);
    }
    let mut tensor_type = PbEncoder::new();
    tensor_type.write_varint_field(1, data_type as u64);
    tensor_type.write_message_field(2, &shape);
    let mut type_proto = PbEncoder::new();
    type_proto.write_message_field(1, &tensor_type);

    let mut vi = PbEncoder::new();
    vi.write_string_field(1, name);
    vi.write_message_field(2, &type_proto);
    vi
}
