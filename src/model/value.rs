// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! [Value] used in points and rows

use horaedbproto::storage::{value, Value as ValuePb};

pub type TimestampMs = i64;

/// The value of a tag, field or queried column.
///
/// Exactly one variant is inhabited. `Null` only occurs in queried rows.
#[derive(Debug, Clone, PartialEq, PartialOrd, Default)]
pub enum Value {
    #[default]
    Null,
    Timestamp(TimestampMs),
    Double(f64),
    Float(f32),
    Varbinary(Vec<u8>),
    String(String),
    UInt64(u64),
    UInt32(u32),
    UInt16(u16),
    UInt8(u8),
    Int64(i64),
    Int32(i32),
    Int16(i16),
    Int8(i8),
    Boolean(bool),
}

impl Value {
    /// The little-endian byte representation, used to key series by tag
    /// values.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Timestamp(v) => v.to_le_bytes().to_vec(),
            Value::Double(v) => v.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::Varbinary(v) => v.clone(),
            Value::String(v) => v.as_bytes().to_vec(),
            Value::UInt64(v) => v.to_le_bytes().to_vec(),
            Value::UInt32(v) => v.to_le_bytes().to_vec(),
            Value::UInt16(v) => v.to_le_bytes().to_vec(),
            Value::UInt8(v) => v.to_le_bytes().to_vec(),
            Value::Int64(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::Int16(v) => v.to_le_bytes().to_vec(),
            Value::Int8(v) => v.to_le_bytes().to_vec(),
            Value::Boolean(v) => (*v as u8).to_le_bytes().to_vec(),
        }
    }
}

impl From<Value> for ValuePb {
    fn from(val: Value) -> Self {
        let value = match val {
            Value::Null => None,
            Value::Timestamp(v) => Some(value::Value::TimestampValue(v)),
            Value::Double(v) => Some(value::Value::Float64Value(v)),
            Value::Float(v) => Some(value::Value::Float32Value(v)),
            Value::Varbinary(v) => Some(value::Value::VarbinaryValue(v)),
            Value::String(v) => Some(value::Value::StringValue(v)),
            Value::UInt64(v) => Some(value::Value::Uint64Value(v)),
            Value::UInt32(v) => Some(value::Value::Uint32Value(v)),
            Value::UInt16(v) => Some(value::Value::Uint16Value(v as u32)),
            Value::UInt8(v) => Some(value::Value::Uint8Value(v as u32)),
            Value::Int64(v) => Some(value::Value::Int64Value(v)),
            Value::Int32(v) => Some(value::Value::Int32Value(v)),
            Value::Int16(v) => Some(value::Value::Int16Value(v as i32)),
            Value::Int8(v) => Some(value::Value::Int8Value(v as i32)),
            Value::Boolean(v) => Some(value::Value::BoolValue(v)),
        };

        ValuePb { value }
    }
}

impl From<ValuePb> for Value {
    fn from(val_pb: ValuePb) -> Self {
        match val_pb.value {
            None => Value::Null,
            Some(value::Value::TimestampValue(v)) => Value::Timestamp(v),
            Some(value::Value::Float64Value(v)) => Value::Double(v),
            Some(value::Value::Float32Value(v)) => Value::Float(v),
            Some(value::Value::VarbinaryValue(v)) => Value::Varbinary(v),
            Some(value::Value::StringValue(v)) => Value::String(v),
            Some(value::Value::Uint64Value(v)) => Value::UInt64(v),
            Some(value::Value::Uint32Value(v)) => Value::UInt32(v),
            Some(value::Value::Uint16Value(v)) => Value::UInt16(v as u16),
            Some(value::Value::Uint8Value(v)) => Value::UInt8(v as u8),
            Some(value::Value::Int64Value(v)) => Value::Int64(v),
            Some(value::Value::Int32Value(v)) => Value::Int32(v),
            Some(value::Value::Int16Value(v)) => Value::Int16(v as i16),
            Some(value::Value::Int8Value(v)) => Value::Int8(v as i8),
            Some(value::Value::BoolValue(v)) => Value::Boolean(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pb_round_trip() {
        let values = vec![
            Value::Null,
            Value::Timestamp(0),
            Value::Timestamp(i64::MIN),
            Value::Timestamp(i64::MAX),
            Value::Double(0.42),
            Value::Float(-0.5),
            Value::Varbinary(b"binarybinary".to_vec()),
            Value::Varbinary(Vec::new()),
            Value::String("hello".to_string()),
            Value::UInt64(u64::MAX),
            Value::UInt32(42),
            Value::UInt16(42),
            Value::UInt8(255),
            Value::Int64(i64::MIN),
            Value::Int32(-42),
            Value::Int16(i16::MIN),
            Value::Int8(-1),
            Value::Boolean(true),
        ];

        for value in values {
            let pb: ValuePb = value.clone().into();
            let back: Value = pb.into();
            assert_eq!(value, back);
        }
    }
}
