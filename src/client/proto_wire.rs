//! Protobuf row encoding for write streams.
//!
//! Each row is one message whose field numbers follow the table's column order,
//! starting at 1. NULLs are omitted, repeated fields are written unpacked and
//! RECORD columns become nested messages.

use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef, StructArray};
use datafusion::arrow::datatypes::{DataType, Fields};
use datafusion::common::ScalarValue;
use prost::bytes::{Buf, BufMut};
use prost::encoding::{
    decode_key, decode_varint, encode_key, encode_varint, skip_field, DecodeContext, WireType,
};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, FieldDescriptorProto};

use super::types::{FieldMode, FieldType, TableFieldSchema};
use crate::error::{BigqueryError, Result};

/// Row descriptor derived from a table schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoSchema {
    fields: Vec<ProtoField>,
}

#[derive(Debug, Clone, PartialEq)]
struct ProtoField {
    number: u32,
    column: TableFieldSchema,
    nested: Option<ProtoSchema>,
}

impl ProtoSchema {
    pub fn from_fields(columns: &[TableFieldSchema]) -> Self {
        let fields = columns
            .iter()
            .enumerate()
            .map(|(i, column)| ProtoField {
                number: i as u32 + 1,
                column: column.clone(),
                nested: (column.field_type == FieldType::Record)
                    .then(|| ProtoSchema::from_fields(&column.fields)),
            })
            .collect();
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &TableFieldSchema> {
        self.fields.iter().map(|f| &f.column)
    }

    /// Self-contained descriptor sent as the writer schema of an append.
    ///
    /// RECORD columns become nested types of the root message, named after
    /// their path of field numbers (`Row_5`, `Row_5_2`, ...).
    pub fn descriptor(&self) -> DescriptorProto {
        let mut nested = Vec::new();
        let field = self.field_descriptors("Row", &mut nested);
        DescriptorProto {
            name: Some("Row".to_string()),
            field,
            nested_type: nested,
            ..Default::default()
        }
    }

    fn field_descriptors(
        &self,
        scope: &str,
        nested: &mut Vec<DescriptorProto>,
    ) -> Vec<FieldDescriptorProto> {
        let mut descriptors = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let label = match field.column.mode {
                FieldMode::Nullable => Label::Optional,
                FieldMode::Required => Label::Required,
                FieldMode::Repeated => Label::Repeated,
            };
            let ty = match field.column.field_type {
                FieldType::Bool => Type::Bool,
                FieldType::Int64 | FieldType::Timestamp => Type::Int64,
                FieldType::Float64 => Type::Double,
                FieldType::Date => Type::Int32,
                FieldType::Bytes => Type::Bytes,
                FieldType::Record => Type::Message,
                _ => Type::String,
            };
            let mut descriptor = FieldDescriptorProto {
                name: Some(field.column.name.clone()),
                number: Some(field.number as i32),
                label: Some(label as i32),
                r#type: Some(ty as i32),
                ..Default::default()
            };
            if let Some(child) = &field.nested {
                let type_name = format!("{scope}_{}", field.number);
                let children = child.field_descriptors(&type_name, nested);
                nested.push(DescriptorProto {
                    name: Some(type_name.clone()),
                    field: children,
                    ..Default::default()
                });
                descriptor.type_name = Some(type_name);
            }
            descriptors.push(descriptor);
        }
        descriptors
    }

    /// Encode one row given in column order.
    pub fn encode_row(&self, row: &[ScalarValue]) -> Result<Vec<u8>> {
        if row.len() != self.fields.len() {
            return Err(BigqueryError::InvalidRequest(format!(
                "row has {} values but the table has {} columns",
                row.len(),
                self.fields.len()
            )));
        }
        let mut buf = Vec::new();
        for (field, value) in self.fields.iter().zip(row) {
            field.encode(value, &mut buf)?;
        }
        Ok(buf)
    }

    /// Decode one row into values of each column's host type.
    pub fn decode_row(&self, mut bytes: &[u8]) -> Result<Vec<ScalarValue>> {
        let mut singles: Vec<Option<ScalarValue>> = vec![None; self.fields.len()];
        let mut repeats: Vec<Vec<ScalarValue>> = vec![Vec::new(); self.fields.len()];

        while bytes.has_remaining() {
            let (tag, wire_type) = decode_key(&mut bytes)?;
            let Some(idx) = self.fields.iter().position(|f| f.number == tag) else {
                skip_field(wire_type, tag, &mut bytes, DecodeContext::default())?;
                continue;
            };
            let field = &self.fields[idx];
            let value = field.decode(wire_type, &mut bytes)?;
            if field.column.is_repeated() {
                repeats[idx].push(value);
            } else {
                singles[idx] = Some(value);
            }
        }

        self.fields
            .iter()
            .zip(singles.into_iter().zip(repeats))
            .map(|(field, (single, repeated))| {
                if field.column.is_repeated() {
                    let list = ScalarValue::new_list_nullable(&repeated, &field.column.value_type());
                    Ok(ScalarValue::List(list))
                } else {
                    match single {
                        Some(v) => Ok(v),
                        None => Ok(ScalarValue::try_from(&field.column.value_type())?),
                    }
                }
            })
            .collect()
    }
}

impl ProtoField {
    fn encode(&self, value: &ScalarValue, buf: &mut Vec<u8>) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        if !self.column.is_repeated() {
            return self.encode_single(value, buf);
        }
        for element in list_elements(value)? {
            if element.is_null() {
                return Err(BigqueryError::InvalidRequest(format!(
                    "column '{}': ARRAY elements cannot be NULL",
                    self.column.name
                )));
            }
            self.encode_single(&element, buf)?;
        }
        Ok(())
    }

    fn encode_single(&self, value: &ScalarValue, buf: &mut Vec<u8>) -> Result<()> {
        let target = self.column.value_type();
        let value = if value.data_type() == target {
            value.clone()
        } else {
            value.cast_to(&target)?
        };

        match (self.column.field_type, &value) {
            (FieldType::Bool, ScalarValue::Boolean(Some(b))) => {
                encode_key(self.number, WireType::Varint, buf);
                encode_varint(*b as u64, buf);
            }
            (FieldType::Int64, ScalarValue::Int64(Some(v))) => {
                encode_key(self.number, WireType::Varint, buf);
                encode_varint(*v as u64, buf);
            }
            (FieldType::Float64, ScalarValue::Float64(Some(v))) => {
                encode_key(self.number, WireType::SixtyFourBit, buf);
                buf.put_f64_le(*v);
            }
            (FieldType::Date, ScalarValue::Date32(Some(days))) => {
                encode_key(self.number, WireType::Varint, buf);
                encode_varint(*days as i64 as u64, buf);
            }
            (FieldType::Timestamp, ScalarValue::TimestampMicrosecond(Some(micros), _)) => {
                encode_key(self.number, WireType::Varint, buf);
                encode_varint(*micros as u64, buf);
            }
            (FieldType::Bytes, ScalarValue::Binary(Some(bytes))) => {
                encode_length_delimited(self.number, bytes, buf);
            }
            (FieldType::Record, ScalarValue::Struct(array)) => {
                let nested = self.nested.as_ref().ok_or_else(|| {
                    BigqueryError::State(format!("no nested schema for '{}'", self.column.name))
                })?;
                let children = (0..array.num_columns())
                    .map(|i| ScalarValue::try_from_array(array.column(i), 0))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let message = nested.encode_row(&children)?;
                encode_length_delimited(self.number, &message, buf);
            }
            (
                FieldType::Numeric
                | FieldType::BigNumeric
                | FieldType::String
                | FieldType::Datetime
                | FieldType::Time
                | FieldType::Geography
                | FieldType::Json
                | FieldType::Interval,
                v,
            ) => match v.cast_to(&DataType::Utf8)? {
                ScalarValue::Utf8(Some(s)) => encode_length_delimited(self.number, s.as_bytes(), buf),
                other => {
                    return Err(BigqueryError::InvalidRequest(format!(
                        "column '{}': cannot render {other:?} as text",
                        self.column.name
                    )))
                }
            },
            (ty, v) => {
                return Err(BigqueryError::InvalidRequest(format!(
                    "column '{}' of type {ty} cannot hold {v:?}",
                    self.column.name
                )))
            }
        }
        Ok(())
    }

    fn decode(&self, wire_type: WireType, buf: &mut &[u8]) -> Result<ScalarValue> {
        let expected = match self.column.field_type {
            FieldType::Bool | FieldType::Int64 | FieldType::Date | FieldType::Timestamp => {
                WireType::Varint
            }
            FieldType::Float64 => WireType::SixtyFourBit,
            _ => WireType::LengthDelimited,
        };
        if wire_type != expected {
            return Err(BigqueryError::Decode(format!(
                "column '{}': expected wire type {expected:?}, got {wire_type:?}",
                self.column.name
            )));
        }

        let value = match self.column.field_type {
            FieldType::Bool => ScalarValue::Boolean(Some(decode_varint(buf)? != 0)),
            FieldType::Int64 => ScalarValue::Int64(Some(decode_varint(buf)? as i64)),
            FieldType::Date => ScalarValue::Date32(Some(decode_varint(buf)? as i64 as i32)),
            FieldType::Timestamp => ScalarValue::TimestampMicrosecond(
                Some(decode_varint(buf)? as i64),
                Some("UTC".into()),
            ),
            FieldType::Float64 => {
                if buf.remaining() < 8 {
                    return Err(BigqueryError::Decode("truncated fixed64".to_string()));
                }
                ScalarValue::Float64(Some(buf.get_f64_le()))
            }
            FieldType::Bytes => ScalarValue::Binary(Some(decode_length_delimited(buf)?.to_vec())),
            FieldType::Record => {
                let nested = self.nested.as_ref().ok_or_else(|| {
                    BigqueryError::State(format!("no nested schema for '{}'", self.column.name))
                })?;
                let message = decode_length_delimited(buf)?;
                let values = nested.decode_row(message)?;
                struct_scalar(&self.column.fields, values)?
            }
            _ => {
                let raw = decode_length_delimited(buf)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|e| BigqueryError::Decode(format!("invalid UTF-8: {e}")))?;
                let value = ScalarValue::Utf8(Some(text.to_string()));
                let target = self.column.value_type();
                if target == DataType::Utf8 {
                    value
                } else {
                    value.cast_to(&target)?
                }
            }
        };
        Ok(value)
    }
}

fn encode_length_delimited(number: u32, bytes: &[u8], buf: &mut Vec<u8>) {
    encode_key(number, WireType::LengthDelimited, buf);
    encode_varint(bytes.len() as u64, buf);
    buf.put_slice(bytes);
}

fn decode_length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = decode_varint(buf)? as usize;
    if buf.len() < len {
        return Err(BigqueryError::Decode(format!(
            "length-delimited field of {len} bytes exceeds remaining {}",
            buf.len()
        )));
    }
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(len);
    *buf = tail;
    Ok(head)
}

fn list_elements(value: &ScalarValue) -> Result<Vec<ScalarValue>> {
    let values: ArrayRef = match value {
        ScalarValue::List(arr) => arr.value(0),
        ScalarValue::LargeList(arr) => arr.value(0),
        ScalarValue::FixedSizeList(arr) => arr.value(0),
        other => {
            return Err(BigqueryError::InvalidRequest(format!(
                "expected a list value, got {other:?}"
            )))
        }
    };
    (0..values.len())
        .map(|i| Ok(ScalarValue::try_from_array(&values, i)?))
        .collect()
}

/// Build a single-row struct value from its member values.
pub(crate) fn struct_scalar(
    columns: &[TableFieldSchema],
    values: Vec<ScalarValue>,
) -> Result<ScalarValue> {
    let fields = Fields::from(
        columns
            .iter()
            .map(TableFieldSchema::to_arrow_field)
            .collect::<Vec<_>>(),
    );
    let arrays = values
        .iter()
        .map(|v| v.to_array())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let array = StructArray::try_new(fields, arrays, None)?;
    Ok(ScalarValue::Struct(Arc::new(array)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ProtoSchema {
        ProtoSchema::from_fields(&[
            TableFieldSchema::new("id", FieldType::Int64).with_mode(FieldMode::Required),
            TableFieldSchema::new("name", FieldType::String),
            TableFieldSchema::new("score", FieldType::Float64),
            TableFieldSchema::new("tags", FieldType::String).with_mode(FieldMode::Repeated),
            TableFieldSchema::record(
                "geo",
                vec![
                    TableFieldSchema::new("lat", FieldType::Float64),
                    TableFieldSchema::new("label", FieldType::String),
                ],
            ),
        ])
    }

    fn tags(values: &[&str]) -> ScalarValue {
        let elements: Vec<ScalarValue> = values
            .iter()
            .map(|s| ScalarValue::Utf8(Some(s.to_string())))
            .collect();
        ScalarValue::List(ScalarValue::new_list_nullable(&elements, &DataType::Utf8))
    }

    #[test]
    fn test_int64_wire_bytes() {
        let schema = ProtoSchema::from_fields(&[TableFieldSchema::new("id", FieldType::Int64)]);
        let bytes = schema.encode_row(&[ScalarValue::Int64(Some(150))]).unwrap();
        // field 1, varint; 150 = 0x96 0x01
        assert_eq!(bytes, vec![0x08, 0x96, 0x01]);
    }

    #[test]
    fn test_nulls_are_omitted() {
        let schema = ProtoSchema::from_fields(&[
            TableFieldSchema::new("a", FieldType::Int64),
            TableFieldSchema::new("b", FieldType::String),
        ]);
        let bytes = schema
            .encode_row(&[ScalarValue::Int64(None), ScalarValue::Utf8(None)])
            .unwrap();
        assert!(bytes.is_empty());
        let decoded = schema.decode_row(&bytes).unwrap();
        assert!(decoded.iter().all(|v| v.is_null()));
    }

    #[test]
    fn test_nested_and_repeated_row() {
        let schema = schema();
        let geo = ScalarValue::Struct(Arc::new(
            StructArray::try_new(
                Fields::from(vec![
                    datafusion::arrow::datatypes::Field::new("lat", DataType::Float64, true),
                    datafusion::arrow::datatypes::Field::new("label", DataType::Utf8, true),
                ]),
                vec![
                    ScalarValue::Float64(Some(52.5)).to_array().unwrap(),
                    ScalarValue::Utf8(Some("berlin".into())).to_array().unwrap(),
                ],
                None,
            )
            .unwrap(),
        ));
        let row = vec![
            ScalarValue::Int32(Some(7)),
            ScalarValue::Utf8(Some("x".into())),
            ScalarValue::Float64(Some(1.25)),
            tags(&["a", "b"]),
            geo.clone(),
        ];
        let bytes = schema.encode_row(&row).unwrap();
        let decoded = schema.decode_row(&bytes).unwrap();

        assert_eq!(decoded[0], ScalarValue::Int64(Some(7)));
        assert_eq!(decoded[1], ScalarValue::Utf8(Some("x".into())));
        assert_eq!(decoded[2], ScalarValue::Float64(Some(1.25)));
        assert_eq!(decoded[3], tags(&["a", "b"]));
        assert_eq!(decoded[4], geo);
    }

    #[test]
    fn test_missing_repeated_field_is_empty_list() {
        let schema = schema();
        let decoded = schema.decode_row(&[0x08, 0x01]).unwrap();
        assert_eq!(decoded[3], tags(&[]));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let schema = ProtoSchema::from_fields(&[TableFieldSchema::new("id", FieldType::Int64)]);
        // field 9 varint 5, then field 1 varint 3
        let decoded = schema.decode_row(&[0x48, 0x05, 0x08, 0x03]).unwrap();
        assert_eq!(decoded, vec![ScalarValue::Int64(Some(3))]);
    }

    #[test]
    fn test_numeric_as_text() {
        let schema = ProtoSchema::from_fields(&[TableFieldSchema::new("n", FieldType::Numeric)]);
        let bytes = schema
            .encode_row(&[ScalarValue::Decimal128(Some(150), 10, 2)])
            .unwrap();
        let decoded = schema.decode_row(&bytes).unwrap();
        assert_eq!(decoded[0], ScalarValue::Decimal128(Some(1_500_000_000), 38, 9));
    }

    #[test]
    fn test_descriptor_matches_wire_layout() {
        let descriptor = schema().descriptor();
        assert_eq!(descriptor.name.as_deref(), Some("Row"));
        let names: Vec<_> = descriptor.field.iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, vec!["id", "name", "score", "tags", "geo"]);

        let id = &descriptor.field[0];
        assert_eq!(id.number, Some(1));
        assert_eq!(id.label(), Label::Required);
        assert_eq!(id.r#type(), Type::Int64);
        assert_eq!(descriptor.field[2].r#type(), Type::Double);
        assert_eq!(descriptor.field[3].label(), Label::Repeated);

        let geo = &descriptor.field[4];
        assert_eq!(geo.r#type(), Type::Message);
        assert_eq!(geo.type_name.as_deref(), Some("Row_5"));
        assert_eq!(descriptor.nested_type.len(), 1);
        assert_eq!(descriptor.nested_type[0].name.as_deref(), Some("Row_5"));
        assert_eq!(descriptor.nested_type[0].field.len(), 2);
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let schema = schema();
        assert!(matches!(
            schema.encode_row(&[ScalarValue::Int64(Some(1))]),
            Err(BigqueryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_truncated_message_is_decode_error() {
        let schema = ProtoSchema::from_fields(&[TableFieldSchema::new("s", FieldType::String)]);
        assert!(schema.decode_row(&[0x0a, 0x05, b'a']).is_err());
    }
}
