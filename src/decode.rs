//! Conversions between JSON values and SQLite cells

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlcipher_window::{CursorWindow, Value, ValueRef};

use crate::{Error, Result};

/// A decoded result row, keyed by column name in select order.
pub type Row = IndexMap<String, JsonValue>;

/// Convert a cell to JSON. Blobs become base64 strings.
pub fn to_json(value: ValueRef<'_>) -> Result<JsonValue> {
   let json = match value {
      ValueRef::Null => JsonValue::Null,
      ValueRef::Integer(v) => JsonValue::from(v),
      // NaN and infinities have no JSON form
      ValueRef::Float(v) => serde_json::Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number),
      ValueRef::Text(bytes) => {
         let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::UnsupportedDatatype("text that is not valid UTF-8".into()))?;
         JsonValue::String(text.to_owned())
      }
      ValueRef::Blob(bytes) => JsonValue::String(STANDARD.encode(bytes)),
   };
   Ok(json)
}

/// Convert a JSON parameter to a bindable value.
///
/// Integers keep full precision when they fit in an `i64`. Arrays and objects
/// bind as their JSON text.
pub fn bind_value(value: JsonValue) -> Value {
   match value {
      JsonValue::Null => Value::Null,
      JsonValue::String(s) => Value::Text(s),
      JsonValue::Bool(b) => Value::from(b),
      JsonValue::Number(number) => {
         if let Some(int_val) = number.as_i64() {
            Value::Integer(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Above i64::MAX; only a float can hold it
            Value::Float(uint_val as f64)
         } else {
            Value::Float(number.as_f64().unwrap_or_default())
         }
      }
      other => Value::Text(other.to_string()),
   }
}

pub fn bind_values(values: Vec<JsonValue>) -> Vec<Value> {
   values.into_iter().map(bind_value).collect()
}

/// Decode one window row into a JSON object.
pub(crate) fn window_row(window: &CursorWindow, row: usize, columns: &[String]) -> Result<Row> {
   let mut decoded = IndexMap::with_capacity(columns.len());
   for (i, column) in columns.iter().enumerate() {
      let value = to_json(window.get(row, i)?)?;
      decoded.insert(column.clone(), value);
   }
   Ok(decoded)
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_blob_is_base64() {
      assert_eq!(to_json(ValueRef::Blob(b"Hello")).unwrap(), json!("SGVsbG8="));
   }

   #[test]
   fn test_non_finite_float_is_null() {
      assert_eq!(to_json(ValueRef::Float(f64::NAN)).unwrap(), JsonValue::Null);
   }

   #[test]
   fn test_invalid_utf8_text_is_rejected() {
      let err = to_json(ValueRef::Text(&[0xff, 0xfe])).unwrap_err();
      assert_eq!(err.error_code(), "UNSUPPORTED_DATATYPE");
   }

   #[test]
   fn test_bind_numbers() {
      assert_eq!(bind_value(json!(9_007_199_254_740_993_i64)), Value::Integer(9_007_199_254_740_993));
      assert_eq!(bind_value(json!(u64::MAX)), Value::Float(u64::MAX as f64));
      assert_eq!(bind_value(json!(1.5)), Value::Float(1.5));
      assert_eq!(bind_value(json!(true)), Value::Integer(1));
   }

   #[test]
   fn test_bind_structured_values_as_json_text() {
      assert_eq!(bind_value(json!([1, 2])), Value::Text("[1,2]".into()));
      assert_eq!(bind_value(json!({"a": null})), Value::Text(r#"{"a":null}"#.into()));
   }
}
