//! Cell values stored in and read from a cursor window

use std::fmt;

/// Storage class of a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
   Null,
   Integer,
   Float,
   Text,
   Blob,
}

impl fmt::Display for CellType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         CellType::Null => "null",
         CellType::Integer => "integer",
         CellType::Float => "float",
         CellType::Text => "text",
         CellType::Blob => "blob",
      };
      f.write_str(name)
   }
}

/// An owned SQLite value, used for bound parameters and for rows that have
/// to outlive the statement step that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
   Null,
   Integer(i64),
   Float(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl Value {
   pub fn cell_type(&self) -> CellType {
      self.as_ref().cell_type()
   }

   /// Borrow this value as a [`ValueRef`].
   pub fn as_ref(&self) -> ValueRef<'_> {
      match self {
         Value::Null => ValueRef::Null,
         Value::Integer(v) => ValueRef::Integer(*v),
         Value::Float(v) => ValueRef::Float(*v),
         Value::Text(s) => ValueRef::Text(s.as_bytes()),
         Value::Blob(b) => ValueRef::Blob(b),
      }
   }
}

impl From<i64> for Value {
   fn from(v: i64) -> Self {
      Value::Integer(v)
   }
}

impl From<i32> for Value {
   fn from(v: i32) -> Self {
      Value::Integer(i64::from(v))
   }
}

impl From<bool> for Value {
   fn from(v: bool) -> Self {
      Value::Integer(i64::from(v))
   }
}

impl From<f64> for Value {
   fn from(v: f64) -> Self {
      Value::Float(v)
   }
}

impl From<&str> for Value {
   fn from(v: &str) -> Self {
      Value::Text(v.to_owned())
   }
}

impl From<String> for Value {
   fn from(v: String) -> Self {
      Value::Text(v)
   }
}

impl From<Vec<u8>> for Value {
   fn from(v: Vec<u8>) -> Self {
      Value::Blob(v)
   }
}

impl From<&[u8]> for Value {
   fn from(v: &[u8]) -> Self {
      Value::Blob(v.to_vec())
   }
}

impl<T: Into<Value>> From<Option<T>> for Value {
   fn from(v: Option<T>) -> Self {
      v.map_or(Value::Null, Into::into)
   }
}

/// A borrowed view of a cell.
///
/// Text is kept as raw bytes because the engine does not guarantee valid
/// UTF-8 for data written through blob-typed bindings; use
/// [`ValueRef::as_str`] to validate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRef<'a> {
   Null,
   Integer(i64),
   Float(f64),
   Text(&'a [u8]),
   Blob(&'a [u8]),
}

impl<'a> ValueRef<'a> {
   pub fn cell_type(&self) -> CellType {
      match self {
         ValueRef::Null => CellType::Null,
         ValueRef::Integer(_) => CellType::Integer,
         ValueRef::Float(_) => CellType::Float,
         ValueRef::Text(_) => CellType::Text,
         ValueRef::Blob(_) => CellType::Blob,
      }
   }

   /// Bytes this cell occupies in the window payload area. Numbers are
   /// stored inline in the cell slot and cost nothing here.
   pub fn payload_len(&self) -> usize {
      match self {
         ValueRef::Text(b) | ValueRef::Blob(b) => b.len(),
         _ => 0,
      }
   }

   /// Returns the text of a text cell, or `None` for other types and
   /// invalid UTF-8.
   pub fn as_str(&self) -> Option<&'a str> {
      match self {
         ValueRef::Text(b) => std::str::from_utf8(b).ok(),
         _ => None,
      }
   }

   pub fn to_owned_value(&self) -> Value {
      match *self {
         ValueRef::Null => Value::Null,
         ValueRef::Integer(v) => Value::Integer(v),
         ValueRef::Float(v) => Value::Float(v),
         ValueRef::Text(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
         ValueRef::Blob(b) => Value::Blob(b.to_vec()),
      }
   }
}

impl<'a> From<&'a Value> for ValueRef<'a> {
   fn from(v: &'a Value) -> Self {
      v.as_ref()
   }
}
