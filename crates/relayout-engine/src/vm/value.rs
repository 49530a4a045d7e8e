//! Runtime values

use super::{Object, VmError};
use relayout_bytecode::{FieldType, PrimitiveKind};
use std::fmt;
use std::sync::Arc;

/// A value on the operand stack, in a local, or in a field
///
/// `long` and `double` are single values here even though they take two
/// local slots.
#[derive(Clone, Default)]
pub enum Value {
    /// Null reference
    #[default]
    Null,
    /// int, boolean, byte, short and char
    Int(i32),
    /// long
    Long(i64),
    /// float
    Float(f32),
    /// double
    Double(f64),
    /// String
    Str(Arc<str>),
    /// Object reference
    Ref(Arc<Object>),
    /// Immutable array (argument arrays built by `PACK_ARGS`)
    Array(Arc<[Value]>),
}

impl Value {
    /// Default value of a field with the given descriptor: zero for
    /// primitives, null for everything else
    pub fn default_for(descriptor: &str) -> Value {
        match FieldType::parse(descriptor).ok().and_then(|t| t.primitive()) {
            Some(PrimitiveKind::Long) => Value::Long(0),
            Some(PrimitiveKind::Float) => Value::Float(0.0),
            Some(PrimitiveKind::Double) => Value::Double(0.0),
            Some(_) => Value::Int(0),
            None => Value::Null,
        }
    }

    /// Create a string value
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Int payload
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Long payload
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Double payload
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Object payload
    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Value::Ref(o) => Some(o),
            _ => None,
        }
    }

    /// Short name of the value's kind, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Ref(_) => "object",
            Value::Array(_) => "array",
        }
    }

    /// Convert a generic value to a primitive of `kind`
    ///
    /// Numbers convert between each other with the usual widening and
    /// narrowing rules. Null and non-numeric values are errors.
    pub fn unbox(&self, kind: PrimitiveKind) -> Result<Value, VmError> {
        let (as_i64, as_f64) = match self {
            Value::Int(v) => (*v as i64, *v as f64),
            Value::Long(v) => (*v, *v as f64),
            Value::Float(v) => (*v as i64, *v as f64),
            Value::Double(v) => (*v as i64, *v),
            Value::Null => return Err(VmError::NullPointer),
            other => {
                return Err(VmError::TypeError(format!(
                    "cannot unbox {} to {:?}",
                    other.kind_name(),
                    kind
                )))
            }
        };
        let value = match kind {
            PrimitiveKind::Int => Value::Int(as_i64 as i32),
            PrimitiveKind::Boolean => Value::Int((as_i64 != 0) as i32),
            PrimitiveKind::Byte => Value::Int(as_i64 as i8 as i32),
            PrimitiveKind::Short => Value::Int(as_i64 as i16 as i32),
            PrimitiveKind::Char => Value::Int(as_i64 as u16 as i32),
            PrimitiveKind::Long => Value::Long(as_i64),
            PrimitiveKind::Float => Value::Float(as_f64 as f32),
            PrimitiveKind::Double => Value::Double(as_f64),
        };
        Ok(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Float(v) => write!(f, "{}f", v),
            Value::Double(v) => write!(f, "{}d", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Ref(o) => write!(f, "<{}>", o.class().name()),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            other => write!(f, "{:?}", other),
        }
    }
}
