//! Typed conversion between [`Value`] and host types.
//!
//! Conversions never coerce across kinds: a numeric string is not a number
//! and a number is not a string. Integer targets accept only integral
//! numbers that fit the target type, and `String` accepts only valid UTF-8
//! (use `Vec<u8>` or [`VmString`] for binary data).

use crate::error::{BridgeError, BridgeResult};
use crate::function::Function;
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::Userdata;
use crate::value::{LightUserdata, Number, Value, VmString};

// ============================================================================
// Value Conversion Traits
// ============================================================================

/// Convert from a [`Value`] to a host type.
///
/// Implement this trait to receive your type from tables and call results.
pub trait FromValue: Sized {
    /// Convert, returning `TypeGuard` if the kind doesn't match.
    fn from_value(value: Value) -> BridgeResult<Self>;
}

/// Convert from a host type to a [`Value`].
pub trait IntoValue {
    /// Convert to a Value.
    fn into_value(self) -> Value;
}

fn mismatch(expected: &str, value: &Value) -> BridgeError {
    BridgeError::type_guard(expected, value.type_name())
}

// ============================================================================
// Value
// ============================================================================

impl FromValue for Value {
    fn from_value(value: Value) -> BridgeResult<Self> {
        Ok(value)
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &Value {
    fn into_value(self) -> Value {
        self.clone()
    }
}

// ============================================================================
// Scalars
// ============================================================================

impl FromValue for String {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::String(s) => s.into_string(),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::string(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::string(self)
    }
}

impl FromValue for VmString {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl IntoValue for VmString {
    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> BridgeResult<Self> {
        VmString::from_value(value).map(VmString::into_bytes)
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::string(self)
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Value {
        Value::string(self)
    }
}

impl FromValue for Number {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Number(n) => Ok(n),
            other => Err(mismatch("number", &other)),
        }
    }
}

impl IntoValue for Number {
    fn into_value(self) -> Value {
        Value::Number(self)
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> BridgeResult<Self> {
        value.as_number().ok_or_else(|| mismatch("number", &value))
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::float(self)
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> BridgeResult<Self> {
        f64::from_value(value).map(|n| n as f32)
    }
}

impl IntoValue for f32 {
    fn into_value(self) -> Value {
        Value::float(self as f64)
    }
}

macro_rules! integer_conversions {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> BridgeResult<Self> {
                    value
                        .as_integer()
                        .and_then(|n| <$ty>::try_from(n).ok())
                        .ok_or_else(|| match &value {
                            Value::Number(n) => BridgeError::type_guard(
                                stringify!($ty),
                                format!("number {}", n),
                            ),
                            other => mismatch(stringify!($ty), other),
                        })
                }
            }

            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    match i64::try_from(self) {
                        Ok(n) => Value::integer(n),
                        Err(_) => Value::float(self as f64),
                    }
                }
            }
        )*
    };
}

integer_conversions!(i64, i32, u32, usize);

impl FromValue for bool {
    fn from_value(value: Value) -> BridgeResult<Self> {
        value.as_bool().ok_or_else(|| mismatch("boolean", &value))
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

// Unit maps to nil (closures with no meaningful result)
impl FromValue for () {
    fn from_value(value: Value) -> BridgeResult<Self> {
        if value.is_nil() {
            Ok(())
        } else {
            Err(mismatch("nil", &value))
        }
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Nil
    }
}

impl FromValue for LightUserdata {
    fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::LightUserdata(p) => Ok(p),
            other => Err(mismatch("lightuserdata", &other)),
        }
    }
}

impl IntoValue for LightUserdata {
    fn into_value(self) -> Value {
        Value::LightUserdata(self)
    }
}

// ============================================================================
// Optional
// ============================================================================

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> BridgeResult<Self> {
        if value.is_nil() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(value) => value.into_value(),
            None => Value::Nil,
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

macro_rules! handle_conversions {
    ($($ty:ident => $name:literal),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> BridgeResult<Self> {
                    match value {
                        Value::$ty(handle) => Ok(handle),
                        other => Err(mismatch($name, &other)),
                    }
                }
            }

            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::$ty(self)
                }
            }

            impl IntoValue for &$ty {
                fn into_value(self) -> Value {
                    Value::$ty(self.clone())
                }
            }
        )*
    };
}

handle_conversions!(
    Table => "table",
    Function => "function",
    Userdata => "userdata",
    Thread => "thread"
);
