//! Value - the host-side image of one VM slot
//!
//! A closed tagged union with one variant per VM kind. Scalars (strings,
//! numbers, booleans, light userdata) are copied out of the VM without loss:
//! strings keep their raw bytes and numbers keep their integer or float
//! subtype. Reference
//! kinds (tables, functions, userdata, threads) are anchored handles whose
//! equality is embedded identity.

use std::borrow::Cow;
use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_int;

use mlua_sys as ffi;

use crate::error::{BridgeError, BridgeResult};
use crate::function::Function;
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::Userdata;

// ============================================================================
// Kind
// ============================================================================

/// Runtime kind tag of a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// No slot at that position
    None,
    /// `nil`
    Nil,
    /// `true` / `false`
    Boolean,
    /// Bare native pointer
    LightUserdata,
    /// Integer or float
    Number,
    /// Byte string
    String,
    /// Associative table
    Table,
    /// Embedded or native callable
    Function,
    /// VM-owned memory block with a metatable
    Userdata,
    /// Coroutine
    Thread,
}

impl Kind {
    pub(crate) fn from_raw(tag: c_int) -> Self {
        match tag {
            ffi::LUA_TNIL => Kind::Nil,
            ffi::LUA_TBOOLEAN => Kind::Boolean,
            ffi::LUA_TLIGHTUSERDATA => Kind::LightUserdata,
            ffi::LUA_TNUMBER => Kind::Number,
            ffi::LUA_TSTRING => Kind::String,
            ffi::LUA_TTABLE => Kind::Table,
            ffi::LUA_TFUNCTION => Kind::Function,
            ffi::LUA_TUSERDATA => Kind::Userdata,
            ffi::LUA_TTHREAD => Kind::Thread,
            _ => Kind::None,
        }
    }

    /// Lowercase kind name, as used in error messages
    pub const fn name(self) -> &'static str {
        match self {
            Kind::None => "no value",
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::LightUserdata => "lightuserdata",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Table => "table",
            Kind::Function => "function",
            Kind::Userdata => "userdata",
            Kind::Thread => "thread",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// LightUserdata
// ============================================================================

/// A bare native pointer stored in a slot. Compared by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightUserdata(pub *mut c_void);

// ============================================================================
// Number
// ============================================================================

/// A VM number with its subtype preserved.
///
/// Integers and floats compare equal when they denote the same mathematical
/// value, the way the VM's own `==` does.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    /// 64-bit integer
    Integer(i64),
    /// Double-precision float
    Float(f64),
}

impl Number {
    /// Value as a float (integers beyond 2^53 round)
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// Value as an integer, if it has an exact integer representation
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Number::Integer(i) => Some(i),
            Number::Float(f) => exact_integer(f),
        }
    }

    /// True for the integer subtype
    pub fn is_integer(self) -> bool {
        matches!(self, Number::Integer(_))
    }
}

// 2^63 is exactly representable; i64::MAX is not
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

fn exact_integer(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && (-TWO_POW_63..TWO_POW_63).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Number::Integer(a), Number::Integer(b)) => a == b,
            (Number::Float(a), Number::Float(b)) => a == b,
            (Number::Integer(i), Number::Float(f)) | (Number::Float(f), Number::Integer(i)) => {
                exact_integer(f) == Some(i)
            }
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Integer(i) => write!(f, "{}", i),
            Number::Float(n) => write!(f, "{}", n),
        }
    }
}

impl From<i64> for Number {
    fn from(i: i64) -> Self {
        Number::Integer(i)
    }
}

impl From<f64> for Number {
    fn from(f: f64) -> Self {
        Number::Float(f)
    }
}

// ============================================================================
// VmString
// ============================================================================

/// A VM string: an arbitrary byte sequence, not necessarily UTF-8.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmString(Vec<u8>);

impl VmString {
    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Borrow as UTF-8, failing with `TypeGuard` on invalid sequences
    pub fn to_str(&self) -> BridgeResult<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|_| BridgeError::type_guard("utf-8 string", "byte string"))
    }

    /// Convert into a `String`, failing with `TypeGuard` on invalid UTF-8
    pub fn into_string(self) -> BridgeResult<String> {
        String::from_utf8(self.0)
            .map_err(|_| BridgeError::type_guard("utf-8 string", "byte string"))
    }

    /// Decode for display, replacing invalid sequences
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty string
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for VmString {
    fn from(s: &str) -> Self {
        VmString(s.as_bytes().to_vec())
    }
}

impl From<String> for VmString {
    fn from(s: String) -> Self {
        VmString(s.into_bytes())
    }
}

impl From<Vec<u8>> for VmString {
    fn from(bytes: Vec<u8>) -> Self {
        VmString(bytes)
    }
}

impl From<&[u8]> for VmString {
    fn from(bytes: &[u8]) -> Self {
        VmString(bytes.to_vec())
    }
}

impl PartialEq<str> for VmString {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for VmString {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl fmt::Debug for VmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "b\"{}\"", self.0.escape_ascii()),
        }
    }
}

impl fmt::Display for VmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

// ============================================================================
// Value
// ============================================================================

/// Host image of a VM value.
#[derive(Clone, Default)]
pub enum Value {
    /// Byte string
    String(VmString),
    /// Integer or float, subtype preserved
    Number(Number),
    /// Boolean
    Boolean(bool),
    /// Callable handle
    Function(Function),
    /// Table handle
    Table(Table),
    /// Userdata handle
    Userdata(Userdata),
    /// Bare pointer
    LightUserdata(LightUserdata),
    /// Coroutine handle
    Thread(Thread),
    /// `nil`
    #[default]
    Nil,
    /// Absence of a value (position above the stack top)
    None,
}

impl Value {
    /// String value from text or bytes
    pub fn string(s: impl Into<VmString>) -> Self {
        Value::String(s.into())
    }

    /// Integer-subtype number
    pub fn integer(i: i64) -> Self {
        Value::Number(Number::Integer(i))
    }

    /// Float-subtype number
    pub fn float(f: f64) -> Self {
        Value::Number(Number::Float(f))
    }

    /// Kind of this value
    pub fn kind(&self) -> Kind {
        match self {
            Value::String(_) => Kind::String,
            Value::Number(_) => Kind::Number,
            Value::Boolean(_) => Kind::Boolean,
            Value::Function(_) => Kind::Function,
            Value::Table(_) => Kind::Table,
            Value::Userdata(_) => Kind::Userdata,
            Value::LightUserdata(_) => Kind::LightUserdata,
            Value::Thread(_) => Kind::Thread,
            Value::Nil => Kind::Nil,
            Value::None => Kind::None,
        }
    }

    /// Kind name for diagnostics
    pub fn type_name(&self) -> &'static str {
        self.kind().name()
    }

    /// `nil` or no value
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil | Value::None)
    }

    /// Borrow the string payload if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => s.to_str().ok(),
            _ => None,
        }
    }

    /// Borrow the raw bytes of a string payload
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Get the number payload as a float
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.as_f64()),
            _ => None,
        }
    }

    /// Get the number payload if it is integral
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Get the boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the table handle
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Borrow the function handle
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Borrow the userdata handle
    pub fn as_userdata(&self) -> Option<&Userdata> {
        match self {
            Value::Userdata(u) => Some(u),
            _ => None,
        }
    }

    /// Truthiness as the VM defines it: only `nil` and `false` are false
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::None | Value::Boolean(false))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightUserdata(a), Value::LightUserdata(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Userdata(a), Value::Userdata(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::None, Value::None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "Value::String({:?})", s),
            Value::Number(n) => write!(f, "Value::Number({:?})", n),
            Value::Boolean(b) => write!(f, "Value::Boolean({})", b),
            Value::Function(func) => write!(f, "Value::Function({:?})", func),
            Value::Table(t) => write!(f, "Value::Table({:?})", t),
            Value::Userdata(u) => write!(f, "Value::Userdata({:?})", u),
            Value::LightUserdata(p) => write!(f, "Value::LightUserdata({:p})", p.0),
            Value::Thread(t) => write!(f, "Value::Thread({:?})", t),
            Value::Nil => write!(f, "Value::Nil"),
            Value::None => write!(f, "Value::None"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Kind::Nil.name(), "nil");
        assert_eq!(Kind::None.name(), "no value");
        assert_eq!(Kind::Userdata.to_string(), "userdata");
        assert_eq!(Kind::from_raw(ffi::LUA_TTABLE), Kind::Table);
        assert_eq!(Kind::from_raw(ffi::LUA_TNONE), Kind::None);
    }

    #[test]
    fn test_scalar_equality() {
        assert_eq!(Value::float(1.5), Value::float(1.5));
        assert_ne!(Value::float(1.0), Value::string("1"));
        assert_eq!(Value::Nil, Value::Nil);
        assert_ne!(Value::Nil, Value::None);
        assert_eq!(Value::default(), Value::Nil);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::float(3.0).as_integer(), Some(3));
        assert_eq!(Value::float(3.5).as_integer(), None);
        assert_eq!(Value::integer(i64::MAX).as_integer(), Some(i64::MAX));
        assert_eq!(Value::string("x").as_str(), Some("x"));
        assert_eq!(Value::Boolean(true).as_bool(), Some(true));
        assert!(Value::None.is_nil());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::float(0.0).is_truthy());
    }

    #[test]
    fn test_light_userdata_identity() {
        let mut x = 5u32;
        let a = LightUserdata(&mut x as *mut u32 as *mut c_void);
        let b = a;
        assert_eq!(Value::LightUserdata(a), Value::LightUserdata(b));
        assert_eq!(Value::LightUserdata(a).type_name(), "lightuserdata");
    }

    #[test]
    fn test_number_subtypes_compare_by_value() {
        assert_eq!(Number::Integer(2), Number::Float(2.0));
        assert_ne!(Number::Integer(2), Number::Float(2.5));
        assert_ne!(Number::Integer(i64::MAX), Number::Float(i64::MAX as f64));
        assert_eq!(Number::Integer(i64::MIN), Number::Float(i64::MIN as f64));
        assert!(Number::Integer(1).is_integer());
        assert!(!Number::Float(1.0).is_integer());
        assert_eq!(Number::Float(-0.0).as_i64(), Some(0));
        assert_eq!(Number::Float(f64::NAN).as_i64(), None);
    }

    #[test]
    fn test_byte_strings() {
        let binary = VmString::from(vec![0xff, 0xfe]);
        assert_eq!(binary.len(), 2);
        assert!(binary.to_str().is_err());
        assert_eq!(format!("{:?}", binary), "b\"\\xff\\xfe\"");
        assert_eq!(Value::String(binary).as_str(), None);

        let text = VmString::from("text");
        assert_eq!(text, "text");
        assert_eq!(text.into_string().unwrap(), "text");
    }
}
