//! Stack plumbing between host values and VM slots
//!
//! Every function here works on a raw `lua_State` and is `unsafe`: callers
//! must pass a thread that belongs to the given VM and must have reserved
//! enough slots (see [`check_stack`]).
//!
//! # Balance
//!
//! Public operations wrap their work in a [`StackGuard`], which records the
//! stack top on entry and restores it on drop. Any early return, including
//! `?` propagation, therefore leaves the stack as it found it.

use std::os::raw::{c_char, c_int};
use std::rc::Rc;

use mlua_sys as ffi;

use crate::error::{self, BridgeError, BridgeResult};
use crate::function::Function;
use crate::reference::StoredValue;
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::Userdata;
use crate::value::{Kind, LightUserdata, Number, Value, VmString};
use crate::vm::VmState;

// ============================================================================
// Stack Guard
// ============================================================================

/// Restores the stack top recorded at construction when dropped.
pub(crate) struct StackGuard {
    state: *mut ffi::lua_State,
    top: c_int,
}

impl StackGuard {
    /// # Safety
    /// `state` must stay valid for the guard's lifetime.
    pub(crate) unsafe fn new(state: *mut ffi::lua_State) -> Self {
        Self {
            state,
            top: ffi::lua_gettop(state),
        }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        unsafe {
            debug_assert!(
                ffi::lua_gettop(self.state) >= self.top,
                "stack dropped below a recorded position"
            );
            ffi::lua_settop(self.state, self.top);
        }
    }
}

/// Reserve `extra` free slots.
pub(crate) unsafe fn check_stack(state: *mut ffi::lua_State, extra: c_int) -> BridgeResult<()> {
    if ffi::lua_checkstack(state, extra) == 0 {
        return Err(BridgeError::Memory(format!(
            "stack overflow (cannot grow by {} slots)",
            extra
        )));
    }
    Ok(())
}

// ============================================================================
// Push
// ============================================================================

/// Push one slot holding `value` in its canonical form.
///
/// `None` is pushed as `nil`: absence cannot occupy a slot.
pub(crate) unsafe fn push_value(
    vm: &VmState,
    state: *mut ffi::lua_State,
    value: &Value,
) -> BridgeResult<()> {
    match value {
        Value::Nil | Value::None => ffi::lua_pushnil(state),
        Value::Boolean(b) => ffi::lua_pushboolean(state, *b as c_int),
        Value::Number(Number::Integer(i)) => ffi::lua_pushinteger(state, *i),
        Value::Number(Number::Float(f)) => ffi::lua_pushnumber(state, *f),
        Value::String(s) => push_bytes(state, s.as_bytes()),
        Value::LightUserdata(p) => ffi::lua_pushlightuserdata(state, p.0),
        Value::Function(f) => f.reference().push(vm, state)?,
        Value::Table(t) => t.reference().push(vm, state)?,
        Value::Userdata(u) => u.reference().push(vm, state)?,
        Value::Thread(t) => t.reference().push(vm, state)?,
    }
    Ok(())
}

/// Push a length-tagged byte string.
pub(crate) unsafe fn push_bytes(state: *mut ffi::lua_State, bytes: &[u8]) {
    ffi::lua_pushlstring(state, bytes.as_ptr() as *const c_char, bytes.len());
}

// ============================================================================
// Materialize
// ============================================================================

/// Pop the top slot and return the matching value. An empty stack yields
/// [`Value::None`] and pops nothing.
pub(crate) unsafe fn pop_value(vm: &Rc<VmState>, state: *mut ffi::lua_State) -> Value {
    if ffi::lua_gettop(state) == 0 {
        return Value::None;
    }
    let kind = Kind::from_raw(ffi::lua_type(state, -1));
    let value = match kind {
        Kind::Table => return Value::Table(Table(StoredValue::pop_anchor(vm, state))),
        Kind::Function => return Value::Function(Function(StoredValue::pop_anchor(vm, state))),
        Kind::Userdata => return Value::Userdata(Userdata(StoredValue::pop_anchor(vm, state))),
        Kind::Thread => return Value::Thread(Thread(StoredValue::pop_anchor(vm, state))),
        Kind::None => return Value::None,
        Kind::Nil => Value::Nil,
        Kind::Boolean => Value::Boolean(ffi::lua_toboolean(state, -1) != 0),
        Kind::LightUserdata => Value::LightUserdata(LightUserdata(ffi::lua_touserdata(state, -1))),
        Kind::Number => {
            if ffi::lua_isinteger(state, -1) != 0 {
                Value::integer(ffi::lua_tointegerx(state, -1, std::ptr::null_mut()))
            } else {
                Value::float(ffi::lua_tonumberx(state, -1, std::ptr::null_mut()))
            }
        }
        Kind::String => Value::String(read_bytes(state, -1).map(VmString::from).unwrap_or_default()),
    };
    ffi::lua_pop(state, 1);
    value
}

/// Read the slot at `index` and remove it, shifting the slots above down.
/// A position above the top yields [`Value::None`].
pub(crate) unsafe fn materialize(vm: &Rc<VmState>, state: *mut ffi::lua_State, index: c_int) -> Value {
    let index = ffi::lua_absindex(state, index);
    let top = ffi::lua_gettop(state);
    if index > top || index <= 0 {
        return Value::None;
    }
    if index != top {
        ffi::lua_rotate(state, index, -1);
    }
    pop_value(vm, state)
}

/// Copy the bytes of the string at `index` without popping it. Only reads
/// real strings, so numbers are never converted in place.
pub(crate) unsafe fn read_bytes(state: *mut ffi::lua_State, index: c_int) -> Option<Vec<u8>> {
    if ffi::lua_type(state, index) != ffi::LUA_TSTRING {
        return None;
    }
    let mut len = 0usize;
    let ptr = ffi::lua_tolstring(state, index, &mut len);
    if ptr.is_null() {
        return None;
    }
    Some(std::slice::from_raw_parts(ptr as *const u8, len).to_vec())
}

/// Text of the string at `index` for names and diagnostics. Invalid UTF-8
/// is replaced.
pub(crate) unsafe fn read_string(state: *mut ffi::lua_State, index: c_int) -> Option<String> {
    read_bytes(state, index).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

// ============================================================================
// Protected Calls
// ============================================================================

/// Turn a non-OK status into a host error. The error object on top of the
/// stack is materialized and handed to the error handler.
pub(crate) unsafe fn check_status(
    vm: &Rc<VmState>,
    state: *mut ffi::lua_State,
    status: c_int,
) -> BridgeResult<()> {
    if status == ffi::LUA_OK {
        return Ok(());
    }
    let message = match pop_value(vm, state) {
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Number(n) => n.to_string(),
        Value::Nil | Value::None => "nil".to_string(),
        other => format!("({} error object)", other.type_name()),
    };
    error::report(&message);
    Err(match status {
        ffi::LUA_ERRSYNTAX => BridgeError::Syntax(message),
        ffi::LUA_ERRMEM => BridgeError::Memory(message),
        _ => BridgeError::Runtime(message),
    })
}

/// Call the function sitting below `nargs` arguments in protected mode and
/// materialize every result in order. `base` is the stack top before the
/// function was pushed.
pub(crate) unsafe fn protected_call(
    vm: &Rc<VmState>,
    state: *mut ffi::lua_State,
    nargs: c_int,
    base: c_int,
) -> BridgeResult<Vec<Value>> {
    let status = ffi::lua_pcall(state, nargs, ffi::LUA_MULTRET, 0);
    check_status(vm, state, status)?;
    let count = ffi::lua_gettop(state) - base;
    let mut results = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        results.push(materialize(vm, state, base + 1));
    }
    Ok(results)
}
