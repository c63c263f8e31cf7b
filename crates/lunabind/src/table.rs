//! Table - live handle to a VM associative container
//!
//! Nothing is cached on the host side: embedded code may mutate a table
//! between any two round trips, so every read and write goes to the VM.
//! Indexing and iteration run inside protected calls, so a raising
//! metamethod surfaces as [`BridgeError::Runtime`](crate::BridgeError::Runtime) instead of aborting.
//!
//! Enumeration order is whatever the VM's next-key protocol yields. Mutating
//! a table while a [`Table::keys`] pass is in flight is undefined.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::os::raw::c_int;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::convert::{FromValue, IntoValue};
use crate::error::BridgeResult;
use crate::reference::StoredValue;
use crate::stack::{self, StackGuard};
use crate::value::Value;
use crate::vm::VmState;

/// Handle to a VM table.
#[derive(Clone, PartialEq)]
pub struct Table(pub(crate) StoredValue);

impl Table {
    pub(crate) fn reference(&self) -> &StoredValue {
        &self.0
    }

    /// Read `self[key]`, honouring `__index`. An unset key yields `Nil`.
    pub fn get(&self, key: impl IntoValue) -> BridgeResult<Value> {
        let key = key.into_value();
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, vm.headroom())?;
            let base = ffi::lua_gettop(state);
            ffi::lua_pushcfunction(state, protected_get);
            self.0.push(&vm, state)?;
            stack::push_value(&vm, state, &key)?;
            let results = stack::protected_call(&vm, state, 2, base)?;
            Ok(results.into_iter().next().unwrap_or(Value::Nil))
        }
    }

    /// Write `self[key] = value`, honouring `__newindex`.
    pub fn set(&self, key: impl IntoValue, value: impl IntoValue) -> BridgeResult<()> {
        let key = key.into_value();
        let value = value.into_value();
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, vm.headroom())?;
            let base = ffi::lua_gettop(state);
            ffi::lua_pushcfunction(state, protected_set);
            self.0.push(&vm, state)?;
            stack::push_value(&vm, state, &key)?;
            stack::push_value(&vm, state, &value)?;
            stack::protected_call(&vm, state, 3, base)?;
            Ok(())
        }
    }

    /// Every key, in the order the VM yields them.
    pub fn keys(&self) -> BridgeResult<Vec<Value>> {
        Ok(self.pairs()?.into_iter().map(|(key, _)| key).collect())
    }

    /// Every (key, value) pair, in the order the VM yields them.
    pub fn pairs(&self) -> BridgeResult<Vec<(Value, Value)>> {
        let vm = self.0.vm()?;
        let mut entries = Vec::new();
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, vm.headroom())?;
            self.0.push(&vm, state)?;
            let table_index = ffi::lua_gettop(state);
            // Starting key
            ffi::lua_pushnil(state);
            while next_entry(&vm, state, table_index)? {
                // [table, key, value]
                let value = stack::pop_value(&vm, state);
                // The key stays on the stack for the next request
                ffi::lua_pushvalue(state, -1);
                let key = stack::pop_value(&vm, state);
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    /// Values of the integer keys `1..=n`, in key order.
    ///
    /// Returns an empty vector when there are no integer keys or when the
    /// integer keys are not exactly `1..=max` (holes, zero or negative keys).
    /// Non-integer keys are ignored. A value that is not a `T` is a
    /// [`TypeGuard`](crate::BridgeError::TypeGuard) error.
    pub fn as_sequence<T: FromValue>(&self) -> BridgeResult<Vec<T>> {
        let mut indexed: Vec<(i64, Value)> = self
            .pairs()?
            .into_iter()
            .filter_map(|(key, value)| key.as_integer().map(|index| (index, value)))
            .collect();
        if indexed.is_empty() {
            return Ok(Vec::new());
        }
        indexed.sort_by_key(|(index, _)| *index);
        let contiguous = indexed
            .iter()
            .enumerate()
            .all(|(position, (index, _))| *index == position as i64 + 1);
        if !contiguous {
            return Ok(Vec::new());
        }
        indexed.into_iter().map(|(_, value)| T::from_value(value)).collect()
    }

    /// Every pair converted to `(K, V)`. A pair that does not convert is a
    /// [`TypeGuard`](crate::BridgeError::TypeGuard) error.
    pub fn as_dictionary<K, V>(&self) -> BridgeResult<HashMap<K, V>>
    where
        K: FromValue + Eq + Hash,
        V: FromValue,
    {
        self.pairs()?
            .into_iter()
            .map(|(key, value)| Ok((K::from_value(key)?, V::from_value(value)?)))
            .collect()
    }

    /// Attach this table as the metatable of `other`.
    pub fn become_metatable_for(&self, other: &Value) -> BridgeResult<()> {
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 2)?;
            stack::push_value(&vm, state, other)?;
            self.0.push(&vm, state)?;
            ffi::lua_setmetatable(state, -2);
            ffi::lua_pop(state, 1);
        }
        Ok(())
    }

    /// Metatable attached to this table, if any.
    pub fn metatable(&self) -> BridgeResult<Option<Table>> {
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 2)?;
            self.0.push(&vm, state)?;
            if ffi::lua_getmetatable(state, -1) == 0 {
                return Ok(None);
            }
            Ok(Some(Table(StoredValue::pop_anchor(&vm, state))))
        }
    }

    /// Raw border length (`#t` without `__len`).
    pub fn len(&self) -> BridgeResult<usize> {
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            self.0.push(&vm, state)?;
            Ok(ffi::lua_rawlen(state, -1) as usize)
        }
    }

    /// True when the table has no entries at all.
    pub fn is_empty(&self) -> BridgeResult<bool> {
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 3)?;
            self.0.push(&vm, state)?;
            let table_index = ffi::lua_gettop(state);
            ffi::lua_pushnil(state);
            Ok(!next_entry(&vm, state, table_index)?)
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({:?})", self.0)
    }
}

// ============================================================================
// Protected primitives
// ============================================================================

/// Request the entry after the key on top of the stack. On `true` the key
/// is replaced by the next (key, value) pair; on `false` it is consumed.
unsafe fn next_entry(
    vm: &Rc<VmState>,
    state: *mut ffi::lua_State,
    table_index: c_int,
) -> BridgeResult<bool> {
    let base = ffi::lua_gettop(state) - 1;
    ffi::lua_pushcfunction(state, protected_next);
    ffi::lua_pushvalue(state, table_index);
    // [key, fn, table] -> [fn, table, key]
    ffi::lua_rotate(state, -3, -1);
    let status = ffi::lua_pcall(state, 2, ffi::LUA_MULTRET, 0);
    stack::check_status(vm, state, status)?;
    Ok(ffi::lua_gettop(state) - base == 2)
}

unsafe extern "C-unwind" fn protected_get(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_gettable(state, 1);
    1
}

unsafe extern "C-unwind" fn protected_set(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_settable(state, 1);
    0
}

unsafe extern "C-unwind" fn protected_next(state: *mut ffi::lua_State) -> c_int {
    if ffi::lua_next(state, 1) != 0 {
        2
    } else {
        0
    }
}
