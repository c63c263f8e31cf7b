//! Reference registry handles
//!
//! A [`StoredValue`] anchors one VM value in the VM's registry table so it
//! stays reachable after the stack frame that produced it is gone. The
//! registry entry is owned by the handle and released exactly once, when the
//! handle is dropped.
//!
//! Handles keep only a weak link to their VM: once the VM is closed every
//! operation fails with [`BridgeError::VmClosed`] and dropping is a no-op.

use std::fmt;
use std::os::raw::c_int;
use std::ptr;
use std::rc::{Rc, Weak};

use mlua_sys as ffi;

use crate::error::{BridgeError, BridgeResult};
use crate::stack::{self, StackGuard};
use crate::value::{Kind, Value};
use crate::vm::VmState;

/// Host handle anchoring a VM value through the registry.
pub struct StoredValue {
    vm: Weak<VmState>,
    key: c_int,
}

impl StoredValue {
    /// Anchor the value on top of the stack, popping it.
    ///
    /// # Safety
    /// `state` must belong to `vm` and have at least one slot.
    pub(crate) unsafe fn pop_anchor(vm: &Rc<VmState>, state: *mut ffi::lua_State) -> Self {
        let key = ffi::luaL_ref(state, ffi::LUA_REGISTRYINDEX);
        tracing::trace!(target: "lunabind", key, "anchored registry reference");
        Self {
            vm: Rc::downgrade(vm),
            key,
        }
    }

    /// Push `value`, then anchor it.
    ///
    /// # Safety
    /// `state` must belong to `vm`.
    pub(crate) unsafe fn anchor(
        vm: &Rc<VmState>,
        state: *mut ffi::lua_State,
        value: &Value,
    ) -> BridgeResult<Self> {
        let _guard = StackGuard::new(state);
        stack::check_stack(state, 1)?;
        stack::push_value(vm, state, value)?;
        Ok(Self::pop_anchor(vm, state))
    }

    /// Upgrade the weak VM link.
    pub(crate) fn vm(&self) -> BridgeResult<Rc<VmState>> {
        self.vm.upgrade().ok_or(BridgeError::VmClosed)
    }

    /// Push the anchored value onto `state`.
    ///
    /// # Safety
    /// `state` must be a thread of `vm` with one free slot.
    pub(crate) unsafe fn push(&self, vm: &VmState, state: *mut ffi::lua_State) -> BridgeResult<()> {
        if !ptr::eq(self.vm.as_ptr(), vm) {
            return Err(BridgeError::VmMismatch);
        }
        debug_assert_ne!(self.key, ffi::LUA_NOREF, "use of a released reference");
        ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, self.key as ffi::lua_Integer);
        Ok(())
    }

    /// Registry handle of this anchor
    pub fn handle(&self) -> i32 {
        self.key
    }

    /// Materialize a fresh copy of the anchored value.
    pub fn value(&self) -> BridgeResult<Value> {
        let vm = self.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            self.push(&vm, state)?;
            Ok(stack::pop_value(&vm, state))
        }
    }

    /// Runtime kind of the anchored value.
    pub fn kind(&self) -> BridgeResult<Kind> {
        let vm = self.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            self.push(&vm, state)?;
            Ok(Kind::from_raw(ffi::lua_type(state, -1)))
        }
    }

    /// True when both handles anchor the same embedded object.
    pub(crate) fn same_target(&self, other: &StoredValue) -> bool {
        if !Weak::ptr_eq(&self.vm, &other.vm) {
            return false;
        }
        let Some(vm) = self.vm.upgrade() else {
            return false;
        };
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            if stack::check_stack(state, 2).is_err() {
                return false;
            }
            if self.push(&vm, state).is_err() || other.push(&vm, state).is_err() {
                return false;
            }
            ffi::lua_rawequal(state, -1, -2) != 0
        }
    }
}

impl Clone for StoredValue {
    /// Anchors a second registry entry for the same value.
    fn clone(&self) -> Self {
        let Some(vm) = self.vm.upgrade() else {
            return Self {
                vm: self.vm.clone(),
                key: ffi::LUA_NOREF,
            };
        };
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            if stack::check_stack(state, 1).is_err() || self.push(&vm, state).is_err() {
                return Self {
                    vm: self.vm.clone(),
                    key: ffi::LUA_NOREF,
                };
            }
            Self::pop_anchor(&vm, state)
        }
    }
}

impl Drop for StoredValue {
    fn drop(&mut self) {
        if self.key == ffi::LUA_NOREF {
            return;
        }
        if let Some(vm) = self.vm.upgrade() {
            unsafe { ffi::luaL_unref(vm.main(), ffi::LUA_REGISTRYINDEX, self.key) };
            tracing::trace!(target: "lunabind", key = self.key, "released registry reference");
        }
        self.key = ffi::LUA_NOREF;
    }
}

impl PartialEq for StoredValue {
    fn eq(&self, other: &Self) -> bool {
        self.same_target(other)
    }
}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref {}", self.key)
    }
}
