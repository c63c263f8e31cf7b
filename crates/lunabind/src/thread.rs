//! Coroutine handles.

use std::fmt;

use mlua_sys as ffi;

use crate::error::BridgeResult;
use crate::reference::StoredValue;
use crate::stack::{self, StackGuard};

/// Identity-only handle to a VM coroutine.
#[derive(Clone, PartialEq)]
pub struct Thread(pub(crate) StoredValue);

impl Thread {
    pub(crate) fn reference(&self) -> &StoredValue {
        &self.0
    }

    /// Whether this handle anchors the VM's main thread.
    pub fn is_main(&self) -> BridgeResult<bool> {
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            self.0.push(&vm, state)?;
            Ok(ffi::lua_tothread(state, -1) == state)
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({:?})", self.0)
    }
}
