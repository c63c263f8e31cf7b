//! Guarded entry points for native functions called by the VM
//!
//! Every native function the VM can invoke (host closures, custom-type
//! equality, finalizers, cell destructors) funnels through here. The guard
//! catches panics before they reach C frames and turns host errors into VM
//! errors.
//!
//! `lua_error` unwinds with `longjmp`, skipping Rust destructors. Everything
//! owned by the failing call is dropped before [`raise`] is reached; only the
//! message bytes live on, inside the VM.

use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};

use mlua_sys as ffi;

use crate::error::{panic_message, BridgeError, BridgeResult};
use crate::stack;

/// Run `body`, returning its result count to the VM, or raise its failure
/// as a VM error.
///
/// # Safety
/// Must be called directly from a `lua_CFunction` running on `state`.
pub(crate) unsafe fn guarded<F>(state: *mut ffi::lua_State, body: F) -> c_int
where
    F: FnOnce() -> BridgeResult<c_int>,
{
    let message = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(count)) => return count,
        Ok(Err(err)) => err.vm_message(),
        Err(payload) => BridgeError::Panic(panic_message(payload.as_ref())).to_string(),
    };
    raise(state, message)
}

/// Push `message` and raise it.
///
/// # Safety
/// Same as [`guarded`]. Does not return.
pub(crate) unsafe fn raise(state: *mut ffi::lua_State, message: String) -> c_int {
    ffi::lua_settop(state, 0);
    stack::push_bytes(state, message.as_bytes());
    drop(message);
    ffi::lua_error(state)
}

/// `__gc` for blocks holding an `Option<T>`: takes the payload and drops it.
/// A block that was already emptied is left alone.
pub(crate) unsafe extern "C-unwind" fn drop_cell<T: 'static>(state: *mut ffi::lua_State) -> c_int {
    let cell = ffi::lua_touserdata(state, 1) as *mut Option<T>;
    if let Some(cell) = cell.as_mut() {
        let payload = cell.take();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(payload))) {
            tracing::warn!(
                target: "lunabind",
                "destructor of {} panicked: {}",
                std::any::type_name::<T>(),
                panic_message(payload.as_ref())
            );
        }
    }
    0
}
