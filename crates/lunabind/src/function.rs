//! Function bridging in both directions
//!
//! - Embedded → host: [`Function::call`] pushes the callable and its
//!   arguments, runs a protected call and materializes every result.
//! - Host → embedded: [`Vm::create_function`](crate::Vm::create_function)
//!   boxes a Rust closure into a VM userdata and exposes it through a native
//!   C closure. A failing host closure raises a VM error at the embedded call
//!   site.

use std::fmt;
use std::mem;
use std::os::raw::c_int;
use std::ptr;
use std::rc::{Rc, Weak};

use mlua_sys as ffi;

use crate::error::{BridgeError, BridgeResult};
use crate::reference::StoredValue;
use crate::stack::{self, StackGuard};
use crate::trampoline;
use crate::value::Value;
use crate::vm::{Vm, VmState};

/// Registry key of the metatable shared by all host-closure cells
pub(crate) const HOST_FUNCTION_METATABLE: &std::ffi::CStr = c"lunabind.HostFunction";

/// Boxed host closure callable from embedded code
pub type HostFn = Box<dyn Fn(&Vm, Vec<Value>) -> BridgeResult<Vec<Value>>>;

// ============================================================================
// Function
// ============================================================================

/// Handle to a callable living in the VM.
#[derive(Clone, PartialEq)]
pub struct Function(pub(crate) StoredValue);

impl Function {
    pub(crate) fn reference(&self) -> &StoredValue {
        &self.0
    }

    /// Call with `args` in protected mode, returning every result in order.
    ///
    /// A VM failure is reported to the error handler and returned as
    /// [`BridgeError::Runtime`] carrying the error message.
    pub fn call(&self, args: &[Value]) -> BridgeResult<Vec<Value>> {
        let vm = self.0.vm()?;
        let nargs = c_int::try_from(args.len())
            .map_err(|_| BridgeError::Unsupported(format!("{} call arguments", args.len())))?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, nargs.saturating_add(vm.headroom()))?;
            let base = ffi::lua_gettop(state);
            self.0.push(&vm, state)?;
            for arg in args {
                stack::push_value(&vm, state, arg)?;
            }
            tracing::trace!(target: "lunabind", nargs, "calling function");
            stack::protected_call(&vm, state, nargs, base)
        }
    }

    /// Call and return only the first result (`Nil` when there is none).
    pub fn call_first(&self, args: &[Value]) -> BridgeResult<Value> {
        Ok(self.call(args)?.into_iter().next().unwrap_or(Value::Nil))
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:?})", self.0)
    }
}

// ============================================================================
// Host Closures
// ============================================================================

/// VM-owned cell holding a host closure. Lives inside a userdata whose
/// `__gc` empties it.
pub(crate) struct HostFunction {
    vm: Weak<VmState>,
    func: HostFn,
}

/// Push a native closure wrapping `func`.
///
/// # Safety
/// `state` must belong to `vm`.
pub(crate) unsafe fn push_host_function(
    vm: &Rc<VmState>,
    state: *mut ffi::lua_State,
    func: HostFn,
) -> BridgeResult<()> {
    stack::check_stack(state, 2)?;
    let size = mem::size_of::<Option<HostFunction>>();
    let cell = ffi::lua_newuserdatauv(state, size, 0) as *mut Option<HostFunction>;
    ptr::write(
        cell,
        Some(HostFunction {
            vm: Rc::downgrade(vm),
            func,
        }),
    );
    ffi::luaL_getmetatable(state, HOST_FUNCTION_METATABLE.as_ptr());
    ffi::lua_setmetatable(state, -2);
    ffi::lua_pushcclosure(state, call_host_function, 1);
    Ok(())
}

unsafe extern "C-unwind" fn call_host_function(state: *mut ffi::lua_State) -> c_int {
    trampoline::guarded(state, || invoke_host_function(state))
}

/// Drain the arguments, run the closure, push its results.
unsafe fn invoke_host_function(state: *mut ffi::lua_State) -> BridgeResult<c_int> {
    let cell = ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const Option<HostFunction>;
    let host = cell
        .as_ref()
        .and_then(|cell| cell.as_ref())
        .ok_or_else(|| BridgeError::Runtime("host function has been destroyed".to_string()))?;
    let state_rc = host.vm.upgrade().ok_or(BridgeError::VmClosed)?;

    let count = ffi::lua_gettop(state);
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(stack::materialize(&state_rc, state, 1));
    }

    let vm = Vm::from_state(state_rc.clone());
    let results = (host.func)(&vm, args)?;

    let nresults = c_int::try_from(results.len())
        .map_err(|_| BridgeError::Unsupported(format!("{} results", results.len())))?;
    stack::check_stack(state, nresults)?;
    for value in &results {
        stack::push_value(&state_rc, state, value)?;
    }
    Ok(nresults)
}
