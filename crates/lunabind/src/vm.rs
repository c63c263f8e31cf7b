//! Vm - owner of one embedded VM instance
//!
//! [`Vm`] is the entry point for every constructor. Handles created through
//! it keep only a weak link to the shared [`VmState`], so dropping the `Vm`
//! closes the VM (running every pending finalizer) even while handles are
//! still alive; those handles then report [`BridgeError::VmClosed`].

use std::ffi::CString;
use std::fmt;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::config::VmOptions;
use crate::error::{BridgeError, BridgeResult};
use crate::function::{self, Function, HostFunction, HOST_FUNCTION_METATABLE};
use crate::reference::StoredValue;
use crate::stack::{self, StackGuard};
use crate::table::Table;
use crate::trampoline;
use crate::userdata::{self, CustomType, CustomTypeBuilder, TypeRegistry, Userdata, TYPE_REGISTRY_KEY};
use crate::value::Value;

// ============================================================================
// Shared State
// ============================================================================

/// State shared by a [`Vm`] and (weakly) by every handle it created.
pub(crate) struct VmState {
    main: *mut ffi::lua_State,
    options: VmOptions,
    // Boxed so the address published in the VM registry stays put
    types: Box<TypeRegistry>,
}

impl VmState {
    /// Main thread of the VM
    pub(crate) fn main(&self) -> *mut ffi::lua_State {
        self.main
    }

    /// Slots reserved before bridge operations
    pub(crate) fn headroom(&self) -> c_int {
        self.options.stack_headroom
    }

    pub(crate) fn types(&self) -> &TypeRegistry {
        &self.types
    }
}

impl Drop for VmState {
    fn drop(&mut self) {
        // Runs every pending `__gc` while `types` is still alive
        unsafe { ffi::lua_close(self.main) };
        tracing::debug!(target: "lunabind", "closed VM");
    }
}

// ============================================================================
// Vm
// ============================================================================

/// An embedded VM instance.
pub struct Vm {
    state: Rc<VmState>,
}

impl Vm {
    /// Create a VM with default options (standard library preloaded).
    pub fn new() -> BridgeResult<Self> {
        Self::with_options(VmOptions::default())
    }

    /// Create a VM with the given options.
    pub fn with_options(options: VmOptions) -> BridgeResult<Self> {
        let main = unsafe { ffi::luaL_newstate() };
        if main.is_null() {
            return Err(BridgeError::Memory("cannot allocate VM state".to_string()));
        }
        let state = Rc::new(VmState {
            main,
            options,
            types: Box::default(),
        });

        unsafe {
            ffi::lua_atpanic(main, vm_panic);
            if state.options.open_libs {
                ffi::luaL_openlibs(main);
            }

            let types = &*state.types as *const TypeRegistry as *mut c_void;
            ffi::lua_pushlightuserdata(main, types);
            ffi::lua_setfield(main, ffi::LUA_REGISTRYINDEX, TYPE_REGISTRY_KEY.as_ptr());

            ffi::luaL_newmetatable(main, HOST_FUNCTION_METATABLE.as_ptr());
            ffi::lua_pushcfunction(main, trampoline::drop_cell::<HostFunction>);
            ffi::lua_setfield(main, -2, c"__gc".as_ptr());
            ffi::lua_pushboolean(main, 0);
            ffi::lua_setfield(main, -2, c"__metatable".as_ptr());
            ffi::lua_pop(main, 1);
        }

        tracing::debug!(
            target: "lunabind",
            open_libs = state.options.open_libs,
            headroom = state.options.stack_headroom,
            "created VM"
        );
        Ok(Self { state })
    }

    /// Temporary view over an existing state, handed to host closures.
    pub(crate) fn from_state(state: Rc<VmState>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &Rc<VmState> {
        &self.state
    }

    /// Options the VM was created with
    pub fn options(&self) -> &VmOptions {
        &self.state.options
    }

    // ------------------------------------------------------------------------
    // Root tables
    // ------------------------------------------------------------------------

    /// The global environment table.
    pub fn globals(&self) -> BridgeResult<Table> {
        unsafe {
            let state = self.state.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            ffi::lua_rawgeti(state, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer);
            Ok(Table(StoredValue::pop_anchor(&self.state, state)))
        }
    }

    /// The VM registry table.
    pub fn registry(&self) -> BridgeResult<Table> {
        unsafe {
            let state = self.state.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            ffi::lua_pushvalue(state, ffi::LUA_REGISTRYINDEX);
            Ok(Table(StoredValue::pop_anchor(&self.state, state)))
        }
    }

    /// Create an empty table with preallocated array and record parts.
    pub fn create_table(&self, array_hint: usize, record_hint: usize) -> BridgeResult<Table> {
        let narr = c_int::try_from(array_hint).unwrap_or(c_int::MAX);
        let nrec = c_int::try_from(record_hint).unwrap_or(c_int::MAX);
        unsafe {
            let state = self.state.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            ffi::lua_createtable(state, narr, nrec);
            Ok(Table(StoredValue::pop_anchor(&self.state, state)))
        }
    }

    /// Anchor any value, returning an owning registry handle.
    pub fn anchor(&self, value: &Value) -> BridgeResult<StoredValue> {
        unsafe { StoredValue::anchor(&self.state, self.state.main(), value) }
    }

    // ------------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------------

    /// Compile `source` into a function without running it.
    pub fn create_function_from_source(&self, source: &str) -> BridgeResult<Function> {
        let chunk_name = CString::new(self.state.options.chunk_name.as_str()).map_err(|_| {
            BridgeError::Unsupported(format!(
                "chunk name {:?} contains NUL",
                self.state.options.chunk_name
            ))
        })?;
        self.load(source.as_bytes(), &chunk_name)
    }

    /// Compile the file at `path` into a function without running it.
    ///
    /// A leading `#` line (shebang) is skipped; line numbers are preserved.
    pub fn create_function_from_file(&self, path: impl AsRef<Path>) -> BridgeResult<Function> {
        let path = path.as_ref();
        let mut source = std::fs::read(path)?;
        if source.first() == Some(&b'#') {
            let end = source
                .iter()
                .position(|&b| b == b'\n')
                .unwrap_or(source.len());
            source.drain(..end);
        }
        let chunk_name = CString::new(format!("@{}", path.display())).map_err(|_| {
            BridgeError::Unsupported(format!("path {:?} contains NUL", path))
        })?;
        self.load(&source, &chunk_name)
    }

    fn load(&self, source: &[u8], chunk_name: &CString) -> BridgeResult<Function> {
        unsafe {
            let state = self.state.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 1)?;
            let status = ffi::luaL_loadbufferx(
                state,
                source.as_ptr() as *const c_char,
                source.len(),
                chunk_name.as_ptr(),
                std::ptr::null(),
            );
            stack::check_status(&self.state, state, status)?;
            tracing::debug!(
                target: "lunabind",
                chunk = %chunk_name.to_string_lossy(),
                bytes = source.len(),
                "loaded chunk"
            );
            Ok(Function(StoredValue::pop_anchor(&self.state, state)))
        }
    }

    /// Expose a host closure as a VM function.
    ///
    /// An `Err` returned by the closure is raised as a VM error at the
    /// embedded call site.
    pub fn create_function<F>(&self, func: F) -> BridgeResult<Function>
    where
        F: Fn(&Vm, Vec<Value>) -> BridgeResult<Vec<Value>> + 'static,
    {
        unsafe {
            let state = self.state.main();
            let _guard = StackGuard::new(state);
            function::push_host_function(&self.state, state, Box::new(func))?;
            Ok(Function(StoredValue::pop_anchor(&self.state, state)))
        }
    }

    /// Compile and run `source` with `args`, returning every result.
    pub fn eval(&self, source: &str, args: &[Value]) -> BridgeResult<Vec<Value>> {
        self.create_function_from_source(source)?.call(args)
    }

    /// Compile and run the file at `path` with `args`, returning every result.
    pub fn eval_file(&self, path: impl AsRef<Path>, args: &[Value]) -> BridgeResult<Vec<Value>> {
        self.create_function_from_file(path)?.call(args)
    }

    // ------------------------------------------------------------------------
    // Custom types
    // ------------------------------------------------------------------------

    /// Register `T` as a custom type. `setup` populates the type object.
    pub fn create_custom_type<T, F>(&self, setup: F) -> BridgeResult<CustomType<T>>
    where
        T: 'static,
        F: FnOnce(&mut CustomTypeBuilder<'_, T>) -> BridgeResult<()>,
    {
        CustomType::register(self, setup)
    }

    /// Move `value` into a new userdata of its registered custom type.
    pub fn create_userdata<T: 'static>(&self, value: T) -> BridgeResult<Userdata> {
        userdata::create_userdata(&self.state, value)
    }

    // ------------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------------

    /// Run a full collection cycle, including pending finalizers.
    pub fn collect_garbage(&self) {
        unsafe {
            ffi::lua_gc(self.state.main(), ffi::LUA_GCCOLLECT, 0);
        }
    }

    /// Bytes currently allocated by the VM.
    pub fn used_memory(&self) -> usize {
        unsafe {
            let state = self.state.main();
            let kbytes = ffi::lua_gc(state, ffi::LUA_GCCOUNT, 0).max(0) as usize;
            let bytes = ffi::lua_gc(state, ffi::LUA_GCCOUNTB, 0).max(0) as usize;
            kbytes * 1024 + bytes
        }
    }

    /// Current depth of the main thread's stack.
    pub fn stack_top(&self) -> i32 {
        unsafe { ffi::lua_gettop(self.state.main()) }
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("state", &self.state.main)
            .field("options", &self.state.options)
            .finish()
    }
}

/// Last stop for an error raised outside any protected call.
unsafe extern "C-unwind" fn vm_panic(state: *mut ffi::lua_State) -> c_int {
    let message = stack::read_string(state, -1).unwrap_or_else(|| "(error object is not a string)".to_string());
    tracing::error!(target: "lunabind", "unprotected error in VM: {}", message);
    0
}
