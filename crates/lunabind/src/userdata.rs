//! Custom types: native payloads living inside VM userdata
//!
//! A [`CustomType<T>`] binds the host type `T` to one metatable per VM. The
//! metatable is also the type object: it is its own metatable, and its
//! `__index` is a raw lookup into itself, so members registered on it resolve
//! both on the type object and on every instance while missing members are
//! `nil`.
//!
//! # Ownership
//!
//! Each instance is a VM-owned block holding an `Option<T>`. The host writes
//! `Some(value)` at creation and never frees the block itself; the collector
//! runs `__gc`, which takes the payload out and hands it to the registered
//! finalizer (or drops it). An emptied block is observable as
//! [`BridgeError::Finalized`].
//!
//! Typed callbacks (finalizer, equality) live host-side in the VM's
//! [`TypeRegistry`], keyed by `TypeId`. The registry is reachable from native
//! code through a light userdata stored in the VM registry, so finalizers
//! still find it while the VM is closing.

use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use mlua_sys as ffi;

use crate::convert::IntoValue;
use crate::error::{panic_message, BridgeError, BridgeResult};
use crate::function::Function;
use crate::reference::StoredValue;
use crate::stack::{self, StackGuard};
use crate::table::Table;
use crate::trampoline;
use crate::value::Value;
use crate::vm::{Vm, VmState};

/// VM registry field holding the light userdata that points at the
/// [`TypeRegistry`]
pub(crate) const TYPE_REGISTRY_KEY: &CStr = c"lunabind.types";

/// Largest payload alignment a VM userdata block guarantees
const USERDATA_ALIGN: usize = {
    let a = mem::align_of::<f64>();
    let b = mem::align_of::<i64>();
    let c = mem::align_of::<*const c_void>();
    let ab = if a > b { a } else { b };
    if ab > c {
        ab
    } else {
        c
    }
};

// ============================================================================
// Type Registry
// ============================================================================

/// Typed callbacks of one registered custom type
pub(crate) struct TypeEntry<T> {
    /// Registry field name of the metatable
    name: CString,
    /// Human-readable name used in errors
    display: String,
    finalizer: Option<Box<dyn Fn(T)>>,
    equality: Option<Box<dyn Fn(&T, &T) -> bool>>,
}

/// Per-VM registrations, one per host type
#[derive(Default)]
pub(crate) struct TypeRegistry {
    entries: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
}

impl TypeRegistry {
    /// Locate the registry of the VM owning `state`.
    ///
    /// # Safety
    /// `state` must be a live thread with one free slot. The returned
    /// reference is valid until the owning VM finishes closing.
    pub(crate) unsafe fn from_lua<'a>(state: *mut ffi::lua_State) -> Option<&'a TypeRegistry> {
        ffi::lua_getfield(state, ffi::LUA_REGISTRYINDEX, TYPE_REGISTRY_KEY.as_ptr());
        let registry = ffi::lua_touserdata(state, -1) as *const TypeRegistry;
        ffi::lua_pop(state, 1);
        registry.as_ref()
    }

    fn entry<T: 'static>(&self) -> Option<Rc<TypeEntry<T>>> {
        let entry = self.entries.borrow().get(&TypeId::of::<T>()).cloned()?;
        entry.downcast::<TypeEntry<T>>().ok()
    }

    fn contains<T: 'static>(&self) -> bool {
        self.entries.borrow().contains_key(&TypeId::of::<T>())
    }

    fn insert<T: 'static>(&self, entry: Rc<TypeEntry<T>>) {
        self.entries.borrow_mut().insert(TypeId::of::<T>(), entry);
    }

    fn registered<T: 'static>(&self) -> BridgeResult<Rc<TypeEntry<T>>> {
        self.entry::<T>()
            .ok_or_else(|| BridgeError::UnregisteredType(type_name::<T>().to_string()))
    }
}

// ============================================================================
// Userdata
// ============================================================================

/// Handle to a VM userdata.
#[derive(Clone, PartialEq)]
pub struct Userdata(pub(crate) StoredValue);

impl Userdata {
    pub(crate) fn reference(&self) -> &StoredValue {
        &self.0
    }

    /// Borrow the payload as `T`.
    ///
    /// Fails with `TypeGuard` when this userdata is not a `T`, with
    /// `Finalized` when its payload was already collected, and with
    /// `UnregisteredType` when `T` has no registration in the VM.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> BridgeResult<R> {
        let vm = self.0.vm()?;
        let entry = vm.types().registered::<T>()?;
        let payload = unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 2)?;
            self.0.push(&vm, state)?;
            let cell = ffi::luaL_testudata(state, -1, entry.name.as_ptr()) as *const Option<T>;
            match cell.as_ref() {
                Some(cell) => cell.as_ref().map(|payload| payload as *const T),
                None => return Err(BridgeError::type_guard(&entry.display, metatable_name(state, -1))),
            }
        };
        // The block stays anchored by `self` for the duration of `f`
        match payload {
            Some(payload) => Ok(f(unsafe { &*payload })),
            None => Err(BridgeError::Finalized(entry.display.clone())),
        }
    }

    /// Copy the payload out.
    pub fn get<T: Clone + 'static>(&self) -> BridgeResult<T> {
        self.with(T::clone)
    }

    /// Whether this userdata is a live `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.with::<T, _>(|_| ()).is_ok()
    }

    /// `__name` of the attached metatable, if it has one.
    pub fn type_name(&self) -> BridgeResult<Option<String>> {
        let vm = self.0.vm()?;
        unsafe {
            let state = vm.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 2)?;
            self.0.push(&vm, state)?;
            if ffi::luaL_getmetafield(state, -1, c"__name".as_ptr()) == ffi::LUA_TNIL {
                return Ok(None);
            }
            Ok(stack::read_string(state, -1))
        }
    }
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Userdata({:?})", self.0)
    }
}

/// `__name` of the value at `index`, or its kind name.
unsafe fn metatable_name(state: *mut ffi::lua_State, index: c_int) -> String {
    let index = ffi::lua_absindex(state, index);
    if ffi::luaL_getmetafield(state, index, c"__name".as_ptr()) != ffi::LUA_TNIL {
        let name = stack::read_string(state, -1);
        ffi::lua_pop(state, 1);
        if let Some(name) = name {
            return name;
        }
    }
    crate::value::Kind::from_raw(ffi::lua_type(state, index))
        .name()
        .to_string()
}

/// Allocate a block for `value` and attach the metatable of `T`.
pub(crate) fn create_userdata<T: 'static>(vm: &Rc<VmState>, value: T) -> BridgeResult<Userdata> {
    let entry = vm.types().registered::<T>()?;
    unsafe {
        let state = vm.main();
        let _guard = StackGuard::new(state);
        stack::check_stack(state, 2)?;
        let cell = ffi::lua_newuserdatauv(state, mem::size_of::<Option<T>>(), 0) as *mut Option<T>;
        ptr::write(cell, Some(value));
        ffi::luaL_getmetatable(state, entry.name.as_ptr());
        ffi::lua_setmetatable(state, -2);
        Ok(Userdata(StoredValue::pop_anchor(vm, state)))
    }
}

// ============================================================================
// Custom Types
// ============================================================================

/// Setup state handed to the registration callback of a custom type.
pub struct CustomTypeBuilder<'vm, T> {
    vm: &'vm Vm,
    table: Table,
    name: String,
    finalizer: Option<Box<dyn Fn(T)>>,
    equality: Option<Box<dyn Fn(&T, &T) -> bool>>,
}

impl<'vm, T: 'static> CustomTypeBuilder<'vm, T> {
    /// VM the type is being registered in
    pub fn vm(&self) -> &'vm Vm {
        self.vm
    }

    /// Type object under construction
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Override the declared name (defaults to the Rust type name).
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    /// Store `value` under `key` on the type object.
    pub fn member(&mut self, key: impl IntoValue, value: impl IntoValue) -> BridgeResult<&mut Self> {
        self.table.set(key, value)?;
        Ok(self)
    }

    /// Store a host closure under `name` on the type object.
    pub fn function<F>(&mut self, name: &str, func: F) -> BridgeResult<&mut Self>
    where
        F: Fn(&Vm, Vec<Value>) -> BridgeResult<Vec<Value>> + 'static,
    {
        let function = self.vm.create_function(func)?;
        self.table.set(name, function)?;
        Ok(self)
    }

    /// Store a method under `name`: argument 1 is unwrapped as `T`, the rest
    /// are passed through.
    pub fn method<F>(&mut self, name: &str, func: F) -> BridgeResult<&mut Self>
    where
        F: Fn(&Vm, &T, Vec<Value>) -> BridgeResult<Vec<Value>> + 'static,
    {
        self.function(name, move |vm, mut args| {
            let this = if args.is_empty() {
                Value::None
            } else {
                args.remove(0)
            };
            match this {
                Value::Userdata(this) => this.with::<T, _>(|payload| func(vm, payload, args))?,
                other => Err(BridgeError::type_guard("userdata", other.type_name())),
            }
        })
    }

    /// Callback receiving each payload when its block is collected.
    pub fn finalizer(&mut self, finalizer: impl Fn(T) + 'static) -> &mut Self {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Install `__eq`, comparing two payloads with `equality`.
    pub fn equality(&mut self, equality: impl Fn(&T, &T) -> bool + 'static) -> &mut Self {
        self.equality = Some(Box::new(equality));
        self
    }
}

/// A host type registered in a VM.
pub struct CustomType<T> {
    table: Table,
    display: String,
    _marker: PhantomData<fn(T)>,
}

impl<T: 'static> CustomType<T> {
    pub(crate) fn register<F>(vm: &Vm, setup: F) -> BridgeResult<Self>
    where
        F: FnOnce(&mut CustomTypeBuilder<'_, T>) -> BridgeResult<()>,
    {
        if mem::align_of::<Option<T>>() > USERDATA_ALIGN {
            return Err(BridgeError::Unsupported(format!(
                "{} requires {}-byte alignment",
                type_name::<T>(),
                mem::align_of::<Option<T>>()
            )));
        }
        let state_rc = vm.state();
        if state_rc.types().contains::<T>() {
            return Err(BridgeError::AlreadyRegistered(type_name::<T>().to_string()));
        }

        let mut builder = CustomTypeBuilder {
            vm,
            table: vm.create_table(0, 8)?,
            name: type_name::<T>().to_string(),
            finalizer: None,
            equality: None,
        };
        setup(&mut builder)?;
        let CustomTypeBuilder {
            table,
            name: label,
            finalizer,
            equality,
            ..
        } = builder;

        let name = CString::new(label.as_str())
            .map_err(|_| BridgeError::Unsupported(format!("type name {:?} contains NUL", label)))?;
        let has_equality = equality.is_some();

        unsafe {
            let state = state_rc.main();
            let _guard = StackGuard::new(state);
            stack::check_stack(state, 4)?;
            if ffi::lua_getfield(state, ffi::LUA_REGISTRYINDEX, name.as_ptr()) != ffi::LUA_TNIL {
                return Err(BridgeError::AlreadyRegistered(label));
            }
            ffi::lua_pop(state, 1);

            table.reference().push(state_rc, state)?;
            stack::push_bytes(state, label.as_bytes());
            raw_set_field(state, c"__name");
            ffi::lua_pushvalue(state, -1);
            ffi::lua_pushcclosure(state, index_member, 1);
            raw_set_field(state, c"__index");
            ffi::lua_pushcfunction(state, finalize_userdata::<T>);
            raw_set_field(state, c"__gc");
            if has_equality {
                ffi::lua_pushcfunction(state, compare_userdata::<T>);
                raw_set_field(state, c"__eq");
            }
            ffi::lua_pushvalue(state, -1);
            ffi::lua_setmetatable(state, -2);
            ffi::lua_setfield(state, ffi::LUA_REGISTRYINDEX, name.as_ptr());
        }

        state_rc.types().insert(Rc::new(TypeEntry {
            name,
            display: label.clone(),
            finalizer,
            equality,
        }));
        tracing::debug!(target: "lunabind", name = %label, equality = has_equality, "registered custom type");

        Ok(Self {
            table,
            display: label,
            _marker: PhantomData,
        })
    }

    /// Declared name (`__name` of the metatable)
    pub fn name(&self) -> &str {
        &self.display
    }

    /// Type object, which is also the metatable of every instance
    pub fn metatable(&self) -> &Table {
        &self.table
    }

    /// Register or replace a member after setup.
    pub fn set_member(&self, key: impl IntoValue, value: impl IntoValue) -> BridgeResult<()> {
        self.table.set(key, value)
    }

    /// Move `value` into a new instance.
    pub fn create(&self, value: T) -> BridgeResult<Userdata> {
        let vm = self.table.reference().vm()?;
        create_userdata(&vm, value)
    }

    /// Look up a member, typically a function registered during setup.
    pub fn member(&self, key: impl IntoValue) -> BridgeResult<Value> {
        self.table.get(key)
    }

    /// Call the member function `name` with `args`.
    pub fn call_member(&self, name: &str, args: &[Value]) -> BridgeResult<Vec<Value>> {
        match self.table.get(name)? {
            Value::Function(function) => Function::call(&function, args),
            other => Err(BridgeError::type_guard("function", other.type_name())),
        }
    }
}

impl<T> fmt::Debug for CustomType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomType")
            .field("name", &self.display)
            .field("metatable", &self.table)
            .finish()
    }
}

/// `t[field] = top` without metamethods, for the table just below the top.
unsafe fn raw_set_field(state: *mut ffi::lua_State, field: &CStr) {
    ffi::lua_pushstring(state, field.as_ptr());
    ffi::lua_insert(state, -2);
    ffi::lua_rawset(state, -3);
}

// ============================================================================
// Metamethods
// ============================================================================

/// Payload of the `T` block at `index`, or `None` for anything else.
unsafe fn payload_at<'a, T>(
    state: *mut ffi::lua_State,
    index: c_int,
    entry: &TypeEntry<T>,
) -> Option<&'a T> {
    let cell = ffi::luaL_testudata(state, index, entry.name.as_ptr()) as *const Option<T>;
    cell.as_ref()?.as_ref()
}

/// `__index`: raw lookup in the type table held as upvalue 1. Missing
/// members are `nil` for instances and for the type object alike.
unsafe extern "C-unwind" fn index_member(state: *mut ffi::lua_State) -> c_int {
    ffi::lua_pushvalue(state, 2);
    ffi::lua_rawget(state, ffi::lua_upvalueindex(1));
    1
}

/// `__gc`: empty the block and hand the payload to the finalizer.
unsafe extern "C-unwind" fn finalize_userdata<T: 'static>(state: *mut ffi::lua_State) -> c_int {
    // The type object shares this metatable; only blocks carry a payload
    if ffi::lua_type(state, 1) != ffi::LUA_TUSERDATA {
        return 0;
    }
    let entry = TypeRegistry::from_lua(state).and_then(|registry| registry.entry::<T>());
    let cell = match &entry {
        Some(entry) => ffi::luaL_testudata(state, 1, entry.name.as_ptr()),
        None => ffi::lua_touserdata(state, 1),
    } as *mut Option<T>;
    let Some(payload) = cell.as_mut().and_then(Option::take) else {
        return 0;
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        match entry.as_ref().and_then(|entry| entry.finalizer.as_ref()) {
            Some(finalizer) => finalizer(payload),
            None => drop(payload),
        }
    }));
    if let Err(payload) = outcome {
        tracing::warn!(
            target: "lunabind",
            "finalizer of {} panicked: {}",
            type_name::<T>(),
            panic_message(payload.as_ref())
        );
    }
    0
}

/// `__eq`: compare two payloads. A non-`T` operand is never equal.
unsafe extern "C-unwind" fn compare_userdata<T: 'static>(state: *mut ffi::lua_State) -> c_int {
    trampoline::guarded(state, || {
        let entry = TypeRegistry::from_lua(state)
            .ok_or(BridgeError::VmClosed)?
            .registered::<T>()?;
        let equal = match (payload_at::<T>(state, 1, &entry), payload_at::<T>(state, 2, &entry)) {
            (Some(a), Some(b)) => {
                let equality = entry.equality.as_ref();
                equality.is_some_and(|equality| equality(a, b))
            }
            _ => false,
        };
        ffi::lua_pushboolean(state, equal as c_int);
        Ok(1)
    })
}
