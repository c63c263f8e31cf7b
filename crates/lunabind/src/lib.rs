//! lunabind - Bidirectional value bridge for embedding a host in a Lua 5.4 VM
//!
//! This crate converts host values to and from the VM's evaluation stack,
//! anchors VM objects beyond the stack frame that produced them, and lets
//! the host register native types as embedded custom types.
//!
//! # Example
//!
//! ```ignore
//! use lunabind::{Value, Vm};
//!
//! let vm = Vm::new()?;
//! let add = vm.create_function(|_vm, args| {
//!     let sum: f64 = args.iter().filter_map(Value::as_number).sum();
//!     Ok(vec![Value::float(sum)])
//! })?;
//! vm.globals()?.set("add", add)?;
//!
//! let results = vm.eval("return add(1, 2, 3)", &[])?;
//! assert_eq!(results, vec![Value::integer(6)]);
//! ```
//!
//! # Threading
//!
//! A [`Vm`] and every handle it hands out are `!Send`. All access to one VM
//! happens on the thread that created it.

#![warn(missing_docs)]

mod config;
mod convert;
mod error;
mod function;
mod reference;
mod stack;
mod table;
mod thread;
mod trampoline;
mod userdata;
mod value;
mod vm;

pub use config::VmOptions;
pub use convert::{FromValue, IntoValue};
pub use error::{reset_error_handler, set_error_handler, BridgeError, BridgeResult, ErrorHandler};
pub use function::{Function, HostFn};
pub use reference::StoredValue;
pub use table::Table;
pub use thread::Thread;
pub use userdata::{CustomType, CustomTypeBuilder, Userdata};
pub use value::{Kind, LightUserdata, Number, Value, VmString};
pub use vm::Vm;
