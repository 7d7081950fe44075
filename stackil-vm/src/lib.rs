//! Reference interpreter for finalized stackil streams
//!
//! [`Loader`] is a [`TargetBackend`](stackil_emit::TargetBackend) that turns
//! a [`FinalizedStream`](stackil_emit::FinalizedStream) into an
//! [`Executable`]; [`VM`] runs it against a [`Host`] that services calls.
//! Branch targets are followed by instruction index, so short and long
//! branch forms behave identically, and the `tail.` flag is passed to the
//! host but otherwise ignored.
//!
//! ```ignore
//! let exe = emitter.finalize_into(&mut Loader)?;
//! let mut vm = VM::new(NativeHost::new(types));
//! let result = vm.execute(&exe, vec![Value::Int32(2)])?;
//! ```

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod error;
mod execute;
mod heap;
mod host;
mod value;
mod vm;

pub use crate::error::ExecError;
pub use crate::heap::{Heap, Object};
pub use crate::host::{Host, Invocation, NativeHost};
pub use crate::value::{ObjectId, Place, StructValue, Value};
pub use crate::vm::{Executable, Loader, VM};
