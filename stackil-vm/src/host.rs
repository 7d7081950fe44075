//! The interpreter's view of everything outside the method body
//!
//! Calls never execute IL: every `call`, `callvirt`, `calli` and constructor
//! run by `newobj` is handed to a [`Host`].

use crate::heap::Heap;
use crate::value::Value;
use anyhow::{bail, Result};
use stackil_bytecode::core::metadata::{MethodKind, MethodRef, TypeProvider, TypeRef};
use std::collections::HashMap;
use std::sync::Arc;

/// One outgoing call
#[derive(Debug)]
pub struct Invocation<'a> {
    pub method: &'a MethodRef,
    /// Runtime class of the receiver for virtual calls
    pub receiver_class: Option<TypeRef>,
    /// Arguments in push order, `this` first
    pub args: Vec<Value>,
    /// Set when the call carried the `tail.` prefix
    pub tail: bool,
}

pub trait Host {
    /// Type relationships used by `castclass`, `isinst` and catch filters
    fn types(&self) -> &dyn TypeProvider;

    fn invoke(&mut self, heap: &mut Heap, call: Invocation<'_>) -> Result<Option<Value>>;
}

type Native = Box<dyn FnMut(&mut Heap, &[Value]) -> Result<Option<Value>>>;

/// Host backed by closures registered as `Type::Method`.
///
/// Virtual calls try the receiver's runtime class before the declaring
/// type. Constructors without a registration do nothing.
pub struct NativeHost {
    types: Arc<dyn TypeProvider>,
    methods: HashMap<String, Native>,
    calls: Vec<String>,
    tail_calls: usize,
}

impl NativeHost {
    pub fn new(types: Arc<dyn TypeProvider>) -> Self {
        Self {
            types,
            methods: HashMap::new(),
            calls: Vec::new(),
            tail_calls: 0,
        }
    }

    pub fn register(
        mut self,
        declaring: &str,
        name: &str,
        native: impl FnMut(&mut Heap, &[Value]) -> Result<Option<Value>> + 'static,
    ) -> Self {
        self.methods
            .insert(format!("{declaring}::{name}"), Box::new(native));
        self
    }

    /// Every dispatched call as `Type::Method`, in order
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn tail_calls(&self) -> usize {
        self.tail_calls
    }
}

impl Host for NativeHost {
    fn types(&self) -> &dyn TypeProvider {
        &*self.types
    }

    fn invoke(&mut self, heap: &mut Heap, call: Invocation<'_>) -> Result<Option<Value>> {
        let method = call.method;
        let mut keys = Vec::with_capacity(2);
        if let Some(class) = &call.receiver_class {
            keys.push(format!("{}::{}", class.name(), method.name()));
        }
        keys.push(format!("{}::{}", method.declaring_type().name(), method.name()));

        if call.tail {
            self.tail_calls += 1;
        }
        for key in keys {
            if let Some(native) = self.methods.get_mut(&key) {
                let result = native(heap, &call.args);
                self.calls.push(key);
                return result;
            }
        }
        if method.kind() == MethodKind::Constructor {
            return Ok(None);
        }
        bail!("no native implementation for {method}")
    }
}
