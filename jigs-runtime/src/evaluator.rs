//! Execution of method bodies

use jigs_core::{JigError, ObjRef, Result, Value};

use crate::class::MethodFn;
use crate::membrane::Membrane;
use crate::runtime::Runtime;

/// Runs method bodies deterministically
///
/// Implementations must refuse non-deterministic primitives by returning
/// [`JigError::Nondeterministic`].
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, body: &MethodFn, cx: &mut Cx<'_>, args: &[Value]) -> Result<Value>;
}

/// Evaluator for bodies written as native closures
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEvaluator;

impl Evaluator for NativeEvaluator {
    fn evaluate(&self, body: &MethodFn, cx: &mut Cx<'_>, args: &[Value]) -> Result<Value> {
        body(cx, args)
    }
}

/// Handle given to a running method body
///
/// Every operation goes through the runtime's membrane, so reads, writes and calls made here are
/// checked and recorded exactly like those made by any other caller.
pub struct Cx<'a> {
    rt: &'a mut Runtime,
    this: ObjRef,
}

impl<'a> Cx<'a> {
    pub(crate) fn new(rt: &'a mut Runtime, this: ObjRef) -> Self {
        Self { rt, this }
    }

    /// The object whose method is running
    pub fn this(&self) -> ObjRef {
        self.this
    }

    pub fn get(&mut self, target: ObjRef, key: &str) -> Result<Value> {
        self.rt.on_get(target, key)
    }

    pub fn set(&mut self, target: ObjRef, key: &str, value: impl Into<Value>) -> Result<()> {
        self.rt.on_set(target, key, value.into())
    }

    pub fn has(&mut self, target: ObjRef, key: &str) -> Result<bool> {
        self.rt.on_has(target, key)
    }

    pub fn delete(&mut self, target: ObjRef, key: &str) -> Result<bool> {
        self.rt.on_delete(target, key)
    }

    pub fn keys(&mut self, target: ObjRef) -> Result<Vec<String>> {
        self.rt.on_enumerate(target)
    }

    pub fn call(&mut self, target: ObjRef, method: &str, args: &[Value]) -> Result<Value> {
        self.rt.on_call(target, method, args)
    }

    /// Read a field of `this`
    pub fn get_own(&mut self, key: &str) -> Result<Value> {
        self.rt.on_get(self.this, key)
    }

    /// Write a field of `this`
    pub fn set_own(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.rt.on_set(self.this, key, value.into())
    }

    /// Read a numeric field of `this`, treating a missing field as an error
    pub fn number(&mut self, key: &str) -> Result<f64> {
        self.get_own(key)?
            .as_number()
            .ok_or_else(|| JigError::user(format!("{} is not a number", key)))
    }

    /// Instantiate a jig of `class`
    pub fn new_jig(&mut self, class: ObjRef, args: &[Value]) -> Result<ObjRef> {
        self.rt.construct(class, args)
    }

    /// Instantiate a berry of `class` at `path`
    pub fn pluck(&mut self, class: ObjRef, path: &str, args: &[Value]) -> Result<ObjRef> {
        self.rt.pluck(class, path, args)
    }

    pub fn is_instance(&self, value: &Value, class: ObjRef) -> bool {
        self.rt.is_instance(value, class)
    }

    pub fn record<K: Into<String>>(&mut self, fields: impl IntoIterator<Item = (K, Value)>) -> Value {
        self.rt.record(fields)
    }

    pub fn array(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        self.rt.array(items)
    }

    pub fn set_of(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        self.rt.set_of(items)
    }

    pub fn map_of(&mut self, entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        self.rt.map_of(entries)
    }

    pub fn bytes(&mut self, bytes: impl Into<Vec<u8>>) -> Value {
        self.rt.bytes(bytes)
    }

    /// Flushing the ledger is only allowed outside method bodies
    pub fn sync(&mut self, target: ObjRef) -> Result<()> {
        self.rt.sync(target)
    }

    /// Wall-clock time is not available to method bodies
    pub fn now(&self) -> Result<f64> {
        Err(JigError::Nondeterministic {
            primitive: "wall-clock time".to_string(),
            hint: None,
        })
    }

    /// Randomness is not available to method bodies
    pub fn random(&self) -> Result<f64> {
        Err(JigError::Nondeterministic {
            primitive: "random number generation".to_string(),
            hint: None,
        })
    }
}
